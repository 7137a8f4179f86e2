use clap::Parser;
use joblib::runtime::{DockerConfig, DockerTls};
use joblib::{ClaimSettings, ExecutorSettings, ImageTable, ReaperSettings};
use std::path::PathBuf;
use std::time::Duration;

/// Claim queued jobs and run each one in its own container
#[derive(Debug, Parser)]
#[clap(name = "runner", version)]
pub struct Args {
    /// Milliseconds between claim attempts
    #[clap(long, env = "RUNNER_POLL_MS", default_value = "500")]
    pub poll_ms: u64,

    /// Image for jobs whose resource class has no mapping
    #[clap(long, env = "RUNNER_DEFAULT_IMAGE", default_value = "ubuntu:22.04")]
    pub default_image: String,

    /// Image for one resource class, as CORE=IMAGE. May be repeated.
    #[clap(long = "core-image", parse(try_from_str = core_eq_image))]
    pub core_images: Vec<(String, String)>,

    /// Docker daemon address; unset uses the local defaults
    #[clap(long, env = "DOCKER_HOST")]
    pub docker_host: Option<String>,

    /// Connect to the Docker daemon with mutual TLS
    #[clap(long)]
    pub docker_tls: bool,

    /// Client certificate for --docker-tls
    #[clap(long, env = "DOCKER_CERT")]
    pub docker_cert: Option<PathBuf>,

    /// Client private key for --docker-tls
    #[clap(long, env = "DOCKER_KEY")]
    pub docker_key: Option<PathBuf>,

    /// CA certificate for --docker-tls
    #[clap(long, env = "DOCKER_CA_CERT")]
    pub docker_ca_cert: Option<PathBuf>,

    #[clap(long, env = "DOCKER_TIMEOUT_SECS", default_value = "120")]
    pub docker_timeout_secs: u64,

    /// Interpreter that runs each job's command string
    #[clap(long, env = "RUNNER_SHELL", default_value = "/bin/bash -c")]
    pub shell: String,

    /// Ceiling on concurrent executions; unset is unbounded
    #[clap(long, env = "RUNNER_MAX_IN_FLIGHT")]
    pub max_in_flight: Option<usize>,

    /// Seconds allowed to jobs that declare no max runtime; 0 is unlimited
    #[clap(long, env = "RUNNER_DEFAULT_MAX_RUNTIME", default_value = "0")]
    pub default_max_runtime_secs: u64,

    /// Seconds past its max runtime before a processing job is marked stalled
    #[clap(long, env = "RUNNER_STALL_GRACE", default_value = "60")]
    pub stall_grace_secs: u64,

    #[clap(long, env = "RUNNER_REAPER_INTERVAL", default_value = "30")]
    pub reaper_interval_secs: u64,

    /// Milliseconds between checks of a running job's kill flag
    #[clap(long, env = "RUNNER_KILL_POLL_MS", default_value = "1000")]
    pub kill_poll_ms: u64,

    /// Milliseconds to wait for output to finish streaming after a container exits
    #[clap(long, env = "RUNNER_DRAIN_TIMEOUT_MS", default_value = "5000")]
    pub drain_timeout_ms: u64,

    /// JSON file of jobs to submit at startup: {"jobs": [...]}
    #[clap(long)]
    pub jobs: Option<PathBuf>,

    /// Account the submitted jobs belong to
    #[clap(long, env = "RUNNER_ACCOUNT", default_value = "runner")]
    pub account: String,

    /// Exit once every submitted job has finished, printing them as JSON
    #[clap(long)]
    pub once: bool,

    /// Emit logs as JSON lines
    #[clap(long)]
    pub log_json: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("--docker-tls requires {0}")]
    MissingTlsPath(&'static str),
    #[error("--docker-tls requires --docker-host")]
    MissingTlsHost,
    #[error("--shell must name an interpreter")]
    EmptyShell,
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("--once requires --jobs")]
    OnceWithoutJobs,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub claim: ClaimSettings,
    pub executor: ExecutorSettings,
    pub reaper: ReaperSettings,
    pub docker: DockerConfig,
    pub jobs: Option<PathBuf>,
    pub account: String,
    pub once: bool,
    pub log_json: bool,
}

impl Args {
    pub fn into_config(self) -> Result<Config, ConfigError> {
        for (value, name) in [
            (self.poll_ms, "--poll-ms"),
            (self.kill_poll_ms, "--kill-poll-ms"),
            (self.reaper_interval_secs, "--reaper-interval-secs"),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.max_in_flight == Some(0) {
            return Err(ConfigError::Zero("--max-in-flight"));
        }
        if self.once && self.jobs.is_none() {
            return Err(ConfigError::OnceWithoutJobs);
        }

        let shell: Vec<String> = self.shell.split_whitespace().map(str::to_string).collect();
        if shell.is_empty() {
            return Err(ConfigError::EmptyShell);
        }

        let tls = if self.docker_tls {
            let tls = DockerTls {
                cert: self
                    .docker_cert
                    .ok_or(ConfigError::MissingTlsPath("--docker-cert"))?,
                key: self
                    .docker_key
                    .ok_or(ConfigError::MissingTlsPath("--docker-key"))?,
                ca_cert: self
                    .docker_ca_cert
                    .ok_or(ConfigError::MissingTlsPath("--docker-ca-cert"))?,
            };
            if self.docker_host.is_none() {
                return Err(ConfigError::MissingTlsHost);
            }
            Some(tls)
        } else {
            None
        };

        let default_max_runtime = (self.default_max_runtime_secs > 0)
            .then(|| Duration::from_secs(self.default_max_runtime_secs));

        let mut images = ImageTable::new(self.default_image);
        images.by_core.extend(self.core_images);

        Ok(Config {
            claim: ClaimSettings {
                poll_interval: Duration::from_millis(self.poll_ms),
                max_in_flight: self.max_in_flight,
            },
            executor: ExecutorSettings {
                images,
                shell,
                kill_poll: Duration::from_millis(self.kill_poll_ms),
                default_max_runtime,
                drain_timeout: Duration::from_millis(self.drain_timeout_ms),
            },
            reaper: ReaperSettings {
                interval: Duration::from_secs(self.reaper_interval_secs),
                grace: Duration::from_secs(self.stall_grace_secs),
                default_max_runtime,
            },
            docker: DockerConfig {
                host: self.docker_host,
                tls,
                timeout_secs: self.docker_timeout_secs,
            },
            jobs: self.jobs,
            account: self.account,
            once: self.once,
            log_json: self.log_json,
        })
    }
}

/// try_from_str parse function for resource class to image mappings
fn core_eq_image(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((core, image)) if !core.is_empty() && !image.is_empty() => {
            Ok((core.to_string(), image.to_string()))
        }
        _ => Err("Required format is CORE=IMAGE".to_string()),
    }
}
