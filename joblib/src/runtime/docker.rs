use super::{Attached, ContainerRuntime, ContainerSpec, Result};
use crate::error::RuntimeError;
use crate::job::Collected;
use crate::types::{ContainerId, Output};
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, DownloadFromContainerOptions,
    KillContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions, StatsOptions,
    WaitContainerOptions,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use std::io::{Cursor, Read};
use std::path::PathBuf;

/// Client certificate, key and CA used to reach a Docker daemon over mutual TLS.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DockerTls {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca_cert: PathBuf,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DockerConfig {
    /// `unix://` socket path or `tcp://`/`https://` address. `None` uses the local defaults.
    pub host: Option<String>,
    pub tls: Option<DockerTls>,
    pub timeout_secs: u64,
}

/// A `ContainerRuntime` backed by a Docker daemon.
///
/// `bollard::Docker` is a cheap, clonable client, so one instance serves every execution.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect(config: &DockerConfig) -> Result<Self> {
        let timeout = if config.timeout_secs == 0 {
            120
        } else {
            config.timeout_secs
        };
        let docker = match (&config.host, &config.tls) {
            (Some(host), Some(tls)) => Docker::connect_with_ssl(
                host,
                &tls.key,
                &tls.cert,
                &tls.ca_cert,
                timeout,
                API_DEFAULT_VERSION,
            )?,
            (None, Some(_)) => {
                return Err(RuntimeError::Other(
                    "a docker host is required when TLS is enabled".to_string(),
                ))
            }
            (Some(host), None) if host.starts_with("unix://") => {
                Docker::connect_with_unix(host, timeout, API_DEFAULT_VERSION)?
            }
            (Some(host), None) => Docker::connect_with_http(host, timeout, API_DEFAULT_VERSION)?,
            (None, None) => Docker::connect_with_local_defaults()?,
        };
        Ok(Self { docker })
    }

    /// Confirm the daemon answers before any job is claimed.
    pub async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        Ok(())
    }
}

fn route(log: LogOutput) -> Option<Output> {
    match log {
        LogOutput::StdOut { message } | LogOutput::Console { message } => {
            Some(Output::Stdout(message))
        }
        LogOutput::StdErr { message } => Some(Output::Stderr(message)),
        // stdin echoes only show up with a tty
        LogOutput::StdIn { .. } => None,
    }
}

fn first_file(archive: Vec<u8>, path: &str) -> Result<Vec<u8>> {
    let mut archive = tar::Archive::new(Cursor::new(archive));
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type().is_file() {
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            return Ok(contents);
        }
    }
    Err(RuntimeError::MissingFile(path.to_string()))
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            open_stdin: Some(spec.open_stdin),
            stdin_once: Some(spec.open_stdin),
            attach_stdin: Some(spec.open_stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };
        let response = self.docker.create_container(Some(options), config).await?;
        for warning in &response.warnings {
            tracing::warn!(container = %spec.name, warning = %warning, "docker warning on create");
        }
        Ok(response.id)
    }

    async fn attach(&self, id: &str) -> Result<Attached> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            ..Default::default()
        };
        let attached = self.docker.attach_container(id, Some(options)).await?;
        let output = attached
            .output
            .filter_map(|item| async move {
                match item {
                    Ok(log) => route(log).map(Ok),
                    Err(err) => Some(Err(RuntimeError::from(err))),
                }
            })
            .boxed();
        Ok(Attached {
            input: attached.input,
            output,
        })
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i64> {
        let mut exits = Box::pin(
            self.docker
                .wait_container(id, None::<WaitContainerOptions<String>>),
        );
        match exits.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports any non-zero exit as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(err)) => Err(err.into()),
            None => Err(RuntimeError::Other(format!(
                "wait stream for {} ended without an exit status",
                id
            ))),
        }
    }

    async fn kill(&self, id: &str) -> Result<()> {
        self.docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }

    async fn read_file(&self, id: &str, path: &str) -> Result<Vec<u8>> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let chunks: Vec<Bytes> = self
            .docker
            .download_from_container(id, Some(options))
            .try_collect()
            .await?;
        first_file(chunks.concat(), path)
    }

    async fn usage(&self, id: &str) -> Result<Collected> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut samples = Box::pin(self.docker.stats(id, Some(options)));
        let stats = samples
            .next()
            .await
            .ok_or_else(|| RuntimeError::Other(format!("no stats returned for {}", id)))??;
        Ok(Collected {
            cpu_time_user: stats.cpu_stats.cpu_usage.usage_in_usermode,
            cpu_time_system: stats.cpu_stats.cpu_usage.usage_in_kernelmode,
            memory_fail_count: stats.memory_stats.failcnt.unwrap_or_default(),
            memory_max_usage: stats.memory_stats.max_usage.unwrap_or_default(),
        })
    }
}
