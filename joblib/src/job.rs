use crate::types::{Account, Jid, StreamKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, str::FromStr, time::Duration};

/// A named filesystem layer mounted into the job's container.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLayer {
    pub name: String,
}

/// A named volume attached to the job's container.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobVolume {
    pub name: String,
}

/// Where a job's result payload is read from once its container exits.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ResultSource {
    #[default]
    Stdout,
    File(String),
}

impl FromStr for ResultSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "stdout" {
            return Ok(ResultSource::Stdout);
        }
        match s.strip_prefix("file:") {
            Some(path) if !path.is_empty() => Ok(ResultSource::File(path.to_string())),
            _ => Err(format!(
                r#"invalid result source [{}]: must be either "stdout" or "file:{{path}}""#,
                s
            )),
        }
    }
}

impl TryFrom<String> for ResultSource {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ResultSource> for String {
    fn from(source: ResultSource) -> Self {
        source.to_string()
    }
}

impl fmt::Display for ResultSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultSource::Stdout => write!(f, "stdout"),
            ResultSource::File(path) => write!(f, "file:{}", path),
        }
    }
}

/// How a client should interpret the result payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultType {
    /// Raw bytes, not to be interpreted.
    #[default]
    Binary,
    /// Pickled Python objects.
    Pickle,
}

/// Lifecycle status of a submitted job.
///
/// `Waiting` and `Queued` precede execution; `Processing` is entered exactly once through a claim;
/// the remaining four are terminal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Submitted, but not yet placed into the queue.
    Waiting,
    /// Eligible to be claimed.
    #[default]
    Queued,
    Processing,
    /// Exited with status 0.
    Done,
    /// Exited with a non-zero status.
    Error,
    /// Terminated on request or for exceeding its maximum runtime.
    Killed,
    /// Stuck in `processing` past its deadline with no executor finishing it.
    Stalled,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Done | Status::Error | Status::Killed | Status::Stalled
        )
    }

    pub fn is_claimable(&self) -> bool {
        *self == Status::Queued
    }

    /// Position in the lifecycle. A job's status never moves to a lower stage.
    pub fn stage(&self) -> u8 {
        match self {
            Status::Waiting => 0,
            Status::Queued => 1,
            Status::Processing => 2,
            Status::Done | Status::Error | Status::Killed | Status::Stalled => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Waiting => "waiting",
            Status::Queued => "queued",
            Status::Processing => "processing",
            Status::Done => "done",
            Status::Error => "error",
            Status::Killed => "killed",
            Status::Stalled => "stalled",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource usage sampled from a job's container.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collected {
    #[serde(rename = "cputime_user", default)]
    pub cpu_time_user: u64,
    #[serde(rename = "cputime_system", default)]
    pub cpu_time_system: u64,
    #[serde(rename = "memory_failcnt", default)]
    pub memory_fail_count: u64,
    #[serde(default)]
    pub memory_max_usage: u64,
}

impl Collected {
    /// Fold a newer sample into this one. Counters only ever grow, so keep the maxima.
    pub fn merge(&mut self, sample: Collected) {
        self.cpu_time_user = self.cpu_time_user.max(sample.cpu_time_user);
        self.cpu_time_system = self.cpu_time_system.max(sample.cpu_time_system);
        self.memory_fail_count = self.memory_fail_count.max(sample.memory_fail_count);
        self.memory_max_usage = self.memory_max_usage.max(sample.memory_max_usage);
    }
}

/// A user-submitted compute task, executed by a shell inside a container.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "cmd")]
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Resource class; selects the container image.
    #[serde(default)]
    pub core: String,
    #[serde(default)]
    pub multicore: u32,
    #[serde(default)]
    pub restartable: bool,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(rename = "layer", default)]
    pub layers: Vec<JobLayer>,
    #[serde(rename = "vol", default)]
    pub volumes: Vec<JobVolume>,
    #[serde(rename = "env", default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub result_source: ResultSource,
    #[serde(default)]
    pub result_type: ResultType,
    /// Seconds; zero means no limit was declared.
    #[serde(default)]
    pub max_runtime: u64,
    #[serde(default, with = "base64_bytes")]
    pub stdin: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<String>,
}

impl Job {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Reject jobs that could never run.
    pub fn validate(&self) -> Result<(), String> {
        if self.command.trim().is_empty() {
            return Err("all jobs must specify a command to execute".to_string());
        }
        Ok(())
    }

    pub fn declared_max_runtime(&self) -> Option<Duration> {
        (self.max_runtime > 0).then(|| Duration::from_secs(self.max_runtime))
    }
}

/// A `Job` plus its execution state and results.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmittedJob {
    #[serde(flatten)]
    pub job: Job,

    pub jid: Jid,
    pub account: Account,

    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,

    pub status: Status,
    #[serde(default)]
    pub kill_requested: bool,

    #[serde(default, with = "base64_bytes")]
    pub result: Vec<u8>,
    #[serde(default)]
    pub return_code: Option<i64>,
    /// Milliseconds between start and finish.
    #[serde(default)]
    pub runtime: u64,
    /// Milliseconds between creation and start.
    #[serde(default)]
    pub queue_delay: u64,
    /// Milliseconds spent outside the user's command: container setup plus teardown.
    #[serde(default)]
    pub overhead_delay: u64,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,

    #[serde(default)]
    pub collected: Collected,
}

impl SubmittedJob {
    /// Pack a job for insertion. The store assigns the JID.
    pub fn new(job: Job, account: impl Into<Account>, now: DateTime<Utc>) -> Self {
        Self {
            job,
            account: account.into(),
            created_at: Some(now),
            status: Status::Queued,
            ..Self::default()
        }
    }

    /// Deterministic, per-JID unique container name: `job_<jid>_<name or "unnamed">`.
    pub fn container_name(&self) -> String {
        let name = self.job.name.as_deref().unwrap_or("unnamed");
        format!("job_{}_{}", self.jid, name)
    }

    pub fn append(&mut self, kind: StreamKind, text: &str) {
        match kind {
            StreamKind::Stdout => self.stdout.push_str(text),
            StreamKind::Stderr => self.stderr.push_str(text),
        }
    }

    /// Fill in `runtime` and `queue_delay` from the recorded timestamps.
    pub fn compute_delays(&mut self) {
        if let (Some(started), Some(finished)) = (self.started_at, self.finished_at) {
            self.runtime = millis_between(started, finished);
        }
        if let (Some(created), Some(started)) = (self.created_at, self.started_at) {
            self.queue_delay = millis_between(created, started);
        }
    }
}

pub(crate) fn millis_between(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    (to - from).num_milliseconds().max(0) as u64
}

/// Byte fields travel as base64 strings in JSON.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD.decode(encoded.as_bytes()).map_err(D::Error::custom)
    }
}
