//! One container's full lifecycle for one claimed job.
//!
//! The sequence for a job is strictly ordered: start timestamp, create, attach, start, wait,
//! remove, finish. Create, start and wait failures abort the execution and leave the job in
//! `processing`; every other failure is logged and the execution carries on. Nothing escapes
//! `Executor::execute`, so one broken job never affects the claim loop or its siblings.

use crate::collector::{pump, OutputCollector, RawOutput, SharedJob};
use crate::error::ExecError;
use crate::job::{millis_between, Collected, ResultSource, Status, SubmittedJob};
use crate::runtime::{ContainerRuntime, ContainerSpec};
use crate::store::JobStore;
use crate::types::StreamKind;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument;

/// Maps a job's resource class to the image its container runs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageTable {
    pub default: String,
    pub by_core: HashMap<String, String>,
}

impl ImageTable {
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            default: default.into(),
            by_core: HashMap::new(),
        }
    }

    pub fn image_for(&self, core: &str) -> &str {
        self.by_core
            .get(core)
            .map(String::as_str)
            .unwrap_or(self.default.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct ExecutorSettings {
    pub images: ImageTable,
    /// Interpreter prefix; the job's command string is passed as its final argument.
    pub shell: Vec<String>,
    /// How often a running job's kill flag and resource usage are checked.
    pub kill_poll: Duration,
    /// Applied to jobs that declare no maximum runtime. `None` leaves them unbounded.
    pub default_max_runtime: Option<Duration>,
    /// How long to wait for output to finish streaming after the container exits.
    pub drain_timeout: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            images: ImageTable::new("ubuntu:22.04"),
            shell: vec!["/bin/bash".to_string(), "-c".to_string()],
            kill_poll: Duration::from_secs(1),
            default_max_runtime: None,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl ExecutorSettings {
    pub fn max_runtime(&self, job: &SubmittedJob) -> Option<Duration> {
        job.job.declared_max_runtime().or(self.default_max_runtime)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum KillReason {
    Requested,
    MaxRuntime(Duration),
}

struct Exit {
    code: i64,
    killed: Option<KillReason>,
    usage: Collected,
    at: DateTime<Utc>,
}

/// Runs claimed jobs. Cheap to clone; every clone shares the store, runtime and settings.
#[derive(Clone)]
pub struct Executor {
    store: Arc<dyn JobStore>,
    runtime: Arc<dyn ContainerRuntime>,
    settings: Arc<ExecutorSettings>,
}

impl Executor {
    pub fn new(
        store: Arc<dyn JobStore>,
        runtime: Arc<dyn ContainerRuntime>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            store,
            runtime,
            settings: Arc::new(settings),
        }
    }

    /// Run a claimed job to completion, logging rather than returning any failure.
    pub async fn execute(&self, job: SubmittedJob) {
        let span = tracing::info_span!(
            "job",
            jid = job.jid,
            account = %job.account,
            container = tracing::field::Empty
        );
        async move {
            match self.run(job).await {
                Ok(status) => tracing::info!(status = %status, "job complete"),
                Err(err) => tracing::error!(error = %err, "job execution aborted"),
            }
        }
        .instrument(span)
        .await
    }

    fn container_spec(&self, job: &SubmittedJob) -> ContainerSpec {
        let mut cmd = self.settings.shell.clone();
        cmd.push(job.job.command.clone());

        let mut env: Vec<String> = job
            .job
            .environment
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        env.sort();

        let labels = HashMap::from([
            ("jid".to_string(), job.jid.to_string()),
            ("account".to_string(), job.account.clone()),
        ]);

        ContainerSpec {
            name: job.container_name(),
            image: self.settings.images.image_for(&job.job.core).to_string(),
            cmd,
            env,
            labels,
            open_stdin: true,
        }
    }

    async fn run(&self, mut job: SubmittedJob) -> Result<Status, ExecError> {
        tracing::info!("launching a job");

        job.started_at = Some(Utc::now());
        if let Err(err) = self.store.update_job(&job).await {
            tracing::warn!(error = %err, "unable to update the job's start timestamp");
        }

        let spec = self.container_spec(&job);
        let id = self
            .runtime
            .create(&spec)
            .await
            .map_err(ExecError::Create)?;
        tracing::Span::current().record("container", id.as_str());
        tracing::debug!(name = %spec.name, image = %spec.image, "created the job's container");

        let stdin = job.job.stdin.clone();
        let job: SharedJob = Arc::new(Mutex::new(job));
        let raw_stdout = RawOutput::default();
        let attach = self.attach(&id, &job, &raw_stdout, stdin).await;

        if let Err(err) = self.runtime.start(&id).await {
            if let Some(attach) = attach {
                attach.abort();
            }
            return Err(ExecError::Start(err));
        }
        let running_at = Utc::now();
        tracing::debug!("started the container");

        let exit = match self.wait_for_exit(&id, &job).await {
            Ok(exit) => exit,
            Err(err) => {
                if let Some(attach) = attach {
                    attach.abort();
                }
                return Err(err);
            }
        };
        tracing::debug!(code = exit.code, "container exited");

        if let Some(attach) = attach {
            self.drain(attach).await;
        }
        self.acquire_result(&id, &job, &raw_stdout).await;

        if let Err(err) = self.runtime.remove(&id).await {
            tracing::warn!(error = %err, "unable to remove the container");
        }

        let mut job = job.lock().await;
        let finished_at = Utc::now();
        job.finished_at = Some(finished_at);
        job.return_code = Some(exit.code);
        job.collected = exit.usage;
        job.status = match exit.killed {
            Some(_) => Status::Killed,
            None if exit.code == 0 => Status::Done,
            None => Status::Error,
        };
        if let Some(KillReason::MaxRuntime(limit)) = exit.killed {
            job.stderr.push_str(&format!(
                "\njob exceeded its maximum runtime of {}s and was killed\n",
                limit.as_secs()
            ));
        }
        job.compute_delays();
        if let Some(started_at) = job.started_at {
            job.overhead_delay =
                millis_between(started_at, running_at) + millis_between(exit.at, finished_at);
        }

        self.store
            .update_job(&job)
            .await
            .map_err(ExecError::Finish)?;
        Ok(job.status)
    }

    async fn attach(
        &self,
        id: &str,
        job: &SharedJob,
        raw_stdout: &RawOutput,
        stdin: Vec<u8>,
    ) -> Option<JoinHandle<()>> {
        let attached = match self.runtime.attach(id).await {
            Ok(attached) => attached,
            Err(err) => {
                tracing::warn!(error = %err, "unable to attach to the container");
                return None;
            }
        };
        let stdout = OutputCollector::new(self.store.clone(), job.clone(), StreamKind::Stdout)
            .keeping_raw(raw_stdout.clone());
        let stderr = OutputCollector::new(self.store.clone(), job.clone(), StreamKind::Stderr);
        let streaming = async move {
            match pump(attached, stdin, stdout, stderr).await {
                Ok(()) => tracing::debug!("output streams closed"),
                Err(err) => tracing::warn!(error = %err, "attached streams failed"),
            }
        };
        Some(tokio::spawn(streaming.instrument(tracing::Span::current())))
    }

    async fn wait_for_exit(&self, id: &str, job: &SharedJob) -> Result<Exit, ExecError> {
        let (jid, limit) = {
            let job = job.lock().await;
            (job.jid, self.settings.max_runtime(&job))
        };

        let wait = self.runtime.wait(id);
        tokio::pin!(wait);

        let deadline = limit.map(|limit| Instant::now() + limit);
        let expiry = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expiry);

        let mut ticker = tokio::time::interval(self.settings.kill_poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut usage = Collected::default();
        let mut killed = None;
        loop {
            tokio::select! {
                code = &mut wait => {
                    let code = code.map_err(ExecError::Wait)?;
                    return Ok(Exit { code, killed, usage, at: Utc::now() });
                }
                _ = &mut expiry, if killed.is_none() => {
                    if let Some(limit) = limit {
                        tracing::warn!(limit_secs = limit.as_secs(), "job exceeded its maximum runtime");
                        killed = Some(KillReason::MaxRuntime(limit));
                        self.kill(id).await;
                    }
                }
                _ = ticker.tick() => {
                    match self.runtime.usage(id).await {
                        Ok(sample) => usage.merge(sample),
                        Err(err) => tracing::debug!(error = %err, "unable to sample container usage"),
                    }
                    if killed.is_none() {
                        match self.store.get_job(jid).await {
                            Ok(Some(stored)) if stored.kill_requested => {
                                tracing::info!("kill requested");
                                killed = Some(KillReason::Requested);
                                self.kill(id).await;
                            }
                            Ok(_) => {}
                            Err(err) => tracing::warn!(error = %err, "unable to check the job's kill flag"),
                        }
                    }
                }
            }
        }
    }

    async fn kill(&self, id: &str) {
        if let Err(err) = self.runtime.kill(id).await {
            tracing::error!(error = %err, "unable to kill the container");
        }
    }

    async fn drain(&self, mut attach: JoinHandle<()>) {
        match tokio::time::timeout(self.settings.drain_timeout, &mut attach).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(error = %err, "output task failed"),
            Err(_) => {
                tracing::warn!("output still streaming after the container exited; detaching");
                attach.abort();
            }
        }
    }

    /// A stdout result is the undecoded bytes, so binary output survives intact.
    async fn acquire_result(&self, id: &str, job: &SharedJob, raw_stdout: &RawOutput) {
        let source = job.lock().await.job.result_source.clone();
        match source {
            ResultSource::Stdout => {
                let bytes = std::mem::take(&mut *raw_stdout.lock().await);
                job.lock().await.result = bytes;
            }
            ResultSource::File(path) => match self.runtime.read_file(id, &path).await {
                Ok(contents) => job.lock().await.result = contents,
                Err(err) => {
                    tracing::warn!(path = %path, error = %err, "unable to read the job's result")
                }
            },
        }
    }
}
