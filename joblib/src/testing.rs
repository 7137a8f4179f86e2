//! Scripted stand-ins for the store and the container runtime.

use crate::error::{RuntimeError, StoreError};
use crate::job::{Collected, SubmittedJob};
use crate::runtime::{self, Attached, ContainerRuntime, ContainerSpec};
use crate::store::{self, JobQuery, JobStore, MemoryStore};
use crate::types::{ContainerId, Jid, Output};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;
use tokio::sync::Notify;

/// Collects whatever an executor writes to a container's stdin.
#[derive(Clone, Default)]
pub struct StdinCapture {
    bytes: Arc<Mutex<Vec<u8>>>,
    closed: Arc<AtomicBool>,
}

impl StdinCapture {
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl AsyncWrite for StdinCapture {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.bytes.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.closed.store(true, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

/// A stdin the container never reads.
pub struct PendingStdin;

impl AsyncWrite for PendingStdin {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Poll::Pending
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Pending
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Pending
    }
}

/// A stdin whose reader has already gone away.
pub struct BrokenStdin;

impl AsyncWrite for BrokenStdin {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
    }
}

pub fn attached_with(
    input: Pin<Box<dyn AsyncWrite + Send>>,
    output: BoxStream<'static, runtime::Result<Output>>,
) -> Attached {
    Attached { input, output }
}

pub fn attached_from(chunks: Vec<runtime::Result<Output>>) -> (Attached, StdinCapture) {
    let stdin = StdinCapture::default();
    let attached = attached_with(
        Box::pin(stdin.clone()),
        futures::stream::iter(chunks).boxed(),
    );
    (attached, stdin)
}

/// Lifecycle steps a `FakeRuntime` can be told to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Create,
    Attach,
    Start,
    Wait,
    Remove,
    ReadFile,
}

/// A container runtime that plays back a script instead of running anything.
pub struct FakeRuntime {
    chunks: Vec<Output>,
    exit_code: i64,
    fail_at: Vec<Step>,
    hang_until_killed: bool,
    endless_output: bool,
    files: Vec<(String, Vec<u8>)>,
    usage: Collected,
    killed: Notify,
    kills: AtomicBool,
    calls: Mutex<Vec<String>>,
    specs: Mutex<Vec<ContainerSpec>>,
    stdin: StdinCapture,
}

impl FakeRuntime {
    pub fn exiting(exit_code: i64) -> Self {
        Self {
            chunks: Vec::new(),
            exit_code,
            fail_at: Vec::new(),
            hang_until_killed: false,
            endless_output: false,
            files: Vec::new(),
            usage: Collected::default(),
            killed: Notify::new(),
            kills: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            specs: Mutex::new(Vec::new()),
            stdin: StdinCapture::default(),
        }
    }

    pub fn with_output(mut self, chunks: Vec<Output>) -> Self {
        self.chunks = chunks;
        self
    }

    pub fn failing_at(mut self, step: Step) -> Self {
        self.fail_at.push(step);
        self
    }

    /// `wait` only returns once `kill` is called, with exit status 137.
    pub fn hanging(mut self) -> Self {
        self.hang_until_killed = true;
        self
    }

    /// The output stream stays open after the scripted chunks, even once the container exits.
    pub fn endless_output(mut self) -> Self {
        self.endless_output = true;
        self
    }

    pub fn with_file(mut self, path: &str, contents: &[u8]) -> Self {
        self.files.push((path.to_string(), contents.to_vec()));
        self
    }

    pub fn with_usage(mut self, usage: Collected) -> Self {
        self.usage = usage;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn specs(&self) -> Vec<ContainerSpec> {
        self.specs.lock().unwrap().clone()
    }

    pub fn stdin(&self) -> StdinCapture {
        self.stdin.clone()
    }

    fn record(&self, step: Step, id: &str) -> runtime::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{:?} {}", step, id).to_lowercase());
        if self.fail_at.contains(&step) {
            return Err(RuntimeError::Other(format!("injected {:?} failure", step)));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec) -> runtime::Result<ContainerId> {
        self.specs.lock().unwrap().push(spec.clone());
        self.record(Step::Create, &spec.name)?;
        Ok(format!("id-{}", spec.name))
    }

    async fn attach(&self, id: &str) -> runtime::Result<Attached> {
        self.record(Step::Attach, id)?;
        let chunks = self.chunks.iter().cloned().map(Ok).collect::<Vec<_>>();
        let chunks = futures::stream::iter(chunks);
        let output = if self.endless_output {
            chunks.chain(futures::stream::pending()).boxed()
        } else {
            chunks.boxed()
        };
        Ok(attached_with(Box::pin(self.stdin.clone()), output))
    }

    async fn start(&self, id: &str) -> runtime::Result<()> {
        self.record(Step::Start, id)
    }

    async fn wait(&self, id: &str) -> runtime::Result<i64> {
        self.record(Step::Wait, id)?;
        if self.hang_until_killed {
            while !self.kills.load(Ordering::SeqCst) {
                self.killed.notified().await;
            }
            return Ok(137);
        }
        Ok(self.exit_code)
    }

    async fn kill(&self, id: &str) -> runtime::Result<()> {
        self.calls.lock().unwrap().push(format!("kill {}", id));
        self.kills.store(true, Ordering::SeqCst);
        self.killed.notify_one();
        Ok(())
    }

    async fn remove(&self, id: &str) -> runtime::Result<()> {
        self.record(Step::Remove, id)
    }

    async fn read_file(&self, id: &str, path: &str) -> runtime::Result<Vec<u8>> {
        self.record(Step::ReadFile, id)?;
        self.files
            .iter()
            .find(|(name, _)| name == path)
            .map(|(_, contents)| contents.clone())
            .ok_or_else(|| RuntimeError::MissingFile(path.to_string()))
    }

    async fn usage(&self, _id: &str) -> runtime::Result<Collected> {
        Ok(self.usage)
    }
}

/// A `MemoryStore` whose operations can be made to fail on demand.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_claims: AtomicBool,
    fail_updates: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_claims(&self, fail: bool) {
        self.fail_claims.store(fail, Ordering::SeqCst);
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    fn unavailable(flag: &AtomicBool) -> store::Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn insert_job(&self, job: SubmittedJob) -> store::Result<Jid> {
        self.inner.insert_job(job).await
    }

    async fn claim_job(&self) -> store::Result<Option<SubmittedJob>> {
        Self::unavailable(&self.fail_claims)?;
        self.inner.claim_job().await
    }

    async fn update_job(&self, job: &SubmittedJob) -> store::Result<()> {
        Self::unavailable(&self.fail_updates)?;
        self.inner.update_job(job).await
    }

    async fn get_job(&self, jid: Jid) -> store::Result<Option<SubmittedJob>> {
        self.inner.get_job(jid).await
    }

    async fn list_jobs(&self, query: &JobQuery) -> store::Result<Vec<SubmittedJob>> {
        self.inner.list_jobs(query).await
    }

    async fn request_kill(&self, jid: Jid) -> store::Result<()> {
        self.inner.request_kill(jid).await
    }

    async fn mark_stalled(&self, jid: Jid, at: DateTime<Utc>) -> store::Result<bool> {
        self.inner.mark_stalled(jid, at).await
    }
}
