//! Persisting a running container's output into its job.
//!
//! Each execution has two `OutputCollector`s, one per stream. Both share the executor's in-memory
//! `SubmittedJob` and write it back to the store after every chunk, so partial output is visible
//! while the container runs.

use crate::error::{RuntimeError, StoreError};
use crate::job::SubmittedJob;
use crate::runtime::Attached;
use crate::store::JobStore;
use crate::types::StreamKind;
use futures::StreamExt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

pub type SharedJob = Arc<Mutex<SubmittedJob>>;

/// The undecoded bytes of a stream, in arrival order.
pub type RawOutput = Arc<Mutex<Vec<u8>>>;

/// Why an attached stream stopped delivering before end of output.
#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error("output stream broke: {0}")]
    Output(#[source] RuntimeError),
    #[error("unable to persist {stream} chunk: {source}")]
    Persist {
        stream: &'static str,
        #[source]
        source: StoreError,
    },
}

/// Incremental UTF-8 decoding that survives multi-byte sequences split across chunks.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut text = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(bad) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        // truncated sequence: wait for the next chunk
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        self.pending = rest.to_vec();
        text
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Appends one stream's chunks to the shared job and persists each one.
pub struct OutputCollector {
    store: Arc<dyn JobStore>,
    job: SharedJob,
    stream: StreamKind,
    decoder: Utf8Decoder,
    raw: Option<RawOutput>,
}

impl OutputCollector {
    pub fn new(store: Arc<dyn JobStore>, job: SharedJob, stream: StreamKind) -> Self {
        Self {
            store,
            job,
            stream,
            decoder: Utf8Decoder::default(),
            raw: None,
        }
    }

    /// Also keep every acknowledged chunk, byte for byte, in `raw`.
    pub fn keeping_raw(mut self, raw: RawOutput) -> Self {
        self.raw = Some(raw);
        self
    }

    /// Append a chunk and persist the job. Returns the number of bytes acknowledged, which is zero
    /// when the update fails.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<usize, StreamError> {
        tracing::trace!(
            length = chunk.len(),
            stream = self.stream.as_str(),
            "received output from a job"
        );
        let text = self.decoder.decode(chunk);
        self.persist(&text).await?;
        if let Some(raw) = &self.raw {
            raw.lock().await.extend_from_slice(chunk);
        }
        Ok(chunk.len())
    }

    /// Flush any bytes held back by the decoder.
    pub async fn finish(&mut self) -> Result<(), StreamError> {
        let text = self.decoder.finish();
        if text.is_empty() {
            return Ok(());
        }
        self.persist(&text).await
    }

    async fn persist(&self, text: &str) -> Result<(), StreamError> {
        // hold the lock across the write so no stale copy of the job is ever persisted last
        let mut job = self.job.lock().await;
        job.append(self.stream, text);
        self.store
            .update_job(&job)
            .await
            .map_err(|source| StreamError::Persist {
                stream: self.stream.as_str(),
                source,
            })
    }
}

/// Drive an attached container: deliver stdin while routing output chunks to the collectors,
/// until the output stream ends.
///
/// A stdin failure is logged and output keeps flowing. Stdin still undelivered when output ends
/// is abandoned.
pub async fn pump(
    attached: Attached,
    stdin: Vec<u8>,
    mut stdout: OutputCollector,
    mut stderr: OutputCollector,
) -> Result<(), StreamError> {
    let Attached { input, mut output } = attached;

    let delivery = deliver(input, stdin);
    tokio::pin!(delivery);
    let mut delivering = true;

    loop {
        tokio::select! {
            biased;
            delivered = &mut delivery, if delivering => {
                delivering = false;
                if let Err(err) = delivered {
                    tracing::warn!(error = %err, "unable to deliver stdin");
                }
            }
            chunk = output.next() => {
                let chunk = match chunk {
                    Some(chunk) => chunk.map_err(StreamError::Output)?,
                    None => break,
                };
                let collector = match chunk.kind() {
                    StreamKind::Stdout => &mut stdout,
                    StreamKind::Stderr => &mut stderr,
                };
                collector.write(&chunk.into_blob()).await?;
            }
        }
    }
    if delivering {
        tracing::debug!("output ended before stdin was consumed");
    }

    stdout.finish().await?;
    stderr.finish().await?;
    Ok(())
}

// stdin is single-use: closing it lets the command see EOF
async fn deliver(mut input: Pin<Box<dyn AsyncWrite + Send>>, stdin: Vec<u8>) -> io::Result<()> {
    input.write_all(&stdin).await?;
    input.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use crate::store::MemoryStore;
    use crate::testing::{attached_from, attached_with, BrokenStdin, FlakyStore, PendingStdin};
    use crate::types::Output;
    use bytes::Bytes;
    use chrono::Utc;
    use std::time::Duration;
    use tracing_test::traced_test;

    async fn claimed(store: &Arc<dyn JobStore>) -> SharedJob {
        store
            .insert_job(SubmittedJob::new(Job::new("cat"), "admin", Utc::now()))
            .await
            .unwrap();
        let job = store.claim_job().await.unwrap().unwrap();
        Arc::new(Mutex::new(job))
    }

    #[test]
    fn decoder_joins_split_sequences() {
        let mut decoder = Utf8Decoder::default();
        let snowman = "☃".as_bytes();
        assert_eq!(decoder.decode(&[b'a', snowman[0]]), "a");
        assert_eq!(decoder.decode(&snowman[1..]), "☃");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"ok\xffok"), "ok\u{fffd}ok");
        assert_eq!(decoder.decode(b"\xe2\x98"), "");
        assert_eq!(decoder.finish(), "\u{fffd}");
    }

    #[tokio::test]
    async fn persists_every_chunk_in_order() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
        let job = claimed(&store).await;
        let jid = job.lock().await.jid;
        let mut collector = OutputCollector::new(store.clone(), job.clone(), StreamKind::Stdout);

        assert_eq!(collector.write(b"hello ").await.unwrap(), 6);
        let partial = store.get_job(jid).await.unwrap().unwrap();
        assert_eq!(partial.stdout, "hello ");

        collector.write(b"world").await.unwrap();
        let stored = store.get_job(jid).await.unwrap().unwrap();
        assert_eq!(stored.stdout, "hello world");
        assert_eq!(stored.stderr, "");
    }

    #[tokio::test]
    async fn failed_update_is_not_acknowledged() {
        let flaky = Arc::new(FlakyStore::new());
        let store: Arc<dyn JobStore> = flaky.clone();
        let job = claimed(&store).await;
        let mut collector = OutputCollector::new(store, job, StreamKind::Stderr);

        flaky.fail_updates(true);
        assert!(matches!(
            collector.write(b"lost").await,
            Err(StreamError::Persist { stream: "stderr", .. })
        ));
    }

    #[tokio::test]
    async fn pump_routes_streams_and_delivers_stdin() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
        let job = claimed(&store).await;
        let jid = job.lock().await.jid;
        let (attached, stdin) = attached_from(vec![
            Ok(Output::Stdout(Bytes::from_static(b"one "))),
            Ok(Output::Stderr(Bytes::from_static(b"warn"))),
            Ok(Output::Stdout(Bytes::from_static(b"two"))),
        ]);

        pump(
            attached,
            b"input".to_vec(),
            OutputCollector::new(store.clone(), job.clone(), StreamKind::Stdout),
            OutputCollector::new(store.clone(), job.clone(), StreamKind::Stderr),
        )
        .await
        .unwrap();

        let stored = store.get_job(jid).await.unwrap().unwrap();
        assert_eq!(stored.stdout, "one two");
        assert_eq!(stored.stderr, "warn");
        assert_eq!(stdin.contents(), b"input");
        assert!(stdin.is_closed());
    }

    #[tokio::test]
    async fn pump_stops_on_broken_stream() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
        let job = claimed(&store).await;
        let (attached, _stdin) = attached_from(vec![
            Ok(Output::Stdout(Bytes::from_static(b"kept"))),
            Err(RuntimeError::Other("connection reset".into())),
            Ok(Output::Stdout(Bytes::from_static(b"never"))),
        ]);

        let result = pump(
            attached,
            Vec::new(),
            OutputCollector::new(store.clone(), job.clone(), StreamKind::Stdout),
            OutputCollector::new(store.clone(), job.clone(), StreamKind::Stderr),
        )
        .await;

        assert!(matches!(result, Err(StreamError::Output(_))));
        assert_eq!(job.lock().await.stdout, "kept");
    }

    #[tokio::test]
    async fn keeps_raw_bytes_when_asked() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
        let job = claimed(&store).await;
        let raw = RawOutput::default();
        let mut collector = OutputCollector::new(store.clone(), job.clone(), StreamKind::Stdout)
            .keeping_raw(raw.clone());

        collector.write(b"\xff").await.unwrap();
        collector.write(b"\x00ok").await.unwrap();
        assert_eq!(raw.lock().await.as_slice(), b"\xff\x00ok");
        assert_eq!(job.lock().await.stdout, "\u{fffd}\0ok");
    }

    #[tokio::test]
    async fn output_flows_while_stdin_is_blocked() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
        let job = claimed(&store).await;
        let jid = job.lock().await.jid;
        let attached = attached_with(
            Box::pin(PendingStdin),
            futures::stream::iter(vec![Ok(Output::Stdout(Bytes::from_static(b"live")))])
                .chain(futures::stream::pending())
                .boxed(),
        );

        let pumping = pump(
            attached,
            vec![0; 1 << 20],
            OutputCollector::new(store.clone(), job.clone(), StreamKind::Stdout),
            OutputCollector::new(store.clone(), job.clone(), StreamKind::Stderr),
        );
        assert!(tokio::time::timeout(Duration::from_millis(200), pumping)
            .await
            .is_err());
        assert_eq!(store.get_job(jid).await.unwrap().unwrap().stdout, "live");
    }

    #[tokio::test]
    #[traced_test]
    async fn stdin_failure_keeps_collecting_output() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
        let job = claimed(&store).await;
        let jid = job.lock().await.jid;
        let attached = attached_with(
            Box::pin(BrokenStdin),
            futures::stream::iter(vec![Ok(Output::Stdout(Bytes::from_static(b"hello")))]).boxed(),
        );

        pump(
            attached,
            b"ignored".to_vec(),
            OutputCollector::new(store.clone(), job.clone(), StreamKind::Stdout),
            OutputCollector::new(store.clone(), job.clone(), StreamKind::Stderr),
        )
        .await
        .unwrap();

        assert_eq!(store.get_job(jid).await.unwrap().unwrap().stdout, "hello");
        assert!(logs_contain("unable to deliver stdin"));
    }
}
