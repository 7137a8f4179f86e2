mod actor;
mod messages;

use self::{actor::ClaimLoop, messages::ClaimLoopMessage};
use crate::error::Exited;
use crate::executor::Executor;
use crate::store::JobStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimSettings {
    /// Bounds how fast new work is picked up, not how much runs at once.
    pub poll_interval: Duration,
    /// Ceiling on concurrent executions. `None` dispatches every claimed job immediately.
    pub max_in_flight: Option<usize>,
}

impl Default for ClaimSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_in_flight: None,
        }
    }
}

/// The claim loop: one claim attempt per poll tick, each claimed job handed to its own execution.
///
/// This struct is an actor handle. The loop itself runs in the actor spawned by
/// `ClaimLoopHandle::spawn` and keeps running until `stop` is called or every handle is dropped.
/// Executions already dispatched are never cancelled by either.
#[derive(Clone)]
pub struct ClaimLoopHandle {
    sender: mpsc::Sender<ClaimLoopMessage>,
}

impl ClaimLoopHandle {
    pub fn spawn(store: Arc<dyn JobStore>, executor: Executor, settings: ClaimSettings) -> Self {
        let (sender, inbox) = mpsc::channel(8);
        ClaimLoop::spawn(inbox, store, executor, settings);
        Self { sender }
    }

    /// Number of executions dispatched by this loop that have not finished yet.
    pub async fn in_flight(&self) -> Result<usize, Exited> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ClaimLoopMessage::InFlight { response: tx })
            .await
            .map_err(|_| Exited("claim loop"))?;
        rx.await.map_err(|_| Exited("claim loop"))
    }

    /// Stop claiming. Returns how many executions were still in flight.
    pub async fn stop(&self) -> Result<usize, Exited> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ClaimLoopMessage::Stop { response: tx })
            .await
            .map_err(|_| Exited("claim loop"))?;
        rx.await.map_err(|_| Exited("claim loop"))
    }
}
