use super::messages::ClaimLoopMessage;
use super::ClaimSettings;
use crate::executor::Executor;
use crate::store::JobStore;
use std::sync::Arc;
use tokio::select;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::MissedTickBehavior;

pub struct ClaimLoop {
    inbox: mpsc::Receiver<ClaimLoopMessage>,
    store: Arc<dyn JobStore>,
    executor: Executor,
    settings: ClaimSettings,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl ClaimLoop {
    pub fn spawn(
        inbox: mpsc::Receiver<ClaimLoopMessage>,
        store: Arc<dyn JobStore>,
        executor: Executor,
        settings: ClaimSettings,
    ) {
        let capacity = settings
            .max_in_flight
            .unwrap_or(Semaphore::MAX_PERMITS)
            .min(Semaphore::MAX_PERMITS);
        let actor = Self {
            inbox,
            store,
            executor,
            settings,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        };
        tokio::spawn(async move { actor.run().await });
    }

    async fn run(mut self) {
        use self::ClaimLoopMessage::*;
        tracing::info!(
            poll_ms = self.settings.poll_interval.as_millis() as u64,
            max_in_flight = ?self.settings.max_in_flight,
            "claim loop started"
        );
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                maybe_msg = self.inbox.recv() => {
                    match maybe_msg {
                        Some(InFlight { response }) => {
                            let _ = response.send(self.in_flight());
                        }
                        Some(Stop { response }) => {
                            tracing::info!(in_flight = self.in_flight(), "claim loop stopped");
                            let _ = response.send(self.in_flight());
                            return;
                        }
                        // every handle dropped
                        None => return,
                    }
                }
                _ = ticker.tick() => self.claim_once().await,
            }
        }
    }

    fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    /// One claim attempt. The execution is handed off and never awaited here.
    async fn claim_once(&mut self) {
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::debug!(
                    in_flight = self.in_flight(),
                    "execution ceiling reached, skipping claim"
                );
                return;
            }
        };

        match self.store.claim_job().await {
            Ok(Some(job)) => {
                tracing::info!(jid = job.jid, account = %job.account, "claimed a job");
                let executor = self.executor.clone();
                tokio::spawn(async move {
                    executor.execute(job).await;
                    drop(permit);
                });
            }
            Ok(None) => tracing::trace!("no queued jobs"),
            Err(err) => tracing::error!(error = %err, "unable to claim a job"),
        }
    }
}
