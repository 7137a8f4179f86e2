//! Stall detection for executions that ended without recording a terminal status.
//!
//! An execution that aborts on a lifecycle failure leaves its job in `processing`. The reaper
//! periodically marks such jobs `stalled` once they are overdue: their effective max runtime plus
//! a grace period has elapsed since they started (or since submission if they never started).

mod actor;
mod messages;

use self::{actor::ReaperActor, messages::ReaperMessage};
use crate::error::Exited;
use crate::job::{Status, SubmittedJob};
use crate::store::{self, JobQuery, JobStore, MAX_LIMIT};
use crate::types::Jid;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReaperSettings {
    pub interval: Duration,
    pub grace: Duration,
    /// Limit for jobs that declare none. Jobs with no limit at all are never reaped.
    pub default_max_runtime: Option<Duration>,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            grace: Duration::from_secs(60),
            default_max_runtime: None,
        }
    }
}

/// Finds and marks overdue `processing` jobs.
pub struct Reaper {
    store: Arc<dyn JobStore>,
    settings: ReaperSettings,
    page_size: usize,
}

impl Reaper {
    pub fn new(store: Arc<dyn JobStore>, settings: ReaperSettings) -> Self {
        Self {
            store,
            settings,
            page_size: MAX_LIMIT,
        }
    }

    #[cfg(test)]
    fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// The instant after which `job` counts as stalled, if it can stall at all.
    pub fn overdue_at(&self, job: &SubmittedJob) -> Option<DateTime<Utc>> {
        let limit = job
            .job
            .declared_max_runtime()
            .or(self.settings.default_max_runtime)?;
        let since = job.started_at.or(job.created_at)?;
        let allowed = chrono::Duration::from_std(limit + self.settings.grace).ok()?;
        since.checked_add_signed(allowed)
    }

    /// Mark every overdue `processing` job as `stalled`. Returns the JIDs that were marked.
    pub async fn sweep(&self, now: DateTime<Utc>) -> store::Result<Vec<Jid>> {
        let mut query = JobQuery {
            statuses: vec![Status::Processing],
            limit: Some(self.page_size),
            ..JobQuery::default()
        };
        let page_size = query.effective_limit();
        let mut stalled = Vec::new();
        loop {
            let page = self.store.list_jobs(&query).await?;
            for job in &page {
                match self.overdue_at(job) {
                    Some(deadline) if now > deadline => {}
                    _ => continue,
                }
                // the job may have finished since it was listed; the store only applies the
                // transition from `processing`
                if self.store.mark_stalled(job.jid, now).await? {
                    tracing::warn!(jid = job.jid, account = %job.account, "marked an overdue job as stalled");
                    stalled.push(job.jid);
                }
            }
            match page.last() {
                Some(last) if page.len() == page_size => query.after = Some(last.jid),
                _ => return Ok(stalled),
            }
        }
    }
}

/// Handle to a `Reaper` sweeping on its own task every `ReaperSettings::interval`.
#[derive(Clone)]
pub struct ReaperHandle {
    sender: mpsc::Sender<ReaperMessage>,
}

impl ReaperHandle {
    pub fn spawn(reaper: Reaper) -> Self {
        let (sender, inbox) = mpsc::channel(8);
        ReaperActor::spawn(inbox, reaper);
        Self { sender }
    }

    /// Sweep now instead of waiting for the next interval.
    pub async fn sweep(&self) -> Result<store::Result<Vec<Jid>>, Exited> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ReaperMessage::Sweep { response: tx })
            .await
            .map_err(|_| Exited("reaper"))?;
        rx.await.map_err(|_| Exited("reaper"))
    }

    pub async fn stop(&self) {
        let _ = self.sender.send(ReaperMessage::Stop).await;
    }
}
