mod memory;

pub use memory::MemoryStore;

use crate::error::StoreError;
use crate::job::{Status, SubmittedJob};
use crate::types::Jid;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::result;

pub type Result<T> = result::Result<T, StoreError>;

/// Result count used when a query does not ask for one.
pub const DEFAULT_LIMIT: usize = 1000;
/// Requests above this are reduced to it.
pub const MAX_LIMIT: usize = 9999;

/// Filter for `JobStore::list_jobs`. Empty sets match everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobQuery {
    pub jids: Vec<Jid>,
    pub names: Vec<String>,
    pub statuses: Vec<Status>,
    /// Only jobs with a greater JID. Results are in JID order, so this pages through them.
    pub after: Option<Jid>,
    pub limit: Option<usize>,
}

impl JobQuery {
    /// The limit a store must apply: the default when unset, clamped to `MAX_LIMIT`.
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT)
    }

    pub fn matches(&self, job: &SubmittedJob) -> bool {
        (self.jids.is_empty() || self.jids.contains(&job.jid))
            && (self.names.is_empty()
                || job
                    .job
                    .name
                    .as_ref()
                    .map_or(false, |name| self.names.contains(name)))
            && (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && self.after.map_or(true, |after| job.jid > after)
    }
}

/// The persistence contract the claim-execute pipeline depends on.
///
/// Implementations are shared by every execution in the process (and, for a real backing store,
/// by every runner process), so each operation must be atomic on its own.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Assign a fresh, never reused JID and store the job.
    async fn insert_job(&self, job: SubmittedJob) -> Result<Jid>;

    /// Atomically move the oldest `queued` job to `processing` and return it.
    ///
    /// Concurrent callers never receive the same job. `Ok(None)` means nothing was eligible.
    async fn claim_job(&self) -> Result<Option<SubmittedJob>>;

    /// Persist the full in-memory state of a job, keyed by JID.
    ///
    /// Called once per output chunk. Fails with `AlreadyFinished` when the stored job is terminal,
    /// and with `InvalidTransition` when the write would move its status backward or into
    /// `processing`, which only `claim_job` may enter.
    /// The kill flag belongs to `request_kill` and is never cleared by an update.
    async fn update_job(&self, job: &SubmittedJob) -> Result<()>;

    async fn get_job(&self, jid: Jid) -> Result<Option<SubmittedJob>>;

    /// Matching jobs in ascending JID order, at most `query.effective_limit()` of them.
    async fn list_jobs(&self, query: &JobQuery) -> Result<Vec<SubmittedJob>>;

    /// Flag a job for termination. The executor holding it observes the flag while it waits.
    async fn request_kill(&self, jid: Jid) -> Result<()>;

    /// Move a job from `processing` to `stalled`. Returns `false` if it had already moved on.
    async fn mark_stalled(&self, jid: Jid, at: DateTime<Utc>) -> Result<bool>;
}
