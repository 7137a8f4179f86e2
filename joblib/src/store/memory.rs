use super::{JobQuery, JobStore, Result};
use crate::error::StoreError;
use crate::job::{Status, SubmittedJob};
use crate::types::Jid;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// A `JobStore` held in process memory.
///
/// A single mutex guards every job, so each operation is one critical section. That makes the
/// claim a true read-modify-write for every caller sharing this instance.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    last_jid: Jid,
    jobs: BTreeMap<Jid, SubmittedJob>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("job table lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, mut job: SubmittedJob) -> Result<Jid> {
        let mut inner = self.lock()?;
        inner.last_jid += 1;
        let jid = inner.last_jid;
        job.jid = jid;
        inner.jobs.insert(jid, job);
        Ok(jid)
    }

    async fn claim_job(&self) -> Result<Option<SubmittedJob>> {
        let mut inner = self.lock()?;
        let oldest = inner
            .jobs
            .values()
            .filter(|job| job.status.is_claimable())
            .min_by_key(|job| (job.created_at, job.jid))
            .map(|job| job.jid);

        Ok(oldest.and_then(|jid| {
            inner.jobs.get_mut(&jid).map(|job| {
                job.status = Status::Processing;
                job.clone()
            })
        }))
    }

    async fn update_job(&self, job: &SubmittedJob) -> Result<()> {
        let mut inner = self.lock()?;
        let stored = inner
            .jobs
            .get_mut(&job.jid)
            .ok_or(StoreError::NotFound(job.jid))?;
        if stored.status.is_terminal() {
            return Err(StoreError::AlreadyFinished {
                jid: job.jid,
                status: stored.status,
            });
        }
        // only a claim may enter processing
        let entering_processing =
            job.status == Status::Processing && stored.status != Status::Processing;
        if entering_processing || job.status.stage() < stored.status.stage() {
            return Err(StoreError::InvalidTransition {
                jid: job.jid,
                from: stored.status,
                to: job.status,
            });
        }
        let kill_requested = stored.kill_requested || job.kill_requested;
        *stored = job.clone();
        stored.kill_requested = kill_requested;
        Ok(())
    }

    async fn get_job(&self, jid: Jid) -> Result<Option<SubmittedJob>> {
        Ok(self.lock()?.jobs.get(&jid).cloned())
    }

    async fn list_jobs(&self, query: &JobQuery) -> Result<Vec<SubmittedJob>> {
        let inner = self.lock()?;
        Ok(inner
            .jobs
            .values()
            .filter(|job| query.matches(job))
            .take(query.effective_limit())
            .cloned()
            .collect())
    }

    async fn request_kill(&self, jid: Jid) -> Result<()> {
        let mut inner = self.lock()?;
        let job = inner.jobs.get_mut(&jid).ok_or(StoreError::NotFound(jid))?;
        job.kill_requested = true;
        Ok(())
    }

    async fn mark_stalled(&self, jid: Jid, at: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.lock()?;
        let job = inner.jobs.get_mut(&jid).ok_or(StoreError::NotFound(jid))?;
        if job.status != Status::Processing {
            return Ok(false);
        }
        job.status = Status::Stalled;
        job.finished_at = Some(at);
        job.compute_delays();
        Ok(true)
    }
}
