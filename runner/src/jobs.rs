use chrono::Utc;
use joblib::types::Jid;
use joblib::{Job, JobQuery, JobStore, SubmittedJob};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct JobFile {
    jobs: Vec<Job>,
}

#[derive(Debug, thiserror::Error)]
pub enum JobFileError {
    #[error("unable to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is not a valid job file: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("job {index} in {path}: {reason}")]
    Invalid {
        path: PathBuf,
        index: usize,
        reason: String,
    },
}

/// Read and validate a `{"jobs": [...]}` document.
pub fn load(path: &Path) -> Result<Vec<Job>, JobFileError> {
    let contents = std::fs::read(path).map_err(|source| JobFileError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let file: JobFile = serde_json::from_slice(&contents).map_err(|source| JobFileError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    for (index, job) in file.jobs.iter().enumerate() {
        job.validate().map_err(|reason| JobFileError::Invalid {
            path: path.to_path_buf(),
            index,
            reason,
        })?;
    }
    Ok(file.jobs)
}

pub async fn submit(
    store: &dyn JobStore,
    jobs: Vec<Job>,
    account: &str,
) -> joblib::Result<Vec<Jid>> {
    let mut jids = Vec::with_capacity(jobs.len());
    for job in jobs {
        let jid = store
            .insert_job(SubmittedJob::new(job, account, Utc::now()))
            .await?;
        tracing::info!(jid, account, "submitted a job");
        jids.push(jid);
    }
    Ok(jids)
}

/// Poll until every job in `jids` is terminal, then return them in JID order.
pub async fn wait_for_terminal(
    store: &dyn JobStore,
    jids: &[Jid],
    poll: Duration,
) -> joblib::Result<Vec<SubmittedJob>> {
    let query = JobQuery {
        jids: jids.to_vec(),
        limit: Some(jids.len()),
        ..JobQuery::default()
    };
    loop {
        let jobs = store.list_jobs(&query).await?;
        if jobs.iter().all(|job| job.status.is_terminal()) {
            return Ok(jobs);
        }
        tokio::time::sleep(poll).await;
    }
}
