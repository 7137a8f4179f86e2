use crate::job::Status;
use crate::types::Jid;
use std::{io, result};

/// Failures reported by a `JobStore`.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("job {0} does not exist")]
    NotFound(Jid),
    #[error("job {jid} already finished as {status}")]
    AlreadyFinished { jid: Jid, status: Status },
    #[error("job {jid} cannot move from {from} to {to}")]
    InvalidTransition { jid: Jid, from: Status, to: Status },
    #[error("job store unavailable: {0}")]
    Unavailable(String),
}

/// Failures reported by a `ContainerRuntime`.
#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("{0} not found in container")]
    MissingFile(String),
    #[error("container runtime: {0}")]
    Other(String),
}

/// The lifecycle steps whose failure aborts an execution.
///
/// Every variant leaves the job in `processing`; stall detection picks it up from there.
#[derive(thiserror::Error, Debug)]
pub enum ExecError {
    #[error("unable to create the job's container: {0}")]
    Create(#[source] RuntimeError),
    #[error("unable to start the container: {0}")]
    Start(#[source] RuntimeError),
    #[error("unable to wait for the container to exit: {0}")]
    Wait(#[source] RuntimeError),
    #[error("unable to persist the job's final state: {0}")]
    Finish(#[source] StoreError),
}

/// Returned by an actor handle whose actor is no longer running.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("{0} has exited")]
pub struct Exited(pub &'static str);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Exec(#[from] ExecError),
}

pub type Result<T> = result::Result<T, Error>;
