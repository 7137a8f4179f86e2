mod docker;

pub use docker::{DockerConfig, DockerRuntime, DockerTls};

use crate::error::RuntimeError;
use crate::job::Collected;
use crate::types::{ContainerId, Output};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::pin::Pin;
use std::result;
use tokio::io::AsyncWrite;

pub type Result<T> = result::Result<T, RuntimeError>;

/// Everything needed to create a job's container.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    /// Keep stdin open for an attached writer, and close it after the first writer detaches.
    pub open_stdin: bool,
}

/// The live streams of an attached container.
pub struct Attached {
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
    pub output: BoxStream<'static, Result<Output>>,
}

/// The container operations an executor needs. Implementations must tolerate concurrent use from
/// many executions at once.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId>;
    async fn attach(&self, id: &str) -> Result<Attached>;
    async fn start(&self, id: &str) -> Result<()>;
    /// Block until the container exits and return its exit status.
    async fn wait(&self, id: &str) -> Result<i64>;
    async fn kill(&self, id: &str) -> Result<()>;
    async fn remove(&self, id: &str) -> Result<()>;
    /// Read a single file out of a (possibly stopped) container.
    async fn read_file(&self, id: &str, path: &str) -> Result<Vec<u8>>;
    /// Sample the container's current resource usage.
    async fn usage(&self, id: &str) -> Result<Collected>;
}
