//! Claim queued jobs from a job store and run each one in its own container.

mod actors;
mod collector;
pub mod error;
pub mod executor;
pub mod job;
pub mod runtime;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

// re-export the actor handles as if they were the loops themselves.
pub use actors::claimer::{ClaimLoopHandle as ClaimLoop, ClaimSettings};
pub use actors::reaper::{Reaper, ReaperHandle, ReaperSettings};
pub use error::{Error, Result};
pub use executor::{Executor, ExecutorSettings, ImageTable};
pub use job::{Job, Status, SubmittedJob};
pub use store::{JobQuery, JobStore, MemoryStore};
