//! Persisted job and message state.
//!
//! The store is the hinge of crash safety: inbound messages are written here
//! before they reach the dispatcher and removed only after execution
//! completes, so a restart replays exactly what was in flight.

pub mod store;
pub mod types;

pub use store::{log_dropped_message, StateError, StateStore};
pub use types::{
    job_branch_name, AgentIdentity, Job, JobStatus, MessageKind, QueuedMessage, RepositoryContext,
    UnknownMessageKind,
};
