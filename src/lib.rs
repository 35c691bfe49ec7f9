// Dockhand - resilient agent worker daemon
// This exposes the core components for testing and integration

pub mod agent;
pub mod cli;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod executor;
pub mod git;
pub mod lock;
pub mod recovery;
pub mod runtime;
pub mod shutdown;
pub mod state;
pub mod telemetry;
pub mod transport;
pub mod worktree;

// Re-export key types for easy access
pub use agent::{adapter_for, AgentAdapter, AgentError, AgentTurn, InvocationOptions};
pub use crate::config::{ConfigError, Settings};
pub use control::{ControlPlaneClient, ControlPlaneError};
pub use dispatch::{
    ExecutionOutcome, InstantPool, JobDispatcher, MessageExecutor, INSTANT_POOL_SIZE,
    PROCESS_JOB_KEY,
};
pub use executor::{ExecutorOptions, JobExecutor};
pub use git::{detect_repository, Git2Operations, GitError, GitOperations};
pub use lock::{InstanceLock, LockError};
pub use recovery::{Recovery, RecoveryReport};
pub use runtime::Runtime;
pub use state::{
    AgentIdentity, Job, JobStatus, MessageKind, QueuedMessage, RepositoryContext, StateError,
    StateStore,
};
pub use telemetry::{generate_correlation_id, init_telemetry, shutdown_telemetry};
pub use transport::{
    ConnectionManager, ConnectionState, ConnectionStatus, EventEnvelope, MessageRouter,
    OutboundEvent, OutboundSender, TransportError,
};
pub use worktree::{JobWorktree, WorktreeError, WorktreePool};
