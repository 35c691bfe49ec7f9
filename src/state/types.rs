use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Stable identifier for this process instance. Generated on first start and
/// reused across restarts for as long as the state file survives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentIdentity(pub String);

impl AgentIdentity {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether the process is bound to a git repository. Determined once per
/// process start; git operations are disallowed in `NoRepo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum RepositoryContext {
    Repo {
        path: PathBuf,
        /// Derived from the remote URL, or a deterministic synthetic value
        /// when the repository has no remote. Sent on every connect.
        repository_id: String,
    },
    NoRepo,
}

impl RepositoryContext {
    pub fn is_repo(&self) -> bool {
        matches!(self, Self::Repo { .. })
    }

    pub fn repository_id(&self) -> Option<&str> {
        match self {
            Self::Repo { repository_id, .. } => Some(repository_id),
            Self::NoRepo => None,
        }
    }

    pub fn repo_path(&self) -> Option<&std::path::Path> {
        match self {
            Self::Repo { path, .. } => Some(path),
            Self::NoRepo => None,
        }
    }
}

/// Lifecycle of a conversation job.
///
/// `AwaitingInput` returns to `InProgress` when the next user message
/// arrives; the other three right-hand states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    InProgress,
    AwaitingInput,
    Completed,
    Failed,
    Evicted,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Evicted)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "Queued",
            Self::InProgress => "InProgress",
            Self::AwaitingInput => "AwaitingInput",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Evicted => "Evicted",
        };
        f.write_str(s)
    }
}

/// A conversation the agent is working on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: String,
    /// Opaque handle returned by the agent CLI. Empty until the first
    /// successful invocation; once non-empty, subsequent turns continue the
    /// session instead of starting a new one.
    #[serde(default)]
    pub session_id: String,
    pub branch_name: String,
    /// Set exactly when the job first acquires a worktree; cleared on
    /// terminal transitions after cleanup.
    #[serde(default)]
    pub worktree_path: Option<PathBuf>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
}

impl Job {
    pub fn new(job_id: impl Into<String>) -> Self {
        let job_id = job_id.into();
        let now = Utc::now();
        Self {
            branch_name: job_branch_name(&job_id),
            job_id,
            session_id: String::new(),
            worktree_path: None,
            status: JobStatus::Queued,
            created_at: now,
            last_message_at: now,
        }
    }

    pub fn has_session(&self) -> bool {
        !self.session_id.is_empty()
    }
}

/// Branch a job's worktree is checked out on.
pub fn job_branch_name(job_id: &str) -> String {
    format!("dockhand/{job_id}")
}

/// Inbound message kinds understood by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    StartConversation,
    UserMessage,
    CompleteConversation,
    EvictJob,
    CheckIdleJobs,
    RefreshToken,
}

impl MessageKind {
    /// Kinds addressed to a specific conversation; they flow through the
    /// per-job FIFO and are persisted before dispatch.
    pub fn is_job_scoped(&self) -> bool {
        matches!(
            self,
            Self::StartConversation | Self::UserMessage | Self::CompleteConversation | Self::EvictJob
        )
    }

    /// Turns driven by an actual user prompt; these are the ones that run the
    /// agent CLI and finalize git state afterwards.
    pub fn is_user_turn(&self) -> bool {
        matches!(self, Self::StartConversation | Self::UserMessage)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartConversation => "StartConversation",
            Self::UserMessage => "UserMessage",
            Self::CompleteConversation => "CompleteConversation",
            Self::EvictJob => "EvictJob",
            Self::CheckIdleJobs => "CheckIdleJobs",
            Self::RefreshToken => "RefreshToken",
        }
    }
}

impl FromStr for MessageKind {
    type Err = UnknownMessageKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "StartConversation" => Ok(Self::StartConversation),
            "UserMessage" => Ok(Self::UserMessage),
            "CompleteConversation" => Ok(Self::CompleteConversation),
            "EvictJob" => Ok(Self::EvictJob),
            "CheckIdleJobs" => Ok(Self::CheckIdleJobs),
            "RefreshToken" => Ok(Self::RefreshToken),
            other => Err(UnknownMessageKind(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown message kind: {0}")]
pub struct UnknownMessageKind(pub String);

/// A message belonging to a job, persisted before execution begins.
///
/// The ordered list of queued messages for a job is its FIFO queue; an entry
/// is removed only after the executor acknowledges completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub message_id: String,
    pub job_id: String,
    pub kind: MessageKind,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl QueuedMessage {
    pub fn new(job_id: impl Into<String>, kind: MessageKind, payload: serde_json::Value) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.into(),
            kind,
            payload,
            received_at: Utc::now(),
        }
    }

    /// User-facing prompt carried by conversation messages.
    pub fn prompt(&self) -> &str {
        self.payload
            .get("prompt")
            .or_else(|| self.payload.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_kind_round_trips_through_str() {
        for kind in [
            MessageKind::StartConversation,
            MessageKind::UserMessage,
            MessageKind::CompleteConversation,
            MessageKind::EvictJob,
            MessageKind::CheckIdleJobs,
            MessageKind::RefreshToken,
        ] {
            assert_eq!(kind.as_str().parse::<MessageKind>().unwrap(), kind);
        }
        assert!("Bogus".parse::<MessageKind>().is_err());
    }

    #[test]
    fn new_job_starts_queued_without_session() {
        let job = Job::new("j-1");
        assert_eq!(job.status, JobStatus::Queued);
        assert!(!job.has_session());
        assert_eq!(job.branch_name, "dockhand/j-1");
        assert!(job.worktree_path.is_none());
    }

    #[test]
    fn prompt_reads_either_field() {
        let m = QueuedMessage::new(
            "j",
            MessageKind::UserMessage,
            serde_json::json!({"prompt": "hello"}),
        );
        assert_eq!(m.prompt(), "hello");
        let m = QueuedMessage::new(
            "j",
            MessageKind::UserMessage,
            serde_json::json!({"message": "hi"}),
        );
        assert_eq!(m.prompt(), "hi");
        let m = QueuedMessage::new("j", MessageKind::CheckIdleJobs, serde_json::Value::Null);
        assert_eq!(m.prompt(), "");
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Evicted.is_terminal());
        assert!(!JobStatus::AwaitingInput.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
    }
}
