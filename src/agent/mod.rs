//! Agent CLI adapters.
//!
//! The core never parses conversation content; it hands a prompt to an
//! adapter and gets back an opaque output plus the session handle needed to
//! continue the conversation later.

pub mod claude;
pub mod codex;

pub use claude::ClaudeAdapter;
pub use codex::CodexAdapter;

use crate::control::ControlPlaneClient;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to spawn agent binary '{binary}': {source}")]
    Spawn {
        binary: String,
        source: std::io::Error,
    },

    #[error("agent process failed: {0}")]
    Process(String),

    #[error("could not parse agent output: {0}")]
    UnparseableOutput(String),

    #[error("unsupported model '{model}' for adapter {adapter}")]
    UnsupportedModel { adapter: &'static str, model: String },

    #[error("unknown agent adapter '{0}'")]
    UnknownAdapter(String),

    #[error("token refresh failed: {0}")]
    TokenRefresh(String),
}

/// Per-invocation options, resolved once at startup from the CLI surface.
#[derive(Debug, Clone)]
pub struct InvocationOptions {
    pub working_dir: PathBuf,
    pub model: Option<String>,
    pub bypass_permissions: bool,
}

/// One completed conversation turn.
#[derive(Debug, Clone)]
pub struct AgentTurn {
    /// Handle to continue this conversation; never empty on success.
    pub session_id: String,
    /// The agent's textual output, passed through opaquely.
    pub output: String,
}

/// An external command-line coding agent. Both calls block until the
/// subprocess exits and buffer its full stdout.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Reject models this adapter cannot drive. Called once at startup.
    fn validate_model(&self, model: &str) -> Result<(), AgentError>;

    async fn start_session(
        &self,
        prompt: &str,
        opts: &InvocationOptions,
    ) -> Result<AgentTurn, AgentError>;

    async fn continue_session(
        &self,
        session_id: &str,
        prompt: &str,
        opts: &InvocationOptions,
    ) -> Result<AgentTurn, AgentError>;

    /// Refresh upstream credentials before a turn. No-op for adapters that
    /// manage their own auth.
    async fn refresh_token(&self) -> Result<(), AgentError> {
        Ok(())
    }
}

/// Select an adapter by its `--agent` name.
pub fn adapter_for(
    name: &str,
    control: Arc<ControlPlaneClient>,
) -> Result<Arc<dyn AgentAdapter>, AgentError> {
    match name {
        "claude" => Ok(Arc::new(ClaudeAdapter::new(control))),
        "codex" => Ok(Arc::new(CodexAdapter::new())),
        other => Err(AgentError::UnknownAdapter(other.to_string())),
    }
}

/// Pull a human-readable failure message out of a dead subprocess's output:
/// prefer the last non-empty stderr line, fall back to stdout, then to the
/// exit status.
pub(crate) fn extract_failure_message(
    status: std::process::ExitStatus,
    stdout: &str,
    stderr: &str,
) -> String {
    let last_line = |s: &str| {
        s.lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
    };
    last_line(stderr)
        .or_else(|| last_line(stdout))
        .unwrap_or_else(|| format!("agent exited with {status}"))
}
