//! Claude Code adapter.
//!
//! Invokes `claude -p` in single-result JSON mode and reads the session id
//! and result text from the final JSON document on stdout.

use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{extract_failure_message, AgentAdapter, AgentError, AgentTurn, InvocationOptions};
use crate::control::ControlPlaneClient;

/// Model aliases the CLI accepts; full model ids (`claude-*`) pass as-is.
const MODEL_ALIASES: &[&str] = &["sonnet", "opus", "haiku"];

pub struct ClaudeAdapter {
    binary: String,
    control: Arc<ControlPlaneClient>,
}

/// Result document printed by `claude -p --output-format json`.
#[derive(Debug, Deserialize)]
struct ResultDocument {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    is_error: bool,
}

impl ClaudeAdapter {
    pub fn new(control: Arc<ControlPlaneClient>) -> Self {
        Self {
            binary: "claude".to_string(),
            control,
        }
    }

    async fn invoke(
        &self,
        prompt: &str,
        resume: Option<&str>,
        opts: &InvocationOptions,
    ) -> Result<AgentTurn, AgentError> {
        let mut command = Command::new(&self.binary);
        command
            .arg("-p")
            .arg("--output-format")
            .arg("json")
            .current_dir(&opts.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(model) = &opts.model {
            command.arg("--model").arg(model);
        }
        if let Some(session_id) = resume {
            command.arg("--resume").arg(session_id);
        }
        if opts.bypass_permissions {
            command.arg("--dangerously-skip-permissions");
        }
        if let Some(token) = self.control.cached_agent_token().await {
            command.env("CLAUDE_CODE_OAUTH_TOKEN", token);
        }

        command.arg("--").arg(prompt);

        debug!(
            binary = %self.binary,
            working_dir = %opts.working_dir.display(),
            resuming = resume.is_some(),
            "invoking claude"
        );

        let output = command.output().await.map_err(|source| AgentError::Spawn {
            binary: self.binary.clone(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            // The CLI often reports the real cause inside the JSON result
            // even when exiting non-zero.
            if let Ok(doc) = serde_json::from_str::<ResultDocument>(stdout.trim()) {
                if let Some(result) = doc.result.filter(|r| !r.is_empty()) {
                    return Err(AgentError::Process(result));
                }
            }
            return Err(AgentError::Process(extract_failure_message(
                output.status,
                &stdout,
                &stderr,
            )));
        }

        let doc: ResultDocument = serde_json::from_str(stdout.trim()).map_err(|e| {
            AgentError::UnparseableOutput(format!("{e}; stdout was {} bytes", stdout.len()))
        })?;

        if doc.is_error {
            return Err(AgentError::Process(
                doc.result.unwrap_or_else(|| "agent reported an error".to_string()),
            ));
        }

        let session_id = doc
            .session_id
            .filter(|s| !s.is_empty())
            .or_else(|| resume.map(str::to_string))
            .ok_or_else(|| {
                AgentError::UnparseableOutput("result document carries no session_id".to_string())
            })?;

        Ok(AgentTurn {
            session_id,
            output: doc.result.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl AgentAdapter for ClaudeAdapter {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn validate_model(&self, model: &str) -> Result<(), AgentError> {
        if MODEL_ALIASES.contains(&model) || model.starts_with("claude-") {
            Ok(())
        } else {
            Err(AgentError::UnsupportedModel {
                adapter: "claude",
                model: model.to_string(),
            })
        }
    }

    async fn start_session(
        &self,
        prompt: &str,
        opts: &InvocationOptions,
    ) -> Result<AgentTurn, AgentError> {
        self.invoke(prompt, None, opts).await
    }

    async fn continue_session(
        &self,
        session_id: &str,
        prompt: &str,
        opts: &InvocationOptions,
    ) -> Result<AgentTurn, AgentError> {
        self.invoke(prompt, Some(session_id), opts).await
    }

    async fn refresh_token(&self) -> Result<(), AgentError> {
        if self.control.token_delegated_to_proxy() {
            debug!("token management delegated to proxy, skipping refresh");
            return Ok(());
        }
        self.control.refresh_agent_token().await.map_err(|e| {
            warn!(error = %e, "agent token refresh failed");
            AgentError::TokenRefresh(e.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> ClaudeAdapter {
        ClaudeAdapter::new(Arc::new(ControlPlaneClient::disconnected()))
    }

    #[test]
    fn model_validation() {
        let a = adapter();
        assert!(a.validate_model("sonnet").is_ok());
        assert!(a.validate_model("claude-sonnet-4-20250514").is_ok());
        assert!(a.validate_model("gpt-5").is_err());
        assert!(a.validate_model("").is_err());
    }

    #[test]
    fn result_document_parses_cli_output() {
        let doc: ResultDocument = serde_json::from_str(
            r#"{"type":"result","subtype":"success","is_error":false,
                "result":"done","session_id":"abc-123","total_cost_usd":0.01}"#,
        )
        .unwrap();
        assert_eq!(doc.session_id.as_deref(), Some("abc-123"));
        assert_eq!(doc.result.as_deref(), Some("done"));
        assert!(!doc.is_error);
    }

    #[test]
    fn result_document_tolerates_missing_fields() {
        let doc: ResultDocument = serde_json::from_str(r#"{"type":"result"}"#).unwrap();
        assert!(doc.session_id.is_none());
        assert!(doc.result.is_none());
    }
}
