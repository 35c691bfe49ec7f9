//! Codex CLI adapter.
//!
//! Runs `codex exec --json` and reads the thread id plus the final agent
//! message from the JSONL event stream on stdout.

use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use super::{extract_failure_message, AgentAdapter, AgentError, AgentTurn, InvocationOptions};

pub struct CodexAdapter {
    binary: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ExecEvent {
    #[serde(rename = "thread.started")]
    ThreadStarted { thread_id: String },
    #[serde(rename = "item.completed")]
    ItemCompleted { item: ExecItem },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ExecItem {
    #[serde(rename = "agent_message")]
    AgentMessage {
        #[serde(default)]
        text: String,
    },
    #[serde(other)]
    Other,
}

impl CodexAdapter {
    pub fn new() -> Self {
        Self {
            binary: "codex".to_string(),
        }
    }

    async fn invoke(
        &self,
        prompt: &str,
        resume: Option<&str>,
        opts: &InvocationOptions,
    ) -> Result<AgentTurn, AgentError> {
        let mut command = Command::new(&self.binary);
        command.arg("exec");
        if let Some(thread_id) = resume {
            command.arg("resume").arg(thread_id);
        }
        command
            .arg("--json")
            .current_dir(&opts.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(model) = &opts.model {
            command.arg("--model").arg(model);
        }
        if opts.bypass_permissions {
            command.arg("--dangerously-bypass-approvals-and-sandbox");
        }

        command.arg("--").arg(prompt);

        debug!(
            binary = %self.binary,
            working_dir = %opts.working_dir.display(),
            resuming = resume.is_some(),
            "invoking codex"
        );

        let output = command.output().await.map_err(|source| AgentError::Spawn {
            binary: self.binary.clone(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            return Err(AgentError::Process(extract_failure_message(
                output.status,
                &stdout,
                &stderr,
            )));
        }

        Self::parse_event_stream(&stdout, resume)
    }

    fn parse_event_stream(stdout: &str, resume: Option<&str>) -> Result<AgentTurn, AgentError> {
        let mut thread_id = resume.map(str::to_string);
        let mut last_message = None;

        for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let event: ExecEvent = match serde_json::from_str(line) {
                Ok(event) => event,
                // Tolerate non-event noise on stdout.
                Err(_) => continue,
            };
            match event {
                ExecEvent::ThreadStarted { thread_id: id } => thread_id = Some(id),
                ExecEvent::ItemCompleted {
                    item: ExecItem::AgentMessage { text },
                } => last_message = Some(text),
                ExecEvent::Error { message } => {
                    return Err(AgentError::Process(message));
                }
                _ => {}
            }
        }

        let session_id = thread_id.ok_or_else(|| {
            AgentError::UnparseableOutput("event stream carries no thread id".to_string())
        })?;

        Ok(AgentTurn {
            session_id,
            output: last_message.unwrap_or_default(),
        })
    }
}

impl Default for CodexAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentAdapter for CodexAdapter {
    fn name(&self) -> &'static str {
        "codex"
    }

    fn validate_model(&self, model: &str) -> Result<(), AgentError> {
        // Codex accepts free-form model names; only reject the degenerate case.
        if model.trim().is_empty() {
            Err(AgentError::UnsupportedModel {
                adapter: "codex",
                model: model.to_string(),
            })
        } else {
            Ok(())
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
}
