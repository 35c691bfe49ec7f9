use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, warn};

use super::types::{AgentIdentity, Job, QueuedMessage, RepositoryContext};

/// Errors raised by the persistent state store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// On-disk document. A single JSON file holding identity, repository
/// context, non-terminal jobs, and the per-job ordered message queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedState {
    agent_id: AgentIdentity,
    #[serde(default)]
    repository_context: Option<RepositoryContext>,
    #[serde(default)]
    jobs: HashMap<String, Job>,
    #[serde(default)]
    queued_messages: HashMap<String, Vec<QueuedMessage>>,
}

impl PersistedState {
    fn fresh() -> Self {
        Self {
            agent_id: AgentIdentity::generate(),
            repository_context: None,
            jobs: HashMap::new(),
            queued_messages: HashMap::new(),
        }
    }
}

/// Durable snapshot of jobs and queued messages.
///
/// All mutations are serialized through a single async mutex and flushed
/// with a write-to-temp + rename so readers never observe a partial file.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    inner: tokio::sync::Mutex<PersistedState>,
}

impl StateStore {
    /// Load the store from `path`, or initialize a fresh one (new agent
    /// identity, empty collections) when the file does not exist.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        let state = match fs::read_to_string(&path).await {
            Ok(contents) => {
                let state: PersistedState = serde_json::from_str(&contents)?;
                info!(
                    agent_id = %state.agent_id,
                    jobs = state.jobs.len(),
                    queued = state.queued_messages.values().map(Vec::len).sum::<usize>(),
                    file = %path.display(),
                    "Loaded persisted state"
                );
                state
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let state = PersistedState::fresh();
                info!(
                    agent_id = %state.agent_id,
                    file = %path.display(),
                    "No state file found, generated fresh agent identity"
                );
                state
            }
            Err(e) => return Err(e.into()),
        };

        let store = Self {
            path,
            inner: tokio::sync::Mutex::new(state),
        };
        // Make a fresh identity durable immediately so restarts reuse it.
        store.save().await?;
        Ok(store)
    }

    pub async fn agent_id(&self) -> AgentIdentity {
        self.inner.lock().await.agent_id.clone()
    }

    pub async fn set_repository_context(&self, ctx: RepositoryContext) -> Result<(), StateError> {
        let mut state = self.inner.lock().await;
        state.repository_context = Some(ctx);
        self.flush(&state).await
    }

    /// Persist a queued message. MUST complete before the message is handed
    /// to the dispatcher; a failure here means the message is never executed.
    pub async fn persist_queued_message(&self, msg: &QueuedMessage) -> Result<(), StateError> {
        let mut state = self.inner.lock().await;
        state
            .queued_messages
            .entry(msg.job_id.clone())
            .or_default()
            .push(msg.clone());
        self.flush(&state).await
    }

    /// Remove a message after the executor acknowledged it.
    pub async fn remove_queued_message(
        &self,
        job_id: &str,
        message_id: &str,
    ) -> Result<(), StateError> {
        let mut state = self.inner.lock().await;
        let mut emptied = false;
        if let Some(queue) = state.queued_messages.get_mut(job_id) {
            queue.retain(|m| m.message_id != message_id);
            emptied = queue.is_empty();
        }
        if emptied {
            state.queued_messages.remove(job_id);
        }
        self.flush(&state).await
    }

    /// Drop every queued message for a job (eviction path).
    pub async fn remove_job_messages(&self, job_id: &str) -> Result<(), StateError> {
        let mut state = self.inner.lock().await;
        if state.queued_messages.remove(job_id).is_some() {
            self.flush(&state).await?;
        }
        Ok(())
    }

    pub async fn upsert_job(&self, job: Job) -> Result<(), StateError> {
        let mut state = self.inner.lock().await;
        state.jobs.insert(job.job_id.clone(), job);
        self.flush(&state).await
    }

    pub async fn remove_job(&self, job_id: &str) -> Result<(), StateError> {
        let mut state = self.inner.lock().await;
        if state.jobs.remove(job_id).is_some() {
            self.flush(&state).await?;
        }
        Ok(())
    }

    pub async fn get_job(&self, job_id: &str) -> Option<Job> {
        self.inner.lock().await.jobs.get(job_id).cloned()
    }

    /// Consistent snapshot of all jobs.
    pub async fn jobs_snapshot(&self) -> Vec<Job> {
        self.inner.lock().await.jobs.values().cloned().collect()
    }

    /// All queued messages across jobs, in stable replay order:
    /// `ReceivedAt` first, `MessageId` as the tiebreak.
    pub async fn queued_messages_snapshot(&self) -> Vec<QueuedMessage> {
        let state = self.inner.lock().await;
        let mut messages: Vec<QueuedMessage> = state
            .queued_messages
            .values()
            .flat_map(|q| q.iter().cloned())
            .collect();
        messages.sort_by(|a, b| {
            a.received_at
                .cmp(&b.received_at)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        messages
    }

    async fn save(&self) -> Result<(), StateError> {
        let state = self.inner.lock().await;
        self.flush(&state).await
    }

    /// Write-to-temp + rename so a crash mid-write never corrupts the file.
    async fn flush(&self, state: &PersistedState) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let serialized = serde_json::to_string_pretty(state)?;
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, serialized).await?;
        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

/// Log a dropped inbound message. This is the only path by which an inbound
/// message can be lost, so it is deliberately loud.
pub fn log_dropped_message(msg: &QueuedMessage, err: &StateError) {
    error!(
        job_id = %msg.job_id,
        message_id = %msg.message_id,
        kind = msg.kind.as_str(),
        error = %err,
        "DROPPING inbound message: state persistence failed, message will not be executed"
    );
    warn!(
        job_id = %msg.job_id,
        "the control plane was not notified of the drop; the job may stall until the next message"
    );
}
