//! Boot-time recovery: runs after the state store loads and before the
//! connection manager accepts events, so replayed work is already queued
//! when the socket comes up.

use std::sync::Arc;
use tracing::{info, warn};

use crate::dispatch::JobDispatcher;
use crate::git::GitOperations;
use crate::state::{JobStatus, StateError, StateStore};

#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryReport {
    /// Messages re-dispatched in persisted order.
    pub replayed: usize,
    /// Jobs whose recorded worktree no longer existed.
    pub cleared_worktrees: usize,
    /// Leftover terminal jobs dropped from the store.
    pub dropped_terminal: usize,
}

pub struct Recovery {
    store: Arc<StateStore>,
    dispatcher: Arc<JobDispatcher>,
    git: Option<Arc<dyn GitOperations>>,
}

impl Recovery {
    pub fn new(
        store: Arc<StateStore>,
        dispatcher: Arc<JobDispatcher>,
        git: Option<Arc<dyn GitOperations>>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            git,
        }
    }

    pub async fn run(&self) -> Result<RecoveryReport, StateError> {
        let mut report = RecoveryReport::default();

        for mut job in self.store.jobs_snapshot().await {
            if job.status.is_terminal() {
                // A crash mid-cleanup can leave a terminal job behind.
                self.store.remove_job(&job.job_id).await?;
                report.dropped_terminal += 1;
                continue;
            }

            let mut changed = false;
            if job.status == JobStatus::InProgress {
                // Interrupted mid-turn; the replayed message drives it back
                // to InProgress, continuing the persisted session.
                job.status = JobStatus::AwaitingInput;
                changed = true;
            }

            if let Some(path) = job.worktree_path.clone() {
                if !self.worktree_still_valid(&path).await {
                    warn!(
                        job_id = %job.job_id,
                        path = %path.display(),
                        "recorded worktree is gone, executor will re-acquire"
                    );
                    job.worktree_path = None;
                    report.cleared_worktrees += 1;
                    changed = true;
                }
            }

            if changed {
                self.store.upsert_job(job).await?;
            }
        }

        // Replay in persisted order; per-job FIFO falls out of the stable
        // (ReceivedAt, MessageId) sort.
        let messages = self.store.queued_messages_snapshot().await;
        report.replayed = messages.len();
        for msg in messages {
            self.dispatcher.dispatch(msg);
        }

        info!(
            replayed = report.replayed,
            cleared_worktrees = report.cleared_worktrees,
            dropped_terminal = report.dropped_terminal,
            "recovery complete"
        );
        Ok(report)
    }

    async fn worktree_still_valid(&self, path: &std::path::Path) -> bool {
        let Some(git) = &self.git else {
            return false;
        };
        let git = Arc::clone(git);
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || git.worktree_is_valid(&path))
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or(false)
    }
}
