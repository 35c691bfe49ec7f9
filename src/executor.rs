//! Per-message job execution: workspace selection, agent CLI invocation,
//! git finalization, reporting, and terminal cleanup.

use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};

use crate::agent::{AgentAdapter, InvocationOptions};
use crate::dispatch::{ExecutionOutcome, MessageExecutor};
use crate::git::{GitError, GitOperations};
use crate::state::{Job, JobStatus, MessageKind, QueuedMessage, RepositoryContext, StateStore};
use crate::transport::{OutboundEvent, OutboundSender};
use crate::worktree::{JobWorktree, WorktreePool};

/// How long a conversation sits in `AwaitingInput` before an idle scan
/// reports it.
const DEFAULT_IDLE_AFTER_SECS: i64 = 600;

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub model: Option<String>,
    pub bypass_permissions: bool,
    pub idle_after_secs: i64,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            model: None,
            bypass_permissions: false,
            idle_after_secs: DEFAULT_IDLE_AFTER_SECS,
        }
    }
}

/// State machine driver for a single `(job, message)` pair.
///
/// Idempotence across crash replays comes from the session model: once a
/// job's `session_id` is persisted, a replayed message continues the session
/// rather than restarting it.
pub struct JobExecutor {
    store: Arc<StateStore>,
    repo: RepositoryContext,
    git: Option<Arc<dyn GitOperations>>,
    pool: Option<Arc<WorktreePool>>,
    adapter: Arc<dyn AgentAdapter>,
    sender: Arc<OutboundSender>,
    options: ExecutorOptions,
}

impl JobExecutor {
    pub fn new(
        store: Arc<StateStore>,
        repo: RepositoryContext,
        git: Option<Arc<dyn GitOperations>>,
        pool: Option<Arc<WorktreePool>>,
        adapter: Arc<dyn AgentAdapter>,
        sender: Arc<OutboundSender>,
        options: ExecutorOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            repo,
            git,
            pool,
            adapter,
            sender,
            options,
        })
    }

    async fn run_conversation_turn(&self, msg: &QueuedMessage) -> ExecutionOutcome {
        if let Err(e) = self.adapter.refresh_token().await {
            warn!(job_id = %msg.job_id, error = %e, "token refresh failed before turn, continuing");
        }

        let mut job = match (msg.kind, self.store.get_job(&msg.job_id).await) {
            (_, Some(job)) => job,
            (MessageKind::StartConversation, None) => Job::new(msg.job_id.as_str()),
            (_, None) => {
                // A turn for a job this worker no longer holds: the control
                // plane declared it lost, poison the id.
                warn!(job_id = %msg.job_id, "message for unknown job, treating as evicted");
                self.sender
                    .enqueue(OutboundEvent::job_status(
                        &msg.job_id,
                        JobStatus::Evicted,
                        Some("job unknown to this worker"),
                    ))
                    .await;
                return ExecutionOutcome::Evict;
            }
        };

        job.status = JobStatus::InProgress;
        job.last_message_at = Utc::now();
        if let Err(e) = self.store.upsert_job(job.clone()).await {
            warn!(job_id = %job.job_id, error = %e, "failed to persist job transition");
        }

        let workdir = match self.select_workspace(&mut job).await {
            Ok(dir) => dir,
            Err(reason) => return self.fail_job(job, reason).await,
        };

        let opts = InvocationOptions {
            working_dir: workdir.clone(),
            model: self.options.model.clone(),
            bypass_permissions: self.options.bypass_permissions,
        };
        let prompt = msg.prompt();
        let turn = if job.has_session() {
            self.adapter
                .continue_session(&job.session_id, prompt, &opts)
                .await
        } else {
            self.adapter.start_session(prompt, &opts).await
        };
        let turn = match turn {
            Ok(turn) => turn,
            Err(e) => return self.fail_job(job, format!("agent invocation failed: {e}")).await,
        };

        job.session_id = turn.session_id.clone();
        if let Err(e) = self.store.upsert_job(job.clone()).await {
            warn!(job_id = %job.job_id, error = %e, "failed to persist session id");
        }

        if self.repo.is_repo() && msg.kind.is_user_turn() {
            if let Err(e) = self.finalize_git(&job, &workdir).await {
                if e.is_retryable() {
                    info!(job_id = %job.job_id, error = %e, "transient git failure, job awaits input");
                    job.status = JobStatus::AwaitingInput;
                    if let Err(e) = self.store.upsert_job(job.clone()).await {
                        warn!(job_id = %job.job_id, error = %e, "failed to persist job transition");
                    }
                    self.sender
                        .enqueue(OutboundEvent::job_output(
                            &job.job_id,
                            &turn.output,
                            JobStatus::AwaitingInput,
                        ))
                        .await;
                    self.sender
                        .enqueue(OutboundEvent::job_status(
                            &job.job_id,
                            JobStatus::AwaitingInput,
                            Some(&format!("git finalization deferred: {e}")),
                        ))
                        .await;
                    return ExecutionOutcome::Continue;
                }
                return self.fail_job(job, format!("git finalization failed: {e}")).await;
            }
        }

        job.status = JobStatus::AwaitingInput;
        if let Err(e) = self.store.upsert_job(job.clone()).await {
            warn!(job_id = %job.job_id, error = %e, "failed to persist job transition");
        }
        self.sender
            .enqueue(OutboundEvent::job_output(
                &job.job_id,
                &turn.output,
                JobStatus::AwaitingInput,
            ))
            .await;
        debug!(job_id = %job.job_id, "conversation turn complete");
        ExecutionOutcome::Continue
    }

    /// NoRepoMode runs in the process working directory; RepoMode reuses the
    /// job's worktree or acquires one from the pool.
    async fn select_workspace(&self, job: &mut Job) -> Result<PathBuf, String> {
        if !self.repo.is_repo() {
            return std::env::current_dir()
                .map_err(|e| format!("working directory unavailable: {e}"));
        }

        if let Some(path) = &job.worktree_path {
            if path.exists() {
                return Ok(path.clone());
            }
        }

        let Some(pool) = &self.pool else {
            return Err("worktree pool not initialized".to_string());
        };
        match pool.acquire(&job.job_id).await {
            Ok(worktree) => {
                job.worktree_path = Some(worktree.path.clone());
                job.branch_name = worktree.branch.clone();
                if let Err(e) = self.store.upsert_job(job.clone()).await {
                    warn!(job_id = %job.job_id, error = %e, "failed to persist worktree assignment");
                }
                Ok(worktree.path)
            }
            Err(e) => Err(format!("workspace acquisition failed: {e}")),
        }
    }

    /// Stage, commit when dirty, and push the job's branch.
    async fn finalize_git(&self, job: &Job, workdir: &std::path::Path) -> Result<(), GitError> {
        let Some(git) = self.git.clone() else {
            return Ok(());
        };
        let message = format!("dockhand: agent turn for job {}", job.job_id);
        let branch = job.branch_name.clone();
        let workdir = workdir.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<(), GitError> {
            if git.has_uncommitted_changes(&workdir)? {
                git.commit_all(&workdir, &message)?;
            }
            git.push_branch(&workdir, &branch)
        })
        .await
        .map_err(|e| GitError::Invalid(format!("git task failed: {e}")))?
    }

    async fn fail_job(&self, mut job: Job, reason: String) -> ExecutionOutcome {
        error!(job_id = %job.job_id, reason = %reason, "job failed");
        job.status = JobStatus::Failed;
        self.sender
            .enqueue(OutboundEvent::job_status(
                &job.job_id,
                JobStatus::Failed,
                Some(&reason),
            ))
            .await;
        self.cleanup_terminal(&job, false).await;
        ExecutionOutcome::Continue
    }

    /// Release the worktree (destroyed, never recycled, on any terminal
    /// transition) and drop the job from the store.
    async fn cleanup_terminal(&self, job: &Job, success: bool) {
        if let (Some(pool), Some(path)) = (&self.pool, &job.worktree_path) {
            pool.release(
                JobWorktree {
                    branch: job.branch_name.clone(),
                    path: path.clone(),
                },
                success,
            )
            .await;
        }
        if let Err(e) = self.store.remove_job(&job.job_id).await {
            warn!(job_id = %job.job_id, error = %e, "failed to remove terminal job from state");
        }
    }

    async fn complete_conversation(&self, msg: &QueuedMessage) -> ExecutionOutcome {
        let Some(mut job) = self.store.get_job(&msg.job_id).await else {
            debug!(job_id = %msg.job_id, "completion for unknown job, ignoring");
            return ExecutionOutcome::Continue;
        };
        info!(job_id = %job.job_id, "conversation completed");
        job.status = JobStatus::Completed;
        self.sender
            .enqueue(OutboundEvent::job_status(&job.job_id, JobStatus::Completed, None))
            .await;
        self.cleanup_terminal(&job, true).await;
        ExecutionOutcome::Continue
    }

    async fn evict_job(&self, msg: &QueuedMessage) -> ExecutionOutcome {
        if let Some(mut job) = self.store.get_job(&msg.job_id).await {
            info!(job_id = %job.job_id, "job evicted by control plane");
            job.status = JobStatus::Evicted;
            if let Err(e) = self.store.upsert_job(job.clone()).await {
                warn!(job_id = %job.job_id, error = %e, "failed to persist eviction");
            }
            self.sender
                .enqueue(OutboundEvent::job_status(
                    &job.job_id,
                    JobStatus::Evicted,
                    Some("declared lost by control plane"),
                ))
                .await;
            self.cleanup_terminal(&job, false).await;
        }
        ExecutionOutcome::Evict
    }

    async fn refresh_token(&self) -> ExecutionOutcome {
        match self.adapter.refresh_token().await {
            Ok(()) => debug!("token refresh complete"),
            Err(e) => warn!(error = %e, "token refresh failed"),
        }
        ExecutionOutcome::Continue
    }

    /// Read-only scan for conversations stuck awaiting input; reports one
    /// summary event. Runs on the instant pool.
    async fn check_idle_jobs(&self) -> ExecutionOutcome {
        let now = Utc::now();
        let mut idle: Vec<String> = self
            .store
            .jobs_snapshot()
            .await
            .into_iter()
            .filter(|job| {
                job.status == JobStatus::AwaitingInput
                    && (now - job.last_message_at).num_seconds() >= self.options.idle_after_secs
            })
            .map(|job| job.job_id)
            .collect();
        idle.sort();
        debug!(idle = idle.len(), "idle job scan complete");
        self.sender.enqueue(OutboundEvent::idle_report(&idle)).await;
        ExecutionOutcome::Continue
    }
}

#[async_trait]
impl MessageExecutor for JobExecutor {
    async fn execute(&self, message: &QueuedMessage) -> ExecutionOutcome {
        let span = crate::telemetry::create_job_span(
            message.kind.as_str(),
            Some(&message.job_id),
            Some(&message.message_id),
        );
        async {
            match message.kind {
                MessageKind::StartConversation | MessageKind::UserMessage => {
                    self.run_conversation_turn(message).await
                }
                MessageKind::CompleteConversation => self.complete_conversation(message).await,
                MessageKind::EvictJob => self.evict_job(message).await,
                MessageKind::RefreshToken => self.refresh_token().await,
                MessageKind::CheckIdleJobs => self.check_idle_jobs().await,
            }
        }
        .instrument(span)
        .await
    }
}
