//! Subsystem wiring and lifecycle: startup order, periodic cleanup, and the
//! shutdown sequence (stop accepting, drain, stop pools, disconnect).

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::AgentAdapter;
use crate::config::{self, Settings};
use crate::dispatch::{InstantPool, JobDispatcher, MessageExecutor, INSTANT_POOL_SIZE};
use crate::executor::{ExecutorOptions, JobExecutor};
use crate::git::{Git2Operations, GitOperations};
use crate::recovery::Recovery;
use crate::state::{AgentIdentity, RepositoryContext, StateStore};
use crate::transport::{ConnectionManager, ConnectionState, MessageRouter, OutboundSender};
use crate::worktree::WorktreePool;

const CLEANUP_PERIOD: Duration = Duration::from_secs(600);

pub struct Runtime {
    pub settings: Settings,
    pub store: Arc<StateStore>,
    pub repo: RepositoryContext,
    pub adapter: Arc<dyn AgentAdapter>,
    pub agent_id: AgentIdentity,
    pub agent_alias: String,
    pub executor_options: ExecutorOptions,
}

impl Runtime {
    pub async fn run(self) -> anyhow::Result<()> {
        let shutdown = CancellationToken::new();
        let connection_state = ConnectionState::new();
        let sender = OutboundSender::new(connection_state.clone());

        let (git, pool) = self.init_repo_side().await;

        let executor: Arc<dyn MessageExecutor> = JobExecutor::new(
            Arc::clone(&self.store),
            self.repo.clone(),
            git.clone(),
            pool.clone(),
            Arc::clone(&self.adapter),
            Arc::clone(&sender),
            self.executor_options.clone(),
        );
        let dispatcher = JobDispatcher::new(
            self.settings.max_concurrency,
            Arc::clone(&executor),
            Arc::clone(&self.store),
        );
        let instant = InstantPool::new(INSTANT_POOL_SIZE);

        // Replay persisted work before the socket can deliver anything new.
        Recovery::new(Arc::clone(&self.store), Arc::clone(&dispatcher), git.clone())
            .run()
            .await
            .context("crash recovery")?;

        let router = MessageRouter::new(
            Arc::clone(&self.store),
            Arc::clone(&dispatcher),
            Arc::clone(&instant),
            Arc::clone(&executor),
        );
        let manager = Arc::new(ConnectionManager::new(
            self.settings.ws_api_url.clone(),
            self.settings.api_key.clone(),
            self.agent_id.clone(),
            self.repo.repository_id().map(str::to_string),
            self.agent_alias.clone(),
            connection_state.clone(),
            Arc::clone(&sender),
            router,
            shutdown.child_token(),
        ));

        let sender_task = sender.spawn_drain(shutdown.child_token());
        let connection_task = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.run().await }
        });
        let cleanup_task = pool.as_ref().map(|pool| {
            Self::spawn_cleanup_ticker(Arc::clone(pool), shutdown.child_token())
        });

        info!("dockhand runtime started");
        let result = tokio::select! {
            _ = crate::shutdown::wait_for_interrupt() => Ok(()),
            joined = connection_task => match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow::Error::new(e).context("transport")),
                Err(e) => Err(anyhow::Error::new(e).context("connection task")),
            },
        };

        info!("shutting down: draining in-flight work");
        shutdown.cancel();
        dispatcher.shutdown().await;
        instant.shutdown().await;
        if let Some(pool) = &pool {
            pool.stop().await;
        }
        sender.detach().await;
        let _ = sender_task.await;
        if let Some(task) = cleanup_task {
            let _ = task.await;
        }
        info!("shutdown complete");
        result
    }

    /// RepoMode gets a git adapter and a running worktree pool; startup
    /// reclamation runs before the replenisher so crashed slots are counted.
    async fn init_repo_side(
        &self,
    ) -> (Option<Arc<dyn GitOperations>>, Option<Arc<WorktreePool>>) {
        let RepositoryContext::Repo {
            path,
            repository_id,
        } = &self.repo
        else {
            return (None, None);
        };

        let git: Arc<dyn GitOperations> = Arc::new(Git2Operations::new(path));
        let base = config::data_dir()
            .join("worktrees")
            .join(repository_id.replace(['/', ':'], "-"));
        let pool = WorktreePool::new(
            Arc::clone(&git),
            base,
            self.settings.worktree_pool_size,
        );

        if let Err(e) = pool.cleanup_stale_job_worktrees().await {
            warn!(error = %e, "stale job worktree cleanup failed");
        }
        if let Err(e) = pool.reclaim_orphaned_pool_worktrees().await {
            warn!(error = %e, "pool worktree reclamation failed");
        }
        pool.start();

        (Some(git), Some(pool))
    }

    /// Ten-minute orphan sweep; errors are logged, never fatal.
    fn spawn_cleanup_ticker(
        pool: Arc<WorktreePool>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // skip the immediate first tick
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = pool.cleanup_stale_job_worktrees().await {
                            warn!(error = %e, "periodic worktree cleanup failed");
                        }
                        if let Err(e) = pool.cleanup_stale_pool_branches().await {
                            warn!(error = %e, "periodic branch cleanup failed");
                        }
                    }
                }
            }
        })
    }
}
