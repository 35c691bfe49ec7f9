//! Preallocated pool of isolated checkouts.
//!
//! `git worktree add` is slow enough (branch creation plus full checkout)
//! that paying it on the conversation path hurts; the pool keeps
//! `WORKTREE_POOL_SIZE` ready worktrees ahead of demand and a background
//! replenisher refills as jobs take them. Acquisition falls back to
//! synchronous creation, so correctness never depends on the pool being
//! full.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::git::{GitError, GitOperations};
use crate::state::job_branch_name;

const REPLENISH_BACKOFF_MIN: std::time::Duration = std::time::Duration::from_secs(5);
const REPLENISH_BACKOFF_MAX: std::time::Duration = std::time::Duration::from_secs(60);

/// Branch prefix marking pool-owned worktrees.
pub const POOL_BRANCH_PREFIX: &str = "pool-";

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error("background task failed: {0}")]
    Task(String),
}

/// A ready worktree waiting in pool storage.
#[derive(Debug, Clone)]
struct PoolSlot {
    branch: String,
    path: PathBuf,
}

/// A worktree handed to a job: checked out on the job's branch under job
/// storage.
#[derive(Debug, Clone)]
pub struct JobWorktree {
    pub branch: String,
    pub path: PathBuf,
}

struct PoolInner {
    ready: VecDeque<PoolSlot>,
}

pub struct WorktreePool {
    git: Arc<dyn GitOperations>,
    pool_dir: PathBuf,
    jobs_dir: PathBuf,
    capacity: usize,
    inner: Mutex<PoolInner>,
    replenish: Notify,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl WorktreePool {
    /// `base_dir` is this repository's worktree storage root; pool slots and
    /// job worktrees live in separate subdirectories below it.
    pub fn new(git: Arc<dyn GitOperations>, base_dir: PathBuf, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            git,
            pool_dir: base_dir.join("pool"),
            jobs_dir: base_dir.join("jobs"),
            capacity: capacity.max(1),
            inner: Mutex::new(PoolInner {
                ready: VecDeque::new(),
            }),
            replenish: Notify::new(),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    pub fn ready_count(&self) -> usize {
        self.inner.lock().unwrap().ready.len()
    }

    pub fn jobs_dir(&self) -> &std::path::Path {
        &self.jobs_dir
    }

    /// Take an isolated checkout for a job. Prefers promoting a ready pool
    /// slot (two renames); creates one synchronously when the pool is empty
    /// so acquisition always succeeds or fails loudly, never deadlocks.
    pub async fn acquire(&self, job_id: &str) -> Result<JobWorktree, WorktreeError> {
        let job_branch = job_branch_name(job_id);
        let slot = self.inner.lock().unwrap().ready.pop_front();
        self.replenish.notify_one();

        if let Some(slot) = slot {
            match self.promote(&slot, job_id, &job_branch) {
                Ok(worktree) => {
                    debug!(
                        job_id,
                        branch = %worktree.branch,
                        path = %worktree.path.display(),
                        "promoted pool worktree"
                    );
                    return Ok(worktree);
                }
                Err(e) => {
                    warn!(
                        job_id,
                        pool_branch = %slot.branch,
                        error = %e,
                        "failed to promote pool worktree, creating a fresh one"
                    );
                    self.destroy(slot.path.clone(), slot.branch.clone()).await;
                }
            }
        }

        let path = self.jobs_dir.join(job_id);
        let git = Arc::clone(&self.git);
        let branch = job_branch.clone();
        let target = path.clone();
        tokio::task::spawn_blocking(move || git.add_worktree(&branch, &target))
            .await
            .map_err(|e| WorktreeError::Task(e.to_string()))??;

        info!(job_id, branch = %job_branch, "created job worktree synchronously");
        Ok(JobWorktree {
            branch: job_branch,
            path,
        })
    }

    /// Move a pool slot into job storage: rename the directory, then point
    /// its HEAD at the job's branch. The pool branch disappears with the
    /// switch, preserving branch/path uniqueness.
    fn promote(
        &self,
        slot: &PoolSlot,
        job_id: &str,
        job_branch: &str,
    ) -> Result<JobWorktree, WorktreeError> {
        let target = self.jobs_dir.join(job_id);
        self.git.move_worktree(&slot.path, &target)?;
        self.git.switch_worktree_branch(&target, job_branch)?;
        Ok(JobWorktree {
            branch: job_branch.to_string(),
            path: target,
        })
    }

    /// Return a worktree after the job reached a terminal state. Job
    /// worktrees are destroyed, not recycled; the replenisher mints fresh
    /// pool slots instead.
    pub async fn release(&self, worktree: JobWorktree, success: bool) {
        debug!(
            branch = %worktree.branch,
            success,
            "releasing job worktree"
        );
        self.destroy(worktree.path, worktree.branch).await;
        self.replenish.notify_one();
    }

    async fn destroy(&self, path: PathBuf, branch: String) {
        let git = Arc::clone(&self.git);
        let result = tokio::task::spawn_blocking(move || -> Result<(), GitError> {
            git.remove_worktree(&path)?;
            if git.branch_exists(&branch)? {
                git.delete_branch(&branch)?;
            }
            git.prune_worktrees()?;
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to destroy worktree"),
            Err(e) => warn!(error = %e, "worktree destruction task failed"),
        }
    }

    /// Launch the background replenisher. It keeps `|ready| = capacity`,
    /// backing off after each creation failure.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.tracker.spawn(async move { this.replenish_loop().await });
        info!(capacity = self.capacity, "worktree pool replenisher started");
    }

    /// Cancel the replenisher and wait for any in-flight creation.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("worktree pool stopped");
    }

    async fn replenish_loop(&self) {
        let mut backoff = REPLENISH_BACKOFF_MIN;
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let deficit = {
                let inner = self.inner.lock().unwrap();
                self.capacity.saturating_sub(inner.ready.len())
            };
            if deficit == 0 {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = self.replenish.notified() => continue,
                }
            }

            match self.create_pool_slot().await {
                Ok(slot) => {
                    debug!(branch = %slot.branch, "pool worktree ready");
                    self.inner.lock().unwrap().ready.push_back(slot);
                    backoff = REPLENISH_BACKOFF_MIN;
                }
                Err(e) => {
                    warn!(error = %e, backoff_secs = backoff.as_secs(), "pool worktree creation failed");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(REPLENISH_BACKOFF_MAX);
                }
            }
        }
    }

    async fn create_pool_slot(&self) -> Result<PoolSlot, WorktreeError> {
        let branch = format!("{POOL_BRANCH_PREFIX}{:08x}", rand::random::<u32>());
        let path = self.pool_dir.join(&branch);
        let git = Arc::clone(&self.git);
        let b = branch.clone();
        let p = path.clone();
        tokio::task::spawn_blocking(move || git.add_worktree(&b, &p))
            .await
            .map_err(|e| WorktreeError::Task(e.to_string()))??;
        Ok(PoolSlot { branch, path })
    }

    /// Startup pass: job worktrees whose git metadata no longer matches a
    /// live directory are deleted along with their branch. Always ends with
    /// a prune, which is safe to run at any time.
    pub async fn cleanup_stale_job_worktrees(&self) -> Result<usize, WorktreeError> {
        let git = Arc::clone(&self.git);
        let jobs_dir = self.jobs_dir.clone();
        let removed = tokio::task::spawn_blocking(move || -> Result<usize, GitError> {
            let mut removed = 0;
            for wt in git.list_worktrees()? {
                if !wt.path.starts_with(&jobs_dir) || wt.valid {
                    continue;
                }
                git.remove_worktree(&wt.path)?;
                if let Some(job_id) = wt.path.file_name().and_then(|n| n.to_str()) {
                    let branch = job_branch_name(job_id);
                    if git.branch_exists(&branch)? {
                        git.delete_branch(&branch)?;
                    }
                }
                removed += 1;
            }
            git.prune_worktrees()?;
            Ok(removed)
        })
        .await
        .map_err(|e| WorktreeError::Task(e.to_string()))??;

        if removed > 0 {
            info!(removed, "cleaned up stale job worktrees");
        }
        Ok(removed)
    }

    /// Startup pass: a crash between "worktree created" and "handed to a
    /// job" leaves orphans in pool storage. Anything that still honors the
    /// pool-slot contract goes back to ready; the rest is destroyed.
    pub async fn reclaim_orphaned_pool_worktrees(&self) -> Result<usize, WorktreeError> {
        let git = Arc::clone(&self.git);
        let pool_dir = self.pool_dir.clone();
        let capacity = self.capacity;
        let slots = tokio::task::spawn_blocking(move || -> Result<Vec<PoolSlot>, GitError> {
            let mut ready = Vec::new();
            let entries = match std::fs::read_dir(&pool_dir) {
                Ok(entries) => entries,
                Err(_) => return Ok(ready),
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().to_string();
                let honors_contract = name.starts_with(POOL_BRANCH_PREFIX)
                    && git.worktree_is_valid(&path).unwrap_or(false)
                    && git.branch_exists(&name).unwrap_or(false);
                if honors_contract && ready.len() < capacity {
                    ready.push(PoolSlot { branch: name, path });
                } else {
                    if path.exists() {
                        let _ = std::fs::remove_dir_all(&path);
                    }
                    if name.starts_with(POOL_BRANCH_PREFIX)
                        && git.branch_exists(&name).unwrap_or(false)
                    {
                        let _ = git.delete_branch(&name);
                    }
                }
            }
            git.prune_worktrees()?;
            Ok(ready)
        })
        .await
        .map_err(|e| WorktreeError::Task(e.to_string()))??;

        let reclaimed = slots.len();
        self.inner.lock().unwrap().ready = slots.into();
        if reclaimed > 0 {
            info!(reclaimed, "reclaimed orphaned pool worktrees");
        }
        Ok(reclaimed)
    }

    /// Periodic pass: drop `pool-*` branches whose worktree directory is
    /// gone and that no ready slot claims.
    pub async fn cleanup_stale_pool_branches(&self) -> Result<usize, WorktreeError> {
        let ready_branches: HashSet<String> = {
            let inner = self.inner.lock().unwrap();
            inner.ready.iter().map(|s| s.branch.clone()).collect()
        };
        let git = Arc::clone(&self.git);
        let pool_dir = self.pool_dir.clone();
        let removed = tokio::task::spawn_blocking(move || -> Result<usize, GitError> {
            let mut removed = 0;
            for branch in git.local_branches_with_prefix(POOL_BRANCH_PREFIX)? {
                if ready_branches.contains(&branch) || pool_dir.join(&branch).exists() {
                    continue;
                }
                git.delete_branch(&branch)?;
                removed += 1;
            }
            Ok(removed)
        })
        .await
        .map_err(|e| WorktreeError::Task(e.to_string()))??;

        if removed > 0 {
            info!(removed, "deleted stale pool branches");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::Git2Operations;
    use git2::{IndexAddOption, Repository, Signature};
    use std::time::Duration;
    use tempfile::TempDir;

    fn seeded_repo(temp: &TempDir) -> Arc<dyn GitOperations> {
        let root = temp.path().join("repo");
        std::fs::create_dir_all(&root).unwrap();
        let repo = Repository::init(&root).unwrap();
        std::fs::write(root.join("README"), "seed\n").unwrap();
        let sig = Signature::now("Test", "test@example.com").unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"], IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
            .unwrap();
        Arc::new(Git2Operations::new(&root))
    }

    async fn wait_for_ready(pool: &WorktreePool, want: usize) {
        for _ in 0..200 {
            if pool.ready_count() >= want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("pool never reached {want} ready worktrees");
    }

    #[tokio::test]
    async fn replenisher_fills_pool_to_capacity() {
        let temp = TempDir::new().unwrap();
        let git = seeded_repo(&temp);
        let pool = WorktreePool::new(git, temp.path().join("wts"), 2);

        pool.start();
        wait_for_ready(&pool, 2).await;
        assert_eq!(pool.ready_count(), 2);
        pool.stop().await;
    }

    #[tokio::test]
    async fn acquire_promotes_ready_slot_into_job_storage() {
        let temp = TempDir::new().unwrap();
        let git = seeded_repo(&temp);
        let pool = WorktreePool::new(Arc::clone(&git), temp.path().join("wts"), 1);

        pool.start();
        wait_for_ready(&pool, 1).await;

        let wt = pool.acquire("job-1").await.unwrap();
        assert_eq!(wt.branch, "dockhand/job-1");
        assert!(wt.path.starts_with(pool.jobs_dir()));
        assert!(git.worktree_is_valid(&wt.path).unwrap());
        assert!(git.branch_exists("dockhand/job-1").unwrap());
        pool.stop().await;
    }

    #[tokio::test]
    async fn acquire_with_empty_pool_creates_synchronously() {
        let temp = TempDir::new().unwrap();
        let git = seeded_repo(&temp);
        let pool = WorktreePool::new(Arc::clone(&git), temp.path().join("wts"), 1);

        // No replenisher running at all.
        let wt = pool.acquire("job-7").await.unwrap();
        assert!(git.worktree_is_valid(&wt.path).unwrap());
        assert!(git.branch_exists("dockhand/job-7").unwrap());
    }

    #[tokio::test]
    async fn release_destroys_worktree_and_branch() {
        let temp = TempDir::new().unwrap();
        let git = seeded_repo(&temp);
        let pool = WorktreePool::new(Arc::clone(&git), temp.path().join("wts"), 1);

        let wt = pool.acquire("job-2").await.unwrap();
        let path = wt.path.clone();
        pool.release(wt, false).await;

        assert!(!path.exists());
        assert!(!git.branch_exists("dockhand/job-2").unwrap());
    }

    #[tokio::test]
    async fn reclaim_keeps_valid_pool_slots_and_destroys_junk() {
        let temp = TempDir::new().unwrap();
        let git = seeded_repo(&temp);
        let base = temp.path().join("wts");
        let pool = WorktreePool::new(Arc::clone(&git), base.clone(), 2);

        // A legitimate orphan from a previous run.
        git.add_worktree("pool-deadbeef", &base.join("pool").join("pool-deadbeef"))
            .unwrap();
        // Junk that honors no contract.
        std::fs::create_dir_all(base.join("pool").join("garbage")).unwrap();

        let reclaimed = pool.reclaim_orphaned_pool_worktrees().await.unwrap();
        assert_eq!(reclaimed, 1);
        assert_eq!(pool.ready_count(), 1);
        assert!(!base.join("pool").join("garbage").exists());
    }

    #[tokio::test]
    async fn cleanup_removes_broken_job_worktrees() {
        let temp = TempDir::new().unwrap();
        let git = seeded_repo(&temp);
        let base = temp.path().join("wts");
        let pool = WorktreePool::new(Arc::clone(&git), base.clone(), 1);

        let wt = pool.acquire("job-3").await.unwrap();
        // Simulate a crash that lost the directory but kept git metadata.
        std::fs::remove_dir_all(&wt.path).unwrap();

        let removed = pool.cleanup_stale_job_worktrees().await.unwrap();
        assert_eq!(removed, 1);
        assert!(!git.branch_exists("dockhand/job-3").unwrap());
        assert!(!git.worktree_is_valid(&wt.path).unwrap());
    }

    #[tokio::test]
    async fn stale_pool_branch_cleanup() {
        let temp = TempDir::new().unwrap();
        let git = seeded_repo(&temp);
        let base = temp.path().join("wts");
        let pool = WorktreePool::new(Arc::clone(&git), base.clone(), 1);

        // Branch with a vanished worktree directory.
        let path = base.join("pool").join("pool-gone");
        git.add_worktree("pool-gone", &path).unwrap();
        std::fs::remove_dir_all(&path).unwrap();
        git.prune_worktrees().unwrap();

        let removed = pool.cleanup_stale_pool_branches().await.unwrap();
        assert_eq!(removed, 1);
        assert!(!git.branch_exists("pool-gone").unwrap());
    }
}
