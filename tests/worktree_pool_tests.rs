//! Pool replenisher behavior under creation failure (scenario: transient
//! git failures must not wedge the pool or mint duplicate branches).
//! Testing library/framework: Rust built-in test framework with Tokio async
//! runtime and tempfile scratch repositories.

use git2::{IndexAddOption, Repository, Signature};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use dockhand::git::{Git2Operations, GitError, GitOperations, WorktreeInfo};
use dockhand::worktree::WorktreePool;

fn seeded_repo(temp: &TempDir) -> Git2Operations {
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
    Git2Operations::new(&root)
}

/// Delegates to the real adapter but fails the first N worktree creations.
struct FlakyGit {
    inner: Git2Operations,
    failures_left: AtomicUsize,
}

impl FlakyGit {
    fn new(inner: Git2Operations, failures: usize) -> Self {
        Self {
            inner,
            failures_left: AtomicUsize::new(failures),
        }
    }
}

impl GitOperations for FlakyGit {
    fn repository_identifier(&self) -> Result<String, GitError> {
        self.inner.repository_identifier()
    }
    fn branch_exists(&self, branch: &str) -> Result<bool, GitError> {
        self.inner.branch_exists(branch)
    }
    fn delete_branch(&self, branch: &str) -> Result<(), GitError> {
        self.inner.delete_branch(branch)
    }
    fn local_branches_with_prefix(&self, prefix: &str) -> Result<Vec<String>, GitError> {
        self.inner.local_branches_with_prefix(prefix)
    }
    fn add_worktree(&self, branch: &str, path: &Path) -> Result<(), GitError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(GitError::Invalid("simulated creation failure".to_string()));
        }
        self.inner.add_worktree(branch, path)
    }
    fn move_worktree(&self, from: &Path, to: &Path) -> Result<(), GitError> {
        self.inner.move_worktree(from, to)
    }
    fn switch_worktree_branch(&self, worktree: &Path, new_branch: &str) -> Result<(), GitError> {
        self.inner.switch_worktree_branch(worktree, new_branch)
    }
    fn remove_worktree(&self, path: &Path) -> Result<(), GitError> {
        self.inner.remove_worktree(path)
    }
    fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, GitError> {
        self.inner.list_worktrees()
    }
    fn prune_worktrees(&self) -> Result<(), GitError> {
        self.inner.prune_worktrees()
    }
    fn worktree_is_valid(&self, path: &Path) -> Result<bool, GitError> {
        self.inner.worktree_is_valid(path)
    }
    fn has_uncommitted_changes(&self, workdir: &Path) -> Result<bool, GitError> {
        self.inner.has_uncommitted_changes(workdir)
    }
    fn commit_all(&self, workdir: &Path, message: &str) -> Result<bool, GitError> {
        self.inner.commit_all(workdir, message)
    }
    fn push_branch(&self, workdir: &Path, branch: &str) -> Result<(), GitError> {
        self.inner.push_branch(workdir, branch)
    }
}

/// One simulated failure, then recovery: the pool still reaches capacity,
/// branch names stay unique, and a synchronous acquire never deadlocks.
#[tokio::test(flavor = "multi_thread")]
async fn replenisher_recovers_from_creation_failures() {
    let temp = TempDir::new().unwrap();
    let git: Arc<dyn GitOperations> = Arc::new(FlakyGit::new(seeded_repo(&temp), 1));
    let pool = WorktreePool::new(Arc::clone(&git), temp.path().join("wts"), 2);

    pool.start();

    // First creation fails, the replenisher backs off and retries. Budget
    // covers the backoff interval.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while pool.ready_count() < 2 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "pool never recovered from the simulated failure"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // No duplicate branches were ever created.
    let branches = git.local_branches_with_prefix("pool-").unwrap();
    let unique: std::collections::HashSet<&String> = branches.iter().collect();
    assert_eq!(branches.len(), unique.len());
    assert_eq!(branches.len(), 2);

    // Acquire drains the pool and the replenisher refills behind it.
    let wt = pool.acquire("job-1").await.unwrap();
    assert!(wt.path.exists());

    pool.stop().await;
}

/// Acquire-then-failed-release restores pool capacity within one
/// replenisher cycle.
#[tokio::test(flavor = "multi_thread")]
async fn failed_release_is_replenished() {
    let temp = TempDir::new().unwrap();
    let git: Arc<dyn GitOperations> = Arc::new(seeded_repo(&temp));
    let pool = WorktreePool::new(Arc::clone(&git), temp.path().join("wts"), 1);

    pool.start();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while pool.ready_count() < 1 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let wt = pool.acquire("job-1").await.unwrap();
    pool.release(wt, false).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while pool.ready_count() < 1 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "pool was not replenished after release"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    pool.stop().await;
}
