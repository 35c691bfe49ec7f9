use git2::{
    BranchType, Cred, IndexAddOption, PushOptions, RemoteCallbacks, Repository, Signature,
    StatusOptions, WorktreeAddOptions, WorktreePruneOptions,
};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Git failures, split for the executor's finalization policy: retryable
/// failures park the job awaiting input, fatal ones fail it.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("git error: {0}")]
    Repository(#[from] git2::Error),

    #[error("push rejected: {0}")]
    PushRejected(String),

    #[error("{0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GitError {
    /// Transient network-ish failures (push conflicts, unreachable remote)
    /// that a later turn may clear without operator intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PushRejected(_) => true,
            Self::Repository(e) => matches!(
                e.class(),
                git2::ErrorClass::Net | git2::ErrorClass::Http | git2::ErrorClass::Ssh
            ),
            _ => false,
        }
    }
}

/// A linked worktree as git knows it.
#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub name: String,
    pub path: PathBuf,
    /// False when the linked directory is missing from git's metadata view.
    pub valid: bool,
}

/// Operations the worktree pool and the job executor need from a repository.
pub trait GitOperations: Send + Sync {
    /// Identifier derived from the `origin` URL (or a deterministic
    /// synthetic value for remote-less repositories); sent on every connect.
    fn repository_identifier(&self) -> Result<String, GitError>;

    fn branch_exists(&self, branch: &str) -> Result<bool, GitError>;

    fn delete_branch(&self, branch: &str) -> Result<(), GitError>;

    fn local_branches_with_prefix(&self, prefix: &str) -> Result<Vec<String>, GitError>;

    /// Create `branch` at HEAD and check it out into a new linked worktree
    /// at `path`. The worktree name is the final path component.
    fn add_worktree(&self, branch: &str, path: &Path) -> Result<(), GitError>;

    /// Relocate a linked worktree directory and repair git's back-pointer.
    fn move_worktree(&self, from: &Path, to: &Path) -> Result<(), GitError>;

    /// Point a worktree's HEAD at a new branch created from its current
    /// commit, then drop the old branch. The working tree is untouched.
    fn switch_worktree_branch(&self, worktree: &Path, new_branch: &str) -> Result<(), GitError>;

    /// Delete the worktree directory and prune its metadata. The branch is
    /// left for the caller to delete.
    fn remove_worktree(&self, path: &Path) -> Result<(), GitError>;

    fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, GitError>;

    /// Equivalent of `git worktree prune`; always safe to run.
    fn prune_worktrees(&self) -> Result<(), GitError>;

    fn worktree_is_valid(&self, path: &Path) -> Result<bool, GitError>;

    fn has_uncommitted_changes(&self, workdir: &Path) -> Result<bool, GitError>;

    /// Stage everything and commit if the tree changed. Returns whether a
    /// commit was created.
    fn commit_all(&self, workdir: &Path, message: &str) -> Result<bool, GitError>;

    fn push_branch(&self, workdir: &Path, branch: &str) -> Result<(), GitError>;
}

/// Implementation of GitOperations using git2.
///
/// Holds only the repository path and opens a `Repository` per call, so the
/// adapter stays `Send + Sync` and callers never carry a libgit2 handle
/// across await points.
#[derive(Debug, Clone)]
pub struct Git2Operations {
    repo_path: PathBuf,
}

impl Git2Operations {
    pub fn new<P: AsRef<Path>>(repo_path: P) -> Self {
        Self {
            repo_path: repo_path.as_ref().to_path_buf(),
        }
    }

    fn open(&self) -> Result<Repository, GitError> {
        Ok(Repository::open(&self.repo_path)?)
    }

    fn open_at(path: &Path) -> Result<Repository, GitError> {
        Ok(Repository::open(path)?)
    }

    fn signature(repo: &Repository) -> Result<Signature<'static>, GitError> {
        // Fall back to a synthetic identity when the checkout has none.
        match repo.signature() {
            Ok(sig) => Ok(sig),
            Err(_) => Ok(Signature::now("Dockhand Agent", "noreply@dockhand.dev")?),
        }
    }

    fn push_callbacks<'a>() -> RemoteCallbacks<'a> {
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(|_url, username_from_url, allowed_types| {
            if allowed_types.contains(git2::CredentialType::SSH_KEY) {
                Cred::ssh_key(
                    username_from_url.unwrap_or("git"),
                    None,
                    std::path::Path::new(&format!(
                        "{}/.ssh/id_rsa",
                        std::env::var("HOME").unwrap_or_default()
                    )),
                    None,
                )
            } else {
                Cred::default()
            }
        });
        callbacks
    }

    fn find_worktree_by_path(
        repo: &Repository,
        path: &Path,
    ) -> Result<Option<git2::Worktree>, GitError> {
        for name in repo.worktrees()?.iter().flatten() {
            let wt = repo.find_worktree(name)?;
            if wt.path() == path {
                return Ok(Some(wt));
            }
        }
        Ok(None)
    }

    /// Parse `host/owner/repo` out of an SSH or HTTPS remote URL.
    pub(crate) fn parse_remote_identifier(url: &str) -> Option<String> {
        // SSH format: git@host:owner/repo.git
        if let Some(rest) = url.strip_prefix("git@") {
            let (_host, path) = rest.split_once(':')?;
            let path = path.strip_suffix(".git").unwrap_or(path);
            let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
            if parts.len() >= 2 {
                return Some(format!("{}/{}", parts[0], parts[1]));
            }
            return None;
        }

        // HTTPS/SSH-URL format: scheme://host/owner/repo.git
        let rest = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .or_else(|| url.strip_prefix("ssh://"))?;
        let (_host, path) = rest.split_once('/')?;
        let path = path.strip_suffix(".git").unwrap_or(path);
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        if parts.len() >= 2 {
            Some(format!("{}/{}", parts[0], parts[1]))
        } else {
            None
        }
    }

    fn synthetic_identifier(&self) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        self.repo_path.hash(&mut hasher);
        let dir = self
            .repo_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "repo".to_string());
        format!("local/{dir}-{:x}", hasher.finish())
    }
}

impl GitOperations for Git2Operations {
    fn repository_identifier(&self) -> Result<String, GitError> {
        let repo = self.open()?;
        let id = repo
            .find_remote("origin")
            .ok()
            .and_then(|remote| remote.url().and_then(Self::parse_remote_identifier))
            .unwrap_or_else(|| self.synthetic_identifier());
        Ok(id)
    }

    fn branch_exists(&self, branch: &str) -> Result<bool, GitError> {
        let repo = self.open()?;
        let exists = repo.find_branch(branch, BranchType::Local).is_ok();
        Ok(exists)
    }

    fn delete_branch(&self, branch: &str) -> Result<(), GitError> {
        let repo = self.open()?;
        let mut branch = repo.find_branch(branch, BranchType::Local)?;
        branch.delete()?;
        Ok(())
    }

    fn local_branches_with_prefix(&self, prefix: &str) -> Result<Vec<String>, GitError> {
        let repo = self.open()?;
        let mut names = Vec::new();
        for entry in repo.branches(Some(BranchType::Local))? {
            let (branch, _) = entry?;
            if let Some(name) = branch.name()? {
                if name.starts_with(prefix) {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    fn add_worktree(&self, branch: &str, path: &Path) -> Result<(), GitError> {
        let repo = self.open()?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| GitError::Invalid(format!("bad worktree path {}", path.display())))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let head = repo.head()?.peel_to_commit()?;
        let created = repo.branch(branch, &head, false)?;
        let branch_ref = created.into_reference();

        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        repo.worktree(name, path, Some(&opts))?;
        Ok(())
    }

    fn move_worktree(&self, from: &Path, to: &Path) -> Result<(), GitError> {
        let repo = self.open()?;
        let wt = Self::find_worktree_by_path(&repo, from)?.ok_or_else(|| {
            GitError::Invalid(format!("{} is not a registered worktree", from.display()))
        })?;
        let name = wt.name().map(str::to_string).ok_or_else(|| {
            GitError::Invalid(format!("worktree at {} has no name", from.display()))
        })?;

        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(from, to)?;

        // The worktree's own `.git` file keeps pointing into the main
        // repository's metadata; only the back-pointer recorded there needs
        // repairing after the directory moved.
        let gitdir_record = repo.path().join("worktrees").join(&name).join("gitdir");
        std::fs::write(&gitdir_record, format!("{}\n", to.join(".git").display()))?;
        Ok(())
    }

    fn switch_worktree_branch(&self, worktree: &Path, new_branch: &str) -> Result<(), GitError> {
        let wt_repo = Self::open_at(worktree)?;
        let old_branch = wt_repo
            .head()
            .ok()
            .and_then(|h| h.shorthand().map(str::to_string));

        let head = wt_repo.head()?.peel_to_commit()?;
        wt_repo.branch(new_branch, &head, false)?;
        wt_repo.set_head(&format!("refs/heads/{new_branch}"))?;

        if let Some(old) = old_branch {
            if old != new_branch {
                // Shared refs: deleting through the worktree handle is fine.
                if let Ok(mut branch) = wt_repo.find_branch(&old, BranchType::Local) {
                    branch.delete()?;
                }
            }
        }
        Ok(())
    }

    fn remove_worktree(&self, path: &Path) -> Result<(), GitError> {
        let repo = self.open()?;
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        if let Some(wt) = Self::find_worktree_by_path(&repo, path)? {
            // The directory is already gone; only the metadata needs pruning.
            let mut opts = WorktreePruneOptions::new();
            opts.valid(true).locked(true);
            wt.prune(Some(&mut opts))?;
        }
        Ok(())
    }

    fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, GitError> {
        let repo = self.open()?;
        let mut out = Vec::new();
        for name in repo.worktrees()?.iter().flatten() {
            let wt = repo.find_worktree(name)?;
            out.push(WorktreeInfo {
                name: name.to_string(),
                path: wt.path().to_path_buf(),
                valid: wt.validate().is_ok() && wt.path().exists(),
            });
        }
        Ok(out)
    }

    fn prune_worktrees(&self) -> Result<(), GitError> {
        let repo = self.open()?;
        for name in repo.worktrees()?.iter().flatten() {
            let wt = repo.find_worktree(name)?;
            let mut check = WorktreePruneOptions::new();
            if wt.is_prunable(Some(&mut check))? {
                let mut opts = WorktreePruneOptions::new();
                wt.prune(Some(&mut opts))?;
            }
        }
        Ok(())
    }

    fn worktree_is_valid(&self, path: &Path) -> Result<bool, GitError> {
        if !path.exists() {
            return Ok(false);
        }
        let repo = self.open()?;
        match Self::find_worktree_by_path(&repo, path)? {
            Some(wt) => Ok(wt.validate().is_ok()),
            None => Ok(false),
        }
    }

    fn has_uncommitted_changes(&self, workdir: &Path) -> Result<bool, GitError> {
        let repo = Self::open_at(workdir)?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(!statuses.is_empty())
    }

    fn commit_all(&self, workdir: &Path, message: &str) -> Result<bool, GitError> {
        let repo = Self::open_at(workdir)?;
        let mut index = repo.index()?;
        index.add_all(["*"], IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let parent = repo.head()?.peel_to_commit()?;
        if parent.tree_id() == tree_id {
            return Ok(false);
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = Self::signature(&repo)?;
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;
        Ok(true)
    }

    fn push_branch(&self, workdir: &Path, branch: &str) -> Result<(), GitError> {
        let repo = Self::open_at(workdir)?;
        let mut remote = repo.find_remote("origin")?;

        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        let mut push_options = PushOptions::new();
        push_options.remote_callbacks(Self::push_callbacks());

        remote
            .push(&[&refspec], Some(&mut push_options))
            .map_err(|e| {
                if e.code() == git2::ErrorCode::NotFastForward {
                    GitError::PushRejected(e.message().to_string())
                } else {
                    GitError::Repository(e)
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_repo() -> (TempDir, Git2Operations) {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("repo");
        std::fs::create_dir_all(&root).unwrap();
        let repo = Repository::init(&root).unwrap();

        let signature = Signature::now("Test", "test@example.com").unwrap();
        std::fs::write(root.join("README"), "seed\n").unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"], IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &signature, &signature, "Initial commit", &tree, &[])
            .unwrap();

        let ops = Git2Operations::new(&root);
        (temp_dir, ops)
    }

    #[test]
    fn worktree_add_list_remove() {
        let (temp_dir, ops) = create_test_repo();
        let wt_path = temp_dir.path().join("wt-a");

        ops.add_worktree("pool-a", &wt_path).unwrap();
        assert!(ops.worktree_is_valid(&wt_path).unwrap());
        assert!(ops.branch_exists("pool-a").unwrap());

        let listed = ops.list_worktrees().unwrap();
        assert!(listed.iter().any(|w| w.path == wt_path && w.valid));

        ops.remove_worktree(&wt_path).unwrap();
        assert!(!ops.worktree_is_valid(&wt_path).unwrap());
        ops.delete_branch("pool-a").unwrap();
        assert!(!ops.branch_exists("pool-a").unwrap());
    }

    #[test]
    fn move_worktree_repairs_metadata() {
        let (temp_dir, ops) = create_test_repo();
        let from = temp_dir.path().join("pool").join("pool-b");
        let to = temp_dir.path().join("jobs").join("job-1");

        ops.add_worktree("pool-b", &from).unwrap();
        ops.move_worktree(&from, &to).unwrap();

        assert!(!from.exists());
        assert!(ops.worktree_is_valid(&to).unwrap());
        // The moved checkout is still a usable repository.
        Repository::open(&to).unwrap();
    }

    #[test]
    fn switch_worktree_branch_renames_without_touching_tree() {
        let (temp_dir, ops) = create_test_repo();
        let wt = temp_dir.path().join("wt-c");

        ops.add_worktree("pool-c", &wt).unwrap();
        std::fs::write(wt.join("scratch.txt"), "keep me").unwrap();
        ops.switch_worktree_branch(&wt, "dockhand/j1").unwrap();

        assert!(ops.branch_exists("dockhand/j1").unwrap());
        assert!(!ops.branch_exists("pool-c").unwrap());
        assert_eq!(std::fs::read_to_string(wt.join("scratch.txt")).unwrap(), "keep me");

        let wt_repo = Repository::open(&wt).unwrap();
        assert_eq!(wt_repo.head().unwrap().shorthand(), Some("dockhand/j1"));
    }

    #[test]
    fn commit_all_detects_clean_and_dirty_trees() {
        let (temp_dir, ops) = create_test_repo();
        let root = temp_dir.path().join("repo");

        assert!(!ops.has_uncommitted_changes(&root).unwrap());
        assert!(!ops.commit_all(&root, "noop").unwrap());

        std::fs::write(root.join("new.txt"), "content").unwrap();
        assert!(ops.has_uncommitted_changes(&root).unwrap());
        assert!(ops.commit_all(&root, "add new.txt").unwrap());
        assert!(!ops.has_uncommitted_changes(&root).unwrap());
    }

    #[test]
    fn branches_with_prefix() {
        let (_temp_dir, ops) = create_test_repo();
        let repo = ops.open().unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        repo.branch("pool-x", &head, false).unwrap();
        repo.branch("pool-y", &head, false).unwrap();
        repo.branch("other", &head, false).unwrap();

        let mut pools = ops.local_branches_with_prefix("pool-").unwrap();
        pools.sort();
        assert_eq!(pools, vec!["pool-x", "pool-y"]);
    }

    #[test]
    fn parse_remote_identifier_formats() {
        assert_eq!(
            Git2Operations::parse_remote_identifier("git@github.com:owner/repo.git").as_deref(),
            Some("owner/repo")
        );
        assert_eq!(
            Git2Operations::parse_remote_identifier("https://github.com/owner/repo").as_deref(),
            Some("owner/repo")
        );
        assert_eq!(
            Git2Operations::parse_remote_identifier("ssh://git@gitlab.com/team/project.git")
                .as_deref(),
            Some("team/project")
        );
        assert_eq!(Git2Operations::parse_remote_identifier("not-a-url"), None);
        assert_eq!(Git2Operations::parse_remote_identifier("git@github.com:owner"), None);
    }

    #[test]
    fn synthetic_identifier_is_deterministic() {
        let (_t, ops) = create_test_repo();
        assert_eq!(ops.synthetic_identifier(), ops.synthetic_identifier());
        assert!(ops.synthetic_identifier().starts_with("local/"));
    }

    #[test]
    fn repository_identifier_without_remote_is_synthetic() {
        let (_t, ops) = create_test_repo();
        let id = ops.repository_identifier().unwrap();
        assert!(id.starts_with("local/"));
    }
}
