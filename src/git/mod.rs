//! Git adapter: repository discovery and the operations the worktree pool
//! and job executor run against a checkout.

pub mod operations;

pub use operations::{GitError, GitOperations, Git2Operations, WorktreeInfo};

use crate::state::RepositoryContext;
use std::path::Path;

/// Resolve the repository context for this process start.
///
/// An explicit `--repo` path must contain a git repository; otherwise the
/// working directory is probed, and a miss means NoRepoMode (all git
/// operations disabled).
pub fn detect_repository(explicit: Option<&Path>) -> Result<RepositoryContext, GitError> {
    match explicit {
        Some(path) => {
            let repo = git2::Repository::open(path).map_err(|e| {
                GitError::Invalid(format!(
                    "--repo path {} is not a git repository: {}",
                    path.display(),
                    e.message()
                ))
            })?;
            let root = repo
                .workdir()
                .ok_or_else(|| {
                    GitError::Invalid(format!(
                        "--repo path {} is a bare repository",
                        path.display()
                    ))
                })?
                .to_path_buf();
            let ops = Git2Operations::new(&root);
            Ok(RepositoryContext::Repo {
                repository_id: ops.repository_identifier()?,
                path: root,
            })
        }
        None => {
            let cwd = std::env::current_dir()?;
            match git2::Repository::discover(&cwd) {
                Ok(repo) => {
                    let root = match repo.workdir() {
                        Some(root) => root.to_path_buf(),
                        None => return Ok(RepositoryContext::NoRepo),
                    };
                    let ops = Git2Operations::new(&root);
                    Ok(RepositoryContext::Repo {
                        repository_id: ops.repository_identifier()?,
                        path: root,
                    })
                }
                Err(_) => Ok(RepositoryContext::NoRepo),
            }
        }
    }
}
