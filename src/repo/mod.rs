//! Repository handles: the working copy of one target repository and the git
//! operations the lifecycle drives against it.
//!
//! | Module  | Responsibility                                              |
//! |---------|-------------------------------------------------------------|
//! | `git`   | `GitRepository`, the libgit2-backed handle                  |
//! | `pool`  | `RepositoryPool`, one shared handle per repository URL      |
//! | `paths` | `resolve_in_repo()`, the path-escape security boundary      |

pub mod git;
pub mod paths;
pub mod pool;

use std::path::Path;

use async_trait::async_trait;

use crate::errors::FixError;
use crate::lifecycle::models::RepositoryRef;

pub use git::{GitRepository, GitRepositoryFactory};
pub use pool::{RepositoryPool, SharedHandle};

/// Abstraction over a working copy for testability.
/// Real implementation: `GitRepository`. Test double: `MockRepository` (tests).
///
/// Methods take `&mut self` because every operation mutates the working copy;
/// callers serialize access through [`RepositoryPool`].
#[async_trait]
pub trait RepositoryHandle: Send + Sync {
    fn url(&self) -> &str;

    fn local_path(&self) -> &Path;

    fn default_branch(&self) -> &str;

    /// Clone if absent, fast-forward the default branch if present.
    async fn ensure_local(&mut self) -> Result<(), FixError>;

    /// Best-effort read for source context. `Ok(None)` when the file is absent.
    async fn read_file(&self, path: &str) -> Result<Option<String>, FixError>;

    /// Create `name` from the default branch head and check it out.
    async fn create_branch(&mut self, name: &str) -> Result<(), FixError>;

    /// Check out an existing local branch.
    async fn checkout_branch(&mut self, name: &str) -> Result<(), FixError>;

    async fn write_file(&mut self, path: &str, content: &str) -> Result<(), FixError>;

    /// Commit the files written since the last commit. Returns the commit id.
    async fn commit(&mut self, message: &str) -> Result<String, FixError>;

    /// Id of the commit currently checked out.
    async fn head_commit(&self) -> Result<String, FixError>;

    async fn push(&mut self, branch: &str) -> Result<(), FixError>;

    /// Return the working copy to the default branch, discarding uncommitted
    /// changes. Branches are left in place.
    async fn restore_default(&mut self) -> Result<(), FixError>;
}

/// Creates handles for repositories the pool has not seen yet.
pub trait RepositoryFactory: Send + Sync {
    fn open(&self, repository: &RepositoryRef) -> Box<dyn RepositoryHandle>;
}

/// Canonical identity of a repository URL: trailing slashes and `.git` do not
/// make a different repository.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    url.strip_suffix(".git").unwrap_or(url).to_string()
}

/// Directory name for a repository's working copy, taken from the last URL
/// segment (`https://github.com/o/widget.git` -> `widget`).
pub fn repo_dir_name(url: &str) -> String {
    let normalized = normalize_url(url);
    let last = normalized
        .rsplit(['/', ':', '\\'])
        .next()
        .unwrap_or_default();
    let cleaned: String = last
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches(|c| c == '.' || c == '-').to_string();
    if cleaned.is_empty() {
        "repo".to_string()
    } else {
        cleaned
    }
}
