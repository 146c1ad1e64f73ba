//! libgit2-backed [`RepositoryHandle`].
//!
//! All git work runs on tokio's blocking pool. Each handle owns a workdir lock
//! whose guard travels into the blocking task, so an operation abandoned by a
//! timeout still finishes before the next one touches the working copy.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    BranchType, Cred, CredentialType, ErrorClass, ErrorCode, FetchOptions, PushOptions,
    RemoteCallbacks, Repository, Signature,
};
use sha2::{Digest, Sha256};

use super::paths::resolve_in_repo;
use super::{RepositoryFactory, RepositoryHandle, normalize_url, repo_dir_name};
use crate::config::Secret;
use crate::errors::FixError;
use crate::lifecycle::models::RepositoryRef;

const MAX_CREDENTIAL_TRIES: u32 = 3;
const REMOTE: &str = "origin";

/// Author used for fix commits.
#[derive(Debug, Clone)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
}

pub struct GitRepository {
    url: String,
    local_path: PathBuf,
    default_branch: String,
    token: Option<Secret>,
    identity: CommitIdentity,
    /// Paths written since the last commit, relative to the root.
    staged: Vec<String>,
    workdir_lock: Arc<tokio::sync::Mutex<()>>,
}

impl std::fmt::Debug for GitRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitRepository")
            .field("url", &self.url)
            .field("local_path", &self.local_path)
            .field("default_branch", &self.default_branch)
            .field("token", &self.token)
            .finish()
    }
}

impl GitRepository {
    pub fn new(
        url: impl Into<String>,
        local_path: impl Into<PathBuf>,
        default_branch: Option<String>,
        token: Option<Secret>,
        identity: CommitIdentity,
    ) -> Self {
        let local_path = local_path.into();
        let default_branch = default_branch
            .or_else(|| {
                Repository::open(&local_path)
                    .ok()
                    .and_then(|repo| detect_default_branch(&repo))
            })
            .unwrap_or_else(|| "main".to_string());
        Self {
            url: url.into(),
            local_path,
            default_branch,
            token,
            identity,
            staged: Vec::new(),
            workdir_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Run `f` on the blocking pool while holding the workdir lock.
    async fn blocking<F, R>(&self, operation: &'static str, f: F) -> Result<R, FixError>
    where
        F: FnOnce() -> Result<R, FixError> + Send + 'static,
        R: Send + 'static,
    {
        let guard = self.workdir_lock.clone().lock_owned().await;
        let path = self.local_path.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            f()
        })
        .await
        .map_err(|e| FixError::WorkingCopyCorrupt {
            path,
            reason: format!("{} task failed: {}", operation, e),
        })?
    }
}

#[async_trait]
impl RepositoryHandle for GitRepository {
    fn url(&self) -> &str {
        &self.url
    }

    fn local_path(&self) -> &Path {
        &self.local_path
    }

    fn default_branch(&self) -> &str {
        &self.default_branch
    }

    async fn ensure_local(&mut self) -> Result<(), FixError> {
        let url = self.url.clone();
        let path = self.local_path.clone();
        let token = self.token.clone();
        let configured = self.default_branch.clone();

        let branch = self
            .blocking("ensure_local", move || {
                if path.join(".git").exists() {
                    let repo = open(&path)?;
                    verify_origin(&repo, &url, &path)?;
                    let branch = detect_default_branch(&repo).unwrap_or(configured);
                    fast_forward(&repo, &url, &path, &branch, token)?;
                    tracing::debug!(repo = %url, branch = %branch, "working copy up to date");
                    Ok(branch)
                } else {
                    let repo = clone_into(&url, &path, token)?;
                    let branch = head_branch(&repo).unwrap_or(configured);
                    tracing::info!(repo = %url, path = %path.display(), branch = %branch, "cloned repository");
                    Ok(branch)
                }
            })
            .await?;

        self.default_branch = branch;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Option<String>, FixError> {
        let full = resolve_in_repo(&self.local_path, path)?;
        Ok(tokio::fs::read_to_string(&full).await.ok())
    }

    async fn create_branch(&mut self, name: &str) -> Result<(), FixError> {
        let path = self.local_path.clone();
        let url = self.url.clone();
        let default = self.default_branch.clone();
        let name = name.to_string();

        self.blocking("create_branch", move || {
            let repo = open_existing(&path, &url)?;
            if repo.find_branch(&name, BranchType::Local).is_ok() {
                return Err(FixError::BranchAlreadyExists { branch: name });
            }
            let corrupt = |reason: String| FixError::WorkingCopyCorrupt {
                path: path.clone(),
                reason,
            };

            let base = repo
                .find_branch(&default, BranchType::Local)
                .or_else(|_| repo.find_branch(&format!("{}/{}", REMOTE, default), BranchType::Remote))
                .and_then(|b| b.get().peel_to_commit())
                .map_err(|e| corrupt(format!("default branch '{}' not found: {}", default, e.message())))?;

            repo.branch(&name, &base, false)
                .map_err(|e| corrupt(format!("failed to create branch '{}': {}", name, e.message())))?;
            repo.checkout_tree(base.as_object(), Some(CheckoutBuilder::new().safe()))
                .and_then(|_| repo.set_head(&format!("refs/heads/{}", name)))
                .map_err(|e| corrupt(format!("failed to check out '{}': {}", name, e.message())))?;
            Ok(())
        })
        .await?;

        self.staged.clear();
        Ok(())
    }

    async fn checkout_branch(&mut self, name: &str) -> Result<(), FixError> {
        let path = self.local_path.clone();
        let url = self.url.clone();
        let name = name.to_string();

        self.blocking("checkout_branch", move || {
            let repo = open_existing(&path, &url)?;
            checkout_local(&repo, &name, true).map_err(|e| FixError::WorkingCopyCorrupt {
                path: path.clone(),
                reason: format!("failed to check out '{}': {}", name, e.message()),
            })
        })
        .await?;

        self.staged.clear();
        Ok(())
    }

    async fn write_file(&mut self, path: &str, content: &str) -> Result<(), FixError> {
        let full = resolve_in_repo(&self.local_path, path)?;
        let relative = full
            .strip_prefix(&self.local_path)
            .map(git_path)
            .map_err(|_| FixError::PathOutsideRepository {
                path: path.to_string(),
            })?;
        let root = self.local_path.clone();
        let content = content.to_string();

        self.blocking("write_file", move || {
            let io_err = |e: std::io::Error| FixError::WorkingCopyCorrupt {
                path: root.clone(),
                reason: format!("failed to write {}: {}", full.display(), e),
            };
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
            std::fs::write(&full, content).map_err(io_err)
        })
        .await?;

        if !self.staged.contains(&relative) {
            self.staged.push(relative);
        }
        Ok(())
    }

    async fn commit(&mut self, message: &str) -> Result<String, FixError> {
        let path = self.local_path.clone();
        let url = self.url.clone();
        let staged = self.staged.clone();
        let identity = self.identity.clone();
        let message = message.to_string();

        let result = self
            .blocking("commit", move || {
                let repo = open_existing(&path, &url)?;
                commit_paths(&repo, &path, &staged, &identity, &message)
            })
            .await;

        if matches!(result, Ok(_) | Err(FixError::NothingToCommit)) {
            self.staged.clear();
        }
        result
    }

    async fn head_commit(&self) -> Result<String, FixError> {
        let path = self.local_path.clone();
        let url = self.url.clone();

        self.blocking("head_commit", move || {
            let repo = open_existing(&path, &url)?;
            repo.head()
                .and_then(|h| h.peel_to_commit())
                .map(|c| c.id().to_string())
                .map_err(|e| FixError::WorkingCopyCorrupt {
                    path: path.clone(),
                    reason: e.message().to_string(),
                })
        })
        .await
    }

    async fn push(&mut self, branch: &str) -> Result<(), FixError> {
        let path = self.local_path.clone();
        let url = self.url.clone();
        let token = self.token.clone();
        let branch_name = branch.to_string();

        self.blocking("push", move || {
            let repo = open_existing(&path, &url)?;
            push_branch(&repo, &url, &branch_name, token)
        })
        .await?;

        tracing::info!(repo = %self.url, branch = %branch, "pushed branch");
        Ok(())
    }

    async fn restore_default(&mut self) -> Result<(), FixError> {
        let path = self.local_path.clone();
        let url = self.url.clone();
        let default = self.default_branch.clone();

        self.blocking("restore_default", move || {
            let repo = open_existing(&path, &url)?;
            checkout_local(&repo, &default, true).map_err(|e| FixError::WorkingCopyCorrupt {
                path: path.clone(),
                reason: format!("failed to restore '{}': {}", default, e.message()),
            })
        })
        .await?;

        self.staged.clear();
        Ok(())
    }
}

/// Index paths always use `/`.
fn git_path(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn open(path: &Path) -> Result<Repository, FixError> {
    Repository::open(path).map_err(|e| FixError::WorkingCopyCorrupt {
        path: path.to_path_buf(),
        reason: e.message().to_string(),
    })
}

fn open_existing(path: &Path, url: &str) -> Result<Repository, FixError> {
    if !path.join(".git").exists() {
        return Err(FixError::RepositoryUnavailable {
            url: url.to_string(),
            reason: "no local working copy; ensure_local has not succeeded".to_string(),
        });
    }
    open(path)
}

/// An existing working copy must have been cloned from `url`.
fn verify_origin(repo: &Repository, url: &str, path: &Path) -> Result<(), FixError> {
    let remote = repo
        .find_remote(REMOTE)
        .map_err(|e| FixError::WorkingCopyCorrupt {
            path: path.to_path_buf(),
            reason: format!("remote '{}' missing: {}", REMOTE, e.message()),
        })?;
    let origin = remote.url().unwrap_or_default();
    if normalize_url(origin) != normalize_url(url) {
        return Err(FixError::WorkingCopyCorrupt {
            path: path.to_path_buf(),
            reason: format!("working copy belongs to {}, not {}", origin, url),
        });
    }
    Ok(())
}

fn credential_callbacks<'a>(token: Option<Secret>) -> RemoteCallbacks<'a> {
    let mut callbacks = RemoteCallbacks::new();
    let mut tries = 0u32;
    callbacks.credentials(move |_url, username_from_url, allowed| {
        tries += 1;
        if tries > MAX_CREDENTIAL_TRIES {
            return Err(git2::Error::new(
                ErrorCode::Auth,
                ErrorClass::Callback,
                "credentials rejected by remote",
            ));
        }
        if allowed.contains(CredentialType::USER_PASS_PLAINTEXT)
            && let Some(token) = &token
        {
            return Cred::userpass_plaintext("x-access-token", token.expose());
        }
        if allowed.contains(CredentialType::SSH_KEY) {
            return Cred::ssh_key_from_agent(username_from_url.unwrap_or("git"));
        }
        if allowed.contains(CredentialType::DEFAULT) {
            return Cred::default();
        }
        Err(git2::Error::new(
            ErrorCode::Auth,
            ErrorClass::Callback,
            "no usable credentials configured",
        ))
    });
    callbacks
}

fn is_auth_error(err: &git2::Error) -> bool {
    err.code() == ErrorCode::Auth
        || err.message().contains("401")
        || err.message().to_lowercase().contains("authentication")
}

fn clone_into(url: &str, path: &Path, token: Option<Secret>) -> Result<Repository, FixError> {
    let unavailable = |reason: String| FixError::RepositoryUnavailable {
        url: url.to_string(),
        reason,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| unavailable(format!("cannot create {}: {}", parent.display(), e)))?;
    }

    let existed = path.exists();
    let mut fetch = FetchOptions::new();
    fetch.remote_callbacks(credential_callbacks(token));
    let mut builder = RepoBuilder::new();
    builder.fetch_options(fetch);

    builder.clone(url, path).map_err(|e| {
        if !existed
            && path.exists()
            && let Err(cleanup) = std::fs::remove_dir_all(path)
        {
            tracing::warn!(path = %path.display(), error = %cleanup, "failed to remove partial clone");
        }
        unavailable(e.message().to_string())
    })
}

/// Bring the local default branch up to date with the remote. Only
/// fast-forwards are taken; anything else means the working copy has drifted.
fn fast_forward(
    repo: &Repository,
    url: &str,
    path: &Path,
    branch: &str,
    token: Option<Secret>,
) -> Result<(), FixError> {
    let corrupt = |reason: String| FixError::WorkingCopyCorrupt {
        path: path.to_path_buf(),
        reason,
    };

    let mut status_opts = git2::StatusOptions::new();
    status_opts.include_untracked(false);
    let dirty = repo
        .statuses(Some(&mut status_opts))
        .map_err(|e| corrupt(e.message().to_string()))?
        .len();
    if dirty > 0 {
        return Err(corrupt(format!("{} tracked files have local modifications", dirty)));
    }

    let mut remote = repo
        .find_remote(REMOTE)
        .map_err(|e| corrupt(format!("remote '{}' missing: {}", REMOTE, e.message())))?;
    let mut fetch = FetchOptions::new();
    fetch.remote_callbacks(credential_callbacks(token));
    let refspec = format!("+refs/heads/{0}:refs/remotes/{1}/{0}", branch, REMOTE);
    remote
        .fetch(&[refspec.as_str()], Some(&mut fetch), None)
        .map_err(|e| FixError::RepositoryUnavailable {
            url: url.to_string(),
            reason: e.message().to_string(),
        })?;

    let remote_ref = repo
        .find_reference(&format!("refs/remotes/{}/{}", REMOTE, branch))
        .map_err(|e| corrupt(format!("remote branch '{}' missing: {}", branch, e.message())))?;
    let upstream = repo
        .reference_to_annotated_commit(&remote_ref)
        .map_err(|e| corrupt(e.message().to_string()))?;
    let local_name = format!("refs/heads/{}", branch);

    let Ok(mut local_ref) = repo.find_reference(&local_name) else {
        repo.reference(&local_name, upstream.id(), false, "fixloop: track remote default")
            .map_err(|e| corrupt(e.message().to_string()))?;
        return checkout_local(repo, branch, true).map_err(|e| corrupt(e.message().to_string()));
    };

    let (analysis, _) = repo
        .merge_analysis_for_ref(&local_ref, &[&upstream])
        .map_err(|e| corrupt(e.message().to_string()))?;

    if analysis.is_up_to_date() {
        return checkout_local(repo, branch, false).map_err(|e| corrupt(e.message().to_string()));
    }
    if !analysis.is_fast_forward() {
        return Err(corrupt(format!(
            "local '{}' has diverged from {}/{}",
            branch, REMOTE, branch
        )));
    }

    local_ref
        .set_target(upstream.id(), "fixloop: fast-forward")
        .map_err(|e| corrupt(e.message().to_string()))?;
    checkout_local(repo, branch, true).map_err(|e| corrupt(e.message().to_string()))
}

fn checkout_local(repo: &Repository, branch: &str, force: bool) -> Result<(), git2::Error> {
    let reference = repo.find_branch(branch, BranchType::Local)?.into_reference();
    let commit = reference.peel_to_commit()?;
    let mut checkout = CheckoutBuilder::new();
    if force {
        checkout.force().remove_untracked(true);
    } else {
        checkout.safe();
    }
    repo.checkout_tree(commit.as_object(), Some(&mut checkout))?;
    repo.set_head(&format!("refs/heads/{}", branch))
}

fn commit_paths(
    repo: &Repository,
    root: &Path,
    staged: &[String],
    identity: &CommitIdentity,
    message: &str,
) -> Result<String, FixError> {
    let corrupt = |e: git2::Error| FixError::WorkingCopyCorrupt {
        path: root.to_path_buf(),
        reason: e.message().to_string(),
    };

    let mut index = repo.index().map_err(corrupt)?;
    for path in staged {
        if root.join(path).exists() {
            index.add_path(Path::new(path)).map_err(corrupt)?;
        } else {
            index.remove_path(Path::new(path)).map_err(corrupt)?;
        }
    }
    index.write().map_err(corrupt)?;
    let tree_id = index.write_tree().map_err(corrupt)?;

    let parent = repo
        .head()
        .and_then(|h| h.peel_to_commit())
        .map_err(corrupt)?;
    if parent.tree_id() == tree_id {
        return Err(FixError::NothingToCommit);
    }

    let tree = repo.find_tree(tree_id).map_err(corrupt)?;
    let sig = Signature::now(&identity.name, &identity.email).map_err(corrupt)?;
    let oid = repo
        .commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])
        .map_err(corrupt)?;
    Ok(oid.to_string())
}

fn push_branch(
    repo: &Repository,
    url: &str,
    branch: &str,
    token: Option<Secret>,
) -> Result<(), FixError> {
    let rejected: RefCell<Option<String>> = RefCell::new(None);
    let refspec = format!("refs/heads/{0}:refs/heads/{0}", branch);

    let result = {
        let mut remote = repo
            .find_remote(REMOTE)
            .map_err(|e| FixError::RepositoryUnavailable {
                url: url.to_string(),
                reason: e.message().to_string(),
            })?;
        let mut callbacks = credential_callbacks(token);
        callbacks.push_update_reference(|refname, status| {
            if let Some(status) = status {
                *rejected.borrow_mut() = Some(format!("{}: {}", refname, status));
            }
            Ok(())
        });
        let mut opts = PushOptions::new();
        opts.remote_callbacks(callbacks);
        remote.push(&[refspec.as_str()], Some(&mut opts))
    };

    match result {
        Err(e) if is_auth_error(&e) => Err(FixError::AuthenticationFailed {
            reason: e.message().to_string(),
        }),
        Err(e) if matches!(e.class(), ErrorClass::Net | ErrorClass::Ssl | ErrorClass::Os) => {
            Err(FixError::RepositoryUnavailable {
                url: url.to_string(),
                reason: e.message().to_string(),
            })
        }
        Err(e) => Err(FixError::PushRejected {
            branch: branch.to_string(),
            reason: e.message().to_string(),
        }),
        Ok(()) => match rejected.into_inner() {
            Some(reason) => Err(FixError::PushRejected {
                branch: branch.to_string(),
                reason,
            }),
            None => Ok(()),
        },
    }
}

/// Default branch of an existing working copy: `origin/HEAD` first, then a
/// local `main`/`master`, then whatever is checked out.
fn detect_default_branch(repo: &Repository) -> Option<String> {
    let prefix = format!("refs/remotes/{}/", REMOTE);
    if let Ok(reference) = repo.find_reference(&format!("{}HEAD", prefix))
        && let Some(target) = reference.symbolic_target()
        && let Some(name) = target.strip_prefix(&prefix)
    {
        return Some(name.to_string());
    }
    for candidate in ["main", "master"] {
        if repo.find_branch(candidate, BranchType::Local).is_ok() {
            return Some(candidate.to_string());
        }
    }
    head_branch(repo)
}

fn head_branch(repo: &Repository) -> Option<String> {
    let head = repo.head().ok()?;
    if head.is_branch() {
        head.shorthand().map(str::to_string)
    } else {
        None
    }
}

/// Opens [`GitRepository`] handles under one workspace root.
pub struct GitRepositoryFactory {
    workspace_root: PathBuf,
    token: Option<Secret>,
    identity: CommitIdentity,
}

impl GitRepositoryFactory {
    pub fn new(workspace_root: PathBuf, token: Option<Secret>, identity: CommitIdentity) -> Self {
        Self {
            workspace_root,
            token,
            identity,
        }
    }

    /// `<workspace_root>/<repo-name>-<hash>`, where the hash is taken from the
    /// normalized URL. The same URL maps to the same directory in every
    /// process, and two URLs never share one.
    pub fn local_path_for(&self, url: &str) -> PathBuf {
        let digest = Sha256::digest(normalize_url(url).as_bytes());
        let short: String = digest.iter().take(4).map(|b| format!("{:02x}", b)).collect();
        self.workspace_root
            .join(format!("{}-{}", repo_dir_name(url), short))
    }
}

impl RepositoryFactory for GitRepositoryFactory {
    fn open(&self, repository: &RepositoryRef) -> Box<dyn RepositoryHandle> {
        Box::new(GitRepository::new(
            repository.url.clone(),
            self.local_path_for(&repository.url),
            repository.default_branch.clone(),
            self.token.clone(),
            self.identity.clone(),
        ))
    }
}
