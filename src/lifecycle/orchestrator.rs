//! The fix lifecycle orchestrator.
//!
//! Owns the attempt registry and drives every transition of the state
//! machine in [`AttemptStatus`]. Each public command:
//! 1. takes the attempt's lock (commands on one attempt never interleave)
//! 2. validates the transition against the current status
//! 3. performs the external work under a timeout and a cancellation token
//! 4. stores the new snapshot and publishes a [`LifecycleEvent`]
//!
//! Leaf failures from the analysis service or the repository are recorded in
//! the attempt's history and end in a terminal status; the command itself
//! still returns `Ok` with that snapshot. `Err` is reserved for rejected
//! commands (`InvalidTransition`, `AttemptNotFound`) and interruptions
//! (`Timeout`, `Cancelled`), which leave the stored attempt in a state from
//! which the same command can be issued again.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::dedup::{DedupPolicy, fingerprint};
use super::events::{self, LifecycleEvent};
use super::locks::AttemptLocks;
use super::models::{
    Actor, ApplyStep, AttemptId, AttemptStatus, FixAttempt, Proposal, RepositoryRef,
    branch_name_for,
};
use super::store::AttemptStore;
use crate::analysis::{ProposalDraft, ProposalRequester};
use crate::config::FixloopConfig;
use crate::errors::{FixError, RecordedError};
use crate::extract::{ErrorCandidate, Extractor};
use crate::repo::{RepositoryHandle, RepositoryPool};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub network_timeout: Duration,
    pub branch_prefix: String,
    pub commit_message: String,
    pub allow_apply_retry: bool,
    pub dedup: DedupPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            network_timeout: Duration::from_secs(60),
            branch_prefix: "autofix".to_string(),
            commit_message: "Auto-fix applied by fixloop".to_string(),
            allow_apply_retry: false,
            dedup: DedupPolicy::Off,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &FixloopConfig) -> Self {
        Self {
            network_timeout: config.network_timeout(),
            branch_prefix: config.toml.git.branch_prefix.clone(),
            commit_message: config.toml.git.commit_message.clone(),
            allow_apply_retry: config.toml.lifecycle.allow_apply_retry,
            dedup: config.toml.lifecycle.dedup,
        }
    }
}

/// Result of feeding a log through the extractor into new attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanOutcome {
    pub attempt_ids: Vec<AttemptId>,
    pub skipped_duplicates: usize,
}

/// What an apply run got done before it stopped.
struct ApplyRun {
    commit_id: Option<String>,
    failure: Option<(ApplyStep, FixError)>,
}

/// Removes the in-flight token when the command finishes or is dropped.
struct InflightGuard<'a> {
    inflight: &'a Mutex<HashMap<AttemptId, CancellationToken>>,
    id: AttemptId,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.id);
    }
}

pub struct Orchestrator {
    store: Arc<dyn AttemptStore>,
    repos: Arc<RepositoryPool>,
    requester: Arc<dyn ProposalRequester>,
    extractor: Extractor,
    locks: AttemptLocks,
    inflight: Mutex<HashMap<AttemptId, CancellationToken>>,
    events: broadcast::Sender<LifecycleEvent>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn AttemptStore>,
        repos: Arc<RepositoryPool>,
        requester: Arc<dyn ProposalRequester>,
        extractor: Extractor,
        settings: OrchestratorSettings,
    ) -> Self {
        let (events, _) = events::channel();
        Self {
            store,
            repos,
            requester,
            extractor,
            locks: AttemptLocks::new(),
            inflight: Mutex::new(HashMap::new()),
            events,
            settings,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn repositories(&self) -> &Arc<RepositoryPool> {
        &self.repos
    }

    /// Register a `Pending` attempt. Does not contact the analysis service.
    pub async fn create_attempt(
        &self,
        candidate: ErrorCandidate,
        repository: RepositoryRef,
    ) -> Result<AttemptId, FixError> {
        let attempt = FixAttempt::new(candidate, repository);
        let id = attempt.id;
        tracing::info!(
            attempt_id = %id,
            repo = %attempt.repository.url,
            file = attempt.source_error.file_path.as_deref().unwrap_or("-"),
            "attempt created"
        );
        self.store.put(attempt.clone()).await?;
        events::publish(&self.events, LifecycleEvent::AttemptCreated { attempt });
        Ok(id)
    }

    /// Extract candidates from `log_text` and create an attempt for each,
    /// subject to the configured [`DedupPolicy`].
    pub async fn scan(
        &self,
        repository: &RepositoryRef,
        log_text: &str,
    ) -> Result<ScanOutcome, FixError> {
        let mut seen: HashSet<String> = HashSet::new();
        if self.settings.dedup == DedupPolicy::Signature {
            for attempt in self.store.list().await? {
                if !attempt.status.is_terminal() {
                    seen.insert(fingerprint(&attempt.repository, &attempt.source_error));
                }
            }
        }

        let candidates: Vec<ErrorCandidate> = self.extractor.extract(log_text).collect();
        let mut outcome = ScanOutcome::default();
        for candidate in candidates {
            if self.settings.dedup == DedupPolicy::Signature
                && !seen.insert(fingerprint(repository, &candidate))
            {
                tracing::debug!(message = %candidate.message, "skipping duplicate error");
                outcome.skipped_duplicates += 1;
                continue;
            }
            outcome
                .attempt_ids
                .push(self.create_attempt(candidate, repository.clone()).await?);
        }

        tracing::info!(
            repo = %repository.url,
            created = outcome.attempt_ids.len(),
            skipped = outcome.skipped_duplicates,
            "scan finished"
        );
        Ok(outcome)
    }

    pub async fn get_attempt(&self, id: AttemptId) -> Result<FixAttempt, FixError> {
        self.store
            .get(id)
            .await?
            .ok_or(FixError::AttemptNotFound { attempt_id: id })
    }

    pub async fn list_attempts(&self) -> Result<Vec<FixAttempt>, FixError> {
        self.store.list().await
    }

    /// Ask the analysis service for a proposal. Valid only in `Pending`.
    pub async fn request_proposal(
        &self,
        id: AttemptId,
        cancel: CancellationToken,
    ) -> Result<FixAttempt, FixError> {
        let _lock = self.locks.acquire(id).await;
        let mut attempt = self.get_attempt(id).await?;
        if attempt.status != AttemptStatus::Pending {
            return Err(FixError::InvalidTransition {
                attempt_id: id,
                from: attempt.status,
                action: "request a proposal for",
            });
        }

        let (token, _inflight) = self.register(id, &cancel);
        let handle = self.repos.handle_for(&attempt.repository);
        let mut context_path = attempt.source_error.file_path.clone();

        let loaded = self
            .bounded("ensure_local", &token, async {
                let mut repo = handle.lock().await;
                repo.ensure_local().await?;
                let path = match context_path.as_deref() {
                    Some(path) => Some(locate_in_repo(repo.as_ref(), path).await),
                    None => None,
                };
                let context = read_context(repo.as_ref(), path.as_deref()).await;
                Ok((path, context))
            })
            .await;
        let context = match loaded {
            Ok((path, context)) => {
                context_path = path;
                context
            }
            Err(e) if e.is_interruption() => return Err(self.interrupted(id, e)),
            Err(e) => {
                tracing::warn!(attempt_id = %id, error = %e, "no source context; requesting without it");
                String::new()
            }
        };

        let requested = self
            .bounded(
                "request_proposal",
                &token,
                self.requester.request_proposal(&attempt.source_error, &context),
            )
            .await;
        let draft = match requested {
            Ok(draft) => draft,
            Err(e) if e.is_interruption() => return Err(self.interrupted(id, e)),
            Err(e) => return self.fail_proposal(attempt, e).await,
        };

        let ProposalDraft {
            explanation,
            suggested_fix,
            patched_content,
            target_file,
        } = draft;
        let Some(target_file) = context_path.clone().or(target_file) else {
            let err = FixError::MalformedProposal(
                "neither the error nor the proposal names a target file".to_string(),
            );
            return self.fail_proposal(attempt, err).await;
        };

        let original_content = if Some(&target_file) == context_path.as_ref() {
            context
        } else {
            let read = self
                .bounded("read_file", &token, async {
                    let repo = handle.lock().await;
                    Ok(read_context(repo.as_ref(), Some(target_file.as_str())).await)
                })
                .await;
            match read {
                Ok(content) => content,
                Err(e) => return Err(self.interrupted(id, e)),
            }
        };

        attempt.proposal = Some(Proposal {
            explanation,
            suggested_fix,
            original_content,
            patched_content,
            target_file: target_file.clone(),
        });
        attempt.record_transition(
            AttemptStatus::ProposalReady,
            Actor::AnalysisService,
            format!("proposal ready for {}", target_file),
            None,
            None,
        );
        tracing::info!(attempt_id = %id, file = %target_file, "proposal ready");
        self.save(attempt).await
    }

    pub async fn approve(
        &self,
        id: AttemptId,
        reviewer: Option<String>,
    ) -> Result<FixAttempt, FixError> {
        let _lock = self.locks.acquire(id).await;
        let mut attempt = self.get_attempt(id).await?;
        self.check_transition(&attempt, AttemptStatus::Approved, "approve")?;

        let note = match &reviewer {
            Some(name) => format!("approved by {}", name),
            None => "approved".to_string(),
        };
        attempt.record_transition(
            AttemptStatus::Approved,
            Actor::Reviewer { name: reviewer },
            note,
            None,
            None,
        );
        tracing::info!(attempt_id = %id, "attempt approved");
        self.save(attempt).await
    }

    pub async fn reject(
        &self,
        id: AttemptId,
        reason: &str,
        reviewer: Option<String>,
    ) -> Result<FixAttempt, FixError> {
        let _lock = self.locks.acquire(id).await;
        let mut attempt = self.get_attempt(id).await?;
        self.check_transition(&attempt, AttemptStatus::Rejected, "reject")?;

        let reason = reason.trim();
        let note = if reason.is_empty() {
            "rejected".to_string()
        } else {
            format!("rejected: {}", reason)
        };
        attempt.record_transition(
            AttemptStatus::Rejected,
            Actor::Reviewer { name: reviewer },
            note,
            None,
            None,
        );
        tracing::info!(attempt_id = %id, "attempt rejected");
        self.save(attempt).await
    }

    /// Apply an approved proposal: branch, write, commit, push.
    ///
    /// A failed step ends in `ApplyFailed` with the step recorded. A timeout
    /// or cancellation before the push succeeds restores the stored attempt to
    /// its pre-apply snapshot, publishes [`LifecycleEvent::ApplyInterrupted`]
    /// and returns the interruption; a later `apply` resumes on the same
    /// branch.
    pub async fn apply(
        &self,
        id: AttemptId,
        cancel: CancellationToken,
    ) -> Result<FixAttempt, FixError> {
        let _lock = self.locks.acquire(id).await;
        let mut attempt = self.get_attempt(id).await?;
        self.check_transition(&attempt, AttemptStatus::Applying, "apply")?;
        let Some(proposal) = attempt.proposal.clone() else {
            return Err(FixError::InvalidTransition {
                attempt_id: id,
                from: attempt.status,
                action: "apply",
            });
        };

        let branch = branch_name_for(&self.settings.branch_prefix, &id);
        let before = attempt.clone();
        attempt.branch_name = Some(branch.clone());
        attempt.record_transition(
            AttemptStatus::Applying,
            Actor::Orchestrator,
            format!("applying on branch {}", branch),
            None,
            None,
        );
        let mut attempt = self.save(attempt).await?;

        let (token, _inflight) = self.register(id, &cancel);
        let run = self
            .run_apply(&attempt.repository, &proposal, &branch, &token)
            .await;
        if run.commit_id.is_some() {
            attempt.commit_id = run.commit_id;
        }

        match run.failure {
            None => {
                attempt.record_transition(
                    AttemptStatus::Applied,
                    Actor::VersionControl,
                    format!("pushed {}", branch),
                    Some(ApplyStep::Push),
                    None,
                );
                tracing::info!(attempt_id = %id, branch = %branch, "fix applied");
                self.save(attempt).await
            }
            Some((step, error)) if error.is_interruption() => {
                tracing::warn!(attempt_id = %id, step = %step, error = %error, "apply interrupted");
                self.store.put(before.clone()).await?;
                events::publish(
                    &self.events,
                    LifecycleEvent::ApplyInterrupted {
                        attempt: before,
                        step,
                        error: RecordedError::from(&error),
                    },
                );
                Err(error)
            }
            Some((step, error)) => {
                attempt.record_transition(
                    AttemptStatus::ApplyFailed,
                    Actor::VersionControl,
                    format!("{} failed", step),
                    Some(step),
                    Some(RecordedError::from(&error)),
                );
                tracing::warn!(attempt_id = %id, step = %step, error = %error, "apply failed");
                self.save(attempt).await
            }
        }
    }

    /// Cancel the in-flight proposal request or apply for `id`. Returns
    /// whether anything was running.
    pub fn cancel(&self, id: AttemptId) -> bool {
        let inflight = self
            .inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match inflight.get(&id) {
            Some(token) => {
                tracing::info!(attempt_id = %id, "cancelling in-flight operation");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Clone or fast-forward a repository's working copy. Returns its path.
    pub async fn sync_repository(
        &self,
        repository: &RepositoryRef,
        cancel: CancellationToken,
    ) -> Result<PathBuf, FixError> {
        let handle = self.repos.handle_for(repository);
        self.bounded("ensure_local", &cancel, async {
            let mut repo = handle.lock().await;
            repo.ensure_local().await?;
            Ok(repo.local_path().to_path_buf())
        })
        .await
    }

    async fn run_apply(
        &self,
        repository: &RepositoryRef,
        proposal: &Proposal,
        branch: &str,
        cancel: &CancellationToken,
    ) -> ApplyRun {
        let mut run = ApplyRun {
            commit_id: None,
            failure: None,
        };
        let handle = self.repos.handle_for(repository);

        // Queue behind other applies on this working copy; only cancellation
        // ends the wait.
        let mut repo = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                run.failure = Some((ApplyStep::CreateBranch, FixError::Cancelled {
                    operation: "waiting for working copy".to_string(),
                }));
                return run;
            }
            guard = handle.lock() => guard,
        };

        // Branch names are unique per attempt, so an existing one was left by
        // an earlier run of this attempt.
        let mut resumed = false;
        let created = self
            .bounded("create_branch", cancel, repo.create_branch(branch))
            .await;
        let created = match created {
            Err(FixError::BranchAlreadyExists { .. }) => {
                tracing::debug!(branch = %branch, "resuming on existing branch");
                resumed = true;
                self.bounded("checkout_branch", cancel, repo.checkout_branch(branch))
                    .await
            }
            other => other,
        };

        let result = match created {
            Err(e) => Err((ApplyStep::CreateBranch, e)),
            Ok(()) => self
                .write_commit_push(repo.as_mut(), proposal, branch, resumed, cancel, &mut run)
                .await,
        };
        if let Err(failure) = result {
            run.failure = Some(failure);
        }

        let restore = tokio::time::timeout(self.settings.network_timeout, repo.restore_default());
        match restore.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "failed to restore default branch"),
            Err(_) => tracing::warn!("timed out restoring default branch"),
        }
        run
    }

    async fn write_commit_push(
        &self,
        repo: &mut dyn RepositoryHandle,
        proposal: &Proposal,
        branch: &str,
        resumed: bool,
        cancel: &CancellationToken,
        run: &mut ApplyRun,
    ) -> Result<(), (ApplyStep, FixError)> {
        self.bounded(
            "write_file",
            cancel,
            repo.write_file(&proposal.target_file, &proposal.patched_content),
        )
        .await
        .map_err(|e| (ApplyStep::WriteFile, e))?;

        let committed = self
            .bounded("commit", cancel, repo.commit(&self.settings.commit_message))
            .await;
        match committed {
            Ok(commit_id) => run.commit_id = Some(commit_id),
            Err(FixError::NothingToCommit) if resumed => {
                tracing::debug!(branch = %branch, "fix already committed by an earlier run");
                run.commit_id = self
                    .bounded("commit", cancel, repo.head_commit())
                    .await
                    .map_err(|e| (ApplyStep::Commit, e))
                    .map(Some)?;
            }
            Err(e) => return Err((ApplyStep::Commit, e)),
        }

        self.bounded("push", cancel, repo.push(branch))
            .await
            .map_err(|e| (ApplyStep::Push, e))
    }

    /// Race `fut` against the network timeout and the cancellation token.
    async fn bounded<T, F>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        fut: F,
    ) -> Result<T, FixError>
    where
        F: Future<Output = Result<T, FixError>>,
    {
        let after = self.settings.network_timeout;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FixError::Cancelled {
                operation: operation.to_string(),
            }),
            result = tokio::time::timeout(after, fut) => match result {
                Ok(inner) => inner,
                Err(_) => Err(FixError::Timeout {
                    operation: operation.to_string(),
                    after,
                }),
            },
        }
    }

    fn register(&self, id: AttemptId, cancel: &CancellationToken) -> (CancellationToken, InflightGuard<'_>) {
        let token = cancel.child_token();
        self.inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, token.clone());
        (
            token,
            InflightGuard {
                inflight: &self.inflight,
                id,
            },
        )
    }

    fn check_transition(
        &self,
        attempt: &FixAttempt,
        next: AttemptStatus,
        action: &'static str,
    ) -> Result<(), FixError> {
        if attempt
            .status
            .can_transition_to(next, self.settings.allow_apply_retry)
        {
            Ok(())
        } else {
            Err(FixError::InvalidTransition {
                attempt_id: attempt.id,
                from: attempt.status,
                action,
            })
        }
    }

    fn interrupted(&self, id: AttemptId, error: FixError) -> FixError {
        tracing::warn!(attempt_id = %id, error = %error, "proposal request interrupted; attempt stays pending");
        error
    }

    async fn fail_proposal(
        &self,
        mut attempt: FixAttempt,
        error: FixError,
    ) -> Result<FixAttempt, FixError> {
        tracing::warn!(attempt_id = %attempt.id, error = %error, "proposal failed");
        attempt.record_transition(
            AttemptStatus::ProposalFailed,
            Actor::AnalysisService,
            "proposal failed",
            None,
            Some(RecordedError::from(&error)),
        );
        self.save(attempt).await
    }

    async fn save(&self, attempt: FixAttempt) -> Result<FixAttempt, FixError> {
        debug_assert!(attempt.invariants_hold(), "attempt {} broke its invariants", attempt.id);
        self.store.put(attempt.clone()).await?;
        events::publish(
            &self.events,
            LifecycleEvent::AttemptUpdated {
                attempt: attempt.clone(),
            },
        );
        Ok(attempt)
    }
}

/// Map an absolute frame path (`/srv/app/app.py`) onto the working copy by
/// its longest suffix that exists there. Relative paths, and absolute paths
/// with no match, come back unchanged.
async fn locate_in_repo(repo: &dyn RepositoryHandle, path: &str) -> String {
    let absolute = path.starts_with(['/', '\\'])
        || path.get(1..3).is_some_and(|s| s == ":\\" || s == ":/");
    if !absolute {
        return path.to_string();
    }

    let parts: Vec<&str> = path
        .split(['/', '\\'])
        .filter(|part| !part.is_empty() && !part.ends_with(':'))
        .collect();
    for start in 0..parts.len() {
        let candidate = parts[start..].join("/");
        if let Ok(Some(_)) = repo.read_file(&candidate).await {
            tracing::debug!(path = %path, resolved = %candidate, "mapped frame path into working copy");
            return candidate;
        }
    }
    path.to_string()
}

/// Best-effort source read; any failure is an empty context.
async fn read_context(repo: &dyn RepositoryHandle, path: Option<&str>) -> String {
    let Some(path) = path else {
        return String::new();
    };
    match repo.read_file(path).await {
        Ok(Some(content)) => content,
        Ok(None) => String::new(),
        Err(e) => {
            tracing::warn!(path = %path, error = %e, "could not read source context");
            String::new()
        }
    }
}
