//! Typed error taxonomy for the fix lifecycle.
//!
//! `FixError` is shared by every layer that can fail on behalf of an attempt:
//! - repository handle failures (clone, branch, write, commit, push)
//! - analysis service failures (unreachable, malformed reply)
//! - local validation failures (`InvalidTransition`, `AttemptNotFound`)
//! - bounded-wait failures (`Timeout`, `Cancelled`)
//!
//! Leaf errors are recorded verbatim in an attempt's history through
//! [`RecordedError`]; validation errors go straight back to the caller.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lifecycle::models::{AttemptId, AttemptStatus};

#[derive(Debug, Error)]
pub enum FixError {
    #[error("Repository {url} unavailable: {reason}")]
    RepositoryUnavailable { url: String, reason: String },

    #[error("Working copy at {path} cannot be reconciled: {reason}")]
    WorkingCopyCorrupt { path: PathBuf, reason: String },

    #[error("Branch {branch} already exists")]
    BranchAlreadyExists { branch: String },

    #[error("Path {path} escapes the repository root")]
    PathOutsideRepository { path: String },

    #[error("Nothing to commit: working copy matches HEAD")]
    NothingToCommit,

    #[error("Push of {branch} rejected: {reason}")]
    PushRejected { branch: String, reason: String },

    #[error("Authentication failed: {reason}")]
    AuthenticationFailed { reason: String },

    #[error("Analysis service unavailable: {0}")]
    AnalysisUnavailable(String),

    #[error("Malformed proposal: {0}")]
    MalformedProposal(String),

    #[error("Cannot {action} attempt {attempt_id} in status {from}")]
    InvalidTransition {
        attempt_id: AttemptId,
        from: AttemptStatus,
        action: &'static str,
    },

    #[error("Attempt {attempt_id} not found")]
    AttemptNotFound { attempt_id: AttemptId },

    #[error("{operation} timed out after {}s", after.as_secs())]
    Timeout { operation: String, after: Duration },

    #[error("{operation} cancelled")]
    Cancelled { operation: String },

    #[error("Attempt store error: {0}")]
    Store(#[source] anyhow::Error),
}

impl FixError {
    /// Stable machine-readable name, used in history records and API bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            FixError::RepositoryUnavailable { .. } => "repository_unavailable",
            FixError::WorkingCopyCorrupt { .. } => "working_copy_corrupt",
            FixError::BranchAlreadyExists { .. } => "branch_already_exists",
            FixError::PathOutsideRepository { .. } => "path_outside_repository",
            FixError::NothingToCommit => "nothing_to_commit",
            FixError::PushRejected { .. } => "push_rejected",
            FixError::AuthenticationFailed { .. } => "authentication_failed",
            FixError::AnalysisUnavailable(_) => "analysis_unavailable",
            FixError::MalformedProposal(_) => "malformed_proposal",
            FixError::InvalidTransition { .. } => "invalid_transition",
            FixError::AttemptNotFound { .. } => "attempt_not_found",
            FixError::Timeout { .. } => "timeout",
            FixError::Cancelled { .. } => "cancelled",
            FixError::Store(_) => "store",
        }
    }

    /// Whether repeating the same call may succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FixError::RepositoryUnavailable { .. }
                | FixError::AnalysisUnavailable(_)
                | FixError::Timeout { .. }
                | FixError::Cancelled { .. }
        )
    }

    /// Errors that leave the attempt's status untouched.
    pub fn is_interruption(&self) -> bool {
        matches!(self, FixError::Timeout { .. } | FixError::Cancelled { .. })
    }
}

/// Serializable copy of a `FixError`, stored in attempt history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedError {
    pub kind: String,
    pub message: String,
}

impl From<&FixError> for RecordedError {
    fn from(err: &FixError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}
