use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::RecordedError;
use crate::extract::ErrorCandidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptId(Uuid);

impl AttemptId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Hyphen-free form used in branch names.
    pub fn simple(&self) -> String {
        self.0.simple().to_string()
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for AttemptId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identity of a target repository. Attempts hold this as a back-reference;
/// the working copy itself is owned by the repository pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub url: String,
    #[serde(default)]
    pub default_branch: Option<String>,
}

impl RepositoryRef {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            default_branch: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    ProposalReady,
    ProposalFailed,
    Approved,
    Rejected,
    Applying,
    Applied,
    ApplyFailed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::ProposalReady => "proposal_ready",
            Self::ProposalFailed => "proposal_failed",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Applying => "applying",
            Self::Applied => "applied",
            Self::ApplyFailed => "apply_failed",
        }
    }

    /// No transition is defined out of a terminal status (except the opt-in
    /// `ApplyFailed -> Applying` retry).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ProposalFailed | Self::Rejected | Self::Applied | Self::ApplyFailed
        )
    }

    pub fn has_proposal(&self) -> bool {
        !matches!(self, Self::Pending | Self::ProposalFailed)
    }

    pub fn has_branch(&self) -> bool {
        matches!(self, Self::Applying | Self::Applied | Self::ApplyFailed)
    }

    /// Edges of the lifecycle state machine. Every edge moves forward; an
    /// interrupted apply is undone by restoring the earlier snapshot, not by
    /// a transition.
    pub fn can_transition_to(&self, next: AttemptStatus, allow_apply_retry: bool) -> bool {
        use AttemptStatus::*;
        match (self, next) {
            (Pending, ProposalReady | ProposalFailed) => true,
            (ProposalReady, Approved | Rejected) => true,
            (Approved, Applying) => true,
            (Applying, Applied | ApplyFailed) => true,
            (ApplyFailed, Applying) => allow_apply_retry,
            _ => false,
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "proposal_ready" => Ok(Self::ProposalReady),
            "proposal_failed" => Ok(Self::ProposalFailed),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "applying" => Ok(Self::Applying),
            "applied" => Ok(Self::Applied),
            "apply_failed" => Ok(Self::ApplyFailed),
            _ => Err(format!("Invalid attempt status: {}", s)),
        }
    }
}

/// The four git steps of an apply, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStep {
    CreateBranch,
    WriteFile,
    Commit,
    Push,
}

impl ApplyStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateBranch => "create_branch",
            Self::WriteFile => "write_file",
            Self::Commit => "commit",
            Self::Push => "push",
        }
    }
}

impl fmt::Display for ApplyStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who or what caused a history transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Actor {
    Orchestrator,
    AnalysisService,
    Reviewer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    VersionControl,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub explanation: String,
    #[serde(default)]
    pub suggested_fix: Option<String>,
    pub original_content: String,
    pub patched_content: String,
    pub target_file: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub from: Option<AttemptStatus>,
    pub to: AttemptStatus,
    pub actor: Actor,
    pub note: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<ApplyStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RecordedError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixAttempt {
    pub id: AttemptId,
    pub repository: RepositoryRef,
    pub source_error: ErrorCandidate,
    pub status: AttemptStatus,
    pub proposal: Option<Proposal>,
    pub branch_name: Option<String>,
    pub commit_id: Option<String>,
    pub history: Vec<HistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FixAttempt {
    /// A fresh `Pending` attempt with its creation entry already recorded.
    pub fn new(source_error: ErrorCandidate, repository: RepositoryRef) -> Self {
        let now = Utc::now();
        let file = source_error.file_path.as_deref().unwrap_or("<unknown file>");
        Self {
            id: AttemptId::new(),
            repository,
            status: AttemptStatus::Pending,
            proposal: None,
            branch_name: None,
            commit_id: None,
            history: vec![HistoryEntry {
                at: now,
                from: None,
                to: AttemptStatus::Pending,
                actor: Actor::Orchestrator,
                note: format!("attempt created for error in {}", file),
                step: None,
                error: None,
            }],
            source_error,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a history entry and move to `to`. Callers validate the edge first.
    pub fn record_transition(
        &mut self,
        to: AttemptStatus,
        actor: Actor,
        note: impl Into<String>,
        step: Option<ApplyStep>,
        error: Option<RecordedError>,
    ) {
        let now = Utc::now();
        self.history.push(HistoryEntry {
            at: now,
            from: Some(self.status),
            to,
            actor,
            note: note.into(),
            step,
            error,
        });
        self.status = to;
        self.updated_at = now;
    }

    /// Check the structural invariants that tie `proposal` and `branch_name`
    /// to the current status.
    pub fn invariants_hold(&self) -> bool {
        self.proposal.is_some() == self.status.has_proposal()
            && self.branch_name.is_some() == self.status.has_branch()
    }
}

/// Deterministic, collision-free branch name for an attempt.
pub fn branch_name_for(prefix: &str, id: &AttemptId) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("attempt-{}", id.simple())
    } else {
        format!("{}/attempt-{}", prefix, id.simple())
    }
}
