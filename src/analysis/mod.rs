//! Fix proposal requests against an analysis service.
//!
//! | Module      | Responsibility                                          |
//! |-------------|---------------------------------------------------------|
//! | `anthropic` | `AnthropicRequester`, the Messages API client           |
//! | `prompt`    | Prompt construction and reply parsing                   |

pub mod anthropic;
pub mod prompt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::FixError;
use crate::extract::ErrorCandidate;

pub use anthropic::AnthropicRequester;

/// A fully populated reply from the analysis service. Never partially filled:
/// a reply missing the explanation or the patched content is rejected as
/// `MalformedProposal` before a draft exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalDraft {
    pub explanation: String,
    pub suggested_fix: Option<String>,
    pub patched_content: String,
    /// File the service says the patch belongs to, used when the error itself
    /// names no file.
    pub target_file: Option<String>,
}

/// Abstraction over the analysis service for testability.
/// Real implementation: `AnthropicRequester`. Test double: `MockRequester` (tests).
#[async_trait]
pub trait ProposalRequester: Send + Sync {
    async fn request_proposal(
        &self,
        candidate: &ErrorCandidate,
        source_context: &str,
    ) -> Result<ProposalDraft, FixError>;
}
