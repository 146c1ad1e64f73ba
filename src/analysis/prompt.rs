use serde::Deserialize;

use super::ProposalDraft;
use crate::errors::FixError;
use crate::extract::ErrorCandidate;
use crate::util::{extract_json_object, truncate};

/// Upper bound on the log excerpt sent to the service.
const MAX_EXCERPT_CHARS: usize = 8_000;

pub fn build_prompt(candidate: &ErrorCandidate, source_context: &str) -> String {
    let location = match (&candidate.file_path, candidate.line) {
        (Some(path), Some(line)) => format!("{} (line {})", path, line),
        (Some(path), None) => path.clone(),
        (None, _) => "unknown file".to_string(),
    };
    let source = if source_context.is_empty() {
        "(source not available)"
    } else {
        source_context
    };

    format!(
        r#"You are a DevOps assistant. Analyze the following error log and the related source code.

### ERROR LOG:
{excerpt}

### SOURCE CODE (from {location}):
{source}

Return a short explanation of the issue and a corrected version of the whole file.

Respond with a single JSON object and nothing else:
{{
  "explanation": "Brief explanation of what caused the error",
  "suggested_fix": "Description of how to fix it",
  "fixed_code": "The complete corrected file contents",
  "target_file": "Repository-relative path of the file to change"
}}"#,
        excerpt = truncate(&candidate.raw_excerpt, MAX_EXCERPT_CHARS),
    )
}

#[derive(Debug, Deserialize)]
struct RawReply {
    #[serde(default)]
    explanation: Option<String>,
    #[serde(default)]
    suggested_fix: Option<String>,
    #[serde(default)]
    fixed_code: Option<String>,
    #[serde(default)]
    target_file: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Parse the model's text reply into a draft. Prose around the JSON object is
/// tolerated; a missing or empty `explanation` or `fixed_code` is not.
pub fn parse_reply(text: &str) -> Result<ProposalDraft, FixError> {
    let json = extract_json_object(text).ok_or_else(|| {
        FixError::MalformedProposal(format!(
            "no JSON object in reply: {}",
            truncate(text.trim(), 120)
        ))
    })?;
    let raw: RawReply = serde_json::from_str(json)
        .map_err(|e| FixError::MalformedProposal(format!("invalid JSON in reply: {}", e)))?;

    let explanation = non_empty(raw.explanation)
        .ok_or_else(|| FixError::MalformedProposal("reply has no explanation".to_string()))?;
    let patched_content = non_empty(raw.fixed_code)
        .ok_or_else(|| FixError::MalformedProposal("reply has no fixed_code".to_string()))?;

    Ok(ProposalDraft {
        explanation,
        suggested_fix: non_empty(raw.suggested_fix),
        patched_content,
        target_file: non_empty(raw.target_file).map(|t| t.trim().to_string()),
    })
}
