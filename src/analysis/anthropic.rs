use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::prompt::{build_prompt, parse_reply};
use super::{ProposalDraft, ProposalRequester};
use crate::config::{AnalysisSection, Secret};
use crate::errors::FixError;
use crate::extract::ErrorCandidate;
use crate::util::truncate;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ERROR_BODY_CHARS: usize = 200;

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Client for the Anthropic Messages API.
#[derive(Debug, Clone)]
pub struct AnthropicRequester {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    max_tokens: u32,
    api_key: Option<Secret>,
}

impl AnthropicRequester {
    pub fn new(settings: &AnalysisSection, api_key: Option<Secret>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/v1/messages", settings.api_url.trim_end_matches('/')),
            model: settings.model.clone(),
            max_tokens: settings.max_tokens,
            api_key,
        })
    }
}

#[async_trait]
impl ProposalRequester for AnthropicRequester {
    async fn request_proposal(
        &self,
        candidate: &ErrorCandidate,
        source_context: &str,
    ) -> Result<ProposalDraft, FixError> {
        let api_key = self.api_key.as_ref().ok_or_else(|| {
            FixError::AnalysisUnavailable("ANTHROPIC_API_KEY is not set".to_string())
        })?;

        let prompt = build_prompt(candidate, source_context);
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: vec![Message {
                role: "user",
                content: &prompt,
            }],
        };

        tracing::debug!(model = %self.model, candidate = %candidate.id, "requesting fix proposal");

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", api_key.expose())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| FixError::AnalysisUnavailable(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let reason = match status.as_u16() {
                401 | 403 => "authentication rejected",
                429 => "rate limited",
                s if s >= 500 => "service error",
                _ => "request refused",
            };
            return Err(FixError::AnalysisUnavailable(format!(
                "{} ({}): {}",
                reason,
                status,
                truncate(detail.trim(), MAX_ERROR_BODY_CHARS)
            )));
        }

        let reply: MessagesResponse = response
            .json()
            .await
            .map_err(|e| FixError::MalformedProposal(format!("unreadable response body: {}", e)))?;
        let text = reply
            .content
            .into_iter()
            .find(|block| block.kind == "text")
            .and_then(|block| block.text)
            .ok_or_else(|| FixError::MalformedProposal("response has no text block".to_string()))?;

        parse_reply(&text)
    }
}
