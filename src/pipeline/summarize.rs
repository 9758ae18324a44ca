//! Summarization: turn extracted document text into a short summary.
//!
//! Two backends implement [`Summarizer`]:
//!
//! * [`GeminiSummarizer`]: direct REST call to Gemini `generateContent`,
//!   used when a Gemini API key is configured.
//! * [`ProviderSummarizer`]: any `edgequake-llm` provider (OpenAI,
//!   Anthropic, Ollama…), auto-detected from the environment.
//!
//! Both share the same prompt ([`crate::prompts`]) and the same
//! post-processing ([`super::postprocess::clean_summary`]), so the length
//! bound holds whatever the model returns. Retries are not handled here;
//! the orchestrator wraps each call in the stage's [`crate::RetryPolicy`].

use crate::error::{DocQrError, SummarizationError, SummarizationFailure};
use crate::output::SummaryResult;
use crate::pipeline::postprocess::clean_summary;
use crate::prompts::{summary_prompt, SUMMARY_SYSTEM_PROMPT};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, LlmError, ProviderFactory};
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Longest input, in characters, sent to the model.
pub const MAX_INPUT_CHARS: usize = 60_000;

/// Produces a summary of at most `max_chars` characters.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        text: &str,
        max_chars: usize,
    ) -> Result<SummaryResult, SummarizationError>;
}

// ── Shared helpers ───────────────────────────────────────────────────────

/// Validate and cap the input text, returning it with its full char count.
fn prepare_input(text: &str) -> Result<(&str, usize), SummarizationError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(SummarizationError::new(
            SummarizationFailure::EmptyInput,
            "document text is empty",
        ));
    }
    let count = trimmed.chars().count();
    let capped = match trimmed.char_indices().nth(MAX_INPUT_CHARS) {
        Some((idx, _)) => {
            debug!("Summary input capped at {} of {} chars", MAX_INPUT_CHARS, count);
            &trimmed[..idx]
        }
        None => trimmed,
    };
    Ok((capped, count))
}

/// Clean the raw model answer into a [`SummaryResult`].
fn finish(
    raw: &str,
    max_chars: usize,
    source_char_count: usize,
) -> Result<SummaryResult, SummarizationError> {
    let text = clean_summary(raw, max_chars);
    if text.is_empty() {
        return Err(SummarizationError::new(
            SummarizationFailure::InvalidResponse,
            "model returned an empty summary",
        ));
    }
    Ok(SummaryResult {
        text,
        source_char_count,
    })
}

// ── Gemini REST backend ──────────────────────────────────────────────────

/// Gemini `generateContent` over HTTPS.
#[derive(Clone)]
pub struct GeminiSummarizer {
    http: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl std::fmt::Debug for GeminiSummarizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiSummarizer")
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

const GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";

impl GeminiSummarizer {
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, DocQrError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DocQrError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            model: model.into(),
            endpoint: GEMINI_ENDPOINT.to_string(),
        })
    }

    /// Point the client at another base URL (proxies, tests).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl Summarizer for GeminiSummarizer {
    async fn summarize(
        &self,
        text: &str,
        max_chars: usize,
    ) -> Result<SummaryResult, SummarizationError> {
        let (input, source_chars) = prepare_input(text)?;
        let url = format!(
            "{}/models/{}:generateContent",
            self.endpoint.trim_end_matches('/'),
            self.model
        );
        let payload = serde_json::json!({
            "systemInstruction": { "parts": [{ "text": SUMMARY_SYSTEM_PROMPT }] },
            "contents": [
                { "role": "user", "parts": [{ "text": summary_prompt(input, max_chars) }] }
            ],
            "generationConfig": { "temperature": 0.2, "maxOutputTokens": 1024 }
        });

        let response = self
            .http
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                let detail = if e.is_timeout() {
                    "request timed out".to_string()
                } else {
                    // Strip the URL: it carries the API key.
                    e.without_url().to_string()
                };
                SummarizationError::new(SummarizationFailure::Network, detail)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_gemini_status(status, &body));
        }

        let body: Value = response.json().await.map_err(|e| {
            SummarizationError::new(SummarizationFailure::InvalidResponse, e.to_string())
        })?;
        let raw = gemini_candidate_text(&body).ok_or_else(|| {
            SummarizationError::new(
                SummarizationFailure::InvalidResponse,
                "missing text candidate",
            )
        })?;
        debug!("Gemini answered {} chars", raw.chars().count());
        finish(raw, max_chars, source_chars)
    }
}

/// Map a non-success Gemini status to a failure reason.
fn classify_gemini_status(status: StatusCode, body: &str) -> SummarizationError {
    let reason = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SummarizationFailure::Auth,
        StatusCode::BAD_REQUEST if body.contains("API_KEY_INVALID") => SummarizationFailure::Auth,
        StatusCode::TOO_MANY_REQUESTS => SummarizationFailure::RateLimit,
        s if s.is_server_error() => SummarizationFailure::Network,
        _ => SummarizationFailure::InvalidResponse,
    };
    let snippet: String = body.chars().take(200).collect();
    SummarizationError::new(reason, format!("HTTP {status}: {snippet}"))
}

fn gemini_candidate_text(body: &Value) -> Option<&str> {
    body.get("candidates")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .and_then(|item| item.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .and_then(|parts| parts.first())
        .and_then(|part| part.get("text"))
        .and_then(Value::as_str)
}

// ── edgequake-llm backend ────────────────────────────────────────────────

/// Summarizer backed by any [`LLMProvider`].
pub struct ProviderSummarizer {
    provider: Arc<dyn LLMProvider>,
}

impl ProviderSummarizer {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self { provider }
    }

    /// Resolve a provider from the environment.
    ///
    /// `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL` win when both are set;
    /// otherwise the factory scans the known API key variables.
    pub fn from_env() -> Result<Self, DocQrError> {
        if let (Ok(name), Ok(model)) = (
            std::env::var("EDGEQUAKE_LLM_PROVIDER"),
            std::env::var("EDGEQUAKE_MODEL"),
        ) {
            if !name.is_empty() && !model.is_empty() {
                let provider = ProviderFactory::create_llm_provider(&name, &model).map_err(|e| {
                    DocQrError::BackendNotConfigured {
                        backend: name.clone(),
                        hint: format!("{e}"),
                    }
                })?;
                return Ok(Self::new(provider));
            }
        }

        let (provider, _embedding) =
            ProviderFactory::from_env().map_err(|e| DocQrError::BackendNotConfigured {
                backend: "summarizer".to_string(),
                hint: format!(
                    "Set gemini_api_key in config.json, GEMINI_API_KEY, or any key \
                     edgequake-llm auto-detects (OPENAI_API_KEY, ANTHROPIC_API_KEY…).\n\
                     Error: {e}"
                ),
            })?;
        Ok(Self::new(provider))
    }
}

#[async_trait]
impl Summarizer for ProviderSummarizer {
    async fn summarize(
        &self,
        text: &str,
        max_chars: usize,
    ) -> Result<SummaryResult, SummarizationError> {
        let (input, source_chars) = prepare_input(text)?;
        let messages = vec![
            ChatMessage::system(SUMMARY_SYSTEM_PROMPT),
            ChatMessage::user(summary_prompt(input, max_chars)),
        ];
        let options = CompletionOptions {
            temperature: Some(0.2),
            max_tokens: Some(1024),
            ..Default::default()
        };

        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(classify_provider_error)?;
        debug!(
            "Provider summary: {} input tokens, {} output tokens",
            response.prompt_tokens, response.completion_tokens
        );
        finish(&response.content, max_chars, source_chars)
    }
}

/// Map a provider error onto a failure class. Only rate limits and
/// transport failures are retried; everything else is permanent.
fn classify_provider_error(err: LlmError) -> SummarizationError {
    let reason = match &err {
        LlmError::RateLimited(_) => SummarizationFailure::RateLimit,
        LlmError::NetworkError(_) | LlmError::Timeout => SummarizationFailure::Network,
        LlmError::AuthError(_) => SummarizationFailure::Auth,
        _ => SummarizationFailure::InvalidResponse,
    };
    SummarizationError::new(reason, err.to_string())
}
