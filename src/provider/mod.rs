//! AI provider families behind a single `invoke` contract.
//!
//! Each credential names the family it belongs to; [`ProviderClients`] picks
//! the matching HTTP client and every failure is folded into one of four
//! [`ErrorKind`]s that the credential pool knows how to recover from.

pub mod anthropic;
pub mod gemini;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};

use crate::chatbot::credentials::Credential;
use anthropic::AnthropicClient;
use gemini::GeminiClient;

/// Provider family a credential belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFamily {
    Anthropic,
    Gemini,
}

impl ProviderFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderFamily::Anthropic => "anthropic",
            ProviderFamily::Gemini => "gemini",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "anthropic" => Some(ProviderFamily::Anthropic),
            "gemini" => Some(ProviderFamily::Gemini),
            _ => None,
        }
    }
}

/// Coarse classification of a failed provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Auth,
    Quota,
    Transport,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Auth => "auth",
            ErrorKind::Quota => "quota",
            ErrorKind::Transport => "transport",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("quota exhausted: {0}")]
    Quota(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("provider error: {0}")]
    Unknown(String),
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Auth(_) => ErrorKind::Auth,
            ProviderError::Quota(_) => ErrorKind::Quota,
            ProviderError::Transport(_) => ErrorKind::Transport,
            ProviderError::Unknown(_) => ErrorKind::Unknown,
        }
    }
}

/// The one contract every provider family satisfies.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Run `prompt` against `model` using `credential`. `context` carries the
    /// system prompt.
    async fn invoke(
        &self,
        credential: &Credential,
        model: &str,
        prompt: &str,
        context: &str,
    ) -> Result<String, ProviderError>;
}

/// Map a non-success HTTP response onto an error kind.
///
/// A 429 is only treated as quota exhaustion when it is not a short-lived
/// rate limit; rate limits are transient and retried like transport errors.
pub fn classify_status(status: StatusCode, headers: &HeaderMap, body: &str) -> ProviderError {
    let detail = format!("{status}: {}", body.chars().take(300).collect::<String>());
    match status.as_u16() {
        401 | 403 => ProviderError::Auth(detail),
        429 if headers.contains_key(RETRY_AFTER) || mentions_rate_limit(body) => {
            ProviderError::Transport(detail)
        }
        402 | 429 => ProviderError::Quota(detail),
        408 | 500..=599 => ProviderError::Transport(detail),
        400 if mentions_quota(body) => ProviderError::Quota(detail),
        _ => ProviderError::Unknown(detail),
    }
}

/// Some providers report billing exhaustion as a plain 400.
fn mentions_quota(body: &str) -> bool {
    let lower = body.to_lowercase();
    ["quota", "credit balance", "billing", "resource_exhausted"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Per-minute limits: Anthropic's `rate_limit_error`, Gemini's `PerMinute` quota ids.
fn mentions_rate_limit(body: &str) -> bool {
    let lower = body.to_lowercase();
    ["rate_limit_error", "rate limit", "perminute", "per minute"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Map a reqwest failure onto an error kind. The URL is stripped first since
/// some endpoints carry credentials in it.
pub fn classify_send_error(err: reqwest::Error) -> ProviderError {
    let err = err.without_url();
    if err.is_builder() {
        ProviderError::Unknown(format!("invalid request: {err}"))
    } else {
        ProviderError::Transport(err.to_string())
    }
}

/// HTTP clients for every supported family.
pub struct ProviderClients {
    anthropic: AnthropicClient,
    gemini: GeminiClient,
}

impl ProviderClients {
    pub fn new(timeout: Duration) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Unknown(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            anthropic: AnthropicClient::new(http.clone()),
            gemini: GeminiClient::new(http),
        })
    }
}

#[async_trait]
impl Provider for ProviderClients {
    async fn invoke(
        &self,
        credential: &Credential,
        model: &str,
        prompt: &str,
        context: &str,
    ) -> Result<String, ProviderError> {
        match credential.family {
            ProviderFamily::Anthropic => {
                self.anthropic
                    .complete(&credential.api_key, model, prompt, context)
                    .await
            }
            ProviderFamily::Gemini => {
                self.gemini
                    .generate(&credential.api_key, model, prompt, context)
                    .await
            }
        }
    }
}
