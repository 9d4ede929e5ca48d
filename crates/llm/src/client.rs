//! Provider-agnostic LLM request/response types and the provider trait.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Overall deadline for the call; enforced by the backend.
    #[serde(skip)]
    pub deadline: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub content: String,
    pub provider: String,
    pub model: String,
    pub latency_ms: u64,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<String>,
}

/// Failure modes a provider can signal.
///
/// Soft failures let callers fail over to the next provider; `BadInput`
/// is a hard failure and is never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider timed out")]
    Timeout,

    #[error("provider rate limited")]
    RateLimited,

    #[error("bad input: {0}")]
    BadInput(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    pub fn is_soft(&self) -> bool {
        !matches!(self, Self::BadInput(_))
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Uniform capability over an LLM backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> ProviderResult<GenerateResponse>;

    /// Cheap liveness probe; the default issues a tiny generation.
    async fn health(&self) -> bool {
        let probe = GenerateRequest {
            prompt: "Hello".to_string(),
            max_tokens: Some(8),
            temperature: Some(0.1),
            deadline: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        self.generate(probe).await.is_ok()
    }

    fn name(&self) -> &str;

    fn supported_models(&self) -> Vec<String>;
}
