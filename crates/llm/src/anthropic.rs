//! Anthropic backend (`/v1/messages`).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::client::{
    GenerateRequest, GenerateResponse, LlmProvider, ProviderError, ProviderResult, TokenUsage,
};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);
const DEFAULT_MAX_TOKENS: u32 = 1024;

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    max_tokens: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    model: String,
    usage: Option<AnthropicUsage>,
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicContent {
    text: String,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

pub struct AnthropicProvider {
    model: String,
    api_key: String,
    api_url: String,
    http_client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(model: String, api_key: String) -> Self {
        Self {
            model,
            api_key,
            api_url: ANTHROPIC_API_URL.to_string(),
            http_client: reqwest::Client::new(),
        }
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    fn build_body(&self, request: &GenerateRequest) -> AnthropicRequest {
        AnthropicRequest {
            model: self.model.clone(),
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: request.prompt.clone(),
            }],
            system: request.system_prompt.clone(),
            temperature: request.temperature,
            top_p: request.top_p,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        }
    }
}

fn map_status(status: reqwest::StatusCode, body: String) -> ProviderError {
    match status.as_u16() {
        408 => ProviderError::Timeout,
        429 => ProviderError::RateLimited,
        400 | 422 => ProviderError::BadInput(body),
        _ => ProviderError::Unavailable(format!("{status}: {body}")),
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn generate(&self, request: GenerateRequest) -> ProviderResult<GenerateResponse> {
        let body = self.build_body(&request);
        let deadline = request.deadline.unwrap_or(DEFAULT_DEADLINE);

        let started = Instant::now();
        let response = self
            .http_client
            .post(&self.api_url)
            .timeout(deadline)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(map_status(status, body_text));
        }

        let anthropic: AnthropicResponse = response.json().await.map_err(|e| {
            ProviderError::Unavailable(format!("unparseable Anthropic response: {e}"))
        })?;

        let content = anthropic
            .content
            .into_iter()
            .map(|c| c.text)
            .collect::<Vec<_>>()
            .join("");

        Ok(GenerateResponse {
            content,
            provider: self.name().to_string(),
            model: anthropic.model,
            latency_ms: started.elapsed().as_millis() as u64,
            usage: anthropic.usage.map(|u| TokenUsage {
                prompt_tokens: u.input_tokens,
                completion_tokens: u.output_tokens,
            }),
            finish_reason: anthropic.stop_reason,
        })
    }

    fn name(&self) -> &str {
        "anthropic"
    }

    fn supported_models(&self) -> Vec<String> {
        vec![
            "claude-sonnet-4-20250514".to_string(),
            "claude-3-5-haiku-20241022".to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_matches_messages_api_format() {
        let provider =
            AnthropicProvider::new("claude-sonnet-4-20250514".into(), "sk-ant-test".into());
        let request = GenerateRequest {
            prompt: "Classify this message.".into(),
            system_prompt: Some("You are an intent classifier.".into()),
            temperature: Some(0.1),
            top_p: None,
            max_tokens: Some(50),
            deadline: None,
        };
        let json = serde_json::to_value(provider.build_body(&request)).unwrap();

        assert_eq!(json["model"], "claude-sonnet-4-20250514");
        assert_eq!(json["system"], "You are an intent classifier.");
        assert_eq!(json["max_tokens"], 50);
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"], "Classify this message.");
        assert!(json.get("top_p").is_none());
    }

    #[test]
    fn max_tokens_defaults_when_unset() {
        let provider = AnthropicProvider::new("claude-sonnet-4-20250514".into(), "key".into());
        let request = GenerateRequest {
            prompt: "hi".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(provider.build_body(&request)).unwrap();
        assert_eq!(json["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn rate_limit_status_is_soft() {
        let err = map_status(reqwest::StatusCode::TOO_MANY_REQUESTS, String::new());
        assert_eq!(err, ProviderError::RateLimited);
        assert!(err.is_soft());
    }

    #[test]
    fn bad_request_is_hard() {
        let err = map_status(reqwest::StatusCode::BAD_REQUEST, "missing model".into());
        assert!(!err.is_soft());
    }
}
