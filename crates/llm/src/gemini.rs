//! Google Gemini backend (REST `generateContent`).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::client::{
    GenerateRequest, GenerateResponse, LlmProvider, ProviderError, ProviderResult, TokenUsage,
};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct GeminiPart {
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: GeminiContent,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    prompt_token_count: Option<u32>,
    candidates_token_count: Option<u32>,
}

pub struct GeminiProvider {
    model: String,
    api_key: String,
    api_base: String,
    http_client: reqwest::Client,
}

impl GeminiProvider {
    pub fn new(model: String, api_key: String) -> Self {
        Self {
            model,
            api_key,
            api_base: GEMINI_API_BASE.to_string(),
            http_client: reqwest::Client::new(),
        }
    }

    /// Point at a non-default endpoint (proxies, emulators).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn build_body(request: &GenerateRequest) -> GeminiRequest {
        GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![GeminiPart {
                    text: request.prompt.clone(),
                }],
            }],
            system_instruction: request.system_prompt.as_ref().map(|s| GeminiContent {
                parts: vec![GeminiPart { text: s.clone() }],
            }),
            generation_config: GeminiGenerationConfig {
                temperature: request.temperature,
                top_p: request.top_p,
                max_output_tokens: request.max_tokens,
            },
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

fn map_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Unavailable(err.to_string())
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    async fn generate(&self, request: GenerateRequest) -> ProviderResult<GenerateResponse> {
        let url = format!(
            "{}/{}:generateContent?key={}",
            self.api_base, self.model, self.api_key
        );
        let body = Self::build_body(&request);
        let deadline = request.deadline.unwrap_or(DEFAULT_DEADLINE);

        let started = Instant::now();
        let response = self
            .http_client
            .post(&url)
            .timeout(deadline)
            .json(&body)
            .send()
            .await
            .map_err(map_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(map_status(status, body_text));
        }

        let gemini: GeminiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("unparseable Gemini response: {e}")))?;

        let candidate = gemini
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Unavailable("no candidates in response".to_string()))?;

        let content = candidate
            .content
            .parts
            .into_iter()
            .map(|p| p.text)
            .collect::<Vec<_>>()
            .join("");

        Ok(GenerateResponse {
            content,
            provider: self.name().to_string(),
            model: self.model.clone(),
            latency_ms: started.elapsed().as_millis() as u64,
            usage: gemini.usage_metadata.map(|u| TokenUsage {
                prompt_tokens: u.prompt_token_count.unwrap_or(0),
                completion_tokens: u.candidates_token_count.unwrap_or(0),
            }),
            finish_reason: candidate.finish_reason,
        })
    }

    fn name(&self) -> &str {
        "gemini"
    }

    fn supported_models(&self) -> Vec<String> {
        vec![
            "gemini-2.5-flash".to_string(),
            "gemini-2.5-pro".to_string(),
            "gemini-pro".to_string(),
        ]
    }
}
