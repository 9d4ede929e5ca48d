//! LLM provider abstraction for Carelink.
//!
//! Backends implement [`LlmProvider`]; [`ProviderRegistry`] layers
//! failover, circuit breaking, and request budgets over an ordered list
//! of them. [`PromptRegistry`] serves the externalized prompt templates.

pub mod anthropic;
pub mod client;
pub mod gemini;
pub mod prompts;
pub mod registry;

pub use anthropic::AnthropicProvider;
pub use client::{
    GenerateRequest, GenerateResponse, LlmProvider, ProviderError, ProviderResult, TokenUsage,
};
pub use gemini::GeminiProvider;
pub use prompts::{PromptRegistry, PromptTemplate};
pub use registry::{GenerateOutcome, ProviderRegistry};
