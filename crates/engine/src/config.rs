//! Orchestrator configuration: YAML file plus environment overrides.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use carelink_common::{CarelinkError, Result};
use serde::{Deserialize, Serialize};

use crate::router::{AgentRouter, DispatchDescriptor};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub session: SessionConfig,

    /// Ordered provider chain: primary first, fallbacks after.
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,

    #[serde(default = "default_prompts_dir")]
    pub prompts_dir: PathBuf,

    /// Optional YAML rules file overriding the built-in intent rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_rules: Option<PathBuf>,

    /// Per-intent routing overrides; intents not listed use the built-in
    /// table.
    #[serde(default)]
    pub agents: HashMap<String, AgentRouteConfig>,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_service_name() -> String {
    "carelink-orchestrator".into()
}

fn default_bind_addr() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            bind_addr: default_bind_addr(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_max_history() -> usize {
    50
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            max_history: default_max_history(),
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    /// "gemini" or "anthropic".
    pub provider: String,

    pub model: String,

    /// If not set, resolved from the provider's environment variable:
    /// GEMINI_API_KEY or ANTHROPIC_API_KEY.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
}

impl ProviderEntry {
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(ref key) = self.api_key {
            if !key.is_empty() {
                return Some(key.clone());
            }
        }
        let env_var = match self.provider.as_str() {
            "gemini" => "GEMINI_API_KEY",
            "anthropic" => "ANTHROPIC_API_KEY",
            _ => return None,
        };
        std::env::var(env_var).ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRouteConfig {
    pub request_topic: String,
    pub response_topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(default = "default_placeholder")]
    pub placeholder: String,
    #[serde(default = "default_soft_deadline_secs")]
    pub soft_deadline_secs: u64,
    #[serde(default = "default_hard_deadline_secs")]
    pub hard_deadline_secs: u64,
}

fn default_placeholder() -> String {
    "I'm processing your request. One moment please.".into()
}

fn default_soft_deadline_secs() -> u64 {
    20
}

fn default_hard_deadline_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub brokers: Vec<String>,

    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    #[serde(default = "default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,

    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_consumer_group() -> String {
    "orchestrator".into()
}

fn default_dispatch_timeout_ms() -> u64 {
    2000
}

fn default_queue_depth() -> usize {
    256
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            brokers: Vec::new(),
            consumer_group: default_consumer_group(),
            dispatch_timeout_ms: default_dispatch_timeout_ms(),
            queue_depth: default_queue_depth(),
        }
    }
}

impl BusConfig {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Session store address (e.g. a Redis URL); absent means the
    /// in-process store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    #[serde(default = "default_llm_requests_per_minute")]
    pub llm_requests_per_minute: u32,

    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,

    #[serde(default = "default_provider_cool_off_secs")]
    pub provider_cool_off_secs: u64,
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_llm_requests_per_minute() -> u32 {
    60
}

fn default_max_message_chars() -> usize {
    2000
}

fn default_provider_cool_off_secs() -> u64 {
    30
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            llm_requests_per_minute: default_llm_requests_per_minute(),
            max_message_chars: default_max_message_chars(),
            provider_cool_off_secs: default_provider_cool_off_secs(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            session: SessionConfig::default(),
            providers: Vec::new(),
            prompts_dir: default_prompts_dir(),
            intent_rules: None,
            agents: HashMap::new(),
            bus: BusConfig::default(),
            store: StoreConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

fn default_prompts_dir() -> PathBuf {
    PathBuf::from("prompts")
}

impl OrchestratorConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        serde_yaml::from_str(&raw)
            .map_err(|e| CarelinkError::Config(format!("bad configuration file: {e}")))
    }

    /// Build the routing table: built-in defaults overlaid with the
    /// configured per-intent entries.
    pub fn build_router(&self) -> AgentRouter {
        let mut router = AgentRouter::with_defaults();
        for (intent, route) in &self.agents {
            router.insert(
                intent.clone(),
                DispatchDescriptor {
                    request_topic: route.request_topic.clone(),
                    response_topic: route.response_topic.clone(),
                    task_type: route.task_type.clone().unwrap_or_else(|| intent.clone()),
                    placeholder: route.placeholder.clone(),
                    soft_deadline: Duration::from_secs(route.soft_deadline_secs),
                    hard_deadline: Duration::from_secs(route.hard_deadline_secs),
                },
            );
        }
        router
    }
}
