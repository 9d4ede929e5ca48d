//! Conversation orchestration for Carelink.
//!
//! The engine sits between the HTTP surface and the worker agents: it
//! classifies each utterance, dispatches work over the bus, tracks the
//! correlation until an agent (or the timeout sweeper) closes it, and
//! delivers the final response over the session's push channel.
//!
//! ```text
//! POST /chat ──► ConversationEngine ──► AgentRouter ──► BusClient
//!                     │    ▲                                │
//!                     ▼    │ resolve                        ▼
//!               SessionStore │                       worker agents
//!                          CorrelationRegistry ◄── response topics
//!                                │
//!                                ▼
//!                             PushHub ──► WebSocket client
//! ```

pub mod classifier;
pub mod config;
pub mod correlation;
pub mod engine;
pub mod hub;
pub mod metrics;
pub mod router;

pub use classifier::{
    Classification, ClassificationSource, IntentClassifier, IntentRuleConfig,
    INTENT_GENERAL_INFO, INTENT_MEDICAL_EMERGENCY,
};
pub use config::{
    AgentRouteConfig, BusConfig, LimitsConfig, OrchestratorConfig, ProviderEntry, ServiceConfig,
    SessionConfig, StoreConfig,
};
pub use correlation::{CorrelationEntry, CorrelationRegistry};
pub use engine::{ChatOutcome, ConversationEngine, MAX_USER_ID_CHARS};
pub use hub::{PushEnvelope, PushFrame, PushHub, PushKind, CLOSE_REASON_SUPERSEDED};
pub use metrics::{Metrics, MetricsSnapshot};
pub use router::{AgentRouter, DispatchDescriptor};
