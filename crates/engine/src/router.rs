//! Agent routing table.
//!
//! Maps a classified intent to the bus topics, task type, deadlines, and
//! provisional placeholder used to dispatch it. The router is pure: it
//! produces dispatch descriptors, the bus client does the I/O.

use std::collections::HashMap;
use std::time::Duration;

pub const INTENT_GENERAL_INFO: &str = "general_info";

/// Everything the engine needs to dispatch one task.
#[derive(Debug, Clone)]
pub struct DispatchDescriptor {
    pub request_topic: String,
    pub response_topic: String,
    pub task_type: String,
    /// Provisional assistant text shown while the agent works.
    pub placeholder: String,
    /// Past this, the client gets a still-working status notification.
    pub soft_deadline: Duration,
    /// Past this, the sweeper synthesizes an error completion.
    pub hard_deadline: Duration,
}

impl DispatchDescriptor {
    fn new(
        request_topic: &str,
        response_topic: &str,
        task_type: &str,
        placeholder: &str,
        soft_secs: u64,
        hard_secs: u64,
    ) -> Self {
        Self {
            request_topic: request_topic.to_string(),
            response_topic: response_topic.to_string(),
            task_type: task_type.to_string(),
            placeholder: placeholder.to_string(),
            soft_deadline: Duration::from_secs(soft_secs),
            hard_deadline: Duration::from_secs(hard_secs),
        }
    }
}

pub struct AgentRouter {
    table: HashMap<String, DispatchDescriptor>,
}

impl AgentRouter {
    /// The built-in table covering the stock agents.
    pub fn with_defaults() -> Self {
        let mut table = HashMap::new();
        table.insert(
            "appointment_booking".to_string(),
            DispatchDescriptor::new(
                "appointment-agent-requests",
                "appointment-agent-responses",
                "appointment_booking",
                "I'm processing your appointment request. Please give me a moment to check availability.",
                20,
                30,
            ),
        );
        table.insert(
            "appointment_modify".to_string(),
            DispatchDescriptor::new(
                "appointment-agent-requests",
                "appointment-agent-responses",
                "appointment_modify",
                "I'm working on modifying your appointment. Please hold on.",
                20,
                30,
            ),
        );
        table.insert(
            INTENT_GENERAL_INFO.to_string(),
            DispatchDescriptor::new(
                "general-info-requests",
                "general-info-responses",
                "general_info",
                "Let me search our knowledge base for that information. One moment please.",
                10,
                15,
            ),
        );
        table.insert(
            "pre_admission".to_string(),
            DispatchDescriptor::new(
                "info-dissemination-requests",
                "info-dissemination-responses",
                "pre_admission",
                "I'm retrieving the pre-admission details for you. This might take a moment.",
                15,
                25,
            ),
        );
        table.insert(
            "post_discharge".to_string(),
            DispatchDescriptor::new(
                "info-dissemination-requests",
                "info-dissemination-responses",
                "post_discharge",
                "I'm looking up post-discharge information. Please wait.",
                15,
                25,
            ),
        );
        Self { table }
    }

    /// Build from an explicit table. The `general_info` route is the
    /// fallback for unknown intents, so a table without one gets the
    /// built-in entry.
    pub fn from_table(mut table: HashMap<String, DispatchDescriptor>) -> Self {
        if !table.contains_key(INTENT_GENERAL_INFO) {
            let defaults = Self::with_defaults();
            let fallback = defaults
                .table
                .get(INTENT_GENERAL_INFO)
                .expect("built-in table carries the general_info route")
                .clone();
            table.insert(INTENT_GENERAL_INFO.to_string(), fallback);
        }
        Self { table }
    }

    /// Override or add a single route.
    pub fn insert(&mut self, intent: impl Into<String>, descriptor: DispatchDescriptor) {
        self.table.insert(intent.into(), descriptor);
    }

    /// Resolve an intent. Unknown intents go through the knowledge-base
    /// agent via the `general_info` route.
    pub fn route(&self, intent: &str) -> &DispatchDescriptor {
        self.table.get(intent).unwrap_or_else(|| {
            self.table
                .get(INTENT_GENERAL_INFO)
                .expect("router table always carries the general_info route")
        })
    }

    /// Distinct response topics the engine must consume.
    pub fn response_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .table
            .values()
            .map(|d| d.response_topic.clone())
            .collect();
        topics.sort();
        topics.dedup();
        topics
    }
}

impl Default for AgentRouter {
    fn default() -> Self {
        Self::with_defaults()
    }
}
