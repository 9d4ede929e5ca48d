//! Session data model.
//!
//! A session is a durable conversation thread: ordered history, TTL from
//! last activity, and the tasks currently in flight for it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::{ConversationMessage, MessageRole};
use crate::time::iso_millis;

/// Greeting seeded into every new session's history.
pub const SESSION_GREETING: &str =
    "Hello! I am your healthcare assistant. How can I help you today?";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    Id,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    #[default]
    Patient,
    Staff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Caller-supplied context forwarded to agents with every task request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserContext {
    #[serde(default)]
    pub language: Language,

    #[serde(default)]
    pub user_type: UserType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,

    #[serde(default)]
    pub priority: Priority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingTaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// A dispatched task tracked on the session until it resolves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingTask {
    /// Task id, equal to the dispatch correlation id.
    pub task_id: Uuid,

    pub task_type: String,

    pub status: PendingTaskStatus,

    #[serde(with = "iso_millis")]
    pub created_at: DateTime<Utc>,

    #[serde(with = "iso_millis")]
    pub deadline: DateTime<Utc>,
}

impl PendingTask {
    /// Past its deadline and not yet resolved.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.status,
            PendingTaskStatus::Pending | PendingTaskStatus::Processing
        ) && self.deadline < now
    }
}

/// A durable conversation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,

    pub user_id: String,

    #[serde(with = "iso_millis")]
    pub created_at: DateTime<Utc>,

    #[serde(with = "iso_millis")]
    pub last_activity: DateTime<Utc>,

    #[serde(default)]
    pub language: Language,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_intent: Option<String>,

    pub workflow_state: String,

    pub conversation_history: Vec<ConversationMessage>,

    #[serde(default)]
    pub context: UserContext,

    #[serde(default)]
    pub pending_tasks: Vec<PendingTask>,
}

impl Session {
    pub const DEFAULT_MAX_HISTORY: usize = 50;

    pub fn new(session_id: Uuid, user_id: impl Into<String>, context: UserContext) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            user_id: user_id.into(),
            created_at: now,
            last_activity: now,
            language: context.language,
            current_intent: None,
            workflow_state: "initial".to_string(),
            conversation_history: vec![ConversationMessage::assistant(SESSION_GREETING)],
            context,
            pending_tasks: Vec::new(),
        }
    }

    /// Append a message, dropping the oldest entries beyond `max_history`.
    pub fn push_message(&mut self, message: ConversationMessage, max_history: usize) {
        self.conversation_history.push(message);
        if self.conversation_history.len() > max_history {
            let excess = self.conversation_history.len() - max_history;
            self.conversation_history.drain(..excess);
        }
        self.last_activity = Utc::now();
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Locate the assistant message dispatched under `correlation_id`.
    pub fn find_by_correlation_mut(
        &mut self,
        correlation_id: Uuid,
    ) -> Option<&mut ConversationMessage> {
        self.conversation_history
            .iter_mut()
            .find(|m| m.metadata.correlation_id == Some(correlation_id))
    }

    /// The most recent user/assistant exchanges, system messages excluded.
    /// One turn is a user message plus the assistant reply to it.
    pub fn recent_turns(&self, turns: usize) -> Vec<ConversationMessage> {
        let mut recent: Vec<ConversationMessage> = self
            .conversation_history
            .iter()
            .rev()
            .filter(|m| m.role != MessageRole::System)
            .take(turns * 2)
            .cloned()
            .collect();
        recent.reverse();
        recent
    }

    pub fn remove_pending_task(&mut self, task_id: Uuid) {
        self.pending_tasks.retain(|t| t.task_id != task_id);
    }
}
