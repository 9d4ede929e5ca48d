//! Bus envelopes exchanged with worker agents.
//!
//! Envelopes are tagged with an explicit `message_type`; agents and the
//! orchestrator refuse frames missing required fields rather than
//! inspecting payload structure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CarelinkError;
use crate::message::ConversationMessage;
use crate::session::UserContext;
use crate::time::iso_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    TaskRequest,
    TaskResponse,
}

/// Payload of a task request: everything an agent needs to act on one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub message: String,

    pub session_id: Uuid,

    #[serde(default)]
    pub user_context: UserContext,

    /// Trimmed history, newest last.
    #[serde(default)]
    pub conversation_history: Vec<ConversationMessage>,

    pub correlation_id: Uuid,
}

/// Envelope produced to an agent request topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub message_type: EnvelopeKind,

    pub correlation_id: Uuid,

    pub task_type: String,

    pub payload: TaskPayload,

    #[serde(with = "iso_millis")]
    pub timestamp: DateTime<Utc>,
}

impl TaskRequest {
    pub fn new(correlation_id: Uuid, task_type: impl Into<String>, payload: TaskPayload) -> Self {
        Self {
            message_type: EnvelopeKind::TaskRequest,
            correlation_id,
            task_type: task_type.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskResponseStatus {
    Success,
    Error,
}

/// Result body of a task response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub response: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,

    #[serde(default)]
    pub requires_human_handoff: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggested_actions: Vec<String>,

    /// The session id the request carried, echoed back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

/// Envelope consumed from an agent response topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    pub message_type: EnvelopeKind,

    pub correlation_id: Uuid,

    pub status: TaskResponseStatus,

    pub result: TaskResult,

    #[serde(with = "iso_millis")]
    pub timestamp: DateTime<Utc>,
}

impl TaskResponse {
    pub fn success(correlation_id: Uuid, result: TaskResult) -> Self {
        Self {
            message_type: EnvelopeKind::TaskResponse,
            correlation_id,
            status: TaskResponseStatus::Success,
            result,
            timestamp: Utc::now(),
        }
    }

    pub fn error(correlation_id: Uuid, result: TaskResult) -> Self {
        Self {
            message_type: EnvelopeKind::TaskResponse,
            correlation_id,
            status: TaskResponseStatus::Error,
            result,
            timestamp: Utc::now(),
        }
    }

    /// Parse a raw bus frame, rejecting anything that is not a well-formed
    /// task response.
    pub fn from_slice(raw: &[u8]) -> Result<Self, CarelinkError> {
        let parsed: Self = serde_json::from_slice(raw)
            .map_err(|e| CarelinkError::Protocol(format!("malformed task response: {e}")))?;
        if parsed.message_type != EnvelopeKind::TaskResponse {
            return Err(CarelinkError::Protocol(format!(
                "unexpected message_type {:?} on response topic",
                parsed.message_type
            )));
        }
        Ok(parsed)
    }
}
