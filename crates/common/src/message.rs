//! Conversation message types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::time::iso_millis;

/// Role of a message within a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// Delivery status of an assistant message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Completed,
    Error,
}

/// Metadata attached to a conversation message.
///
/// A pending assistant message carries exactly one correlation id; on
/// completion its status flips and the content is overwritten with the
/// final text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
}

/// One entry in a session's conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    #[serde(with = "iso_millis")]
    pub timestamp: DateTime<Utc>,

    pub role: MessageRole,

    pub content: String,

    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            role: MessageRole::User,
            content: content.into(),
            metadata: MessageMetadata::default(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            role: MessageRole::System,
            content: content.into(),
            metadata: MessageMetadata::default(),
        }
    }

    /// A finished assistant message (greetings, emergency responses).
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            role: MessageRole::Assistant,
            content: content.into(),
            metadata: MessageMetadata {
                status: Some(MessageStatus::Completed),
                ..Default::default()
            },
        }
    }

    /// A provisional assistant message awaiting an agent result.
    pub fn pending_assistant(content: impl Into<String>, correlation_id: Uuid) -> Self {
        Self {
            timestamp: Utc::now(),
            role: MessageRole::Assistant,
            content: content.into(),
            metadata: MessageMetadata {
                correlation_id: Some(correlation_id),
                status: Some(MessageStatus::Pending),
                ..Default::default()
            },
        }
    }

    pub fn is_pending(&self) -> bool {
        self.metadata.status == Some(MessageStatus::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_serialize_lowercase() {
        assert_eq!(
            serde_json::to_string(&MessageRole::Assistant).unwrap(),
            "\"assistant\""
        );
        assert_eq!(serde_json::to_string(&MessageRole::User).unwrap(), "\"user\"");
    }

    #[test]
    fn pending_assistant_carries_correlation_id() {
        let correlation_id = Uuid::new_v4();
        let msg = ConversationMessage::pending_assistant("One moment...", correlation_id);
        assert!(msg.is_pending());
        assert_eq!(msg.metadata.correlation_id, Some(correlation_id));
        assert_eq!(msg.role, MessageRole::Assistant);
    }

    #[test]
    fn completed_assistant_is_not_pending() {
        let msg = ConversationMessage::assistant("Hello!");
        assert!(!msg.is_pending());
        assert_eq!(msg.metadata.status, Some(MessageStatus::Completed));
    }

    #[test]
    fn metadata_omits_empty_fields() {
        let msg = ConversationMessage::user("hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json["metadata"].get("correlation_id").is_none());
        assert!(json["metadata"].get("status").is_none());
    }
}
