//! Common types shared across Carelink crates.
//!
//! This crate provides the conversation data model, the bus envelope
//! contract, and the error taxonomy that every other component builds on.

pub mod envelope;
pub mod error;
pub mod message;
pub mod session;
pub mod time;

pub use envelope::{
    EnvelopeKind, TaskPayload, TaskRequest, TaskResponse, TaskResponseStatus, TaskResult,
};
pub use error::{CarelinkError, Result};
pub use message::{ConversationMessage, MessageMetadata, MessageRole, MessageStatus};
pub use session::{
    Language, PendingTask, PendingTaskStatus, Priority, Session, UserContext, UserType,
    SESSION_GREETING,
};
