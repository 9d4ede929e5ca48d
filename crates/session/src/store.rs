//! Session store contract.
//!
//! The store is shared by every orchestrator instance; sessions are
//! self-contained structured values and the store is opaque to their
//! shape. Appends use optimistic concurrency: a lost race surfaces as
//! [`StoreError::Conflict`].

use async_trait::async_trait;
use carelink_common::{ConversationMessage, MessageStatus, PendingTask, Session};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Concurrent write conflict: {0}")]
    Conflict(String),

    #[error("Session not found: {0}")]
    Missing(Uuid),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupted session data: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Outages degrade the service to stateless mode rather than failing
    /// the request.
    pub fn is_outage(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable key-value contract for conversation sessions.
///
/// Every `put` (including appends) resets the session TTL to the store's
/// configured default. A session absent beyond its TTL is nonexistent.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: Uuid) -> StoreResult<Option<Session>>;

    async fn put(&self, session: Session) -> StoreResult<()>;

    async fn delete(&self, session_id: Uuid) -> StoreResult<()>;

    /// Session ids owned by a user; administrative surface only.
    async fn list_by_user(&self, user_id: &str) -> StoreResult<Vec<Uuid>>;

    /// Atomically append a batch of messages (read, append with truncation,
    /// write). The batch is all-or-nothing so a user turn and its
    /// provisional assistant reply land together.
    async fn append_messages(
        &self,
        session_id: Uuid,
        messages: Vec<ConversationMessage>,
    ) -> StoreResult<()>;

    async fn append_message(
        &self,
        session_id: Uuid,
        message: ConversationMessage,
    ) -> StoreResult<()> {
        self.append_messages(session_id, vec![message]).await
    }

    /// Atomically record a dispatched exchange: append the user turn and
    /// its provisional assistant reply, push the pending task, and set the
    /// session's current intent.
    async fn append_with_task(
        &self,
        session_id: Uuid,
        messages: Vec<ConversationMessage>,
        task: PendingTask,
        intent: &str,
    ) -> StoreResult<()>;

    /// Apply a final response to the assistant message whose metadata
    /// carries `correlation_id`: overwrite content, set status, refresh
    /// the timestamp, optionally record the intent, and drop the matching
    /// pending task. Returns whether a matching message was found.
    async fn update_by_correlation(
        &self,
        session_id: Uuid,
        correlation_id: Uuid,
        content: &str,
        status: MessageStatus,
        intent: Option<&str>,
    ) -> StoreResult<bool>;

    /// Number of live (unexpired) sessions.
    async fn count(&self) -> StoreResult<usize>;
}
