//! Push channel hub: at most one live connection per session.
//!
//! The hub never talks to sockets directly. Each attached connection is
//! an unbounded channel of [`PushFrame`]s; the transport task (the
//! WebSocket handler) drains it and writes frames out. That keeps `send`
//! non-blocking and lets a superseding attach close the old transport
//! with a reason.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{SecondsFormat, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CLOSE_REASON_SUPERSEDED: &str = "superseded";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PushKind {
    FinalResponse,
    Typing,
    Status,
    Error,
}

/// JSON envelope written to the client.
#[derive(Debug, Clone, Serialize)]
pub struct PushEnvelope {
    #[serde(rename = "type")]
    pub kind: PushKind,
    pub data: serde_json::Value,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

impl PushEnvelope {
    pub fn new(kind: PushKind, data: serde_json::Value, correlation_id: Option<Uuid>) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            correlation_id,
        }
    }

    pub fn status(session_id: Uuid, detail: &str, correlation_id: Option<Uuid>) -> Self {
        Self::new(
            PushKind::Status,
            json!({ "session_id": session_id, "detail": detail }),
            correlation_id,
        )
    }
}

/// What flows from the hub to a connection's transport task.
#[derive(Debug, Clone)]
pub enum PushFrame {
    Envelope(PushEnvelope),
    Close { reason: String },
}

struct Connection {
    id: u64,
    tx: mpsc::UnboundedSender<PushFrame>,
}

#[derive(Default)]
pub struct PushHub {
    connections: RwLock<HashMap<Uuid, Connection>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl PushHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection for `session_id`, superseding any prior one.
    /// Returns the connection id (needed to detach) and the frame stream
    /// the transport must drain.
    pub fn attach(&self, session_id: Uuid) -> (u64, mpsc::UnboundedReceiver<PushFrame>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();

        let previous = self
            .connections
            .write()
            .insert(session_id, Connection { id, tx });

        if let Some(previous) = previous {
            debug!(%session_id, "superseding existing push connection");
            let _ = previous.tx.send(PushFrame::Close {
                reason: CLOSE_REASON_SUPERSEDED.to_string(),
            });
        }

        (id, rx)
    }

    /// Forget a connection. The connection id must match: a superseded
    /// transport detaching late must not evict its replacement.
    pub fn detach(&self, session_id: Uuid, connection_id: u64) {
        let mut connections = self.connections.write();
        if connections
            .get(&session_id)
            .is_some_and(|c| c.id == connection_id)
        {
            connections.remove(&session_id);
            debug!(%session_id, "push connection detached");
        }
    }

    /// Deliver an envelope to the session's live connection, if any.
    /// Never blocks; an unattached session drops the envelope.
    pub fn send(&self, session_id: Uuid, envelope: PushEnvelope) -> bool {
        let connections = self.connections.read();
        match connections.get(&session_id) {
            Some(connection) => {
                if connection.tx.send(PushFrame::Envelope(envelope)).is_ok() {
                    true
                } else {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    false
                }
            }
            None => {
                warn!(%session_id, "no push connection attached, dropping envelope");
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn is_attached(&self, session_id: Uuid) -> bool {
        self.connections.read().contains_key(&session_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
