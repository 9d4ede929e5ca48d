//! Message bus client contract.
//!
//! The bus moves tagged task envelopes between the orchestrator and the
//! worker agents. The contract is broker-agnostic: records are opaque
//! bytes keyed for partitioning (producers key by session id so one
//! session's traffic stays ordered), consumption is sequential per topic,
//! and delivery is at-least-once — handlers must be idempotent with
//! respect to correlation id.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// One record on a topic.
#[derive(Debug, Clone)]
pub struct Record {
    /// Partition key; session id for all Carelink traffic.
    pub key: String,
    pub payload: Vec<u8>,
}

/// Handler invoked for each consumed record, one at a time per topic.
pub type BusHandler =
    Arc<dyn Fn(Record) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Error, Debug)]
pub enum BusError {
    /// The producer could not flush within its deadline. No record was
    /// durably accepted; callers must not register correlation state.
    #[error("dispatch timed out before the producer flushed")]
    DispatchTimeout,

    #[error("bus is shut down")]
    Closed,

    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

#[async_trait]
pub trait BusClient: Send + Sync {
    /// Produce one record to `topic`, keyed by `key`. Bounded by the
    /// producer flush deadline.
    async fn dispatch(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Register the consumer for `topic`. At most one consumer per topic
    /// per client; records are handed to `handler` in order.
    async fn subscribe(&self, topic: &str, handler: BusHandler) -> Result<(), BusError>;

    /// Drain the producer and stop all consumers.
    async fn shutdown(&self);
}
