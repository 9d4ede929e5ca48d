//! In-memory broker implementing the bus contract.
//!
//! Each topic is a bounded channel with a single consumer task, which
//! gives the same observable behavior as one consumer per partition:
//! records are processed sequentially and in production order. A full
//! queue exerts backpressure on `dispatch` up to the flush deadline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::client::{BusClient, BusError, BusHandler, Record};

pub const DEFAULT_QUEUE_DEPTH: usize = 256;
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(2);

struct TopicState {
    tx: mpsc::Sender<Record>,
    /// Held until a consumer subscribes; dispatches meanwhile buffer in
    /// the channel.
    rx: Option<mpsc::Receiver<Record>>,
}

pub struct MemoryBus {
    queue_depth: usize,
    dispatch_timeout: Duration,
    topics: Mutex<HashMap<String, TopicState>>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_settings(DEFAULT_QUEUE_DEPTH, DEFAULT_DISPATCH_TIMEOUT)
    }

    pub fn with_settings(queue_depth: usize, dispatch_timeout: Duration) -> Self {
        Self {
            queue_depth,
            dispatch_timeout,
            topics: Mutex::new(HashMap::new()),
            consumers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn sender_for(&self, topic: &str) -> mpsc::Sender<Record> {
        let mut topics = self.topics.lock();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.queue_depth);
                TopicState { tx, rx: Some(rx) }
            })
            .tx
            .clone()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusClient for MemoryBus {
    async fn dispatch(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }

        let tx = self.sender_for(topic);
        let record = Record {
            key: key.to_string(),
            payload,
        };
        debug!(topic, key, "producing record");
        tx.send_timeout(record, self.dispatch_timeout)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => BusError::DispatchTimeout,
                mpsc::error::SendTimeoutError::Closed(_) => BusError::Closed,
            })
    }

    async fn subscribe(&self, topic: &str, handler: BusHandler) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }

        let mut rx = {
            let mut topics = self.topics.lock();
            let state = topics.entry(topic.to_string()).or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.queue_depth);
                TopicState { tx, rx: Some(rx) }
            });
            state
                .rx
                .take()
                .ok_or_else(|| BusError::Subscribe(format!("already subscribed to {topic}")))?
        };

        let topic_name = topic.to_string();
        let task = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                handler(record).await;
            }
            debug!(topic = %topic_name, "consumer drained");
        });
        self.consumers.lock().push(task);
        info!(topic, "subscribed consumer");
        Ok(())
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping senders lets consumer tasks drain what is queued and exit.
        self.topics.lock().clear();
        let tasks: Vec<JoinHandle<()>> = self.consumers.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("bus shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex as AsyncMutex;

    fn collecting_handler() -> (BusHandler, Arc<AsyncMutex<Vec<String>>>) {
        let seen = Arc::new(AsyncMutex::new(Vec::new()));
        let seen_in_handler = Arc::clone(&seen);
        let handler: BusHandler = Arc::new(move |record: Record| {
            let seen = Arc::clone(&seen_in_handler);
            Box::pin(async move {
                seen.lock()
                    .await
                    .push(String::from_utf8(record.payload).unwrap());
            })
        });
        (handler, seen)
    }

    #[tokio::test]
    async fn records_arrive_in_production_order() {
        let bus = MemoryBus::new();
        let (handler, seen) = collecting_handler();
        bus.subscribe("appointment-agent-requests", handler)
            .await
            .unwrap();

        for i in 0..10 {
            bus.dispatch("appointment-agent-requests", "s1", format!("m{i}").into_bytes())
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = seen.lock().await;
        let expected: Vec<String> = (0..10).map(|i| format!("m{i}")).collect();
        assert_eq!(*seen, expected);
    }

    #[tokio::test]
    async fn dispatch_before_subscribe_buffers() {
        let bus = MemoryBus::new();
        bus.dispatch("general-info-responses", "s1", b"early".to_vec())
            .await
            .unwrap();

        let (handler, seen) = collecting_handler();
        bus.subscribe("general-info-responses", handler).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().await, vec!["early".to_string()]);
    }

    #[tokio::test]
    async fn full_queue_times_out_dispatch() {
        let bus = MemoryBus::with_settings(1, Duration::from_millis(50));
        bus.dispatch("t", "k", b"first".to_vec()).await.unwrap();

        // No consumer; the single-slot queue is full.
        let err = bus.dispatch("t", "k", b"second".to_vec()).await.unwrap_err();
        assert!(matches!(err, BusError::DispatchTimeout));
    }

    #[tokio::test]
    async fn double_subscribe_is_rejected() {
        let bus = MemoryBus::new();
        let (handler, _) = collecting_handler();
        bus.subscribe("t", handler.clone()).await.unwrap();
        let err = bus.subscribe("t", handler).await.unwrap_err();
        assert!(matches!(err, BusError::Subscribe(_)));
    }

    #[tokio::test]
    async fn shutdown_rejects_further_dispatch() {
        let bus = MemoryBus::new();
        let (handler, seen) = collecting_handler();
        bus.subscribe("t", handler).await.unwrap();
        bus.dispatch("t", "k", b"last".to_vec()).await.unwrap();
        bus.shutdown().await;

        // Queued record drained before shutdown completed.
        assert_eq!(*seen.lock().await, vec!["last".to_string()]);
        assert!(matches!(
            bus.dispatch("t", "k", b"late".to_vec()).await.unwrap_err(),
            BusError::Closed
        ));
    }
}
