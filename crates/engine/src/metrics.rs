//! Service counters exposed on the admin surface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

/// Upper bounds (ms) of the response-time histogram buckets.
const LATENCY_BOUNDS_MS: [u64; 12] = [
    1, 2, 5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000,
];

#[derive(Default)]
struct LatencyHistogram {
    /// One count per bound, plus an overflow bucket.
    counts: [u64; LATENCY_BOUNDS_MS.len() + 1],
    total: u64,
}

impl LatencyHistogram {
    fn observe(&mut self, millis: u64) {
        let idx = LATENCY_BOUNDS_MS
            .iter()
            .position(|bound| millis <= *bound)
            .unwrap_or(LATENCY_BOUNDS_MS.len());
        self.counts[idx] += 1;
        self.total += 1;
    }

    /// Approximate percentile: the upper bound of the bucket holding the
    /// p-th observation.
    fn percentile(&self, p: f64) -> u64 {
        if self.total == 0 {
            return 0;
        }
        let target = ((self.total as f64) * p).ceil() as u64;
        let mut seen = 0;
        for (idx, count) in self.counts.iter().enumerate() {
            seen += count;
            if seen >= target {
                return LATENCY_BOUNDS_MS
                    .get(idx)
                    .copied()
                    .unwrap_or(u64::MAX);
            }
        }
        u64::MAX
    }
}

#[derive(Default)]
pub struct Metrics {
    total_messages: AtomicU64,
    total_errors: AtomicU64,
    llm_fallback_used: AtomicU64,
    dispatch_timeouts: AtomicU64,
    agent_timeouts: AtomicU64,
    duplicate_responses: AtomicU64,
    protocol_errors: AtomicU64,
    intents: Mutex<HashMap<String, u64>>,
    latency: Mutex<LatencyHistogram>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_message(&self) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_llm_fallback(&self) {
        self.llm_fallback_used.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch_timeout(&self) {
        self.dispatch_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_agent_timeout(&self) {
        self.agent_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate_response(&self) {
        self.duplicate_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_intent(&self, intent: &str) {
        *self.intents.lock().entry(intent.to_string()).or_insert(0) += 1;
    }

    pub fn observe_response_time(&self, millis: u64) {
        self.latency.lock().observe(millis);
    }

    pub fn snapshot(
        &self,
        active_sessions: usize,
        push_connections: usize,
        dropped_pushes: u64,
        provider_timeouts: u64,
        llm_provider: Option<String>,
        fallback_provider: Option<String>,
    ) -> MetricsSnapshot {
        let total_messages = self.total_messages.load(Ordering::Relaxed);
        let total_errors = self.total_errors.load(Ordering::Relaxed);
        let error_rate = if total_messages == 0 {
            0.0
        } else {
            total_errors as f64 / total_messages as f64
        };

        let latency = self.latency.lock();
        MetricsSnapshot {
            active_sessions,
            push_connections,
            total_messages,
            total_errors,
            error_rate,
            response_time_ms: ResponseTimes {
                p50: latency.percentile(0.50),
                p95: latency.percentile(0.95),
                p99: latency.percentile(0.99),
            },
            intent_distribution: self.intents.lock().clone(),
            provider_timeouts,
            llm_fallback_used: self.llm_fallback_used.load(Ordering::Relaxed),
            dispatch_timeouts: self.dispatch_timeouts.load(Ordering::Relaxed),
            agent_timeouts: self.agent_timeouts.load(Ordering::Relaxed),
            duplicate_responses: self.duplicate_responses.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            dropped_pushes,
            llm_provider,
            fallback_provider,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseTimes {
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub active_sessions: usize,
    pub push_connections: usize,
    pub total_messages: u64,
    pub total_errors: u64,
    pub error_rate: f64,
    pub response_time_ms: ResponseTimes,
    pub intent_distribution: HashMap<String, u64>,
    pub provider_timeouts: u64,
    pub llm_fallback_used: u64,
    pub dispatch_timeouts: u64,
    pub agent_timeouts: u64,
    pub duplicate_responses: u64,
    pub protocol_errors: u64,
    pub dropped_pushes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_provider: Option<String>,
}
