//! Shared application state for the API server.

use std::sync::Arc;
use std::time::Instant;

use carelink_engine::ConversationEngine;

use crate::rate_limit::{RateLimitConfig, RateLimiter};

pub struct AppState {
    pub engine: Arc<ConversationEngine>,
    pub rate_limiter: Arc<RateLimiter>,
    pub start_time: Instant,
    pub service_name: String,
}

impl AppState {
    pub fn new(engine: Arc<ConversationEngine>, service_name: impl Into<String>) -> Self {
        Self {
            engine,
            rate_limiter: Arc::new(RateLimiter::new(RateLimitConfig::default())),
            start_time: Instant::now(),
            service_name: service_name.into(),
        }
    }

    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limiter = Arc::new(RateLimiter::new(config));
        self
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
