//! Ordered provider registry with failover, circuit breaking, and
//! per-provider request budgets.
//!
//! Providers are tried in configuration order: primary first, then each
//! fallback. Soft failures (timeout, rate limit, unavailable) move on to
//! the next provider; a rate-limited provider is additionally
//! circuit-broken for a cool-off period so a degrading backend is not
//! hammered. `BadInput` is hard and returns immediately.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::client::{GenerateRequest, GenerateResponse, LlmProvider, ProviderError};

pub const DEFAULT_COOL_OFF: Duration = Duration::from_secs(30);
pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 60;

const BUDGET_WINDOW: Duration = Duration::from_secs(60);

/// A successful generation plus which provider in the chain produced it.
#[derive(Debug, Clone)]
pub struct GenerateOutcome {
    pub response: GenerateResponse,
    /// 0 = primary, 1 = first fallback, and so on.
    pub provider_rank: usize,
}

impl GenerateOutcome {
    pub fn used_fallback(&self) -> bool {
        self.provider_rank > 0
    }
}

struct ProviderState {
    /// Request timestamps inside the sliding budget window.
    window: Vec<Instant>,
    /// Circuit-broken until this instant, if tripped.
    open_until: Option<Instant>,
}

impl ProviderState {
    fn new() -> Self {
        Self {
            window: Vec::new(),
            open_until: None,
        }
    }

    fn is_open(&mut self, now: Instant) -> bool {
        match self.open_until {
            Some(until) if until > now => true,
            Some(_) => {
                self.open_until = None;
                false
            }
            None => false,
        }
    }

    fn try_acquire(&mut self, now: Instant, budget: u32) -> bool {
        let cutoff = now - BUDGET_WINDOW;
        self.window.retain(|t| *t > cutoff);
        if self.window.len() >= budget as usize {
            return false;
        }
        self.window.push(now);
        true
    }
}

/// Configuration-ordered set of LLM providers.
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn LlmProvider>>,
    states: Mutex<Vec<ProviderState>>,
    cool_off: Duration,
    requests_per_minute: u32,
    timeouts: AtomicU64,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<Arc<dyn LlmProvider>>) -> Self {
        let states = providers.iter().map(|_| ProviderState::new()).collect();
        Self {
            providers,
            states: Mutex::new(states),
            cool_off: DEFAULT_COOL_OFF,
            requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
            timeouts: AtomicU64::new(0),
        }
    }

    /// Total provider timeouts observed across the chain.
    pub fn timeout_count(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn with_cool_off(mut self, cool_off: Duration) -> Self {
        self.cool_off = cool_off;
        self
    }

    pub fn with_requests_per_minute(mut self, requests_per_minute: u32) -> Self {
        self.requests_per_minute = requests_per_minute;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn primary_name(&self) -> Option<String> {
        self.providers.first().map(|p| p.name().to_string())
    }

    pub fn fallback_name(&self) -> Option<String> {
        self.providers.get(1).map(|p| p.name().to_string())
    }

    /// Whether the provider at `rank` may be called right now; consumes a
    /// budget slot when it may.
    fn admit(&self, rank: usize) -> Result<(), ProviderError> {
        let now = Instant::now();
        let mut states = self.states.lock();
        let state = &mut states[rank];
        if state.is_open(now) {
            return Err(ProviderError::Unavailable("circuit open".to_string()));
        }
        if !state.try_acquire(now, self.requests_per_minute) {
            return Err(ProviderError::RateLimited);
        }
        Ok(())
    }

    fn trip(&self, rank: usize) {
        let mut states = self.states.lock();
        states[rank].open_until = Some(Instant::now() + self.cool_off);
    }

    /// Generate through the failover chain.
    pub async fn generate(
        &self,
        request: GenerateRequest,
    ) -> Result<GenerateOutcome, ProviderError> {
        self.generate_from(0, request).await
    }

    /// Generate starting at `start_rank` in the chain. Callers that judge
    /// a provider's output unusable (rather than erroring) resume from the
    /// next rank.
    pub async fn generate_from(
        &self,
        start_rank: usize,
        request: GenerateRequest,
    ) -> Result<GenerateOutcome, ProviderError> {
        let mut last_soft: Option<ProviderError> = None;

        for (rank, provider) in self.providers.iter().enumerate().skip(start_rank) {
            if let Err(e) = self.admit(rank) {
                debug!(provider = provider.name(), rank, error = %e, "skipping provider");
                last_soft = Some(e);
                continue;
            }

            match provider.generate(request.clone()).await {
                Ok(response) => {
                    return Ok(GenerateOutcome {
                        response,
                        provider_rank: rank,
                    });
                }
                Err(ProviderError::BadInput(msg)) => {
                    return Err(ProviderError::BadInput(msg));
                }
                Err(e) => {
                    if e == ProviderError::RateLimited {
                        self.trip(rank);
                    }
                    if e == ProviderError::Timeout {
                        self.timeouts.fetch_add(1, Ordering::Relaxed);
                    }
                    warn!(
                        provider = provider.name(),
                        rank,
                        error = %e,
                        "provider failed, trying next"
                    );
                    last_soft = Some(e);
                }
            }
        }

        Err(last_soft
            .unwrap_or_else(|| ProviderError::Unavailable("no providers configured".to_string())))
    }

    /// Probe every provider; returns (name, healthy) pairs.
    pub async fn health(&self) -> Vec<(String, bool)> {
        let mut results = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            results.push((provider.name().to_string(), provider.health().await));
        }
        results
    }
}
