//! Per-IP request rate limiting and WebSocket connection caps.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests per window.
    pub max_requests: u32,
    /// Window duration.
    pub window: Duration,
    /// Maximum WebSocket connections per IP.
    pub max_websocket_per_ip: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window: Duration::from_secs(60),
            max_websocket_per_ip: 10,
        }
    }
}

#[derive(Debug)]
struct RateLimitEntry {
    requests: Vec<Instant>,
    websocket_count: u32,
}

impl RateLimitEntry {
    fn new() -> Self {
        Self {
            requests: Vec::new(),
            websocket_count: 0,
        }
    }

    fn prune(&mut self, window: Duration) {
        let cutoff = Instant::now() - window;
        self.requests.retain(|t| *t > cutoff);
    }
}

/// Sliding-window rate limiter keyed by client IP.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    entries: RwLock<HashMap<IpAddr, RateLimitEntry>>,
    last_cleanup: RwLock<Instant>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            last_cleanup: RwLock::new(Instant::now()),
        }
    }

    /// Whether a request from `ip` is allowed; records it when it is.
    pub fn check_request(&self, ip: IpAddr) -> bool {
        self.maybe_cleanup();

        let mut entries = self.entries.write();
        let entry = entries.entry(ip).or_insert_with(RateLimitEntry::new);
        entry.prune(self.config.window);

        if entry.requests.len() >= self.config.max_requests as usize {
            return false;
        }
        entry.requests.push(Instant::now());
        true
    }

    pub fn acquire_websocket(&self, ip: IpAddr) -> bool {
        let mut entries = self.entries.write();
        let entry = entries.entry(ip).or_insert_with(RateLimitEntry::new);
        if entry.websocket_count >= self.config.max_websocket_per_ip {
            return false;
        }
        entry.websocket_count += 1;
        true
    }

    pub fn release_websocket(&self, ip: IpAddr) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(&ip) {
            entry.websocket_count = entry.websocket_count.saturating_sub(1);
        }
    }

    /// Drop idle entries every five minutes.
    fn maybe_cleanup(&self) {
        const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

        let due = self.last_cleanup.read().elapsed() > CLEANUP_INTERVAL;
        if due {
            let mut entries = self.entries.write();
            let mut last = self.last_cleanup.write();
            if last.elapsed() > CLEANUP_INTERVAL {
                entries.retain(|_, entry| {
                    entry.prune(self.config.window);
                    !entry.requests.is_empty() || entry.websocket_count > 0
                });
                *last = Instant::now();
            }
        }
    }
}

/// RAII guard holding one WebSocket slot for an IP.
pub struct WebSocketGuard {
    limiter: Arc<RateLimiter>,
    ip: IpAddr,
}

impl WebSocketGuard {
    pub fn new(limiter: Arc<RateLimiter>, ip: IpAddr) -> Option<Self> {
        if limiter.acquire_websocket(ip) {
            Some(Self { limiter, ip })
        } else {
            None
        }
    }
}

impl Drop for WebSocketGuard {
    fn drop(&mut self) {
        self.limiter.release_websocket(self.ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn allows_up_to_the_limit() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 3,
            ..Default::default()
        });
        for _ in 0..3 {
            assert!(limiter.check_request(ip(1)));
        }
        assert!(!limiter.check_request(ip(1)));
    }

    #[test]
    fn limits_are_per_ip() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 1,
            ..Default::default()
        });
        assert!(limiter.check_request(ip(1)));
        assert!(!limiter.check_request(ip(1)));
        assert!(limiter.check_request(ip(2)));
    }

    #[test]
    fn websocket_guard_releases_on_drop() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            max_websocket_per_ip: 1,
            ..Default::default()
        }));
        {
            let _guard = WebSocketGuard::new(limiter.clone(), ip(1)).unwrap();
            assert!(WebSocketGuard::new(limiter.clone(), ip(1)).is_none());
        }
        assert!(WebSocketGuard::new(limiter.clone(), ip(1)).is_some());
    }
}
