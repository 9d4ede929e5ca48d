//! In-memory registry of dispatched work awaiting agent responses.
//!
//! Entries are inserted on dispatch and removed exactly once — by the
//! response handler, the timeout sweeper, or session deletion. Whichever
//! path removes the entry owns the resolution; late arrivals find nothing
//! and are dropped, which is what makes response handling idempotent.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CorrelationEntry {
    pub session_id: Uuid,
    pub user_id: String,
    pub intent: String,
    /// The user message that triggered the dispatch; kept for re-answer
    /// fallbacks.
    pub message: String,
    pub response_topic: String,
    pub registered_at: Instant,
    pub soft_deadline: Instant,
    pub hard_deadline: Instant,
    soft_notified: bool,
}

impl CorrelationEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: Uuid,
        user_id: impl Into<String>,
        intent: impl Into<String>,
        message: impl Into<String>,
        response_topic: impl Into<String>,
        soft_deadline: Instant,
        hard_deadline: Instant,
    ) -> Self {
        Self {
            session_id,
            user_id: user_id.into(),
            intent: intent.into(),
            message: message.into(),
            response_topic: response_topic.into(),
            registered_at: Instant::now(),
            soft_deadline,
            hard_deadline,
            soft_notified: false,
        }
    }
}

#[derive(Default)]
pub struct CorrelationRegistry {
    entries: Mutex<HashMap<Uuid, CorrelationEntry>>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, correlation_id: Uuid, entry: CorrelationEntry) {
        self.entries.lock().insert(correlation_id, entry);
    }

    /// Claim the entry for resolution. `None` means the correlation was
    /// never registered, already resolved, or cancelled.
    pub fn take(&self, correlation_id: Uuid) -> Option<CorrelationEntry> {
        self.entries.lock().remove(&correlation_id)
    }

    pub fn cancel(&self, correlation_id: Uuid) -> bool {
        self.entries.lock().remove(&correlation_id).is_some()
    }

    /// Drop every pending correlation for a session; returns the ids so
    /// callers can account for them. Cancelled work produces no push.
    pub fn cancel_by_session(&self, session_id: Uuid) -> Vec<Uuid> {
        let mut entries = self.entries.lock();
        let ids: Vec<Uuid> = entries
            .iter()
            .filter(|(_, e)| e.session_id == session_id)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            entries.remove(id);
        }
        ids
    }

    /// Remove and return entries past their hard deadline.
    pub fn take_expired(&self, now: Instant) -> Vec<(Uuid, CorrelationEntry)> {
        let mut entries = self.entries.lock();
        let expired: Vec<Uuid> = entries
            .iter()
            .filter(|(_, e)| e.hard_deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| entries.remove(&id).map(|e| (id, e)))
            .collect()
    }

    /// Sessions whose work just crossed the soft deadline; each entry
    /// reports at most once.
    pub fn take_soft_expired(&self, now: Instant) -> Vec<(Uuid, Uuid)> {
        let mut entries = self.entries.lock();
        entries
            .iter_mut()
            .filter(|(_, e)| !e.soft_notified && e.soft_deadline <= now && e.hard_deadline > now)
            .map(|(id, e)| {
                e.soft_notified = true;
                (*id, e.session_id)
            })
            .collect()
    }

    pub fn contains(&self, correlation_id: Uuid) -> bool {
        self.entries.lock().contains_key(&correlation_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(session_id: Uuid, hard_in: Duration) -> CorrelationEntry {
        let now = Instant::now();
        CorrelationEntry::new(
            session_id,
            "u1",
            "appointment_booking",
            "book me",
            "appointment-agent-responses",
            now + hard_in / 2,
            now + hard_in,
        )
    }

    #[test]
    fn take_resolves_exactly_once() {
        let registry = CorrelationRegistry::new();
        let id = Uuid::new_v4();
        registry.register(id, entry(Uuid::new_v4(), Duration::from_secs(30)));

        assert!(registry.take(id).is_some());
        // Second delivery for the same correlation finds nothing.
        assert!(registry.take(id).is_none());
    }

    #[test]
    fn cancel_by_session_only_touches_that_session() {
        let registry = CorrelationRegistry::new();
        let session_a = Uuid::new_v4();
        let session_b = Uuid::new_v4();
        let id_a1 = Uuid::new_v4();
        let id_a2 = Uuid::new_v4();
        let id_b = Uuid::new_v4();
        registry.register(id_a1, entry(session_a, Duration::from_secs(30)));
        registry.register(id_a2, entry(session_a, Duration::from_secs(30)));
        registry.register(id_b, entry(session_b, Duration::from_secs(30)));

        let cancelled = registry.cancel_by_session(session_a);
        assert_eq!(cancelled.len(), 2);
        assert!(!registry.contains(id_a1));
        assert!(!registry.contains(id_a2));
        assert!(registry.contains(id_b));
    }

    #[test]
    fn expired_entries_are_removed_on_take() {
        let registry = CorrelationRegistry::new();
        let fresh = Uuid::new_v4();
        let stale = Uuid::new_v4();
        let now = Instant::now();

        registry.register(fresh, entry(Uuid::new_v4(), Duration::from_secs(30)));
        let mut old = entry(Uuid::new_v4(), Duration::from_secs(30));
        old.hard_deadline = now - Duration::from_millis(1);
        registry.register(stale, old);

        let expired = registry.take_expired(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, stale);
        assert!(registry.contains(fresh));
        // A later real response for the timed-out entry is a no-op.
        assert!(registry.take(stale).is_none());
    }

    #[test]
    fn soft_expiry_reports_once() {
        let registry = CorrelationRegistry::new();
        let id = Uuid::new_v4();
        let session_id = Uuid::new_v4();
        let now = Instant::now();
        let mut e = entry(session_id, Duration::from_secs(30));
        e.soft_deadline = now - Duration::from_millis(1);
        registry.register(id, e);

        let first = registry.take_soft_expired(now);
        assert_eq!(first, vec![(id, session_id)]);
        assert!(registry.take_soft_expired(now).is_empty());
        // Entry itself is still pending.
        assert!(registry.contains(id));
    }

    #[test]
    fn hard_expired_entry_never_soft_notifies() {
        let registry = CorrelationRegistry::new();
        let id = Uuid::new_v4();
        let now = Instant::now();
        let mut e = entry(Uuid::new_v4(), Duration::from_secs(30));
        e.soft_deadline = now - Duration::from_secs(2);
        e.hard_deadline = now - Duration::from_secs(1);
        registry.register(id, e);

        assert!(registry.take_soft_expired(now).is_empty());
        assert_eq!(registry.take_expired(now).len(), 1);
    }
}
