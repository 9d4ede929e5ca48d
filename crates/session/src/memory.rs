//! In-memory session store with per-entry TTL and versioned writes.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use carelink_common::{ConversationMessage, MessageStatus, PendingTask, Session};
use chrono::Utc;
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::store::{SessionStore, StoreError, StoreResult};

const APPEND_ATTEMPTS: u32 = 3;

struct Versioned {
    version: u64,
    session: Session,
    expires_at: Instant,
}

/// Process-local [`SessionStore`] implementation.
///
/// Entries are evicted lazily: an expired session is invisible to reads
/// and removed the next time it is touched.
pub struct MemoryStore {
    ttl: Duration,
    max_history: usize,
    sessions: RwLock<HashMap<Uuid, Versioned>>,
    user_index: RwLock<HashMap<String, HashSet<Uuid>>>,
}

impl MemoryStore {
    pub fn new(ttl: Duration, max_history: usize) -> Self {
        Self {
            ttl,
            max_history,
            sessions: RwLock::new(HashMap::new()),
            user_index: RwLock::new(HashMap::new()),
        }
    }

    fn unindex(&self, user_id: &str, session_id: Uuid) {
        let mut index = self.user_index.write();
        if let Some(ids) = index.get_mut(user_id) {
            ids.remove(&session_id);
            if ids.is_empty() {
                index.remove(user_id);
            }
        }
    }

    /// Snapshot the live entry, evicting it if expired.
    fn snapshot(&self, session_id: Uuid) -> Option<(u64, Session)> {
        let expired_owner = {
            let sessions = self.sessions.read();
            let entry = sessions.get(&session_id)?;
            if entry.expires_at <= Instant::now() {
                Some(entry.session.user_id.clone())
            } else {
                return Some((entry.version, entry.session.clone()));
            }
        };
        if let Some(user_id) = expired_owner {
            debug!(%session_id, "evicting expired session");
            self.sessions.write().remove(&session_id);
            self.unindex(&user_id, session_id);
        }
        None
    }

    /// Read-modify-write with version compare, retried on lost races.
    /// No lock is held across the backoff await.
    async fn mutate<F>(&self, session_id: Uuid, mut apply: F) -> StoreResult<bool>
    where
        F: FnMut(&mut Session) -> bool + Send,
    {
        for attempt in 0..APPEND_ATTEMPTS {
            let (version, mut session) = self
                .snapshot(session_id)
                .ok_or(StoreError::Missing(session_id))?;

            let outcome = apply(&mut session);

            {
                let mut sessions = self.sessions.write();
                match sessions.get_mut(&session_id) {
                    Some(entry) if entry.version == version => {
                        entry.version += 1;
                        entry.session = session;
                        entry.expires_at = Instant::now() + self.ttl;
                        return Ok(outcome);
                    }
                    Some(_) => {}
                    None => return Err(StoreError::Missing(session_id)),
                }
            }
            debug!(%session_id, attempt, "session write raced, retrying");
            tokio::time::sleep(conflict_backoff(attempt)).await;
        }
        Err(StoreError::Conflict(format!(
            "session {session_id} kept racing after {APPEND_ATTEMPTS} attempts"
        )))
    }
}

/// Roughly 10 ms of deterministic jitter between conflict retries.
fn conflict_backoff(attempt: u32) -> Duration {
    let spread = attempt.wrapping_add(1).wrapping_mul(2654435761) % 10;
    Duration::from_millis(5 + spread as u64)
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get(&self, session_id: Uuid) -> StoreResult<Option<Session>> {
        Ok(self.snapshot(session_id).map(|(_, session)| session))
    }

    async fn put(&self, session: Session) -> StoreResult<()> {
        let session_id = session.session_id;
        let user_id = session.user_id.clone();

        let mut sessions = self.sessions.write();
        let entry = sessions.entry(session_id).or_insert_with(|| Versioned {
            version: 0,
            session: session.clone(),
            expires_at: Instant::now() + self.ttl,
        });
        entry.version += 1;
        entry.session = session;
        entry.expires_at = Instant::now() + self.ttl;
        drop(sessions);

        self.user_index
            .write()
            .entry(user_id)
            .or_default()
            .insert(session_id);
        Ok(())
    }

    async fn delete(&self, session_id: Uuid) -> StoreResult<()> {
        let removed = self.sessions.write().remove(&session_id);
        if let Some(entry) = removed {
            self.unindex(&entry.session.user_id, session_id);
        }
        Ok(())
    }

    async fn list_by_user(&self, user_id: &str) -> StoreResult<Vec<Uuid>> {
        let ids: Vec<Uuid> = self
            .user_index
            .read()
            .get(user_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        // Filter through snapshot so expired sessions drop out.
        Ok(ids
            .into_iter()
            .filter(|id| self.snapshot(*id).is_some())
            .collect())
    }

    async fn append_messages(
        &self,
        session_id: Uuid,
        messages: Vec<ConversationMessage>,
    ) -> StoreResult<()> {
        let max_history = self.max_history;
        self.mutate(session_id, |session| {
            for message in messages.clone() {
                session.push_message(message, max_history);
            }
            true
        })
        .await
        .map(|_| ())
    }

    async fn append_with_task(
        &self,
        session_id: Uuid,
        messages: Vec<ConversationMessage>,
        task: PendingTask,
        intent: &str,
    ) -> StoreResult<()> {
        let max_history = self.max_history;
        self.mutate(session_id, |session| {
            for message in messages.clone() {
                session.push_message(message, max_history);
            }
            session.pending_tasks.push(task.clone());
            session.current_intent = Some(intent.to_string());
            true
        })
        .await
        .map(|_| ())
    }

    async fn update_by_correlation(
        &self,
        session_id: Uuid,
        correlation_id: Uuid,
        content: &str,
        status: MessageStatus,
        intent: Option<&str>,
    ) -> StoreResult<bool> {
        self.mutate(session_id, |session| {
            let found = match session.find_by_correlation_mut(correlation_id) {
                Some(message) => {
                    message.content = content.to_string();
                    message.timestamp = Utc::now();
                    message.metadata.status = Some(status);
                    if let Some(intent) = intent {
                        message.metadata.intent = Some(intent.to_string());
                    }
                    true
                }
                None => false,
            };
            session.remove_pending_task(correlation_id);
            session.touch();
            found
        })
        .await
    }

    async fn count(&self) -> StoreResult<usize> {
        let now = Instant::now();
        Ok(self
            .sessions
            .read()
            .values()
            .filter(|e| e.expires_at > now)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carelink_common::UserContext;

    fn store() -> MemoryStore {
        MemoryStore::new(Duration::from_secs(3600), 50)
    }

    fn new_session(store: &MemoryStore, user_id: &str) -> Session {
        let session = Session::new(Uuid::new_v4(), user_id, UserContext::default());
        futures_block(store.put(session.clone())).unwrap();
        session
    }

    // Small helper to keep tests synchronous-looking.
    fn futures_block<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap()
            .block_on(f)
    }

    #[test]
    fn get_returns_what_put_stored() {
        let store = store();
        let session = new_session(&store, "u1");
        let loaded = futures_block(store.get(session.session_id)).unwrap().unwrap();
        assert_eq!(loaded.session_id, session.session_id);
        assert_eq!(loaded.user_id, "u1");
    }

    #[test]
    fn expired_session_is_absent() {
        let store = MemoryStore::new(Duration::from_millis(10), 50);
        let session = new_session(&store, "u1");
        std::thread::sleep(Duration::from_millis(30));
        assert!(futures_block(store.get(session.session_id))
            .unwrap()
            .is_none());
        assert_eq!(futures_block(store.count()).unwrap(), 0);
    }

    #[test]
    fn append_resets_ttl() {
        let store = MemoryStore::new(Duration::from_millis(80), 50);
        let session = new_session(&store, "u1");
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(40));
            futures_block(
                store.append_message(session.session_id, ConversationMessage::user("ping")),
            )
            .unwrap();
        }
        // Without TTL resets the session would have expired by now.
        assert!(futures_block(store.get(session.session_id))
            .unwrap()
            .is_some());
    }

    #[test]
    fn append_truncates_to_max_history() {
        let store = MemoryStore::new(Duration::from_secs(3600), 50);
        let session = new_session(&store, "u1");
        for i in 0..55 {
            futures_block(store.append_message(
                session.session_id,
                ConversationMessage::user(format!("m{i}")),
            ))
            .unwrap();
        }
        let loaded = futures_block(store.get(session.session_id)).unwrap().unwrap();
        assert_eq!(loaded.conversation_history.len(), 50);
        // Greeting plus the earliest messages fell off the head.
        assert_eq!(loaded.conversation_history[0].content, "m5");
        assert_eq!(loaded.conversation_history[49].content, "m54");
    }

    #[test]
    fn append_to_missing_session_fails() {
        let store = store();
        let err = futures_block(
            store.append_message(Uuid::new_v4(), ConversationMessage::user("hi")),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::Missing(_)));
    }

    #[test]
    fn update_by_correlation_completes_the_pending_message() {
        let store = store();
        let session = new_session(&store, "u1");
        let correlation_id = Uuid::new_v4();
        futures_block(store.append_messages(
            session.session_id,
            vec![
                ConversationMessage::user("book me"),
                ConversationMessage::pending_assistant("Working on it...", correlation_id),
            ],
        ))
        .unwrap();

        let found = futures_block(store.update_by_correlation(
            session.session_id,
            correlation_id,
            "Slot reserved for 10:00 AM",
            MessageStatus::Completed,
            Some("appointment_booking"),
        ))
        .unwrap();
        assert!(found);

        let loaded = futures_block(store.get(session.session_id)).unwrap().unwrap();
        let message = loaded
            .conversation_history
            .iter()
            .find(|m| m.metadata.correlation_id == Some(correlation_id))
            .unwrap();
        assert_eq!(message.content, "Slot reserved for 10:00 AM");
        assert_eq!(message.metadata.status, Some(MessageStatus::Completed));
        assert_eq!(message.metadata.intent.as_deref(), Some("appointment_booking"));
    }

    #[test]
    fn append_with_task_records_dispatch_state() {
        let store = store();
        let session = new_session(&store, "u1");
        let correlation_id = Uuid::new_v4();
        let now = chrono::Utc::now();
        futures_block(store.append_with_task(
            session.session_id,
            vec![
                ConversationMessage::user("book me"),
                ConversationMessage::pending_assistant("Working on it...", correlation_id),
            ],
            PendingTask {
                task_id: correlation_id,
                task_type: "appointment_booking".into(),
                status: carelink_common::PendingTaskStatus::Pending,
                created_at: now,
                deadline: now + chrono::Duration::seconds(30),
            },
            "appointment_booking",
        ))
        .unwrap();

        let loaded = futures_block(store.get(session.session_id)).unwrap().unwrap();
        assert_eq!(loaded.pending_tasks.len(), 1);
        assert_eq!(loaded.pending_tasks[0].task_id, correlation_id);
        assert_eq!(loaded.current_intent.as_deref(), Some("appointment_booking"));
        assert_eq!(loaded.conversation_history.len(), 3);

        // Completion clears the pending task again.
        futures_block(store.update_by_correlation(
            session.session_id,
            correlation_id,
            "done",
            MessageStatus::Completed,
            None,
        ))
        .unwrap();
        let loaded = futures_block(store.get(session.session_id)).unwrap().unwrap();
        assert!(loaded.pending_tasks.is_empty());
    }

    #[test]
    fn update_by_correlation_reports_missing_message() {
        let store = store();
        let session = new_session(&store, "u1");
        let found = futures_block(store.update_by_correlation(
            session.session_id,
            Uuid::new_v4(),
            "late",
            MessageStatus::Completed,
            None,
        ))
        .unwrap();
        assert!(!found);
    }

    #[test]
    fn delete_then_get_is_none() {
        let store = store();
        let session = new_session(&store, "u1");
        futures_block(store.delete(session.session_id)).unwrap();
        assert!(futures_block(store.get(session.session_id))
            .unwrap()
            .is_none());
        assert!(futures_block(store.list_by_user("u1")).unwrap().is_empty());
    }

    #[test]
    fn list_by_user_tracks_ownership() {
        let store = store();
        let a = new_session(&store, "alice");
        let b = new_session(&store, "alice");
        let _c = new_session(&store, "bob");

        let mut ids = futures_block(store.list_by_user("alice")).unwrap();
        ids.sort();
        let mut expected = vec![a.session_id, b.session_id];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[test]
    fn concurrent_appends_preserve_both_messages() {
        let store = std::sync::Arc::new(store());
        let session = new_session(&store, "u1");
        let id = session.session_id;

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || {
                    futures_block(
                        store.append_message(id, ConversationMessage::user(format!("t{i}"))),
                    )
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        let loaded = futures_block(store.get(id)).unwrap().unwrap();
        // Greeting + 8 appended messages, none lost to races.
        assert_eq!(loaded.conversation_history.len(), 9);
    }
}
