//! In-memory coordination store for tests
//!
//! Implements session-keyed acquire with the same exclusivity rule Consul
//! enforces: a key held by a live session can only be re-acquired by that
//! session. Invalidating a session quarantines its keys for the session's
//! lock-delay, measured on tokio's clock so paused-time tests can step it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use super::{CoordinationError, CoordinationStore, SessionInfo, SessionRequest};

#[derive(Debug, Clone)]
struct KvEntry {
    value: Vec<u8>,
    session: Option<String>,
    /// Acquires are refused until then
    quarantined_until: Option<Instant>,
}

#[derive(Debug, Default)]
pub(crate) struct MemoryStore {
    sessions: Mutex<HashMap<String, SessionInfo>>,
    lock_delays: Mutex<HashMap<String, Duration>>,
    kv: Mutex<BTreeMap<String, KvEntry>>,
    failing_keys: Mutex<HashSet<String>>,
    acquire_calls: AtomicUsize,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Store a raw value without any session
    pub(crate) fn put(&self, key: &str, value: impl Into<Vec<u8>>) {
        self.kv.lock().unwrap().insert(
            key.to_string(),
            KvEntry {
                value: value.into(),
                session: None,
                quarantined_until: None,
            },
        );
    }

    /// Make reads of `key` fail with a transport error
    pub(crate) fn fail_reads_of(&self, key: &str) {
        self.failing_keys.lock().unwrap().insert(key.to_string());
    }

    /// Session currently holding `key`
    pub(crate) fn holder(&self, key: &str) -> Option<String> {
        self.kv.lock().unwrap().get(key).and_then(|e| e.session.clone())
    }

    pub(crate) fn value(&self, key: &str) -> Option<Vec<u8>> {
        self.kv.lock().unwrap().get(key).map(|e| e.value.clone())
    }

    pub(crate) fn acquire_calls(&self) -> usize {
        self.acquire_calls.load(Ordering::SeqCst)
    }

    /// Simulate lease expiry: drop the session and quarantine its locks
    pub(crate) fn expire_session(&self, session_id: &str) {
        self.sessions.lock().unwrap().remove(session_id);
        let lock_delay = self
            .lock_delays
            .lock()
            .unwrap()
            .remove(session_id)
            .unwrap_or_default();

        let until = Instant::now() + lock_delay;
        for entry in self.kv.lock().unwrap().values_mut() {
            if entry.session.as_deref() == Some(session_id) {
                entry.session = None;
                entry.quarantined_until = Some(until);
            }
        }
    }

    pub(crate) fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn create_session(&self, request: &SessionRequest) -> Result<String, CoordinationError> {
        let id = Uuid::new_v4().to_string();
        self.sessions.lock().unwrap().insert(
            id.clone(),
            SessionInfo {
                id: id.clone(),
                name: request.name.clone(),
                node: request.node.clone(),
                create_index: 1,
                modify_index: 1,
            },
        );
        self.lock_delays
            .lock()
            .unwrap()
            .insert(id.clone(), Duration::from_secs(request.lock_delay_seconds));
        Ok(id)
    }

    async fn renew_session(&self, session_id: &str) -> Result<SessionInfo, CoordinationError> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .ok_or_else(|| CoordinationError::SessionInvalid(session_id.to_string()))
    }

    async fn destroy_session(&self, session_id: &str) -> Result<(), CoordinationError> {
        self.expire_session(session_id);
        Ok(())
    }

    async fn node_sessions(&self, node: &str) -> Result<Vec<SessionInfo>, CoordinationError> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.node == node)
            .cloned()
            .collect())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, CoordinationError> {
        Ok(self
            .kv
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn get_value(&self, key: &str) -> Result<Option<Vec<u8>>, CoordinationError> {
        if self.failing_keys.lock().unwrap().contains(key) {
            return Err(CoordinationError::Transport(format!("read of {} refused", key)));
        }
        Ok(self.value(key))
    }

    async fn acquire(
        &self,
        key: &str,
        value: &[u8],
        session_id: &str,
    ) -> Result<bool, CoordinationError> {
        self.acquire_calls.fetch_add(1, Ordering::SeqCst);

        if !self.sessions.lock().unwrap().contains_key(session_id) {
            return Err(CoordinationError::SessionInvalid(session_id.to_string()));
        }

        let mut kv = self.kv.lock().unwrap();
        match kv.get_mut(key) {
            Some(entry) => {
                if entry.quarantined_until.map(|t| Instant::now() < t).unwrap_or(false) {
                    return Ok(false);
                }
                match entry.session.as_deref() {
                    Some(holder) if holder != session_id => Ok(false),
                    _ => {
                        entry.value = value.to_vec();
                        entry.session = Some(session_id.to_string());
                        entry.quarantined_until = None;
                        Ok(true)
                    }
                }
            }
            None => {
                kv.insert(
                    key.to_string(),
                    KvEntry {
                        value: value.to_vec(),
                        session: Some(session_id.to_string()),
                        quarantined_until: None,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, session_id: &str) -> Result<bool, CoordinationError> {
        let mut kv = self.kv.lock().unwrap();
        match kv.get_mut(key) {
            Some(entry) if entry.session.as_deref() == Some(session_id) => {
                entry.session = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(node: &str) -> SessionRequest {
        SessionRequest {
            name: "Raftainer Host".to_string(),
            node: node.to_string(),
            ttl_seconds: 10,
            lock_delay_seconds: 10,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_locks_are_quarantined_for_lock_delay() {
        let store = MemoryStore::new();
        let old = store.create_session(&request("host-a")).await.unwrap();
        let new = store.create_session(&request("host-b")).await.unwrap();

        assert!(store.acquire("k", b"a", &old).await.unwrap());
        store.expire_session(&old);

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(!store.acquire("k", b"b", &new).await.unwrap());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(store.acquire("k", b"b", &new).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_frees_key_without_quarantine() {
        let store = MemoryStore::new();
        let a = store.create_session(&request("host-a")).await.unwrap();
        let b = store.create_session(&request("host-b")).await.unwrap();

        assert!(store.acquire("k", b"a", &a).await.unwrap());
        assert!(!store.release("k", &b).await.unwrap());
        assert!(store.release("k", &a).await.unwrap());
        assert!(store.acquire("k", b"b", &b).await.unwrap());
    }
}
