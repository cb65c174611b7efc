//! Pod slot locking
//!
//! A pod with `maxInstances = M` has slots `0..M`, each a key under
//! `<podKey>/hosts/<slot>/.lock`. Slots are tried lowest index first and the
//! first one this host's session acquires is its claim on the pod.
//!
//! A host holds at most one slot per pod: when a lower slot frees up and the
//! host moves into it, the slot it held before is released.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{CoordinationError, CoordinationStore};
use crate::metrics;
use crate::models::{LockRecord, PodEntry};

/// Key of slot `slot` of the pod stored at `pod_key`
pub fn slot_lock_key(pod_key: &str, slot: u32) -> String {
    format!("{}/hosts/{}/.lock", pod_key, slot)
}

/// A slot this host holds for a pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotLock {
    pub pod_name: String,
    pub pod_key: String,
    pub slot: u32,
    pub lock_key: String,
    pub session_id: String,
}

/// Claims pod slots on behalf of this host
pub struct PodLocker {
    store: Arc<dyn CoordinationStore>,
    host: String,
    region: String,
    /// Last slot claimed per pod key
    held: Mutex<HashMap<String, SlotLock>>,
}

impl PodLocker {
    pub fn new(store: Arc<dyn CoordinationStore>, host: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            store,
            host: host.into(),
            region: region.into(),
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Try to claim one slot of `entry` with `session_id`
    ///
    /// Returns `Ok(None)` when every slot is held by another session. Slots
    /// already held by `session_id` are re-acquired, not duplicated, and a
    /// slot left behind by moving to a lower one is released. A transport
    /// error stops the attempt at the failing slot.
    pub async fn try_lock(
        &self,
        session_id: &str,
        entry: &PodEntry,
    ) -> Result<Option<SlotLock>, CoordinationError> {
        let pod_name = &entry.pod.name;
        debug!(pod = %pod_name, max_instances = entry.pod.max_instances, "Attempting to lock pod");

        for slot in 0..entry.pod.max_instances {
            let lock_key = slot_lock_key(&entry.key, slot);
            let record = LockRecord {
                holders: vec![session_id.to_string()],
                host: self.host.clone(),
                region: self.region.clone(),
                timestamp: Utc::now().timestamp_millis(),
            };
            let value = serde_json::to_vec(&record).map_err(|e| CoordinationError::Protocol(e.to_string()))?;

            let acquired = self.store.acquire(&lock_key, &value, session_id).await?;
            debug!(pod = %pod_name, slot, lock_key = %lock_key, acquired, "Slot lock attempt");

            if acquired {
                metrics::record_slot_claim(pod_name, true);
                info!(pod = %pod_name, slot, session_id = %session_id, "Got slot lock");
                let lock = SlotLock {
                    pod_name: pod_name.clone(),
                    pod_key: entry.key.clone(),
                    slot,
                    lock_key,
                    session_id: session_id.to_string(),
                };
                self.release_previous(&lock).await;
                return Ok(Some(lock));
            }
        }

        metrics::record_slot_claim(pod_name, false);
        info!(pod = %pod_name, "Did not get a slot lock for pod");
        Ok(None)
    }

    /// Release the slot this session held for the pod before `lock`, if any
    ///
    /// On failure the previous slot stays recorded, so the next claim retries.
    async fn release_previous(&self, lock: &SlotLock) {
        let previous = self.held.lock().await.get(&lock.pod_key).cloned();

        if let Some(previous) = previous {
            if previous.session_id == lock.session_id && previous.slot != lock.slot {
                match self.store.release(&previous.lock_key, &previous.session_id).await {
                    Ok(released) => info!(
                        pod = %lock.pod_name,
                        from_slot = previous.slot,
                        to_slot = lock.slot,
                        released,
                        "Moved to another slot, released the previous one"
                    ),
                    Err(e) => {
                        warn!(
                            pod = %lock.pod_name,
                            slot = previous.slot,
                            error = %e,
                            "Failed to release previous slot, retrying on next claim"
                        );
                        return;
                    }
                }
            }
        }

        self.held.lock().await.insert(lock.pod_key.clone(), lock.clone());
    }
}
