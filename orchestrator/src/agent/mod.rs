//! Node agent control loop
//!
//! Each orchestration pass lists the declared pods, tries to claim a slot of
//! every pod with the host session and converges the containers of the pods
//! it won. Pods are handled concurrently; the host session's health gates
//! every claim and every reconciliation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::container::{ContainerRuntime, PodReconciler, PodReport, RuntimeError};
use crate::coordination::{
    CoordinationError, CoordinationStore, PodDirectory, PodLocker, SessionKeeper, SessionManager, SlotLock,
};
use crate::metrics;
use crate::models::PodEntry;

/// Conditions that abort one orchestration pass
#[derive(Debug, Error)]
pub enum PassError {
    #[error("host session {0} was lost")]
    SessionLost(String),

    #[error("failed to list pods: {0}")]
    Directory(#[source] CoordinationError),

    #[error("failed to read container inventory: {0}")]
    Inventory(#[source] RuntimeError),
}

/// What one orchestration pass did
#[derive(Debug, Clone)]
pub struct PassSummary {
    pub pass_id: Uuid,
    /// Well-formed pod entries in the directory
    pub pods_seen: usize,
    /// Entries that could not be fetched or parsed
    pub malformed_entries: usize,
    /// Slots this host holds after the pass
    pub slots: Vec<SlotLock>,
    /// Pods whose claim failed with a coordination error
    pub claims_failed: usize,
    pub containers_converged: usize,
    pub containers_failed: usize,
}

impl PassSummary {
    fn new(pass_id: Uuid) -> Self {
        Self {
            pass_id,
            pods_seen: 0,
            malformed_entries: 0,
            slots: Vec::new(),
            claims_failed: 0,
            containers_converged: 0,
            containers_failed: 0,
        }
    }

    pub fn slots_held(&self) -> usize {
        self.slots.len()
    }
}

enum PodOutcome {
    NotClaimed,
    ClaimFailed,
    SessionLost,
    Reconciled { lock: SlotLock, report: PodReport },
    InventoryFailed { lock: SlotLock, error: RuntimeError },
}

/// Drives orchestration passes for this host
pub struct NodeAgent {
    directory: PodDirectory,
    locker: PodLocker,
    reconciler: PodReconciler,
    interval: Duration,
}

impl NodeAgent {
    pub fn new(directory: PodDirectory, locker: PodLocker, reconciler: PodReconciler, interval: Duration) -> Self {
        Self {
            directory,
            locker,
            reconciler,
            interval,
        }
    }

    pub fn from_config(
        config: &AppConfig,
        store: Arc<dyn CoordinationStore>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self::new(
            PodDirectory::new(store.clone(), config.pods_prefix()),
            PodLocker::new(store, config.node_name.clone(), config.region.clone()),
            PodReconciler::new(runtime),
            config.orchestration_interval(),
        )
    }

    /// Run passes until `shutdown` fires, then release the host session
    ///
    /// A lost session is never reused: the loop drops it and acquires a new
    /// one, waiting out the old registration, before the next pass.
    pub async fn run(&self, manager: &SessionManager, keeper: SessionKeeper, shutdown: CancellationToken) {
        let mut keeper = Some(keeper);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            node = %manager.node_name(),
            prefix = %self.directory.prefix(),
            interval_secs = self.interval.as_secs(),
            "Starting orchestration loop"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if keeper.as_ref().map(|k| k.is_lost()).unwrap_or(true) {
                if let Some(lost) = keeper.take() {
                    let session_id = lost.stop().await;
                    warn!(session_id = %session_id, "Host session lost, abandoning its slot locks");
                }

                let started = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    started = manager.start(false) => started,
                };
                match started {
                    Ok(new_keeper) => {
                        info!(session_id = %new_keeper.session_id(), "Re-acquired host session");
                        keeper = Some(new_keeper);
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to re-acquire host session, retrying next tick");
                        continue;
                    }
                }
            }

            let Some(session) = keeper.as_ref() else {
                continue;
            };
            if let Err(e) = self.run_pass(session).await {
                warn!(error = %e, "Orchestration pass aborted");
            }
        }

        info!("Orchestration loop stopped");
        if let Some(keeper) = keeper {
            manager.release(keeper).await;
        }
    }

    /// One orchestration pass over every declared pod
    pub async fn run_pass(&self, session: &SessionKeeper) -> Result<PassSummary, PassError> {
        let pass_id = Uuid::new_v4();
        let span = info_span!("orchestration_pass", pass_id = %pass_id, session_id = %session.session_id());
        self.pass(pass_id, session).instrument(span).await
    }

    async fn pass(&self, pass_id: Uuid, session: &SessionKeeper) -> Result<PassSummary, PassError> {
        let started = Instant::now();
        if session.is_lost() {
            return Err(PassError::SessionLost(session.session_id().to_string()));
        }

        let listings = self.directory.list_pods().await.map_err(PassError::Directory)?;

        let mut summary = PassSummary::new(pass_id);
        let mut pods = Vec::with_capacity(listings.len());
        for listing in listings {
            match listing {
                Ok(entry) => pods.push(entry),
                Err(e) => {
                    summary.malformed_entries += 1;
                    warn!(key = %e.key(), error = %e, "Skipping pod entry");
                }
            }
        }
        summary.pods_seen = pods.len();

        let outcomes = join_all(pods.iter().map(|entry| self.orchestrate_pod(session, entry))).await;

        let mut session_lost = false;
        let mut inventory_error = None;
        for outcome in outcomes {
            match outcome {
                PodOutcome::NotClaimed => {}
                PodOutcome::ClaimFailed => summary.claims_failed += 1,
                PodOutcome::SessionLost => session_lost = true,
                PodOutcome::Reconciled { lock, report } => {
                    summary.containers_converged += report.converged();
                    summary.containers_failed += report.failures().count();
                    summary.slots.push(lock);
                }
                PodOutcome::InventoryFailed { lock, error } => {
                    summary.slots.push(lock);
                    inventory_error.get_or_insert(error);
                }
            }
        }

        if session_lost {
            return Err(PassError::SessionLost(session.session_id().to_string()));
        }
        if let Some(error) = inventory_error {
            return Err(PassError::Inventory(error));
        }

        let elapsed = started.elapsed();
        metrics::record_pass(elapsed.as_secs_f64(), summary.slots_held());
        info!(
            pods = summary.pods_seen,
            malformed = summary.malformed_entries,
            slots_held = summary.slots_held(),
            claims_failed = summary.claims_failed,
            converged = summary.containers_converged,
            failed = summary.containers_failed,
            duration_ms = elapsed.as_millis() as u64,
            "Orchestration pass complete"
        );

        Ok(summary)
    }

    async fn orchestrate_pod(&self, session: &SessionKeeper, entry: &PodEntry) -> PodOutcome {
        let pod_name = &entry.pod.name;
        if session.is_lost() {
            return PodOutcome::SessionLost;
        }

        let lock = match self.locker.try_lock(session.session_id(), entry).await {
            Ok(Some(lock)) => lock,
            Ok(None) => return PodOutcome::NotClaimed,
            Err(CoordinationError::SessionInvalid(_)) => return PodOutcome::SessionLost,
            Err(e) => {
                error!(pod = %pod_name, error = %e, retryable = e.is_retryable(), "Failed to claim pod slot");
                return PodOutcome::ClaimFailed;
            }
        };

        // Renewal may have failed while the claim was in flight
        if session.is_lost() {
            warn!(pod = %pod_name, slot = lock.slot, "Session lost after claim, not reconciling");
            return PodOutcome::SessionLost;
        }

        match self.reconciler.reconcile(entry).await {
            Ok(report) => PodOutcome::Reconciled { lock, report },
            Err(error) => {
                error!(pod = %pod_name, slot = lock.slot, error = %error, "Failed to read container inventory");
                PodOutcome::InventoryFailed { lock, error }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::container::fake::FakeRuntime;
    use crate::coordination::memory::MemoryStore;
    use crate::coordination::{slot_lock_key, SessionConfig, SessionRequest, HOST_SESSION_NAME};
    use crate::models::{ContainerSpec, PodSpec, RestartPolicy};
    use pretty_assertions::assert_eq;

    fn pod_json(name: &str, max_instances: u32, images: &[&str]) -> Vec<u8> {
        let pod = PodSpec {
            name: name.to_string(),
            max_instances,
            containers: images
                .iter()
                .enumerate()
                .map(|(i, image)| ContainerSpec {
                    name: format!("c{}", i),
                    image: image.to_string(),
                    environment: HashMap::new(),
                    ports: vec![],
                    local_volumes: vec![],
                    restart_policy: RestartPolicy::Always,
                })
                .collect(),
        };
        serde_json::to_vec(&pod).unwrap()
    }

    fn session_config(node: &str) -> SessionConfig {
        SessionConfig {
            node_name: node.to_string(),
            ttl: Duration::from_secs(10),
            lock_delay: Duration::from_secs(10),
            renew_interval: Duration::from_secs(5),
            max_startup_backoff: Duration::from_secs(10),
        }
    }

    fn agent(store: &Arc<MemoryStore>, runtime: &Arc<FakeRuntime>, node: &str) -> NodeAgent {
        NodeAgent::new(
            PodDirectory::new(store.clone(), "raftainer/pods"),
            PodLocker::new(store.clone(), node, "eu"),
            PodReconciler::new(runtime.clone()),
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn test_pass_claims_and_reconciles_pods() {
        let store = Arc::new(MemoryStore::new());
        store.put("raftainer/pods/web", pod_json("web", 1, &["nginx:1", "sidecar:1"]));
        store.put("raftainer/pods/db", pod_json("db", 1, &["postgres:16"]));
        store.put("raftainer/pods/broken", "{");
        let runtime = Arc::new(FakeRuntime::new());

        let manager = SessionManager::new(store.clone(), session_config("host-a"));
        let keeper = manager.start(true).await.unwrap();

        let summary = agent(&store, &runtime, "host-a").run_pass(&keeper).await.unwrap();

        assert_eq!(summary.pods_seen, 2);
        assert_eq!(summary.malformed_entries, 1);
        assert_eq!(summary.slots_held(), 2);
        assert_eq!(summary.containers_converged, 3);
        assert_eq!(summary.containers_failed, 0);
        assert!(runtime.find("web.c0").unwrap().1.running);
        assert!(runtime.find("db.c0").unwrap().1.running);
        assert_eq!(
            store.holder(&slot_lock_key("raftainer/pods/web", 0)).as_deref(),
            Some(keeper.session_id())
        );

        manager.release(keeper).await;
    }

    #[tokio::test]
    async fn test_pod_held_elsewhere_is_not_run() {
        let store = Arc::new(MemoryStore::new());
        store.put("raftainer/pods/web", pod_json("web", 1, &["nginx:1"]));

        let other = store
            .create_session(&SessionRequest {
                name: HOST_SESSION_NAME.to_string(),
                node: "host-b".to_string(),
                ttl_seconds: 10,
                lock_delay_seconds: 10,
            })
            .await
            .unwrap();
        store
            .acquire(&slot_lock_key("raftainer/pods/web", 0), b"{}", &other)
            .await
            .unwrap();

        let runtime = Arc::new(FakeRuntime::new());
        let manager = SessionManager::new(store.clone(), session_config("host-a"));
        let keeper = manager.start(true).await.unwrap();

        let summary = agent(&store, &runtime, "host-a").run_pass(&keeper).await.unwrap();

        assert_eq!(summary.pods_seen, 1);
        assert_eq!(summary.slots_held(), 0);
        assert_eq!(runtime.len(), 0);
        assert_eq!(runtime.counts().pulls, 0);
    }

    #[tokio::test]
    async fn test_container_failure_does_not_fail_pass() {
        let store = Arc::new(MemoryStore::new());
        store.put("raftainer/pods/web", pod_json("web", 1, &["missing:1", "nginx:1"]));
        let runtime = Arc::new(FakeRuntime::new());
        runtime.fail_pulls_of("missing:1");

        let manager = SessionManager::new(store.clone(), session_config("host-a"));
        let keeper = manager.start(true).await.unwrap();

        let summary = agent(&store, &runtime, "host-a").run_pass(&keeper).await.unwrap();

        assert_eq!(summary.slots_held(), 1);
        assert_eq!(summary.containers_converged, 1);
        assert_eq!(summary.containers_failed, 1);
        assert!(runtime.find("web.c1").unwrap().1.running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_session_aborts_pass() {
        let store = Arc::new(MemoryStore::new());
        store.put("raftainer/pods/web", pod_json("web", 1, &["nginx:1"]));
        let runtime = Arc::new(FakeRuntime::new());

        let manager = SessionManager::new(store.clone(), session_config("host-a"));
        let keeper = manager.start(true).await.unwrap();
        store.expire_session(keeper.session_id());

        tokio::time::timeout(Duration::from_secs(6), keeper.lost())
            .await
            .expect("renewal should notice the expired session");

        let err = agent(&store, &runtime, "host-a").run_pass(&keeper).await.unwrap_err();
        assert!(matches!(err, PassError::SessionLost(_)));
        assert_eq!(store.acquire_calls(), 0);
        assert_eq!(runtime.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reacquires_lost_session_and_releases_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        store.put("raftainer/pods/web", pod_json("web", 1, &["nginx:1"]));
        let runtime = Arc::new(FakeRuntime::new());
        let lock_key = slot_lock_key("raftainer/pods/web", 0);

        let manager = SessionManager::new(store.clone(), session_config("host-a"));
        let keeper = manager.start(true).await.unwrap();
        let first_session = keeper.session_id().to_string();

        let node = agent(&store, &runtime, "host-a");
        let shutdown = CancellationToken::new();

        let control = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert_eq!(store.holder(&lock_key), Some(first_session.clone()));
            store.expire_session(&first_session);

            // Renewal notices at 5s and the 10s pass runs on a new session,
            // but the slot stays quarantined until 11s
            tokio::time::sleep(Duration::from_millis(9_500)).await;
            assert_eq!(store.holder(&lock_key), None);
            assert_eq!(store.session_count(), 1);

            // The 20s pass claims it
            tokio::time::sleep(Duration::from_millis(10_500)).await;
            let holder = store.holder(&lock_key);
            shutdown.cancel();
            holder
        };

        let (_, holder) = tokio::join!(node.run(&manager, keeper, shutdown.clone()), control);

        let holder = holder.expect("slot should be re-claimed");
        assert_ne!(holder, first_session);
        assert_eq!(store.session_count(), 0);
        assert!(runtime.find("web.c0").unwrap().1.running);
    }

    #[tokio::test]
    async fn test_claim_with_dead_session_aborts_pass() {
        let store = Arc::new(MemoryStore::new());
        store.put("raftainer/pods/web", pod_json("web", 1, &["nginx:1"]));
        let runtime = Arc::new(FakeRuntime::new());

        let manager = SessionManager::new(store.clone(), session_config("host-a"));
        let keeper = manager.start(true).await.unwrap();

        // Gone on the server before any renewal noticed
        store.expire_session(keeper.session_id());
        assert!(!keeper.is_lost());

        let err = agent(&store, &runtime, "host-a").run_pass(&keeper).await.unwrap_err();
        assert!(matches!(err, PassError::SessionLost(_)));
        assert_eq!(runtime.len(), 0);
    }
}
