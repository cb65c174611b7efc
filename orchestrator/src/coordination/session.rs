//! Host session lifecycle
//!
//! One session per process. It is the exclusivity token for every slot lock
//! this host takes, so its health gates all orchestration work: the
//! [`SessionKeeper`] renews it in the background and reports
//! [`SessionHealth::Lost`] once the lease can no longer be vouched for.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{CoordinationError, CoordinationStore, SessionRequest};
use crate::config::AppConfig;
use crate::metrics;

/// Name every Raftainer host session is registered under
pub const HOST_SESSION_NAME: &str = "Raftainer Host";

/// Lease parameters for the host session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub node_name: String,
    pub ttl: Duration,
    pub lock_delay: Duration,
    pub renew_interval: Duration,
    pub max_startup_backoff: Duration,
}

impl SessionConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            node_name: config.node_name.clone(),
            ttl: config.session.ttl(),
            lock_delay: config.session.lock_delay(),
            renew_interval: config.session.renew_interval(),
            max_startup_backoff: config.session.max_startup_backoff(),
        }
    }
}

/// Whether the host session can still be trusted as a lock token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionHealth {
    Healthy,
    Lost,
}

/// Creates, renews and destroys the host session
pub struct SessionManager {
    store: Arc<dyn CoordinationStore>,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(store: Arc<dyn CoordinationStore>, config: SessionConfig) -> Self {
        Self { store, config }
    }

    pub fn node_name(&self) -> &str {
        &self.config.node_name
    }

    /// Create the host session, first waiting out any session this node still holds
    pub async fn acquire(&self, skip_uniqueness_check: bool) -> Result<String, CoordinationError> {
        if !skip_uniqueness_check {
            self.wait_for_previous_session().await?;
        }

        let request = SessionRequest {
            name: HOST_SESSION_NAME.to_string(),
            node: self.config.node_name.clone(),
            ttl_seconds: self.config.ttl.as_secs(),
            lock_delay_seconds: self.config.lock_delay.as_secs(),
        };
        let session_id = self.store.create_session(&request).await?;

        info!(
            session_id = %session_id,
            node = %self.config.node_name,
            ttl_secs = request.ttl_seconds,
            lock_delay_secs = request.lock_delay_seconds,
            "Created host session"
        );

        Ok(session_id)
    }

    /// Acquire a session and start renewing it
    pub async fn start(&self, skip_uniqueness_check: bool) -> Result<SessionKeeper, CoordinationError> {
        let session_id = self.acquire(skip_uniqueness_check).await?;
        Ok(self.spawn_keeper(session_id))
    }

    /// Start the background renewal task for `session_id`
    pub fn spawn_keeper(&self, session_id: String) -> SessionKeeper {
        let (health_tx, health_rx) = watch::channel(SessionHealth::Healthy);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(renew_loop(
            self.store.clone(),
            session_id.clone(),
            self.config.ttl,
            self.config.renew_interval,
            health_tx,
            cancel.clone(),
        ));

        SessionKeeper {
            session_id,
            health: health_rx,
            cancel,
            task,
        }
    }

    /// Stop renewal and destroy the session; failures only get logged
    pub async fn release(&self, keeper: SessionKeeper) {
        let session_id = keeper.stop().await;

        match self.store.destroy_session(&session_id).await {
            Ok(()) => info!(session_id = %session_id, "Destroyed host session"),
            Err(e) => error!(
                session_id = %session_id,
                error = %e,
                "Failed to destroy host session, it will expire with its lease"
            ),
        }
    }

    async fn wait_for_previous_session(&self) -> Result<(), CoordinationError> {
        loop {
            let sessions = self.store.node_sessions(&self.config.node_name).await?;
            if !sessions.iter().any(|s| s.name == HOST_SESSION_NAME) {
                return Ok(());
            }

            let wait = self.startup_backoff();
            warn!(
                node = %self.config.node_name,
                wait_ms = wait.as_millis() as u64,
                "Node already has a Raftainer session, waiting for it to expire"
            );
            tokio::time::sleep(wait).await;
        }
    }

    fn startup_backoff(&self) -> Duration {
        let max_ms = self.config.max_startup_backoff.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

/// Owns the renewal task of one live session
pub struct SessionKeeper {
    session_id: String,
    health: watch::Receiver<SessionHealth>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SessionKeeper {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn health(&self) -> SessionHealth {
        *self.health.borrow()
    }

    pub fn is_lost(&self) -> bool {
        self.health() == SessionHealth::Lost
    }

    /// Resolves once the session is lost; never resolves after a clean stop
    pub async fn lost(&self) {
        let mut health = self.health.clone();
        if health.wait_for(|h| *h == SessionHealth::Lost).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Stop renewing and hand back the session id
    pub async fn stop(self) -> String {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!(session_id = %self.session_id, error = %e, "Session renewal task failed");
        }
        self.session_id
    }
}

async fn renew_loop(
    store: Arc<dyn CoordinationStore>,
    session_id: String,
    ttl: Duration,
    renew_interval: Duration,
    health: watch::Sender<SessionHealth>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval_at(Instant::now() + renew_interval, renew_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_renewed = Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(session_id = %session_id, "Session renewal stopped");
                return;
            }
            _ = interval.tick() => {}
        }

        match store.renew_session(&session_id).await {
            Ok(info) => {
                last_renewed = Instant::now();
                metrics::record_session_renewal(true);
                trace!(
                    session_id = %session_id,
                    create_index = info.create_index,
                    modify_index = info.modify_index,
                    "Renewed host session"
                );
            }
            Err(CoordinationError::SessionInvalid(_)) => {
                metrics::record_session_renewal(false);
                error!(session_id = %session_id, "Host session no longer exists");
                let _ = health.send(SessionHealth::Lost);
                return;
            }
            Err(e) => {
                metrics::record_session_renewal(false);
                let since_renewal = last_renewed.elapsed();
                warn!(
                    session_id = %session_id,
                    error = %e,
                    since_renewal_ms = since_renewal.as_millis() as u64,
                    "Session renewal failed, retrying"
                );

                if since_renewal > ttl {
                    error!(
                        session_id = %session_id,
                        "No successful renewal within the session TTL, treating session as lost"
                    );
                    let _ = health.send(SessionHealth::Lost);
                    return;
                }
            }
        }
    }
}
