//! Coordination service access for the node agent
//!
//! Everything cluster-wide goes through the [`CoordinationStore`] seam:
//! - Host sessions (create, renew, destroy, list by node)
//! - The pod directory (key listing and values)
//! - Slot locks (atomic acquire keyed by a live session)
//!
//! [`ConsulClient`] is the production implementation.

mod consul;
mod lock;
mod pods;
mod session;

#[cfg(test)]
pub(crate) mod memory;

pub use consul::ConsulClient;
pub use lock::{slot_lock_key, PodLocker, SlotLock};
pub use pods::{DirectoryError, PodDirectory, PodListing};
pub use session::{SessionConfig, SessionHealth, SessionKeeper, SessionManager, HOST_SESSION_NAME};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coordination service errors
#[derive(Debug, Clone, Error)]
pub enum CoordinationError {
    #[error("coordination service unreachable: {0}")]
    Transport(String),

    #[error("session {0} is not known to the coordination service")]
    SessionInvalid(String),

    #[error("unexpected coordination service response: {0}")]
    Protocol(String),
}

impl CoordinationError {
    /// Whether the same call may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoordinationError::Transport(_))
    }
}

/// Parameters for creating a host session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub name: String,
    pub node: String,
    pub ttl_seconds: u64,
    pub lock_delay_seconds: u64,
}

/// A session as reported by the coordination service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionInfo {
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub node: String,

    #[serde(default)]
    pub create_index: u64,

    #[serde(default)]
    pub modify_index: u64,
}

/// Operations the agent consumes from the coordination service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Create a session and return its id
    async fn create_session(&self, request: &SessionRequest) -> Result<String, CoordinationError>;

    /// Extend a session's lease
    async fn renew_session(&self, session_id: &str) -> Result<SessionInfo, CoordinationError>;

    /// Invalidate a session, releasing its locks
    async fn destroy_session(&self, session_id: &str) -> Result<(), CoordinationError>;

    /// Sessions currently registered for a node
    async fn node_sessions(&self, node: &str) -> Result<Vec<SessionInfo>, CoordinationError>;

    /// All keys below a prefix (recursive)
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, CoordinationError>;

    /// Raw value of a key, `None` when the key does not exist
    async fn get_value(&self, key: &str) -> Result<Option<Vec<u8>>, CoordinationError>;

    /// Write `value` to `key` only if the key is free or already held by `session_id`
    async fn acquire(
        &self,
        key: &str,
        value: &[u8],
        session_id: &str,
    ) -> Result<bool, CoordinationError>;

    /// Give up `key` if `session_id` holds it; no lock-delay applies
    async fn release(&self, key: &str, session_id: &str) -> Result<bool, CoordinationError>;
}
