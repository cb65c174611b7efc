//! Pod directory: declared pods read from the key/value store

use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, warn};

use super::{CoordinationError, CoordinationStore};
use crate::models::{PodEntry, PodSpec};

/// Why one directory entry could not be read
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("pod {key} could not be fetched: {source}")]
    Fetch {
        key: String,
        #[source]
        source: CoordinationError,
    },

    #[error("pod {key} has a malformed spec: {source}")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl DirectoryError {
    /// Directory key of the offending entry
    pub fn key(&self) -> &str {
        match self {
            DirectoryError::Fetch { key, .. } | DirectoryError::Malformed { key, .. } => key,
        }
    }
}

/// One directory entry, or the error isolated to it
pub type PodListing = Result<PodEntry, DirectoryError>;

/// Reads pods declared under a prefix
pub struct PodDirectory {
    store: Arc<dyn CoordinationStore>,
    prefix: String,
}

impl PodDirectory {
    pub fn new(store: Arc<dyn CoordinationStore>, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().trim_end_matches('/').to_string();
        Self { store, prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// List every declared pod
    ///
    /// Only a failure to list the namespace itself is an error; each entry
    /// carries its own result so one bad value never hides the others.
    pub async fn list_pods(&self) -> Result<Vec<PodListing>, CoordinationError> {
        let keys = self.store.list_keys(&format!("{}/", self.prefix)).await?;

        let pod_keys: Vec<String> = keys.into_iter().filter(|k| self.is_pod_key(k)).collect();
        debug!(prefix = %self.prefix, count = pod_keys.len(), "Listed pod keys");

        let fetches = pod_keys.into_iter().map(|key| self.fetch(key));
        let listings = join_all(fetches).await.into_iter().flatten().collect();

        Ok(listings)
    }

    /// Keys directly under the prefix; lock keys and folders nest deeper
    fn is_pod_key(&self, key: &str) -> bool {
        key.strip_prefix(&self.prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .map(|name| !name.is_empty() && !name.contains('/'))
            .unwrap_or(false)
    }

    /// `None` when the key disappeared after listing
    async fn fetch(&self, key: String) -> Option<PodListing> {
        let value = match self.store.get_value(&key).await {
            Ok(Some(value)) => value,
            Ok(None) => {
                debug!(key = %key, "Pod key removed while listing");
                return None;
            }
            Err(source) => {
                warn!(key = %key, error = %source, "Failed to fetch pod");
                return Some(Err(DirectoryError::Fetch { key, source }));
            }
        };

        match serde_json::from_slice::<PodSpec>(&value) {
            Ok(pod) => Some(Ok(PodEntry { key, pod })),
            Err(source) => {
                warn!(key = %key, error = %source, "Ignoring malformed pod spec");
                Some(Err(DirectoryError::Malformed { key, source }))
            }
        }
    }
}
