//! Container runtime seam

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Protocol, RestartPolicy};

/// Container runtime errors
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("container runtime error: {0}")]
    Api(String),
}

/// A container as returned by a label-filtered listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    /// Name without Docker's leading slash
    pub name: String,
    pub labels: HashMap<String, String>,
    pub running: bool,
}

/// Authoritative state of one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    pub id: String,
    pub name: String,
    pub image: String,
    /// Runtime status string, e.g. `running`, `exited`, `created`
    pub status: String,
    pub running: bool,
    pub labels: HashMap<String, String>,
}

/// A port binding, published on the same host port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBinding {
    pub container_port: u16,
    pub protocol: Protocol,
}

impl PortBinding {
    /// Docker port key, e.g. `53/udp`
    pub fn port_key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol.as_docker_str())
    }
}

/// Everything needed to create a managed container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateContainerRequest {
    pub name: String,
    pub image: String,
    /// `KEY=value` pairs
    pub env: Vec<String>,
    pub ports: Vec<PortBinding>,
    /// `host:container:mode` bind specifications
    pub binds: Vec<String>,
    pub restart_policy: RestartPolicy,
    pub labels: HashMap<String, String>,
}

/// Operations the reconciler consumes from the local container engine
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// All containers (running or not) carrying `label` (`key=value` or `key`)
    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerSummary>, RuntimeError>;

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Create a container and return its id
    async fn create_container(&self, request: &CreateContainerRequest) -> Result<String, RuntimeError>;

    /// `None` when the container no longer exists
    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerStatus>, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Force-remove a container, stopping it if needed
    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;
}
