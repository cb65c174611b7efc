//! Container management module for the Raftainer agent
//!
//! Handles all interactions with the local container engine:
//! - Listing containers owned by the orchestrator
//! - Fingerprinting container specs
//! - Converging containers toward a locked pod's declaration

mod docker;
mod hash;
mod reconciler;
mod runtime;

#[cfg(test)]
pub(crate) mod fake;

pub use docker::DockerRuntime;
pub use hash::{canonical_json, config_hash};
pub use reconciler::{
    ContainerOutcome, ContainerReport, PodReconciler, PodReport, ReconcileAction, ReconcileError,
    ReconcileStage, CONFIG_HASH_LABEL, CONTAINER_NAME_LABEL, ORCHESTRATOR_LABEL, ORCHESTRATOR_NAME,
    POD_KEY_LABEL, POD_NAME_LABEL,
};
pub use runtime::{
    ContainerRuntime, ContainerStatus, ContainerSummary, CreateContainerRequest, PortBinding, RuntimeError,
};
