//! Pod container reconciliation
//!
//! Converges this host's containers toward a locked pod's declaration:
//!
//! ```text
//! absent                  --create-->  started
//! stopped, hash matches   --start--->  started   (restart policy != no)
//! stale (hash differs)    --pull, remove-->  absent --create--> started
//! running, hash matches   --noop---->  running
//! ```
//!
//! Containers of one pod converge concurrently and each one reports its own
//! result; a failure never rolls back or cancels a sibling.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::hash::config_hash;
use super::runtime::{
    ContainerRuntime, ContainerStatus, ContainerSummary, CreateContainerRequest, PortBinding,
    RuntimeError,
};
use crate::metrics;
use crate::models::{ContainerSpec, PodEntry, RestartPolicy};

pub const ORCHESTRATOR_LABEL: &str = "OrchestratorTag";
pub const ORCHESTRATOR_NAME: &str = "Raftainer";
pub const POD_NAME_LABEL: &str = "PodName";
pub const POD_KEY_LABEL: &str = "PodConsulKey";
pub const CONTAINER_NAME_LABEL: &str = "PodContainerName";
pub const CONFIG_HASH_LABEL: &str = "ConfigHash";

/// What the reconciler did to one container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    Created,
    Recreated,
    Started,
    Unchanged,
    /// Stopped with restart policy `no`; left alone
    LeftStopped,
}

impl ReconcileAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileAction::Created => "created",
            ReconcileAction::Recreated => "recreated",
            ReconcileAction::Started => "started",
            ReconcileAction::Unchanged => "unchanged",
            ReconcileAction::LeftStopped => "left_stopped",
        }
    }
}

impl fmt::Display for ReconcileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime call that failed during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileStage {
    Inspect,
    Pull,
    Remove,
    Create,
    Start,
}

impl fmt::Display for ReconcileStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            ReconcileStage::Inspect => "inspect",
            ReconcileStage::Pull => "pull image",
            ReconcileStage::Remove => "remove",
            ReconcileStage::Create => "create",
            ReconcileStage::Start => "start",
        };
        f.write_str(stage)
    }
}

#[derive(Debug, Clone, Error)]
#[error("container {container} failed to {stage}: {source}")]
pub struct ReconcileError {
    pub container: String,
    pub stage: ReconcileStage,
    #[source]
    pub source: RuntimeError,
}

/// Successful convergence of one container
#[derive(Debug, Clone)]
pub struct ContainerOutcome {
    pub action: ReconcileAction,
    /// Inspected state after the action
    pub status: ContainerStatus,
}

/// Result for one declared container
#[derive(Debug, Clone)]
pub struct ContainerReport {
    /// Container name as declared in the pod
    pub container: String,
    pub result: Result<ContainerOutcome, ReconcileError>,
}

/// Aggregate result of one reconciliation pass over a pod
#[derive(Debug, Clone)]
pub struct PodReport {
    pub pod_name: String,
    pub containers: Vec<ContainerReport>,
}

impl PodReport {
    pub fn converged(&self) -> usize {
        self.containers.iter().filter(|c| c.result.is_ok()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ReconcileError> {
        self.containers.iter().filter_map(|c| c.result.as_ref().err())
    }

    pub fn outcome(&self, container: &str) -> Option<&Result<ContainerOutcome, ReconcileError>> {
        self.containers
            .iter()
            .find(|c| c.container == container)
            .map(|c| &c.result)
    }
}

/// Converges runtime containers for locked pods
pub struct PodReconciler {
    runtime: Arc<dyn ContainerRuntime>,
}

impl PodReconciler {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Managed containers on this host, by name
    pub async fn inventory(&self) -> Result<HashMap<String, ContainerSummary>, RuntimeError> {
        let label = format!("{}={}", ORCHESTRATOR_LABEL, ORCHESTRATOR_NAME);
        let containers = self.runtime.list_containers(&label).await?;

        Ok(containers
            .into_iter()
            .map(|c| {
                debug!(container = %c.name, id = %c.id, running = c.running, "Found existing container");
                (c.name.clone(), c)
            })
            .collect())
    }

    /// Converge every container of `entry`
    ///
    /// Only a failure to read the inventory fails the whole pod.
    pub async fn reconcile(&self, entry: &PodEntry) -> Result<PodReport, RuntimeError> {
        let pod_name = &entry.pod.name;
        let inventory = &self.inventory().await?;
        info!(pod = %pod_name, containers = entry.pod.containers.len(), "Reconciling pod");

        let reconciles = entry.pod.containers.iter().map(|spec| async move {
            let existing = inventory.get(&spec.runtime_name(pod_name));
            ContainerReport {
                container: spec.name.clone(),
                result: self.reconcile_container(entry, spec, existing).await,
            }
        });
        let containers = join_all(reconciles).await;

        for report in &containers {
            match &report.result {
                Ok(outcome) => {
                    metrics::record_container_reconciled(pod_name, outcome.action.as_str());
                    info!(
                        pod = %pod_name,
                        container = %report.container,
                        action = %outcome.action,
                        status = %outcome.status.status,
                        "Container reconciled"
                    );
                }
                Err(e) => {
                    metrics::record_container_failure(pod_name);
                    error!(
                        pod = %pod_name,
                        container = %report.container,
                        stage = %e.stage,
                        error = %e.source,
                        "Container reconciliation failed"
                    );
                }
            }
        }

        Ok(PodReport {
            pod_name: pod_name.clone(),
            containers,
        })
    }

    async fn reconcile_container(
        &self,
        entry: &PodEntry,
        spec: &ContainerSpec,
        existing: Option<&ContainerSummary>,
    ) -> Result<ContainerOutcome, ReconcileError> {
        let name = spec.runtime_name(&entry.pod.name);
        let hash = config_hash(spec);
        let fail = |stage: ReconcileStage| {
            let container = spec.name.clone();
            move |source: RuntimeError| ReconcileError {
                container,
                stage,
                source,
            }
        };

        let mut stale = None;
        if let Some(existing) = existing {
            // The listing may be stale; decide on inspected state
            let status = self
                .runtime
                .inspect_container(&existing.id)
                .await
                .map_err(fail(ReconcileStage::Inspect))?;

            match status {
                Some(status) if status.labels.get(CONFIG_HASH_LABEL) == Some(&hash) => {
                    debug!(container = %name, "Container config matches existing config");
                    return self.converge_existing(spec, status).await;
                }
                Some(status) => {
                    debug!(container = %name, id = %status.id, "Container config changed");
                    stale = Some(status);
                }
                None => {
                    debug!(container = %name, id = %existing.id, "Listed container is gone");
                }
            }
        }

        // A stale container keeps running unless its replacement image is available
        self.runtime
            .pull_image(&spec.image)
            .await
            .map_err(fail(ReconcileStage::Pull))?;

        let replaced = stale.is_some();
        if let Some(stale) = stale {
            debug!(container = %name, id = %stale.id, "Removing existing container");
            self.runtime
                .remove_container(&stale.id)
                .await
                .map_err(fail(ReconcileStage::Remove))?;
        }

        let request = create_request(entry, spec, name, hash);
        let id = self
            .runtime
            .create_container(&request)
            .await
            .map_err(fail(ReconcileStage::Create))?;
        debug!(container = %request.name, id = %id, "Created container");

        self.runtime
            .start_container(&id)
            .await
            .map_err(fail(ReconcileStage::Start))?;

        let status = self.inspect_required(spec, &id).await?;
        let action = if replaced {
            ReconcileAction::Recreated
        } else {
            ReconcileAction::Created
        };

        Ok(ContainerOutcome { action, status })
    }

    /// Hash matches: start if stopped and allowed, otherwise leave as is
    async fn converge_existing(
        &self,
        spec: &ContainerSpec,
        status: ContainerStatus,
    ) -> Result<ContainerOutcome, ReconcileError> {
        if status.running {
            return Ok(ContainerOutcome {
                action: ReconcileAction::Unchanged,
                status,
            });
        }

        if spec.restart_policy == RestartPolicy::No {
            warn!(container = %status.name, status = %status.status, "Container stopped and restart policy is no");
            return Ok(ContainerOutcome {
                action: ReconcileAction::LeftStopped,
                status,
            });
        }

        debug!(container = %status.name, "Re-starting existing container");
        self.runtime
            .start_container(&status.id)
            .await
            .map_err(|source| ReconcileError {
                container: spec.name.clone(),
                stage: ReconcileStage::Start,
                source,
            })?;

        let status = self.inspect_required(spec, &status.id).await?;
        Ok(ContainerOutcome {
            action: ReconcileAction::Started,
            status,
        })
    }

    async fn inspect_required(&self, spec: &ContainerSpec, id: &str) -> Result<ContainerStatus, ReconcileError> {
        let inspect_error = |source: RuntimeError| ReconcileError {
            container: spec.name.clone(),
            stage: ReconcileStage::Inspect,
            source,
        };

        self.runtime
            .inspect_container(id)
            .await
            .map_err(inspect_error)?
            .ok_or_else(|| inspect_error(RuntimeError::NotFound(id.to_string())))
    }
}

fn create_request(entry: &PodEntry, spec: &ContainerSpec, name: String, hash: String) -> CreateContainerRequest {
    let mut env: Vec<String> = spec
        .environment
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    env.sort();

    let labels = HashMap::from([
        (ORCHESTRATOR_LABEL.to_string(), ORCHESTRATOR_NAME.to_string()),
        (POD_NAME_LABEL.to_string(), entry.pod.name.clone()),
        (POD_KEY_LABEL.to_string(), entry.key.clone()),
        (CONTAINER_NAME_LABEL.to_string(), spec.name.clone()),
        (CONFIG_HASH_LABEL.to_string(), hash),
    ]);

    CreateContainerRequest {
        name,
        image: spec.image.clone(),
        env,
        ports: spec
            .ports
            .iter()
            .map(|p| PortBinding {
                container_port: p.container_port,
                protocol: p.protocol,
            })
            .collect(),
        binds: spec.local_volumes.iter().map(|v| v.bind_spec()).collect(),
        restart_policy: spec.restart_policy,
        labels,
    }
}
