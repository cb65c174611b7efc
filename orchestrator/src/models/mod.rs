//! Data models for the Raftainer node agent
//!
//! Pod and container declarations as stored in the coordination service, plus
//! the record written into every slot lock.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Pod declarations
// ============================================================================

/// A declared workload, stored as JSON under the pods namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    /// Pod name, also the prefix of every container name it owns
    pub name: String,

    /// Number of slots cluster-wide; bounds concurrent instances
    pub max_instances: u32,

    /// Containers to run, in declaration order
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
}

/// One container inside a pod
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub name: String,

    pub image: String,

    #[serde(default)]
    pub environment: HashMap<String, String>,

    #[serde(default)]
    pub ports: Vec<ExposedPort>,

    #[serde(default)]
    pub local_volumes: Vec<LocalVolume>,

    #[serde(default)]
    pub restart_policy: RestartPolicy,
}

impl ContainerSpec {
    /// Name of the runtime container materialising this spec within `pod_name`
    pub fn runtime_name(&self, pod_name: &str) -> String {
        format!("{}.{}", pod_name, self.name)
    }
}

/// Port published by a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposedPort {
    pub container_port: u16,

    #[serde(default)]
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    /// Protocol suffix used in Docker port specifications
    pub fn as_docker_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Host directory bound into a container
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolume {
    pub host_path: String,

    pub container_path: String,

    #[serde(default = "default_volume_mode")]
    pub mode: String,
}

impl LocalVolume {
    /// Docker bind specification, `host:container:mode`
    pub fn bind_spec(&self) -> String {
        format!("{}:{}:{}", self.host_path, self.container_path, self.mode)
    }
}

fn default_volume_mode() -> String {
    "rw".to_string()
}

/// Container restart policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    No,
    Always,
    UnlessStopped,
    OnFailure,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::No => "no",
            RestartPolicy::Always => "always",
            RestartPolicy::UnlessStopped => "unless-stopped",
            RestartPolicy::OnFailure => "on-failure",
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Directory and lock records
// ============================================================================

/// Snapshot of one pod as read from the directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodEntry {
    /// Coordination-store key holding the pod
    pub key: String,

    pub pod: PodSpec,
}

/// Value written into a slot lock key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub holders: Vec<String>,
    pub host: String,
    pub region: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}
