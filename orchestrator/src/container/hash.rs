//! Container configuration fingerprints
//!
//! The hash is taken over a canonical JSON rendering of the spec: maps are
//! key-ordered and port/volume lists are sorted and de-duplicated, so two
//! specs that differ only in ordering hash identically.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::models::{ContainerSpec, ExposedPort, LocalVolume, RestartPolicy};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalSpec<'a> {
    name: &'a str,
    image: &'a str,
    environment: BTreeMap<&'a str, &'a str>,
    ports: BTreeSet<&'a ExposedPort>,
    local_volumes: BTreeSet<&'a LocalVolume>,
    restart_policy: RestartPolicy,
}

impl<'a> From<&'a ContainerSpec> for CanonicalSpec<'a> {
    fn from(spec: &'a ContainerSpec) -> Self {
        Self {
            name: &spec.name,
            image: &spec.image,
            environment: spec
                .environment
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect(),
            ports: spec.ports.iter().collect(),
            local_volumes: spec.local_volumes.iter().collect(),
            restart_policy: spec.restart_policy,
        }
    }
}

/// Canonical serialized form of a container spec
pub fn canonical_json(spec: &ContainerSpec) -> String {
    // Only string keys and plain values: serialization cannot fail
    serde_json::to_string(&CanonicalSpec::from(spec)).unwrap_or_default()
}

/// Hex SHA-256 of the canonical form
pub fn config_hash(spec: &ContainerSpec) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(spec).as_bytes());
    format!("{:x}", hasher.finalize())
}
