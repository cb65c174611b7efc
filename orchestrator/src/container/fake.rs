//! Fake container runtime for tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use super::runtime::{ContainerRuntime, ContainerStatus, ContainerSummary, CreateContainerRequest, RuntimeError};

#[derive(Debug, Clone)]
pub(crate) struct FakeContainer {
    pub(crate) name: String,
    pub(crate) request: CreateContainerRequest,
    pub(crate) running: bool,
}

/// Counts of mutating calls, for asserting no-op passes
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CallCounts {
    pub(crate) pulls: usize,
    pub(crate) creates: usize,
    pub(crate) starts: usize,
    pub(crate) removes: usize,
}

#[derive(Debug, Default)]
pub(crate) struct FakeRuntime {
    containers: Mutex<HashMap<String, FakeContainer>>,
    missing_images: Mutex<HashSet<String>>,
    /// Containers listed but already gone when inspected
    stale_listing: Mutex<Vec<ContainerSummary>>,
    pulls: AtomicUsize,
    creates: AtomicUsize,
    starts: AtomicUsize,
    removes: AtomicUsize,
}

impl FakeRuntime {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Pulls of `image` fail as if the registry had no such image
    pub(crate) fn fail_pulls_of(&self, image: &str) {
        self.missing_images.lock().unwrap().insert(image.to_string());
    }

    /// Report a container in listings that inspect no longer finds
    pub(crate) fn add_stale_listing(&self, summary: ContainerSummary) {
        self.stale_listing.lock().unwrap().push(summary);
    }

    pub(crate) fn counts(&self) -> CallCounts {
        CallCounts {
            pulls: self.pulls.load(Ordering::SeqCst),
            creates: self.creates.load(Ordering::SeqCst),
            starts: self.starts.load(Ordering::SeqCst),
            removes: self.removes.load(Ordering::SeqCst),
        }
    }

    /// Id and state of the container called `name`
    pub(crate) fn find(&self, name: &str) -> Option<(String, FakeContainer)> {
        self.containers
            .lock()
            .unwrap()
            .iter()
            .find(|(_, c)| c.name == name)
            .map(|(id, c)| (id.clone(), c.clone()))
    }

    pub(crate) fn stop(&self, id: &str) {
        if let Some(container) = self.containers.lock().unwrap().get_mut(id) {
            container.running = false;
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.containers.lock().unwrap().len()
    }
}

fn matches_label(labels: &HashMap<String, String>, filter: &str) -> bool {
    match filter.split_once('=') {
        Some((key, value)) => labels.get(key).map(|v| v == value).unwrap_or(false),
        None => labels.contains_key(filter),
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let mut listed: Vec<ContainerSummary> = self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, c)| matches_label(&c.request.labels, label))
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                name: c.name.clone(),
                labels: c.request.labels.clone(),
                running: c.running,
            })
            .collect();
        listed.extend(self.stale_listing.lock().unwrap().iter().cloned());
        Ok(listed)
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        if self.missing_images.lock().unwrap().contains(image) {
            return Err(RuntimeError::NotFound(format!("manifest for {} not found", image)));
        }
        Ok(())
    }

    async fn create_container(&self, request: &CreateContainerRequest) -> Result<String, RuntimeError> {
        let mut containers = self.containers.lock().unwrap();
        if containers.values().any(|c| c.name == request.name) {
            return Err(RuntimeError::Conflict(format!(
                "container name \"/{}\" is already in use",
                request.name
            )));
        }

        self.creates.fetch_add(1, Ordering::SeqCst);
        let id = Uuid::new_v4().simple().to_string();
        containers.insert(
            id.clone(),
            FakeContainer {
                name: request.name.clone(),
                request: request.clone(),
                running: false,
            },
        );
        Ok(id)
    }

    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerStatus>, RuntimeError> {
        Ok(self.containers.lock().unwrap().get(id).map(|c| ContainerStatus {
            id: id.to_string(),
            name: c.name.clone(),
            image: c.request.image.clone(),
            status: if c.running { "running" } else { "exited" }.to_string(),
            running: c.running,
            labels: c.request.labels.clone(),
        }))
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        match self.containers.lock().unwrap().get_mut(id) {
            Some(container) => {
                container.running = true;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.containers.lock().unwrap().remove(id);
        Ok(())
    }
}
