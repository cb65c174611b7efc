//! Docker engine backend

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerInspectResponse, HostConfig, PortBinding as DockerPortBinding,
    RestartPolicy as DockerRestartPolicy, RestartPolicyNameEnum,
};
use bollard::Docker;
use futures::TryStreamExt;
use tracing::{debug, info};

use super::runtime::{ContainerRuntime, ContainerStatus, ContainerSummary, CreateContainerRequest, RuntimeError};
use crate::config::DockerConfig;
use crate::models::RestartPolicy;

/// [`ContainerRuntime`] backed by the Docker Engine API
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the configured socket, or the platform default
    pub fn connect(config: &DockerConfig) -> Result<Self, RuntimeError> {
        let docker = match config.socket {
            Some(ref socket) => Docker::connect_with_socket(
                socket,
                config.timeout_seconds,
                bollard::API_DEFAULT_VERSION,
            ),
            None => Docker::connect_with_local_defaults()
                .map(|d| d.with_timeout(Duration::from_secs(config.timeout_seconds))),
        }
        .map_err(map_docker_error)?;

        Ok(Self { docker })
    }

    /// Engine version, used as a startup health check
    pub async fn version(&self) -> Result<String, RuntimeError> {
        let version = self.docker.version().await.map_err(map_docker_error)?;
        Ok(version.version.unwrap_or_else(|| "unknown".to_string()))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label.to_string()]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(map_docker_error)?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let name = c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default();
                Some(ContainerSummary {
                    id,
                    name,
                    labels: c.labels.unwrap_or_default(),
                    running: c.state.as_deref() == Some("running"),
                })
            })
            .collect())
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let reference = image_reference(image);
        debug!(image = %reference, "Pulling image");

        let options = CreateImageOptions {
            from_image: reference.as_str(),
            ..Default::default()
        };

        let progress: Vec<_> = self
            .docker
            .create_image(Some(options), None, None)
            .try_collect()
            .await
            .map_err(map_docker_error)?;

        if let Some(message) = progress.iter().find_map(|p| p.error.clone()) {
            return Err(RuntimeError::Api(format!("pull of {} failed: {}", reference, message)));
        }

        info!(image = %reference, "Pulled image");
        Ok(())
    }

    async fn create_container(&self, request: &CreateContainerRequest) -> Result<String, RuntimeError> {
        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for port in &request.ports {
            let key = port.port_key();
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![DockerPortBinding {
                    host_ip: None,
                    host_port: Some(port.container_port.to_string()),
                }]),
            );
        }

        let host_config = HostConfig {
            binds: if request.binds.is_empty() {
                None
            } else {
                Some(request.binds.clone())
            },
            port_bindings: Some(port_bindings),
            restart_policy: Some(DockerRestartPolicy {
                name: Some(restart_policy_name(request.restart_policy)),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        let config = Config {
            image: Some(request.image.clone()),
            env: Some(request.env.clone()),
            labels: Some(request.labels.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: request.name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(map_docker_error)?;

        for warning in &response.warnings {
            debug!(container = %request.name, warning = %warning, "Docker create warning");
        }

        Ok(response.id)
    }

    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerStatus>, RuntimeError> {
        match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(Some(status_from_inspect(id, info))),
            Err(DockerError::DockerResponseServerError { status_code: 404, .. }) => Ok(None),
            Err(e) => Err(map_docker_error(e)),
        }
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            // 304: already started
            Ok(()) | Err(DockerError::DockerResponseServerError { status_code: 304, .. }) => Ok(()),
            Err(e) => Err(map_docker_error(e)),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) | Err(DockerError::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(map_docker_error(e)),
        }
    }
}

fn status_from_inspect(id: &str, info: ContainerInspectResponse) -> ContainerStatus {
    let state = info.state.unwrap_or_default();
    let config = info.config.unwrap_or_default();

    ContainerStatus {
        id: info.id.unwrap_or_else(|| id.to_string()),
        name: info
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default(),
        image: config.image.unwrap_or_default(),
        status: state.status.map(|s| s.to_string()).unwrap_or_default(),
        running: state.running.unwrap_or(false),
        labels: config.labels.unwrap_or_default(),
    }
}

/// Pin untagged images to `latest`; Docker would otherwise pull every tag
fn image_reference(image: &str) -> String {
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    if image.contains('@') || last_segment.contains(':') {
        image.to_string()
    } else {
        format!("{}:latest", image)
    }
}

fn restart_policy_name(policy: RestartPolicy) -> RestartPolicyNameEnum {
    match policy {
        RestartPolicy::No => RestartPolicyNameEnum::NO,
        RestartPolicy::Always => RestartPolicyNameEnum::ALWAYS,
        RestartPolicy::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
        RestartPolicy::OnFailure => RestartPolicyNameEnum::ON_FAILURE,
    }
}

fn map_docker_error(err: DockerError) -> RuntimeError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        DockerError::DockerResponseServerError {
            status_code: 409,
            message,
        } => RuntimeError::Conflict(message),
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Api(format!("{}: {}", status_code, message)),
        e @ (DockerError::HyperResponseError { .. }
        | DockerError::IOError { .. }
        | DockerError::RequestTimeoutError) => RuntimeError::Unavailable(e.to_string()),
        e => RuntimeError::Api(e.to_string()),
    }
}
