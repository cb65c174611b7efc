//! Consul HTTP API client

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::{CoordinationError, CoordinationStore, SessionInfo, SessionRequest};
use crate::config::ConsulConfig;

/// Body of `PUT /v1/session/create`
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateSessionBody<'a> {
    name: &'a str,
    node: &'a str,
    #[serde(rename = "TTL")]
    ttl: String,
    lock_delay: String,
    behavior: &'static str,
}

#[derive(Debug, Deserialize)]
struct CreateSessionResponse {
    #[serde(rename = "ID")]
    id: String,
}

/// Consul client for sessions and the key/value store
pub struct ConsulClient {
    config: ConsulConfig,
    client: Client,
}

impl ConsulClient {
    pub fn new(config: ConsulConfig) -> Result<Self, CoordinationError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| CoordinationError::Protocol(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.config.address.trim_end_matches('/'), path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut builder = self.client.request(method, self.url(path));

        if let Some(ref token) = self.config.token {
            builder = builder.header("X-Consul-Token", token);
        }
        if let Some(ref dc) = self.config.datacenter {
            builder = builder.query(&[("dc", dc)]);
        }

        builder
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, CoordinationError> {
        builder
            .send()
            .await
            .map_err(|e| CoordinationError::Transport(e.to_string()))
    }

    /// Turn a non-success response into an error carrying its body
    async fn unexpected(response: Response) -> CoordinationError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        warn!(status = %status, body = %body, "Consul request failed");
        status_error(status, &body)
    }

    /// Like [`Self::unexpected`], but recognises a dead session on lock calls
    async fn lock_error(response: Response, session_id: &str) -> CoordinationError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        warn!(status = %status, body = %body, session_id = %session_id, "Consul lock request failed");
        lock_status_error(status, &body, session_id)
    }

    async fn json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, CoordinationError> {
        response
            .json()
            .await
            .map_err(|e| CoordinationError::Protocol(e.to_string()))
    }
}

#[async_trait]
impl CoordinationStore for ConsulClient {
    async fn create_session(&self, request: &SessionRequest) -> Result<String, CoordinationError> {
        let body = CreateSessionBody {
            name: &request.name,
            node: &request.node,
            ttl: format!("{}s", request.ttl_seconds),
            lock_delay: format!("{}s", request.lock_delay_seconds),
            behavior: "release",
        };

        let response = self
            .send(self.request(Method::PUT, "session/create").json(&body))
            .await?;
        if !response.status().is_success() {
            return Err(Self::unexpected(response).await);
        }

        let created: CreateSessionResponse = Self::json(response).await?;
        debug!(session_id = %created.id, node = %request.node, "Consul session created");
        Ok(created.id)
    }

    async fn renew_session(&self, session_id: &str) -> Result<SessionInfo, CoordinationError> {
        let response = self
            .send(self.request(Method::PUT, &format!("session/renew/{}", session_id)))
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(CoordinationError::SessionInvalid(session_id.to_string()));
        }
        if !response.status().is_success() {
            return Err(Self::unexpected(response).await);
        }

        let sessions: Vec<SessionInfo> = Self::json(response).await?;
        sessions
            .into_iter()
            .next()
            .ok_or_else(|| CoordinationError::SessionInvalid(session_id.to_string()))
    }

    async fn destroy_session(&self, session_id: &str) -> Result<(), CoordinationError> {
        let response = self
            .send(self.request(Method::PUT, &format!("session/destroy/{}", session_id)))
            .await?;
        if !response.status().is_success() {
            return Err(Self::unexpected(response).await);
        }
        Ok(())
    }

    async fn node_sessions(&self, node: &str) -> Result<Vec<SessionInfo>, CoordinationError> {
        let response = self
            .send(self.request(Method::GET, &format!("session/node/{}", node)))
            .await?;
        if !response.status().is_success() {
            return Err(Self::unexpected(response).await);
        }

        // Consul answers `null` rather than `[]` for nodes without sessions
        let sessions: Option<Vec<SessionInfo>> = Self::json(response).await?;
        Ok(sessions.unwrap_or_default())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, CoordinationError> {
        let response = self
            .send(self.request(Method::GET, &format!("kv/{}", prefix)).query(&[("keys", "")]))
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(Self::unexpected(response).await);
        }

        let keys: Vec<String> = Self::json(response).await?;
        trace!(prefix = %prefix, count = keys.len(), "Consul KV keys");
        Ok(keys)
    }

    async fn get_value(&self, key: &str) -> Result<Option<Vec<u8>>, CoordinationError> {
        let response = self
            .send(self.request(Method::GET, &format!("kv/{}", key)).query(&[("raw", "")]))
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::unexpected(response).await);
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| CoordinationError::Transport(e.to_string()))?;
        Ok(Some(bytes.to_vec()))
    }

    async fn acquire(
        &self,
        key: &str,
        value: &[u8],
        session_id: &str,
    ) -> Result<bool, CoordinationError> {
        let response = self
            .send(
                self.request(Method::PUT, &format!("kv/{}", key))
                    .query(&[("acquire", session_id)])
                    .body(value.to_vec()),
            )
            .await?;
        if !response.status().is_success() {
            return Err(Self::lock_error(response, session_id).await);
        }

        let acquired: bool = Self::json(response).await?;
        Ok(acquired)
    }

    async fn release(&self, key: &str, session_id: &str) -> Result<bool, CoordinationError> {
        let response = self
            .send(self.request(Method::PUT, &format!("kv/{}", key)).query(&[("release", session_id)]))
            .await?;
        if !response.status().is_success() {
            return Err(Self::lock_error(response, session_id).await);
        }

        let released: bool = Self::json(response).await?;
        Ok(released)
    }
}

fn status_error(status: StatusCode, body: &str) -> CoordinationError {
    if status.is_server_error() {
        CoordinationError::Transport(format!("{}: {}", status, body.trim()))
    } else {
        CoordinationError::Protocol(format!("{}: {}", status, body.trim()))
    }
}

/// Consul rejects acquire and release with a dead session as a 500 `invalid session`
fn lock_status_error(status: StatusCode, body: &str, session_id: &str) -> CoordinationError {
    if body.to_ascii_lowercase().contains("invalid session") {
        CoordinationError::SessionInvalid(session_id.to_string())
    } else {
        status_error(status, body)
    }
}
