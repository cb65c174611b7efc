//! Configuration module for the Raftainer node agent
//!
//! Supports configuration via:
//! - Optional `config/raftainer.*` and `/etc/raftainer/config.*` files in any
//!   format the `config` crate detects (TOML, YAML, JSON, ...)
//! - Environment variables prefixed `RAFTAINER__` with `__` between nested
//!   keys, e.g. `RAFTAINER__NODE_NAME` or `RAFTAINER__CONSUL__ADDRESS`

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Node name registered with the coordination service
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Region recorded in every slot lock this host takes
    #[serde(default = "default_region")]
    pub region: String,

    /// Skip waiting for a previous session of this host to expire
    #[serde(default)]
    pub fast_startup: bool,

    /// Root namespace in the key/value store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Seconds between orchestration passes
    #[serde(default = "default_orchestration_interval")]
    pub orchestration_interval_seconds: u64,

    #[serde(default)]
    pub consul: ConsulConfig,

    #[serde(default)]
    pub docker: DockerConfig,

    #[serde(default)]
    pub session: SessionSettings,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Consul agent connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsulConfig {
    /// Consul HTTP address
    #[serde(default = "default_consul_address")]
    pub address: String,

    /// ACL token sent as X-Consul-Token
    #[serde(default)]
    pub token: Option<String>,

    /// Datacenter override
    #[serde(default)]
    pub datacenter: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_consul_timeout")]
    pub timeout_seconds: u64,
}

/// Docker engine connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Unix socket path; the platform default is used when unset
    #[serde(default)]
    pub socket: Option<String>,

    /// Request timeout in seconds (image pulls can be slow)
    #[serde(default = "default_docker_timeout")]
    pub timeout_seconds: u64,
}

/// Host session lease settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_session_ttl")]
    pub ttl_seconds: u64,

    /// Quarantine after session death before its locks can be re-acquired
    #[serde(default = "default_lock_delay")]
    pub lock_delay_seconds: u64,

    #[serde(default = "default_renew_interval")]
    pub renew_interval_seconds: u64,

    /// Upper bound of the randomized wait while an old session is still alive
    #[serde(default = "default_startup_backoff")]
    pub max_startup_backoff_seconds: u64,
}

impl SessionSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn lock_delay(&self) -> Duration {
        Duration::from_secs(self.lock_delay_seconds)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_secs(self.renew_interval_seconds)
    }

    pub fn max_startup_backoff(&self) -> Duration {
        Duration::from_secs(self.max_startup_backoff_seconds)
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Serve Prometheus metrics
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address of the metrics endpoint
    #[serde(default = "default_metrics_addr")]
    pub listen_addr: String,
}

// Default value functions
fn default_node_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn default_region() -> String {
    "default".to_string()
}

fn default_key_prefix() -> String {
    "raftainer".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_orchestration_interval() -> u64 {
    10
}

fn default_consul_address() -> String {
    "http://127.0.0.1:8500".to_string()
}

fn default_consul_timeout() -> u64 {
    10
}

fn default_docker_timeout() -> u64 {
    300
}

fn default_session_ttl() -> u64 {
    10
}

fn default_lock_delay() -> u64 {
    10
}

fn default_renew_interval() -> u64 {
    5
}

fn default_startup_backoff() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9464".to_string()
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: default_consul_address(),
            token: None,
            datacenter: None,
            timeout_seconds: default_consul_timeout(),
        }
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket: None,
            timeout_seconds: default_docker_timeout(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl_seconds: default_session_ttl(),
            lock_delay_seconds: default_lock_delay(),
            renew_interval_seconds: default_renew_interval(),
            max_startup_backoff_seconds: default_startup_backoff(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: default_metrics_addr(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            region: default_region(),
            fast_startup: false,
            key_prefix: default_key_prefix(),
            log_level: default_log_level(),
            orchestration_interval_seconds: default_orchestration_interval(),
            consul: ConsulConfig::default(),
            docker: DockerConfig::default(),
            session: SessionSettings::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file and environment variables
    pub fn load() -> Result<Self> {
        // Try to load .env file if present
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config/raftainer").required(false))
            .add_source(config::File::with_name("/etc/raftainer/config").required(false))
            // Override with environment variables (RAFTAINER_ prefix)
            .add_source(
                config::Environment::with_prefix("RAFTAINER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;

        Ok(app_config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            anyhow::bail!("Node name cannot be empty");
        }

        if self.session.ttl_seconds == 0 {
            anyhow::bail!("Session TTL cannot be 0");
        }

        if self.session.renew_interval_seconds == 0
            || self.session.renew_interval_seconds * 2 > self.session.ttl_seconds
        {
            anyhow::bail!(
                "Session renew interval must be between 1 and half the TTL ({}s)",
                self.session.ttl_seconds
            );
        }

        if self.orchestration_interval_seconds == 0 {
            anyhow::bail!("Orchestration interval cannot be 0");
        }

        if self.consul.timeout_seconds == 0 {
            anyhow::bail!("Consul timeout cannot be 0");
        }

        Ok(())
    }

    /// Key under which all pods are declared
    pub fn pods_prefix(&self) -> String {
        format!("{}/pods", self.key_prefix.trim_end_matches('/'))
    }

    pub fn orchestration_interval(&self) -> Duration {
        Duration::from_secs(self.orchestration_interval_seconds)
    }
}
