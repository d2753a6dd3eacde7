//! Configuration parsing for a fleet service process.
//!
//! Every process reads its settings from a single JSON file. Only
//! `service.name` is mandatory; every other field has a default suited to a
//! local development fleet.
//!
//! # Example config
//!
//! ```json
//! {
//!   "service": { "name": "custodian-simulator", "version": "1.0.0", "rpc_port": 9094 },
//!   "registry": {
//!     "url": "redis://localhost:6379", "ttl_secs": 90, "heartbeat_interval_secs": 30
//!   },
//!   "configuration": { "url": "http://localhost:8090", "cache_ttl_secs": 300 },
//!   "connections": { "dial_timeout_ms": 3000 },
//!   "logging": { "level": "info" }
//! }
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::{FleetError, Result};

/// Top-level process config, deserialized from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct FleetConfig {
    /// Identity this process advertises in the registry.
    pub service: ServiceConfig,

    /// Registry store and heartbeat settings.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Remote configuration service settings.
    #[serde(default)]
    pub configuration: ConfigServiceConfig,

    /// Peer connection settings.
    #[serde(default)]
    pub connections: ConnectionsConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl FleetConfig {
    /// Reject configurations that would break registry or timeout invariants.
    pub fn validate(&self) -> Result<()> {
        self.service.validate()?;
        self.registry.validate()?;
        self.configuration.validate()?;
        self.connections.validate()
    }
}

// ---------------------------------------------------------------------------
// service
// ---------------------------------------------------------------------------

/// Identity of the local process.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Logical name peers use to discover this process (e.g. `"custodian-simulator"`).
    pub name: String,

    /// Semantic version advertised in the registry record.
    #[serde(default = "default_version")]
    pub version: String,

    /// Host peers should dial.
    #[serde(default = "default_host")]
    pub host: String,

    /// Request/response (HTTP) port.
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Streaming RPC port; also part of the registry key.
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,
}

impl ServiceConfig {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(FleetError::Config("service.name must not be empty".into()));
        }
        if self.name.contains(':') {
            return Err(FleetError::Config(format!(
                "service.name '{}' must not contain ':'",
                self.name
            )));
        }
        if self.http_port == 0 || self.rpc_port == 0 {
            return Err(FleetError::Config("service ports must be non-zero".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// registry
// ---------------------------------------------------------------------------

/// Registry store settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Store URL: `redis://[:password@]host:port[/db]` or `memory://`.
    #[serde(default = "default_registry_url")]
    pub url: String,

    /// Prefix prepended to every registry key.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Record time-to-live in seconds.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Heartbeat interval in seconds.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,

    /// Bound on every individual store command, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: default_registry_url(),
            key_prefix: default_key_prefix(),
            ttl_secs: default_ttl_secs(),
            heartbeat_interval_secs: default_heartbeat_secs(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl RegistryConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_secs == 0 || self.request_timeout_ms == 0 {
            return Err(FleetError::Config("registry intervals must be non-zero".into()));
        }
        validate_ttl(self.ttl(), self.heartbeat_interval())
    }
}

/// A record must survive at least two missed heartbeats.
pub fn validate_ttl(ttl: Duration, heartbeat_interval: Duration) -> Result<()> {
    let Some(min_ttl) = heartbeat_interval.checked_mul(3) else {
        return Err(FleetError::Config(format!(
            "heartbeat interval {heartbeat_interval:?} is too large"
        )));
    };
    if ttl < min_ttl {
        return Err(FleetError::Config(format!(
            "registry ttl {ttl:?} must be at least 3x the heartbeat interval {heartbeat_interval:?}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// configuration service
// ---------------------------------------------------------------------------

/// Remote configuration service settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigServiceConfig {
    /// Base URL of the configuration service.
    #[serde(default = "default_config_url")]
    pub url: String,

    /// Bound on each HTTP call, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// How long a fetched value stays in the local cache, in seconds.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for ConfigServiceConfig {
    fn default() -> Self {
        Self {
            url: default_config_url(),
            request_timeout_ms: default_request_timeout_ms(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl ConfigServiceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0 {
            return Err(FleetError::Config(
                "configuration.request_timeout_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// connections
// ---------------------------------------------------------------------------

/// Peer connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionsConfig {
    /// Bound on establishing a peer connection, in milliseconds.
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    /// Bound on a single RPC call, in milliseconds.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Keepalive ping period; a connection with no RPC traffic for one
    /// period is reported idle.
    #[serde(default = "default_keepalive_ms")]
    pub keepalive_interval_ms: u64,

    /// Logical names queried by `discover_services`.
    #[serde(default = "default_well_known_services")]
    pub well_known_services: Vec<String>,
}

impl Default for ConnectionsConfig {
    fn default() -> Self {
        Self {
            dial_timeout_ms: default_dial_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            keepalive_interval_ms: default_keepalive_ms(),
            well_known_services: default_well_known_services(),
        }
    }
}

impl ConnectionsConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.dial_timeout_ms == 0
            || self.call_timeout_ms == 0
            || self.keepalive_interval_ms == 0
        {
            return Err(FleetError::Config("connection timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// logging
// ---------------------------------------------------------------------------

/// Logging settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for daily-rotating log files.
    #[serde(default)]
    pub log_dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_dir: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Default helpers (used by serde)
// ---------------------------------------------------------------------------

fn default_version() -> String {
    "0.1.0".into()
}

fn default_host() -> String {
    "localhost".into()
}

fn default_http_port() -> u16 {
    8080
}

fn default_rpc_port() -> u16 {
    9090
}

fn default_registry_url() -> String {
    "redis://localhost:6379".into()
}

fn default_key_prefix() -> String {
    "services:".into()
}

fn default_ttl_secs() -> u64 {
    90
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_config_url() -> String {
    "http://localhost:8090".into()
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_dial_timeout_ms() -> u64 {
    3000
}

fn default_call_timeout_ms() -> u64 {
    5000
}

fn default_keepalive_ms() -> u64 {
    30_000
}

fn default_well_known_services() -> Vec<String> {
    ["exchange-simulator", "audit-correlator", "custodian-simulator", "risk-monitor"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_log_level() -> String {
    "info".into()
}

/// Load, parse, and validate a JSON config file.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<FleetConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: FleetConfig = serde_json::from_str(&content)?;
    config.validate()?;
    Ok(config)
}
