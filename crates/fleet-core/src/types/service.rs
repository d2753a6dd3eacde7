//! Registry records describing one running service instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ServiceConfig;

// ---------------------------------------------------------------------------
// ServiceStatus
// ---------------------------------------------------------------------------

/// Lifecycle status advertised in a registry record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ServiceStatus {
    #[default]
    Starting = 0,
    Healthy = 1,
    Degraded = 2,
}

impl ServiceStatus {
    /// Decode the `repr(u8)` discriminant, falling back to `Starting`.
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Healthy,
            2 => Self::Degraded,
            _ => Self::Starting,
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
        }
    }
}

// ---------------------------------------------------------------------------
// ServiceRecord
// ---------------------------------------------------------------------------

/// One running instance of a logical service, as stored in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Logical name (e.g. `"exchange-simulator"`).
    pub name: String,
    /// Semantic version.
    pub version: String,
    /// Host peers should dial.
    pub host: String,
    /// Streaming RPC port. Older peers publish it as `grpc_port`.
    #[serde(alias = "grpc_port")]
    pub rpc_port: u16,
    /// Request/response (HTTP) port.
    pub http_port: u16,
    /// Advertised lifecycle status.
    pub status: ServiceStatus,
    /// When the owning process last refreshed this record.
    pub last_seen: DateTime<Utc>,
}

impl ServiceRecord {
    /// Build the initial record for the local process (status `starting`).
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            name: config.name.clone(),
            version: config.version.clone(),
            host: config.host.clone(),
            rpc_port: config.rpc_port,
            http_port: config.http_port,
            status: ServiceStatus::Starting,
            last_seen: Utc::now(),
        }
    }

    /// Registry key: `{prefix}{name}:{host}:{rpc_port}`.
    ///
    /// Re-registering the same instance overwrites this key in place.
    pub fn storage_key(&self, prefix: &str) -> String {
        format!("{prefix}{}:{}:{}", self.name, self.host, self.rpc_port)
    }

    /// `host:rpc_port` dial target.
    pub fn rpc_target(&self) -> String {
        format!("{}:{}", self.host, self.rpc_port)
    }
}
