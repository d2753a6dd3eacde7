//! Peer connection, health, and RPC payload types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Transport readiness
// ---------------------------------------------------------------------------

/// Transport-level readiness of a peer channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    /// Connected, but no RPC traffic for at least one keepalive period.
    Idle,
    Connecting,
    Ready,
    /// The transport failed; the channel will not recover.
    TransientFailure,
    Shutdown,
}

impl ConnectivityState {
    /// Only `Ready` and `Idle` channels may be reused from the pool.
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Ready | Self::Idle)
    }
}

impl std::fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Ready => write!(f, "READY"),
            Self::TransientFailure => write!(f, "TRANSIENT_FAILURE"),
            Self::Shutdown => write!(f, "SHUTDOWN"),
        }
    }
}

// ---------------------------------------------------------------------------
// Connection statistics
// ---------------------------------------------------------------------------

/// Process-local connection counters kept by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConnectionStats {
    pub active_connections: u64,
    pub total_connections: u64,
    pub failed_connections: u64,
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Serving status reported by a peer's health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServingStatus {
    #[default]
    Unknown,
    Serving,
    NotServing,
}

impl std::fmt::Display for ServingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "UNKNOWN"),
            Self::Serving => write!(f, "SERVING"),
            Self::NotServing => write!(f, "NOT_SERVING"),
        }
    }
}

/// `health.check` request body.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HealthCheckRequest {
    /// Sub-service name; empty means the whole server.
    #[serde(default)]
    pub service: String,
}

/// `health.check` response body.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: ServingStatus,
}

/// Result of a typed client's health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: ServingStatus,
    pub last_checked: DateTime<Utc>,
    pub details: String,
}

impl HealthStatus {
    pub fn is_serving(&self) -> bool {
        self.status == ServingStatus::Serving
    }
}

// ---------------------------------------------------------------------------
// Peer-specific payloads
// ---------------------------------------------------------------------------

/// Exchange simulator trading summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingStatus {
    pub active_trades: u64,
    pub total_volume: i64,
    pub last_trade_time: DateTime<Utc>,
}

/// Audit correlator event counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditMetrics {
    pub total_events: u64,
    pub correlated_events: u64,
    pub last_updated: DateTime<Utc>,
}

/// Counters exposed by a running RPC server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMetrics {
    pub active_connections: u64,
    pub total_requests: u64,
    pub uptime_secs: u64,
}
