//! Typed error definitions for the fleet connectivity layer.
//!
//! Provides [`FleetError`] so callers can branch on the failure kind (a peer
//! that is not up yet versus a broken configuration service) instead of
//! inspecting strings. All variants implement `std::error::Error` via
//! `thiserror`, so they integrate with `anyhow::Result` in binaries.

use thiserror::Error;

/// Result alias used across the fleet crates.
pub type Result<T> = std::result::Result<T, FleetError>;

/// Domain-specific errors for the fleet connectivity layer.
#[derive(Debug, Error)]
pub enum FleetError {
    /// The registry store could not be reached.
    #[error("registry store unavailable: {0}")]
    StoreUnavailable(String),

    /// A registry store command failed after the connection was established.
    #[error("registry store error: {0}")]
    Store(String),

    /// The configuration service did not answer its liveness check.
    #[error("configuration service unavailable: {0}")]
    ConfigServiceUnavailable(String),

    /// The configuration service reported that the key does not exist.
    #[error("configuration key '{key}' not found")]
    ConfigNotFound { key: String },

    /// The configuration service answered with an unexpected status.
    #[error("configuration service returned status {status}: {message}")]
    ConfigServiceError { status: u16, message: String },

    /// A configuration value could not be converted to the requested type.
    #[error("cannot convert '{value}' to {target}")]
    Conversion { value: String, target: &'static str },

    /// A peer could not be resolved or dialed.
    #[error("service '{name}' is unavailable: {cause}")]
    ServiceUnavailable { name: String, cause: String },

    /// Peer RPC transport or remote handler error.
    #[error("rpc error: {0}")]
    Rpc(String),

    /// A bounded network operation did not complete in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Local configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// JSON encoding or decoding error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Socket or file error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetError {
    /// Build a [`FleetError::ServiceUnavailable`] for `name`.
    pub fn service_unavailable(name: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::ServiceUnavailable {
            name: name.into(),
            cause: cause.to_string(),
        }
    }

    /// True when a peer could not be resolved or dialed.
    pub fn is_service_unavailable(&self) -> bool {
        matches!(self, Self::ServiceUnavailable { .. })
    }

    /// True when a bounded operation hit its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<tokio::time::error::Elapsed> for FleetError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        FleetError::Timeout(err.to_string())
    }
}
