//! Typed peer clients.
//!
//! Every client wraps a pooled [`PeerChannel`] and answers health checks
//! ([`HealthCheckable`]). Peer-specific capabilities are extension traits on
//! top of it, and the concrete clients compose a [`GenericServiceClient`]
//! rather than re-implementing the health call.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use fleet_core::rpc::{AUDIT_METRICS, EXCHANGE_TRADING_STATUS, HEALTH_CHECK, PeerChannel};
use fleet_core::{
    AuditMetrics, HealthCheckRequest, HealthCheckResponse, HealthStatus, Result, TradingStatus,
};
use serde_json::Value;

/// Anything that can report whether its peer is serving.
#[async_trait]
pub trait HealthCheckable: Send + Sync {
    /// Logical name of the peer.
    fn service_name(&self) -> &str;

    async fn health_check(&self) -> Result<HealthStatus>;
}

/// Exchange simulator capabilities.
#[async_trait]
pub trait TradingStatusProvider: HealthCheckable {
    async fn get_trading_status(&self) -> Result<TradingStatus>;
}

/// Audit correlator capabilities.
#[async_trait]
pub trait AuditMetricsProvider: HealthCheckable {
    async fn get_audit_metrics(&self) -> Result<AuditMetrics>;
}

// ---------------------------------------------------------------------------
// GenericServiceClient
// ---------------------------------------------------------------------------

/// Health-only client for any peer.
#[derive(Debug, Clone)]
pub struct GenericServiceClient {
    channel: Arc<PeerChannel>,
    service_name: String,
}

impl GenericServiceClient {
    pub fn new(channel: Arc<PeerChannel>, service_name: impl Into<String>) -> Self {
        Self {
            channel,
            service_name: service_name.into(),
        }
    }

    /// The pooled connection this client uses.
    pub fn channel(&self) -> &Arc<PeerChannel> {
        &self.channel
    }

    async fn call_no_params<R: serde::de::DeserializeOwned>(&self, method: &str) -> Result<R> {
        self.channel.call(method, &Value::Null).await
    }
}

#[async_trait]
impl HealthCheckable for GenericServiceClient {
    fn service_name(&self) -> &str {
        &self.service_name
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        let request = HealthCheckRequest {
            service: self.service_name.clone(),
        };
        let response: HealthCheckResponse = self.channel.call(HEALTH_CHECK, &request).await?;
        Ok(HealthStatus {
            status: response.status,
            last_checked: Utc::now(),
            details: format!("{} at {}", self.service_name, self.channel.target()),
        })
    }
}

// ---------------------------------------------------------------------------
// ExchangeClient
// ---------------------------------------------------------------------------

/// Client for the exchange simulator.
#[derive(Clone)]
pub struct ExchangeClient {
    inner: GenericServiceClient,
}

impl ExchangeClient {
    pub fn new(inner: GenericServiceClient) -> Self {
        Self { inner }
    }

    pub fn channel(&self) -> &Arc<PeerChannel> {
        self.inner.channel()
    }
}

#[async_trait]
impl HealthCheckable for ExchangeClient {
    fn service_name(&self) -> &str {
        self.inner.service_name()
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        self.inner.health_check().await
    }
}

#[async_trait]
impl TradingStatusProvider for ExchangeClient {
    async fn get_trading_status(&self) -> Result<TradingStatus> {
        self.inner.call_no_params(EXCHANGE_TRADING_STATUS).await
    }
}

// ---------------------------------------------------------------------------
// AuditClient
// ---------------------------------------------------------------------------

/// Client for the audit correlator.
#[derive(Clone)]
pub struct AuditClient {
    inner: GenericServiceClient,
}

impl AuditClient {
    pub fn new(inner: GenericServiceClient) -> Self {
        Self { inner }
    }

    pub fn channel(&self) -> &Arc<PeerChannel> {
        self.inner.channel()
    }
}

#[async_trait]
impl HealthCheckable for AuditClient {
    fn service_name(&self) -> &str {
        self.inner.service_name()
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        self.inner.health_check().await
    }
}

#[async_trait]
impl AuditMetricsProvider for AuditClient {
    async fn get_audit_metrics(&self) -> Result<AuditMetrics> {
        self.inner.call_no_params(AUDIT_METRICS).await
    }
}
