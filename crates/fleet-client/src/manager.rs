//! Connection manager: discovery-to-connection resolution and pooling.
//!
//! # Resolution
//!
//! ```text
//! get_client_by_name(name)
//!   ├─ read lock:  pooled + READY/IDLE ─────────────────────► reuse
//!   └─ write lock: pooled + READY/IDLE (raced) ─────────────► reuse
//!                  pooled + unusable ──► close, evict
//!                  discover(name) ──► none ─────────────────► ServiceUnavailable
//!                                 └─► first record ──► dial ─► pool, count
//! ```
//!
//! The write lock is held across discovery and dial so two callers never
//! dial the same peer at once. Connection counters live behind their own lock.

use std::collections::HashMap;
use std::sync::Arc;

use fleet_core::config::FleetConfig;
use fleet_core::rpc::{ChannelConfig, PeerChannel};
use fleet_core::store::{ExpiringStore, open_store};
use fleet_core::{ConnectionStats, FleetError, Result, ServiceRecord};
use fleet_discovery::ServiceDirectory;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::configuration::{ConfigTransport, ConfigurationClient, HttpConfigTransport};
use crate::peers::{AuditClient, ExchangeClient, GenericServiceClient};

/// Logical name of the exchange simulator.
pub const EXCHANGE_SERVICE: &str = "exchange-simulator";

/// Logical name of the audit correlator.
pub const AUDIT_SERVICE: &str = "audit-correlator";

/// Façade business logic uses to reach peers.
///
/// Owns the service directory, the configuration client, and every pooled
/// peer connection.
pub struct ConnectionManager {
    directory: Arc<ServiceDirectory>,
    configuration: Arc<ConfigurationClient>,
    channel_config: ChannelConfig,
    well_known_services: Vec<String>,
    connections: RwLock<HashMap<String, Arc<PeerChannel>>>,
    stats: Mutex<ConnectionStats>,
}

impl ConnectionManager {
    /// Build a manager over an explicit store and configuration transport.
    /// Nothing is connected until [`initialize`](Self::initialize).
    pub fn new(
        config: &FleetConfig,
        store: Arc<dyn ExpiringStore>,
        transport: Arc<dyn ConfigTransport>,
    ) -> Result<Self> {
        let directory = Arc::new(ServiceDirectory::from_fleet_config(config, store)?);
        let configuration =
            Arc::new(ConfigurationClient::from_config(transport, &config.configuration));
        let channel_config = ChannelConfig {
            dial_timeout: config.connections.dial_timeout(),
            call_timeout: config.connections.call_timeout(),
            keepalive_interval: config.connections.keepalive_interval(),
        };
        Ok(Self {
            directory,
            configuration,
            channel_config,
            well_known_services: config.connections.well_known_services.clone(),
            connections: RwLock::new(HashMap::new()),
            stats: Mutex::new(ConnectionStats::default()),
        })
    }

    /// Build a manager from the registry and configuration-service URLs in `config`.
    pub fn from_config(config: &FleetConfig) -> Result<Self> {
        let store = open_store(&config.registry.url, config.registry.request_timeout())?;
        let transport = Arc::new(HttpConfigTransport::new(
            &config.configuration.url,
            config.configuration.request_timeout(),
        )?);
        Self::new(config, store, transport)
    }

    pub fn directory(&self) -> &Arc<ServiceDirectory> {
        &self.directory
    }

    pub fn configuration(&self) -> &Arc<ConfigurationClient> {
        &self.configuration
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Connect the directory (fatal on failure) and the configuration client
    /// (logged and skipped on failure).
    pub async fn initialize(&self) -> Result<()> {
        self.directory.connect().await?;

        if let Err(e) = self.configuration.connect().await {
            warn!("[manager] continuing without remote configuration: {e}");
        }

        info!("[manager] initialized");
        Ok(())
    }

    /// Close every pooled connection and disconnect both components.
    pub async fn cleanup(&self) {
        let drained: Vec<(String, Arc<PeerChannel>)> =
            self.connections.write().await.drain().collect();
        let closed = drained.len() as u64;
        for (name, channel) in drained {
            if let Err(e) = channel.close().await {
                warn!("[manager] failed to close connection to '{name}': {e}");
            }
        }
        {
            let mut stats = self.stats.lock().await;
            stats.active_connections = stats.active_connections.saturating_sub(closed);
        }

        self.directory.disconnect().await;
        self.configuration.disconnect().await;
        info!("[manager] cleaned up {closed} connection(s)");
    }

    // -----------------------------------------------------------------------
    // Clients
    // -----------------------------------------------------------------------

    /// Health-capable client for any peer.
    pub async fn get_client_by_name(&self, name: &str) -> Result<GenericServiceClient> {
        let channel = self.resolve(name).await?;
        Ok(GenericServiceClient::new(channel, name))
    }

    pub async fn get_exchange_client(&self) -> Result<ExchangeClient> {
        Ok(ExchangeClient::new(self.get_client_by_name(EXCHANGE_SERVICE).await?))
    }

    pub async fn get_audit_client(&self) -> Result<AuditClient> {
        Ok(AuditClient::new(self.get_client_by_name(AUDIT_SERVICE).await?))
    }

    // -----------------------------------------------------------------------
    // Observability
    // -----------------------------------------------------------------------

    /// Records for every well-known service. Names that fail to resolve are
    /// logged and skipped.
    pub async fn discover_services(&self) -> Vec<ServiceRecord> {
        let mut all = Vec::new();
        for name in &self.well_known_services {
            match self.directory.discover(name).await {
                Ok(records) => all.extend(records),
                Err(e) => warn!("[manager] discovery of '{name}' failed: {e}"),
            }
        }
        all
    }

    pub async fn get_connection_stats(&self) -> ConnectionStats {
        *self.stats.lock().await
    }

    // -----------------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------------

    async fn resolve(&self, name: &str) -> Result<Arc<PeerChannel>> {
        {
            let connections = self.connections.read().await;
            if let Some(channel) = connections.get(name) {
                if channel.state().is_usable() {
                    debug!("[manager] pool hit for '{name}'");
                    return Ok(Arc::clone(channel));
                }
            }
        }

        let mut connections = self.connections.write().await;
        if let Some(channel) = connections.get(name) {
            if channel.state().is_usable() {
                return Ok(Arc::clone(channel));
            }
            let stale = connections.remove(name);
            if let Some(stale) = stale {
                info!("[manager] evicting '{name}' connection in state {}", stale.state());
                if let Err(e) = stale.close().await {
                    warn!("[manager] failed to close stale connection to '{name}': {e}");
                }
                let mut stats = self.stats.lock().await;
                stats.active_connections = stats.active_connections.saturating_sub(1);
            }
        }

        let records = match self.directory.discover(name).await {
            Ok(records) => records,
            Err(e) => return Err(self.fail(name, format!("service discovery failed: {e}")).await),
        };
        let Some(record) = records.into_iter().next() else {
            return Err(self.fail(name, "no instances found").await);
        };

        let target = record.rpc_target();
        let channel = match PeerChannel::dial(&target, self.channel_config).await {
            Ok(channel) => Arc::new(channel),
            Err(e) => return Err(self.fail(name, e).await),
        };

        connections.insert(name.to_string(), Arc::clone(&channel));
        {
            let mut stats = self.stats.lock().await;
            stats.active_connections += 1;
            stats.total_connections += 1;
        }
        info!("[manager] connected to '{name}' at {target}");
        Ok(channel)
    }

    async fn fail(&self, name: &str, cause: impl std::fmt::Display) -> FleetError {
        self.stats.lock().await.failed_connections += 1;
        let err = FleetError::service_unavailable(name, cause);
        warn!("[manager] {err}");
        err
    }
}
