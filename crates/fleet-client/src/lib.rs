//! # fleet-client
//!
//! Everything business logic needs to talk to the rest of the fleet.
//!
//! - [`configuration`]: read-through cache over the remote configuration service
//! - [`peers`]: typed clients layered on a pooled
//!   [`PeerChannel`](fleet_core::rpc::PeerChannel)
//! - [`manager`]: [`ConnectionManager`], the façade that discovers, dials and
//!   pools peers
//!
//! ## Lifecycle
//!
//! 1. Build a [`ConnectionManager`] from the process config.
//! 2. [`initialize`](ConnectionManager::initialize) once at startup.
//! 3. Ask for peers by name (`get_client_by_name`, `get_exchange_client`, ...).
//! 4. [`cleanup`](ConnectionManager::cleanup) once on shutdown.

pub mod configuration;
pub mod manager;
pub mod peers;

pub use configuration::{ConfigTransport, ConfigurationClient, HttpConfigTransport};
pub use manager::ConnectionManager;
pub use peers::{
    AuditClient, AuditMetricsProvider, ExchangeClient, GenericServiceClient, HealthCheckable,
    TradingStatusProvider,
};
