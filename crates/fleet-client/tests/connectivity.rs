//! End-to-end: one process registers and serves RPC, another discovers it,
//! dials it through the connection manager, and calls it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_client::{
    ConfigTransport, ConnectionManager, HealthCheckable, TradingStatusProvider,
};
use fleet_core::config::FleetConfig;
use fleet_core::rpc::{EXCHANGE_TRADING_STATUS, RpcHandler, RpcServer, RpcServerHandle};
use fleet_core::store::{ExpiringStore, MemoryStore};
use fleet_core::{ConfigurationValue, ConnectivityState, FleetError, Result, ServingStatus};
use fleet_discovery::ServiceDirectory;
use serde_json::{Value, json};

struct NoConfigService;

#[async_trait]
impl ConfigTransport for NoConfigService {
    async fn check_health(&self) -> Result<()> {
        Err(FleetError::ConfigServiceUnavailable("connection refused".into()))
    }

    async fn fetch(&self, key: &str) -> Result<ConfigurationValue> {
        Err(FleetError::ConfigNotFound {
            key: key.to_string(),
        })
    }
}

struct TradingStatusHandler;

#[async_trait]
impl RpcHandler for TradingStatusHandler {
    async fn handle(&self, _params: Value) -> Result<Value> {
        Ok(json!({
            "active_trades": 4,
            "total_volume": 1_250_000,
            "last_trade_time": "2024-05-01T12:00:00Z"
        }))
    }
}

fn config(name: &str, rpc_port: u16) -> FleetConfig {
    serde_json::from_value(json!({
        "service": { "name": name, "host": "127.0.0.1", "rpc_port": rpc_port },
        "connections": { "dial_timeout_ms": 1000, "call_timeout_ms": 2000 }
    }))
    .unwrap()
}

/// Process A: an exchange simulator serving RPC and registered in `store`.
async fn start_exchange(store: &Arc<MemoryStore>) -> (RpcServerHandle, Arc<ServiceDirectory>) {
    let mut server = RpcServer::bind("127.0.0.1:0").await.unwrap();
    server.register(EXCHANGE_TRADING_STATUS, Arc::new(TradingStatusHandler));
    let handle = server.start().unwrap();

    let store: Arc<dyn ExpiringStore> = store.clone();
    let config = config("exchange-simulator", handle.local_addr().port());
    let directory = Arc::new(ServiceDirectory::from_fleet_config(&config, store).unwrap());
    directory.connect().await.unwrap();
    directory.register_self().await.unwrap();
    (handle, directory)
}

/// Process B: the custodian, reaching peers through its manager.
async fn start_custodian(store: &Arc<MemoryStore>) -> ConnectionManager {
    let store: Arc<dyn ExpiringStore> = store.clone();
    let config = config("custodian-simulator", 9094);
    let manager = ConnectionManager::new(&config, store, Arc::new(NoConfigService)).unwrap();
    manager.initialize().await.unwrap();
    manager
}

#[tokio::test]
async fn discover_dial_and_health_check() {
    let store = Arc::new(MemoryStore::new());
    let (mut server, _exchange_dir) = start_exchange(&store).await;
    let manager = start_custodian(&store).await;

    let found = manager
        .directory()
        .discover("exchange-simulator")
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].rpc_port, server.local_addr().port());

    // Not configured yet: the sub-service is unknown to the peer.
    let client = manager.get_client_by_name("exchange-simulator").await.unwrap();
    assert!(matches!(client.health_check().await, Err(FleetError::Rpc(_))));

    server
        .health()
        .set_serving_status("exchange-simulator", ServingStatus::Serving)
        .await;
    let health = client.health_check().await.unwrap();
    assert_eq!(health.status, ServingStatus::Serving);

    manager.cleanup().await;
    server.stop().await;
}

#[tokio::test]
async fn pooled_connection_is_reused() {
    let store = Arc::new(MemoryStore::new());
    let (mut server, _exchange_dir) = start_exchange(&store).await;
    let manager = start_custodian(&store).await;

    let first = manager.get_exchange_client().await.unwrap();
    let second = manager.get_exchange_client().await.unwrap();
    assert!(Arc::ptr_eq(first.channel(), second.channel()));

    let stats = manager.get_connection_stats().await;
    assert_eq!(stats.active_connections, 1);
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.failed_connections, 0);

    let status = second.get_trading_status().await.unwrap();
    assert_eq!(status.active_trades, 4);
    assert_eq!(status.total_volume, 1_250_000);

    manager.cleanup().await;
    assert_eq!(manager.get_connection_stats().await.active_connections, 0);
    assert_eq!(first.channel().state(), ConnectivityState::Shutdown);
    server.stop().await;
}

#[tokio::test]
async fn dead_connection_is_evicted_and_redialed() {
    let store = Arc::new(MemoryStore::new());
    let (mut server, _exchange_dir) = start_exchange(&store).await;
    let manager = start_custodian(&store).await;

    let first = manager.get_exchange_client().await.unwrap();
    first.channel().close().await.unwrap();

    let second = manager.get_exchange_client().await.unwrap();
    assert!(!Arc::ptr_eq(first.channel(), second.channel()));
    assert!(second.channel().state().is_usable());

    let stats = manager.get_connection_stats().await;
    assert_eq!(stats.active_connections, 1);
    assert_eq!(stats.total_connections, 2);

    manager.cleanup().await;
    server.stop().await;
}

#[tokio::test]
async fn missing_peer_is_service_unavailable() {
    let store = Arc::new(MemoryStore::new());
    let manager = start_custodian(&store).await;

    let err = manager.get_client_by_name("no-such-service").await.unwrap_err();
    assert!(matches!(
        &err,
        FleetError::ServiceUnavailable { name, .. } if name == "no-such-service"
    ));
    assert_eq!(manager.get_connection_stats().await.failed_connections, 1);
}

#[tokio::test]
async fn deregistered_peer_disappears_from_discovery() {
    let store = Arc::new(MemoryStore::new());
    let (mut server, exchange_dir) = start_exchange(&store).await;
    let manager = start_custodian(&store).await;
    manager.directory().register_self().await.unwrap();

    let names: Vec<String> = manager
        .discover_services()
        .await
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(names, vec!["exchange-simulator", "custodian-simulator"]);

    exchange_dir.disconnect().await;
    server.stop().await;

    let names: Vec<String> = manager
        .discover_services()
        .await
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(names, vec!["custodian-simulator"]);

    tokio::time::timeout(Duration::from_secs(5), manager.cleanup()).await.unwrap();
}
