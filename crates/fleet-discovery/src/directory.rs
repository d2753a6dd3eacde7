//! Service directory and heartbeat loop.
//!
//! ```text
//! register_self() ──► SET {prefix}{name}:{host}:{port} <record> PX ttl
//! heartbeat tick  ──► same write with the current status and a fresh timestamp
//! discover(name)  ──► SCAN {prefix}{name}:* ──► GET each ──► Vec<ServiceRecord>
//! disconnect()    ──► stop heartbeat ──► DEL own key ──► close store
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_core::config::{FleetConfig, RegistryConfig, ServiceConfig, validate_ttl};
use fleet_core::store::{ExpiringStore, escape_glob};
use fleet_core::{FleetError, Result, ServiceRecord, ServiceStatus};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Registry timing and naming for one directory.
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub key_prefix: String,
    pub ttl: Duration,
    pub heartbeat_interval: Duration,
}

impl DirectoryConfig {
    pub fn from_registry(registry: &RegistryConfig) -> Self {
        Self {
            key_prefix: registry.key_prefix.clone(),
            ttl: registry.ttl(),
            heartbeat_interval: registry.heartbeat_interval(),
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self::from_registry(&RegistryConfig::default())
    }
}

/// Registers this process in the registry and looks up peers.
///
/// Shared as `Arc<ServiceDirectory>` between the connection manager and the
/// heartbeat task. Only `status` and `last_seen` change after construction,
/// both through atomics.
pub struct ServiceDirectory {
    store: Arc<dyn ExpiringStore>,
    config: DirectoryConfig,
    identity: ServiceRecord,
    status: AtomicU8,
    last_seen_ms: AtomicI64,
    heartbeat_stop: watch::Sender<bool>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceDirectory {
    /// Build a directory for the local `service`.
    ///
    /// Fails with [`FleetError::Config`] when the TTL is shorter than three
    /// heartbeat intervals.
    pub fn new(
        config: DirectoryConfig,
        service: &ServiceConfig,
        store: Arc<dyn ExpiringStore>,
    ) -> Result<Self> {
        validate_ttl(config.ttl, config.heartbeat_interval)?;
        let identity = ServiceRecord::from_config(service);
        let (heartbeat_stop, _) = watch::channel(false);
        Ok(Self {
            store,
            status: AtomicU8::new(identity.status as u8),
            last_seen_ms: AtomicI64::new(identity.last_seen.timestamp_millis()),
            identity,
            config,
            heartbeat_stop,
            heartbeat_task: Mutex::new(None),
        })
    }

    pub fn from_fleet_config(
        config: &FleetConfig,
        store: Arc<dyn ExpiringStore>,
    ) -> Result<Self> {
        Self::new(DirectoryConfig::from_registry(&config.registry), &config.service, store)
    }

    /// Registry key of this process's own record.
    pub fn own_key(&self) -> String {
        self.identity.storage_key(&self.config.key_prefix)
    }

    /// Snapshot of the in-memory record.
    pub fn record(&self) -> ServiceRecord {
        let last_seen = DateTime::from_timestamp_millis(self.last_seen_ms.load(Ordering::Acquire))
            .unwrap_or(self.identity.last_seen);
        ServiceRecord {
            status: self.status(),
            last_seen,
            ..self.identity.clone()
        }
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Change the advertised status. Written by the next heartbeat, not now.
    pub fn update_status(&self, status: ServiceStatus) {
        let previous = ServiceStatus::from_u8(self.status.swap(status as u8, Ordering::AcqRel));
        if previous != status {
            info!("[directory] status {previous} -> {status} (published on next heartbeat)");
        }
    }

    // -----------------------------------------------------------------------
    // Store lifecycle
    // -----------------------------------------------------------------------

    /// Connect to the registry store.
    pub async fn connect(&self) -> Result<()> {
        self.store.connect().await.map_err(|e| match e {
            FleetError::StoreUnavailable(_) => e,
            other => FleetError::StoreUnavailable(other.to_string()),
        })?;
        info!("[directory] connected to registry store");
        Ok(())
    }

    /// Stop the heartbeat, remove our record, and close the store.
    ///
    /// Never fails: deregistration and close errors are logged.
    pub async fn disconnect(&self) {
        self.stop_heartbeat().await;

        let key = self.own_key();
        match self.store.delete(&key).await {
            Ok(true) => info!("[directory] deregistered {key}"),
            Ok(false) => debug!("[directory] {key} was already gone"),
            Err(e) => warn!("[directory] failed to deregister {key}: {e}"),
        }
        if let Err(e) = self.store.close().await {
            warn!("[directory] failed to close registry store: {e}");
        }
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Mark this process healthy and write its record with a fresh TTL.
    pub async fn register_self(&self) -> Result<()> {
        self.status.store(ServiceStatus::Healthy as u8, Ordering::Release);
        self.refresh().await?;
        info!(
            "[directory] registered {} ({}) ttl={:?}",
            self.identity.name,
            self.identity.rpc_target(),
            self.config.ttl
        );
        Ok(())
    }

    /// Rewrite the record with the current status, a fresh timestamp, and a
    /// renewed TTL. This is what each heartbeat does.
    pub async fn refresh(&self) -> Result<()> {
        let now = Utc::now();
        self.last_seen_ms.store(now.timestamp_millis(), Ordering::Release);
        let record = ServiceRecord {
            status: self.status(),
            last_seen: now,
            ..self.identity.clone()
        };
        let payload = serde_json::to_string(&record)?;
        let key = record.storage_key(&self.config.key_prefix);
        self.store.set_ex(&key, &payload, self.config.ttl).await
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    /// All live records registered under `name`, in store key order.
    ///
    /// An empty result means the peer is not currently up. Entries that
    /// vanish between scan and read, or fail to decode, are skipped.
    pub async fn discover(&self, name: &str) -> Result<Vec<ServiceRecord>> {
        let pattern = format!("{}{}:*", escape_glob(&self.config.key_prefix), escape_glob(name));
        let keys = self.store.keys(&pattern).await?;

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let raw = match self.store.get(&key).await {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    debug!("[directory] {key} expired during discovery");
                    continue;
                }
                Err(e) => {
                    warn!("[directory] skipping unreadable entry {key}: {e}");
                    continue;
                }
            };
            match serde_json::from_str::<ServiceRecord>(&raw) {
                Ok(record) if record.name == name => records.push(record),
                Ok(record) => {
                    debug!("[directory] {key} belongs to '{}', not '{name}'", record.name)
                }
                Err(e) => warn!("[directory] skipping malformed entry {key}: {e}"),
            }
        }

        debug!("[directory] discovered {} instance(s) of '{name}'", records.len());
        Ok(records)
    }

    // -----------------------------------------------------------------------
    // Heartbeat
    // -----------------------------------------------------------------------

    /// Refresh the record every heartbeat interval until `stop` fires or its
    /// sender is dropped. Failed writes are logged and retried on the next
    /// tick. No write happens on exit.
    pub async fn run_heartbeat(&self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // skip the immediate first tick

        info!("[directory] heartbeat started every {:?}", self.config.heartbeat_interval);
        loop {
            if *stop.borrow_and_update() {
                break;
            }
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.refresh().await {
                        Ok(()) => debug!("[directory] heartbeat for {}", self.own_key()),
                        Err(e) => error!("[directory] heartbeat failed, retrying next tick: {e}"),
                    }
                }
            }
        }
        info!("[directory] heartbeat stopped");
    }

    /// Run the heartbeat on a background task. Replaces any running one.
    pub async fn spawn_heartbeat(self: &Arc<Self>) {
        self.stop_heartbeat().await;
        self.heartbeat_stop.send_replace(false);
        let stop = self.heartbeat_stop.subscribe();
        let directory = Arc::clone(self);
        let task = tokio::spawn(async move { directory.run_heartbeat(stop).await });
        *self.heartbeat_task.lock().await = Some(task);
    }

    /// Signal the heartbeat to stop and wait for it.
    pub async fn stop_heartbeat(&self) {
        self.heartbeat_stop.send_replace(true);
        let task = self.heartbeat_task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("[directory] heartbeat task ended abnormally: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use fleet_core::store::MemoryStore;

    use super::*;

    fn service(name: &str, port: u16) -> ServiceConfig {
        ServiceConfig {
            name: name.into(),
            version: "1.0.0".into(),
            host: "127.0.0.1".into(),
            http_port: 8080,
            rpc_port: port,
        }
    }

    fn fast_config(ttl_ms: u64) -> DirectoryConfig {
        DirectoryConfig {
            key_prefix: "services:".into(),
            ttl: Duration::from_millis(ttl_ms),
            heartbeat_interval: Duration::from_millis(ttl_ms / 3),
        }
    }

    fn directory(store: &Arc<MemoryStore>, name: &str, ttl_ms: u64) -> Arc<ServiceDirectory> {
        let store: Arc<dyn ExpiringStore> = store.clone();
        Arc::new(ServiceDirectory::new(fast_config(ttl_ms), &service(name, 9091), store).unwrap())
    }

    #[test]
    fn short_ttl_is_rejected() {
        let config = DirectoryConfig {
            key_prefix: "services:".into(),
            ttl: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
        };
        let store: Arc<dyn ExpiringStore> = Arc::new(MemoryStore::new());
        assert!(matches!(
            ServiceDirectory::new(config, &service("risk-monitor", 9095), store),
            Err(FleetError::Config(_))
        ));
    }

    #[tokio::test]
    async fn discover_unknown_name_is_empty() {
        let store = Arc::new(MemoryStore::new());
        let dir = directory(&store, "custodian-simulator", 90_000);
        dir.connect().await.unwrap();
        let found = dir.discover("exchange-simulator").await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn register_then_discover_sees_own_record() {
        let store = Arc::new(MemoryStore::new());
        let dir = directory(&store, "exchange-simulator", 90_000);
        dir.register_self().await.unwrap();

        let found = dir.discover("exchange-simulator").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].status, ServiceStatus::Healthy);
        assert_eq!(found[0].rpc_target(), "127.0.0.1:9091");
        assert_eq!(dir.record().status, ServiceStatus::Healthy);
    }

    #[tokio::test]
    async fn reregistration_overwrites_in_place() {
        let store = Arc::new(MemoryStore::new());
        let dir = directory(&store, "exchange-simulator", 90_000);
        dir.register_self().await.unwrap();
        dir.register_self().await.unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn prefix_names_do_not_collide() {
        let store = Arc::new(MemoryStore::new());
        for name in ["audit", "audit-correlator"] {
            directory(&store, name, 90_000).register_self().await.unwrap();
        }

        let dir = directory(&store, "risk-monitor", 90_000);
        assert_eq!(dir.discover("audit").await.unwrap().len(), 1);
        assert_eq!(dir.discover("audit-correlator").await.unwrap().len(), 1);
        assert!(dir.discover("audit*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn record_expires_without_heartbeat() {
        let store = Arc::new(MemoryStore::new());
        let dir = directory(&store, "exchange-simulator", 60);
        dir.register_self().await.unwrap();
        assert_eq!(dir.discover("exchange-simulator").await.unwrap().len(), 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        let found = dir.discover("exchange-simulator").await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn heartbeat_keeps_record_alive_until_stopped() {
        let store = Arc::new(MemoryStore::new());
        let dir = directory(&store, "exchange-simulator", 150);
        dir.register_self().await.unwrap();
        dir.spawn_heartbeat().await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(dir.discover("exchange-simulator").await.unwrap().len(), 1);

        dir.stop_heartbeat().await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        let found = dir.discover("exchange-simulator").await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn status_change_is_published_by_next_refresh() {
        let store = Arc::new(MemoryStore::new());
        let dir = directory(&store, "exchange-simulator", 90_000);
        dir.register_self().await.unwrap();

        dir.update_status(ServiceStatus::Degraded);
        let found = dir.discover("exchange-simulator").await.unwrap();
        assert_eq!(found[0].status, ServiceStatus::Healthy);

        dir.refresh().await.unwrap();
        let found = dir.discover("exchange-simulator").await.unwrap();
        assert_eq!(found[0].status, ServiceStatus::Degraded);
    }

    #[tokio::test]
    async fn stop_signal_ends_heartbeat_promptly() {
        let store = Arc::new(MemoryStore::new());
        let store_dyn: Arc<dyn ExpiringStore> = store.clone();
        let config = DirectoryConfig {
            key_prefix: "services:".into(),
            ttl: Duration::from_secs(90),
            heartbeat_interval: Duration::from_secs(30),
        };
        let service = service("risk-monitor", 9095);
        let dir = Arc::new(ServiceDirectory::new(config, &service, store_dyn).unwrap());

        let (stop_tx, stop_rx) = watch::channel(false);
        let runner = Arc::clone(&dir);
        let task = tokio::spawn(async move { runner.run_heartbeat(stop_rx).await });

        stop_tx.send(true).unwrap();
        assert!(tokio::time::timeout(Duration::from_secs(1), task).await.is_ok());
        // No final write on exit.
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn malformed_entries_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let dir = directory(&store, "exchange-simulator", 90_000);
        dir.register_self().await.unwrap();
        let ttl = Duration::from_secs(60);
        store.set_ex("services:exchange-simulator:bad:1", "{not json", ttl).await.unwrap();

        let found = dir.discover("exchange-simulator").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].host, "127.0.0.1");
    }

    #[tokio::test]
    async fn heartbeat_survives_store_outage() {
        let store = Arc::new(MemoryStore::new());
        let dir = directory(&store, "exchange-simulator", 150);
        dir.register_self().await.unwrap();
        dir.spawn_heartbeat().await;

        store.set_available(false);
        tokio::time::sleep(Duration::from_millis(120)).await;
        store.set_available(true);
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(dir.discover("exchange-simulator").await.unwrap().len(), 1);
        dir.stop_heartbeat().await;
    }

    #[tokio::test]
    async fn disconnect_deregisters_and_never_fails() {
        let store = Arc::new(MemoryStore::new());
        let dir = directory(&store, "exchange-simulator", 90_000);
        dir.connect().await.unwrap();
        dir.register_self().await.unwrap();
        dir.disconnect().await;
        assert!(store.is_empty().await);

        let other = directory(&store, "audit-correlator", 90_000);
        other.register_self().await.unwrap();
        store.set_available(false);
        other.disconnect().await;
    }

    #[tokio::test]
    async fn store_outage_is_store_unavailable() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let dir = directory(&store, "exchange-simulator", 90_000);
        assert!(matches!(dir.connect().await, Err(FleetError::StoreUnavailable(_))));
    }
}
