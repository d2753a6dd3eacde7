//! In-process expiring store.
//!
//! Entries carry an expiry instant and are treated as absent once it passes;
//! expired entries are purged lazily on the next write or scan. Key listing is
//! returned in sorted order so "first record" selection is deterministic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ahash::AHashMap;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use super::{ExpiringStore, glob_match};
use crate::error::{FleetError, Result};

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Expiring store backed by a hash map under a reader/writer lock.
pub struct MemoryStore {
    entries: RwLock<AHashMap<String, Entry>>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(AHashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every call fails with
    /// [`FleetError::StoreUnavailable`]. Stored data is kept.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(FleetError::StoreUnavailable("memory store marked unavailable".into()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExpiringStore for MemoryStore {
    async fn connect(&self) -> Result<()> {
        self.check_available()
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| e.is_live(now));
        let entry = Entry {
            value: value.to_string(),
            expires_at: now + ttl,
        };
        entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        let now = Instant::now();
        let removed = self.entries.write().await.remove(key);
        Ok(removed.is_some_and(|e| e.is_live(now)))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| e.is_live(now));
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        debug!("[store] memory scan '{pattern}' matched {} key(s)", keys.len());
        Ok(keys)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
