//! Configuration cache client.
//!
//! Values are fetched from the remote configuration service on first use and
//! cached locally until `now + cache_ttl`. An entry past its expiry is treated
//! as absent: the next lookup counts a miss and re-fetches, even though the
//! old entry is still in the map until it is replaced.
//!
//! The cache map and the hit/miss counters sit behind separate locks so
//! accounting never blocks a lookup of another key.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use async_trait::async_trait;
use fleet_core::config::ConfigServiceConfig;
use fleet_core::{CacheStats, ConfigurationValue, FleetError, Result};
use tokio::sync::{Mutex, RwLock};
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};
use url::Url;

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Request/response access to the configuration service.
#[async_trait]
pub trait ConfigTransport: Send + Sync {
    /// Liveness check.
    async fn check_health(&self) -> Result<()>;

    /// Fetch one value. Fails with [`FleetError::ConfigNotFound`] if the
    /// service does not know `key`.
    async fn fetch(&self, key: &str) -> Result<ConfigurationValue>;
}

/// HTTP transport.
///
/// | Operation | Method | Path                     |
/// |-----------|--------|--------------------------|
/// | Health    | GET    | `/health`                |
/// | Fetch     | GET    | `/configuration?key=...` |
pub struct HttpConfigTransport {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpConfigTransport {
    /// `base_url` is the service root, e.g. `http://localhost:8090`.
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let mut base_url = Url::parse(base_url).map_err(|e| {
            FleetError::Config(format!("invalid configuration service url '{base_url}': {e}"))
        })?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| FleetError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self { http, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| FleetError::Config(format!("invalid endpoint '{path}': {e}")))
    }
}

fn transport_error(e: reqwest::Error) -> FleetError {
    if e.is_timeout() {
        FleetError::Timeout(format!("configuration service: {e}"))
    } else {
        FleetError::ConfigServiceUnavailable(e.to_string())
    }
}

#[async_trait]
impl ConfigTransport for HttpConfigTransport {
    async fn check_health(&self) -> Result<()> {
        let url = self.endpoint("health")?;
        let resp = self.http.get(url).send().await.map_err(transport_error)?;
        if !resp.status().is_success() {
            let msg = format!("health check returned {}", resp.status());
            return Err(FleetError::ConfigServiceUnavailable(msg));
        }
        Ok(())
    }

    async fn fetch(&self, key: &str) -> Result<ConfigurationValue> {
        let mut url = self.endpoint("configuration")?;
        url.query_pairs_mut().append_pair("key", key);

        let resp = self.http.get(url).send().await.map_err(transport_error)?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FleetError::ConfigNotFound {
                key: key.to_string(),
            });
        }
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(FleetError::ConfigServiceError {
                status: status.as_u16(),
                message,
            });
        }
        resp.json::<ConfigurationValue>().await.map_err(|e| FleetError::ConfigServiceError {
            status: status.as_u16(),
            message: format!("invalid response body: {e}"),
        })
    }
}

// ---------------------------------------------------------------------------
// ConfigurationClient
// ---------------------------------------------------------------------------

struct CacheEntry {
    value: ConfigurationValue,
    expires_at: Instant,
}

#[derive(Default)]
struct Counters {
    hits: u64,
    misses: u64,
}

/// Read-through cache in front of a [`ConfigTransport`].
pub struct ConfigurationClient {
    transport: Arc<dyn ConfigTransport>,
    cache_ttl: Duration,
    request_timeout: Duration,
    cache: RwLock<AHashMap<String, CacheEntry>>,
    counters: Mutex<Counters>,
}

impl ConfigurationClient {
    pub fn new(
        transport: Arc<dyn ConfigTransport>,
        cache_ttl: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            cache_ttl,
            request_timeout,
            cache: RwLock::new(AHashMap::new()),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn from_config(transport: Arc<dyn ConfigTransport>, config: &ConfigServiceConfig) -> Self {
        Self::new(transport, config.cache_ttl(), config.request_timeout())
    }

    /// Check that the configuration service is reachable.
    pub async fn connect(&self) -> Result<()> {
        match timeout(self.request_timeout, self.transport.check_health()).await {
            Ok(Ok(())) => {
                info!("[config-client] configuration service is reachable");
                Ok(())
            }
            Ok(Err(e @ FleetError::ConfigServiceUnavailable(_))) => Err(e),
            Ok(Err(e)) => Err(FleetError::ConfigServiceUnavailable(e.to_string())),
            Err(_) => Err(FleetError::ConfigServiceUnavailable(format!(
                "health check timed out after {:?}",
                self.request_timeout
            ))),
        }
    }

    /// Drop every cached value.
    pub async fn disconnect(&self) {
        let mut cache = self.cache.write().await;
        let dropped = cache.len();
        cache.clear();
        debug!("[config-client] disconnected, dropped {dropped} cached value(s)");
    }

    /// Look up `key`, fetching it remotely on a miss or after expiry.
    pub async fn get_configuration(&self, key: &str) -> Result<ConfigurationValue> {
        let cached = {
            let cache = self.cache.read().await;
            let now = Instant::now();
            cache
                .get(key)
                .filter(|e| now < e.expires_at)
                .map(|e| e.value.clone())
        };
        if let Some(value) = cached {
            self.counters.lock().await.hits += 1;
            return Ok(value);
        }

        self.counters.lock().await.misses += 1;
        let value = match timeout(self.request_timeout, self.transport.fetch(key)).await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                if !matches!(e, FleetError::ConfigNotFound { .. }) {
                    warn!("[config-client] fetch of '{key}' failed: {e}");
                }
                return Err(e);
            }
            Err(_) => {
                let msg = format!("fetch of '{key}' after {:?}", self.request_timeout);
                return Err(FleetError::Timeout(msg));
            }
        };

        let entry = CacheEntry {
            value: value.clone(),
            expires_at: Instant::now() + self.cache_ttl,
        };
        self.cache.write().await.insert(key.to_string(), entry);
        debug!("[config-client] cached '{key}' for {:?}", self.cache_ttl);
        Ok(value)
    }

    /// Hit/miss counters and current cache size.
    pub async fn get_cache_stats(&self) -> CacheStats {
        let (hits, misses) = {
            let counters = self.counters.lock().await;
            (counters.hits, counters.misses)
        };
        let size = self.cache.read().await.len();
        CacheStats::new(hits, misses, size)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use fleet_core::ConfigValueType;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    /// Knows one key and counts fetches.
    struct FakeTransport {
        fetches: AtomicUsize,
        reachable: bool,
    }

    impl FakeTransport {
        fn new(reachable: bool) -> Arc<Self> {
            Arc::new(Self {
                fetches: AtomicUsize::new(0),
                reachable,
            })
        }
    }

    #[async_trait]
    impl ConfigTransport for FakeTransport {
        async fn check_health(&self) -> Result<()> {
            if self.reachable {
                Ok(())
            } else {
                Err(FleetError::ConfigServiceUnavailable("connection refused".into()))
            }
        }

        async fn fetch(&self, key: &str) -> Result<ConfigurationValue> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            match key {
                "max_connections.timeout" => {
                    Ok(ConfigurationValue::new(key, "30", ConfigValueType::Number))
                }
                _ => Err(FleetError::ConfigNotFound {
                    key: key.to_string(),
                }),
            }
        }
    }

    fn client(transport: Arc<dyn ConfigTransport>, cache_ttl: Duration) -> ConfigurationClient {
        ConfigurationClient::new(transport, cache_ttl, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn second_lookup_is_a_cache_hit() {
        let transport = FakeTransport::new(true);
        let client = client(transport.clone(), Duration::from_secs(60));

        let first = client.get_configuration("max_connections.timeout").await.unwrap();
        let before = client.get_cache_stats().await;
        let second = client.get_configuration("max_connections.timeout").await.unwrap();
        let after = client.get_cache_stats().await;

        assert_eq!(first, second);
        assert_eq!(second.as_int().unwrap(), 30);
        assert_eq!(after.cache_hits, before.cache_hits + 1);
        assert_eq!(after.cache_misses, before.cache_misses);
        assert_eq!(after.cache_size, 1);
        assert!((after.hit_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(transport.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entry_is_refetched() {
        let transport = FakeTransport::new(true);
        let client = client(transport.clone(), Duration::from_millis(30));

        client.get_configuration("max_connections.timeout").await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        // Entry is still physically cached but past its expiry.
        assert_eq!(client.get_cache_stats().await.cache_size, 1);

        client.get_configuration("max_connections.timeout").await.unwrap();
        let stats = client.get_cache_stats().await;
        assert_eq!(stats.cache_misses, 2);
        assert_eq!(stats.cache_hits, 0);
        assert_eq!(transport.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_key_is_not_cached() {
        let client = client(FakeTransport::new(true), Duration::from_secs(60));
        let err = client.get_configuration("nope").await.unwrap_err();
        assert!(matches!(err, FleetError::ConfigNotFound { key } if key == "nope"));
        assert_eq!(client.get_cache_stats().await.cache_size, 0);
    }

    #[tokio::test]
    async fn stats_start_at_zero() {
        let client = client(FakeTransport::new(true), Duration::from_secs(60));
        let stats = client.get_cache_stats().await;
        assert_eq!(stats.hit_rate, 0.0);
        assert_eq!(stats.cache_size, 0);
    }

    #[tokio::test]
    async fn connect_and_disconnect() {
        let down = client(FakeTransport::new(false), Duration::from_secs(60));
        assert!(matches!(down.connect().await, Err(FleetError::ConfigServiceUnavailable(_))));

        let up = client(FakeTransport::new(true), Duration::from_secs(60));
        up.connect().await.unwrap();
        up.get_configuration("max_connections.timeout").await.unwrap();
        up.disconnect().await;
        assert_eq!(up.get_cache_stats().await.cache_size, 0);
    }

    // -- HTTP transport against a one-shot-per-connection local server --

    async fn serve_http(routes: fn(&str) -> (u16, String)) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let mut read = 0;
                    while !buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                        match sock.read(&mut buf[read..]).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => read += n,
                        }
                    }
                    let head = String::from_utf8_lossy(&buf[..read]).to_string();
                    let target = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                    let (status, body) = routes(&target);
                    let resp = format!(
                        "HTTP/1.1 {status} X\r\n\
                         Content-Type: application/json\r\n\
                         Content-Length: {}\r\n\
                         Connection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = sock.write_all(resp.as_bytes()).await;
                });
            }
        });
        format!("http://{addr}")
    }

    fn routes(target: &str) -> (u16, String) {
        match target {
            "/health" => (200, "{}".into()),
            "/configuration?key=feature.enabled" => (
                200,
                r#"{"key":"feature.enabled","value":"true","type":"boolean",
                    "environment":"dev","last_updated":"2024-01-01T00:00:00Z"}"#
                    .into(),
            ),
            "/configuration?key=broken" => (500, "database down".into()),
            _ => (404, "{}".into()),
        }
    }

    #[tokio::test]
    async fn http_transport_maps_statuses() {
        let base = serve_http(routes).await;
        let transport = HttpConfigTransport::new(&base, Duration::from_secs(2)).unwrap();

        transport.check_health().await.unwrap();

        let value = transport.fetch("feature.enabled").await.unwrap();
        assert_eq!(value.value_type, ConfigValueType::Boolean);
        assert_eq!(value.environment, "dev");
        assert!(value.as_bool().unwrap());

        assert!(matches!(transport.fetch("missing").await, Err(FleetError::ConfigNotFound { .. })));
        assert!(matches!(
            transport.fetch("broken").await,
            Err(FleetError::ConfigServiceError { status: 500, message })
                if message == "database down"
        ));
    }

    #[tokio::test]
    async fn http_transport_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let base = format!("http://{addr}");
        let transport = Arc::new(HttpConfigTransport::new(&base, Duration::from_secs(1)).unwrap());
        let client = client(transport, Duration::from_secs(60));
        assert!(matches!(client.connect().await, Err(FleetError::ConfigServiceUnavailable(_))));
    }
}
