//! Server side of the peer RPC protocol.
//!
//! [`RpcServer`] accepts TCP connections on the service's RPC port, upgrades
//! them to WebSocket, and answers request frames. The `health.check` method is
//! built in and backed by a [`HealthRegistry`]; any other method is served by
//! an [`RpcHandler`] registered before [`RpcServer::start`].
//!
//! Requests on one connection are answered in order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{HEALTH_CHECK, RpcRequest, RpcResponse};
use crate::error::{FleetError, Result};
use crate::types::{HealthCheckRequest, HealthCheckResponse, ServerMetrics, ServingStatus};

/// A server-side method implementation.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, params: Value) -> Result<Value>;
}

type HandlerMap = HashMap<String, Arc<dyn RpcHandler>>;

// ---------------------------------------------------------------------------
// HealthRegistry
// ---------------------------------------------------------------------------

/// Serving status per sub-service. The empty name is the server as a whole.
pub struct HealthRegistry {
    statuses: RwLock<HashMap<String, ServingStatus>>,
}

impl HealthRegistry {
    /// New registry with the whole server marked `SERVING`.
    pub fn new() -> Self {
        let mut statuses = HashMap::new();
        statuses.insert(String::new(), ServingStatus::Serving);
        Self {
            statuses: RwLock::new(statuses),
        }
    }

    pub async fn set_serving_status(&self, service: &str, status: ServingStatus) {
        self.statuses.write().await.insert(service.to_string(), status);
        debug!("[rpc] health status for '{service}' set to {status}");
    }

    /// Status for `service`, or `None` if it was never registered.
    pub async fn check(&self, service: &str) -> Option<ServingStatus> {
        self.statuses.read().await.get(service).copied()
    }

    /// Mark every registered sub-service `NOT_SERVING` (graceful shutdown).
    pub async fn shutdown(&self) {
        for status in self.statuses.write().await.values_mut() {
            *status = ServingStatus::NotServing;
        }
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Server counters
// ---------------------------------------------------------------------------

struct ServerCounters {
    active_connections: AtomicU64,
    total_requests: AtomicU64,
    started_at: Instant,
}

impl ServerCounters {
    fn snapshot(&self) -> ServerMetrics {
        ServerMetrics {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// RpcServer
// ---------------------------------------------------------------------------

/// A bound, not yet serving, RPC server.
pub struct RpcServer {
    listener: TcpListener,
    health: Arc<HealthRegistry>,
    handlers: HandlerMap,
}

impl RpcServer {
    /// Bind the listening socket (e.g. `"0.0.0.0:9094"`, or port 0 for tests).
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            health: Arc::new(HealthRegistry::new()),
            handlers: HashMap::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn health(&self) -> Arc<HealthRegistry> {
        Arc::clone(&self.health)
    }

    /// Serve `method` with `handler`. `health.check` cannot be overridden.
    pub fn register(&mut self, method: impl Into<String>, handler: Arc<dyn RpcHandler>) {
        let method = method.into();
        if method == HEALTH_CHECK {
            warn!("[rpc] ignoring handler for reserved method '{HEALTH_CHECK}'");
            return;
        }
        self.handlers.insert(method, handler);
    }

    /// Start the accept loop on a background task.
    pub fn start(self) -> Result<RpcServerHandle> {
        let local_addr = self.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(ServerCounters {
            active_connections: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            started_at: Instant::now(),
        });

        let task = tokio::spawn(accept_loop(
            self.listener,
            Arc::new(self.handlers),
            Arc::clone(&self.health),
            Arc::clone(&counters),
            shutdown_rx,
        ));

        info!("[rpc] server listening on {local_addr}");
        Ok(RpcServerHandle {
            local_addr,
            health: self.health,
            counters,
            shutdown_tx,
            task: Some(task),
        })
    }
}

/// Handle to a running server.
pub struct RpcServerHandle {
    local_addr: SocketAddr,
    health: Arc<HealthRegistry>,
    counters: Arc<ServerCounters>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl RpcServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn health(&self) -> Arc<HealthRegistry> {
        Arc::clone(&self.health)
    }

    pub fn metrics(&self) -> ServerMetrics {
        self.counters.snapshot()
    }

    /// Stop accepting, close every open connection, and wait for the accept loop.
    pub async fn stop(&mut self) {
        self.health.shutdown().await;
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        info!("[rpc] server on {} stopped", self.local_addr);
    }
}

async fn accept_loop(
    listener: TcpListener,
    handlers: Arc<HandlerMap>,
    health: Arc<HealthRegistry>,
    counters: Arc<ServerCounters>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return,

            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        warn!("[rpc] accept failed: {e}");
                        continue;
                    }
                };
                tokio::spawn(serve_connection(
                    stream,
                    peer,
                    Arc::clone(&handlers),
                    Arc::clone(&health),
                    Arc::clone(&counters),
                    shutdown_rx.clone(),
                ));
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handlers: Arc<HandlerMap>,
    health: Arc<HealthRegistry>,
    counters: Arc<ServerCounters>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(s) => s,
        Err(e) => {
            warn!("[rpc] handshake with {peer} failed: {e}");
            return;
        }
    };
    counters.active_connections.fetch_add(1, Ordering::Relaxed);
    debug!("[rpc] accepted connection from {peer}");

    let (mut ws_write, mut ws_read) = ws_stream.split();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                let _ = ws_write.close().await;
                break;
            }

            msg = ws_read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        counters.total_requests.fetch_add(1, Ordering::Relaxed);
                        let Some(response) = answer(&text, &handlers, &health).await else {
                            continue;
                        };
                        let frame = match serde_json::to_string(&response) {
                            Ok(f) => f,
                            Err(e) => {
                                warn!("[rpc] failed to encode response: {e}");
                                continue;
                            }
                        };
                        if let Err(e) = ws_write.send(Message::Text(frame.into())).await {
                            warn!("[rpc] send to {peer} failed: {e}");
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("[rpc] read from {peer} failed: {e}");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    counters.active_connections.fetch_sub(1, Ordering::Relaxed);
    debug!("[rpc] connection from {peer} closed");
}

/// Decode one request frame and produce its response. Frames that are not
/// valid requests have no id to answer and are dropped.
async fn answer(text: &str, handlers: &HandlerMap, health: &HealthRegistry) -> Option<RpcResponse> {
    let request: RpcRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!("[rpc] dropping malformed request frame: {e}");
            return None;
        }
    };

    let id = request.id;
    let outcome = match request.method.as_str() {
        HEALTH_CHECK => health_check(request.params, health).await,
        method => match handlers.get(method) {
            Some(handler) => handler.handle(request.params).await,
            None => Err(FleetError::Rpc(format!("unknown method '{method}'"))),
        },
    };

    Some(match outcome {
        Ok(result) => RpcResponse::ok(id, result),
        Err(FleetError::Rpc(msg)) => RpcResponse::err(id, msg),
        Err(e) => RpcResponse::err(id, e.to_string()),
    })
}

async fn health_check(params: Value, health: &HealthRegistry) -> Result<Value> {
    let request: HealthCheckRequest = if params.is_null() {
        HealthCheckRequest::default()
    } else {
        serde_json::from_value(params)?
    };
    match health.check(&request.service).await {
        Some(status) => Ok(serde_json::to_value(HealthCheckResponse { status })?),
        None => Err(FleetError::Rpc(format!("unknown service '{}'", request.service))),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::rpc::{ChannelConfig, PeerChannel};
    use crate::types::ConnectivityState;

    struct Echo;

    #[async_trait]
    impl RpcHandler for Echo {
        async fn handle(&self, params: Value) -> Result<Value> {
            Ok(params)
        }
    }

    async fn start_server() -> RpcServerHandle {
        let mut server = RpcServer::bind("127.0.0.1:0").await.unwrap();
        server.register("test.echo", Arc::new(Echo));
        server.start().unwrap()
    }

    async fn dial(server: &RpcServerHandle, config: ChannelConfig) -> PeerChannel {
        let target = server.local_addr().to_string();
        PeerChannel::dial(&target, config).await.unwrap()
    }

    fn health_request(service: &str) -> HealthCheckRequest {
        HealthCheckRequest {
            service: service.to_string(),
        }
    }

    #[tokio::test]
    async fn health_check_reports_registered_status() {
        let mut server = start_server().await;
        server
            .health()
            .set_serving_status("exchange-simulator", ServingStatus::NotServing)
            .await;

        let channel = dial(&server, ChannelConfig::default()).await;
        let overall: HealthCheckResponse =
            channel.call(HEALTH_CHECK, &health_request("")).await.unwrap();
        assert_eq!(overall.status, ServingStatus::Serving);

        let sub: HealthCheckResponse =
            channel.call(HEALTH_CHECK, &health_request("exchange-simulator")).await.unwrap();
        assert_eq!(sub.status, ServingStatus::NotServing);

        let unknown = channel
            .call::<_, HealthCheckResponse>(HEALTH_CHECK, &health_request("nope"))
            .await;
        assert!(matches!(unknown, Err(FleetError::Rpc(m)) if m.contains("unknown service")));

        channel.close().await.unwrap();
        server.stop().await;
    }

    #[tokio::test]
    async fn custom_handlers_and_unknown_methods() {
        let mut server = start_server().await;
        let channel = dial(&server, ChannelConfig::default()).await;

        let echoed: Value = channel.call("test.echo", &serde_json::json!({"n": 3})).await.unwrap();
        assert_eq!(echoed["n"], 3);

        let missing = channel.call::<_, Value>("test.missing", &Value::Null).await;
        assert!(matches!(missing, Err(FleetError::Rpc(m)) if m.contains("unknown method")));

        assert_eq!(server.metrics().total_requests, 2);
        assert_eq!(server.metrics().active_connections, 1);

        channel.close().await.unwrap();
        assert_eq!(channel.state(), ConnectivityState::Shutdown);
        server.stop().await;
    }

    #[tokio::test]
    async fn server_stop_fails_the_channel() {
        let mut server = start_server().await;
        let channel = dial(&server, ChannelConfig::default()).await;
        assert_eq!(channel.state(), ConnectivityState::Ready);

        server.stop().await;

        let mut state = channel.subscribe_state();
        let failed = state.wait_for(|s| !s.is_usable());
        assert!(tokio::time::timeout(Duration::from_secs(2), failed).await.is_ok());
        assert_eq!(channel.state(), ConnectivityState::TransientFailure);

        let call = channel.call::<_, Value>("test.echo", &Value::Null).await;
        assert!(call.is_err());
    }

    #[tokio::test]
    async fn quiet_channel_goes_idle_and_wakes_on_call() {
        let server = start_server().await;
        let config = ChannelConfig {
            keepalive_interval: Duration::from_millis(50),
            ..ChannelConfig::default()
        };
        let channel = dial(&server, config).await;

        let mut state = channel.subscribe_state();
        let idle = state.wait_for(|s| *s == ConnectivityState::Idle);
        assert!(tokio::time::timeout(Duration::from_secs(2), idle).await.is_ok());
        assert!(channel.state().is_usable());

        let _: Value = channel.call("test.echo", &1).await.unwrap();
        assert_eq!(channel.state(), ConnectivityState::Ready);
    }
}
