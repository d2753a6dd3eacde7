//! Client side of a peer RPC connection.
//!
//! Each `PeerChannel` owns one WebSocket connection driven by a tokio task
//! that:
//! 1. Writes outbound request frames queued by [`PeerChannel::call`].
//! 2. Routes response frames to the waiting caller by request id.
//! 3. Sends keepalive pings and reports `IDLE` after a quiet keepalive period.
//! 4. On any transport failure moves to `TRANSIENT_FAILURE` and fails every
//!    in-flight call. It never reconnects: the owner evicts the channel and
//!    dials a fresh one.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::time::{Instant, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{RpcRequest, RpcResponse};
use crate::error::{FleetError, Result};
use crate::types::ConnectivityState;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// In-flight calls awaiting a response, keyed by request id.
type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>>;

/// Timing bounds for one channel.
#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    /// Bound on the TCP connect + WebSocket handshake.
    pub dial_timeout: Duration,
    /// Bound on each call, from enqueue to response.
    pub call_timeout: Duration,
    /// Ping period; also the quiet period after which the channel is idle.
    pub keepalive_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(3),
            call_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

/// A dialed connection to one peer.
#[derive(Debug)]
pub struct PeerChannel {
    target: String,
    config: ChannelConfig,
    state_rx: watch::Receiver<ConnectivityState>,
    outbound_tx: mpsc::Sender<String>,
    pending: PendingCalls,
    next_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PeerChannel {
    /// Connect to `target` (`host:port`) and start the connection task.
    pub async fn dial(target: &str, config: ChannelConfig) -> Result<Self> {
        let url = format!("ws://{target}/rpc");
        debug!("[rpc] dialing {url}");

        let connect = tokio_tungstenite::connect_async(url.as_str());
        let ws_stream = match timeout(config.dial_timeout, connect).await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                return Err(FleetError::Rpc(format!("failed to connect to {target}: {e}")));
            }
            Err(_) => {
                let msg = format!("dial {target} after {:?}", config.dial_timeout);
                return Err(FleetError::Timeout(msg));
            }
        };

        let (state_tx, state_rx) = watch::channel(ConnectivityState::Ready);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::channel::<String>(64);
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));

        let task = tokio::spawn(connection_loop(
            target.to_string(),
            ws_stream,
            config.keepalive_interval,
            state_tx,
            outbound_rx,
            shutdown_rx,
            Arc::clone(&pending),
        ));

        info!("[rpc] connected to {target}");
        Ok(Self {
            target: target.to_string(),
            config,
            state_rx,
            outbound_tx,
            pending,
            next_id: AtomicU64::new(1),
            shutdown_tx,
            task: Mutex::new(Some(task)),
        })
    }

    /// `host:port` this channel is connected to.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Current transport readiness.
    pub fn state(&self) -> ConnectivityState {
        *self.state_rx.borrow()
    }

    /// Watch readiness transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectivityState> {
        self.state_rx.clone()
    }

    /// Invoke `method` on the peer and decode its result.
    pub async fn call<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let state = self.state();
        if !state.is_usable() {
            return Err(FleetError::Rpc(format!("channel to {} is {state}", self.target)));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest {
            id,
            method: method.to_string(),
            params: serde_json::to_value(params)?,
        };
        let frame = serde_json::to_string(&request)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.outbound_tx.send(frame).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(FleetError::Rpc(format!("channel to {} is closed", self.target)));
        }

        match timeout(self.config.call_timeout, rx).await {
            Ok(Ok(response)) => Ok(serde_json::from_value(response.into_result()?)?),
            Ok(Err(_)) => Err(FleetError::Rpc(format!(
                "channel to {} closed before response",
                self.target
            ))),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(FleetError::Timeout(format!(
                    "{method} on {} after {:?}",
                    self.target, self.config.call_timeout
                )))
            }
        }
    }

    /// Close the connection and wait for the task to finish.
    pub async fn close(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.lock().await.take() {
            task.await.map_err(|e| {
                FleetError::Rpc(format!("channel task for {} failed: {e}", self.target))
            })?;
        }
        Ok(())
    }
}

/// Drive one connection until shutdown or transport failure.
async fn connection_loop(
    target: String,
    ws_stream: WsStream,
    keepalive: Duration,
    state_tx: watch::Sender<ConnectivityState>,
    mut outbound_rx: mpsc::Receiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
    pending: PendingCalls,
) {
    let (mut ws_write, mut ws_read) = ws_stream.split();

    let mut ping_timer = tokio::time::interval(keepalive);
    ping_timer.tick().await; // skip the immediate first tick
    let mut last_activity = Instant::now();

    let reason = loop {
        tokio::select! {
            // Shutdown signal (or the channel was dropped)
            _ = shutdown_rx.changed() => {
                debug!("[rpc] closing channel to {target}");
                let _ = ws_write.close().await;
                state_tx.send_replace(ConnectivityState::Shutdown);
                fail_pending(&pending, "channel shut down").await;
                return;
            }

            // Incoming frame
            msg = ws_read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();
                        mark_ready(&state_tx);
                        dispatch_response(&pending, &text).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => break "peer sent close frame".to_string(),
                    Some(Err(e)) => break format!("read error: {e}"),
                    None => break "stream ended".to_string(),
                    _ => {} // Pong, Binary, Frame: ignored
                }
            }

            // Outbound request
            Some(frame) = outbound_rx.recv() => {
                last_activity = Instant::now();
                mark_ready(&state_tx);
                if let Err(e) = ws_write.send(Message::Text(frame.into())).await {
                    break format!("send error: {e}");
                }
            }

            // Keepalive
            _ = ping_timer.tick() => {
                if last_activity.elapsed() >= keepalive {
                    state_tx.send_if_modified(|s| {
                        let idle = *s == ConnectivityState::Ready;
                        if idle {
                            *s = ConnectivityState::Idle;
                        }
                        idle
                    });
                }
                if let Err(e) = ws_write.send(Message::Ping(Vec::new().into())).await {
                    break format!("ping send error: {e}");
                }
            }
        }
    };

    warn!("[rpc] channel to {target} failed: {reason}");
    state_tx.send_replace(ConnectivityState::TransientFailure);
    fail_pending(&pending, &reason).await;
}

fn mark_ready(state_tx: &watch::Sender<ConnectivityState>) {
    state_tx.send_if_modified(|s| {
        let woke = *s == ConnectivityState::Idle;
        if woke {
            *s = ConnectivityState::Ready;
        }
        woke
    });
}

async fn dispatch_response(pending: &PendingCalls, text: &str) {
    let response: RpcResponse = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!("[rpc] dropping malformed response frame: {e}");
            return;
        }
    };
    match pending.lock().await.remove(&response.id) {
        Some(tx) => {
            let _ = tx.send(response);
        }
        None => debug!("[rpc] response for unknown or abandoned request {}", response.id),
    }
}

async fn fail_pending(pending: &PendingCalls, reason: &str) {
    for (id, tx) in pending.lock().await.drain() {
        let _ = tx.send(RpcResponse::err(id, reason));
    }
}
