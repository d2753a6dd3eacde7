//! Peer RPC over WebSocket.
//!
//! Every fleet service listens on its RPC port for WebSocket connections and
//! speaks a minimal JSON request/response protocol, one message per text
//! frame:
//!
//! ```text
//! client → server : {"id": 7, "method": "health.check",
//!                    "params": {"service": "exchange-simulator"}}
//! server → client : {"id": 7, "result": {"status": "SERVING"}}
//!                 | {"id": 7, "error": "unknown service 'foo'"}
//! ```
//!
//! - [`PeerChannel`]: client side: one dialed connection, multiplexed by request id
//! - [`RpcServer`]: server side: health registry plus pluggable method handlers

pub mod channel;
pub mod server;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FleetError, Result};

pub use channel::{ChannelConfig, PeerChannel};
pub use server::{HealthRegistry, RpcHandler, RpcServer, RpcServerHandle};

/// Standard health-check method every peer serves.
pub const HEALTH_CHECK: &str = "health.check";

/// Exchange simulator trading summary.
pub const EXCHANGE_TRADING_STATUS: &str = "exchange.trading_status";

/// Audit correlator event counters.
pub const AUDIT_METRICS: &str = "audit.metrics";

/// Request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Response frame. Exactly one of `result` / `error` is set by well-behaved
/// servers; a response with neither is a successful `null` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(msg) => Err(FleetError::Rpc(msg)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_shapes() {
        let ok = RpcResponse::ok(1, serde_json::json!({"status": "SERVING"}));
        let ok = serde_json::to_string(&ok).unwrap();
        assert_eq!(ok, r#"{"id":1,"result":{"status":"SERVING"}}"#);

        let err: RpcResponse = serde_json::from_str(r#"{"id":2,"error":"boom"}"#).unwrap();
        assert!(matches!(err.into_result(), Err(FleetError::Rpc(m)) if m == "boom"));

        let empty: RpcResponse = serde_json::from_str(r#"{"id":3}"#).unwrap();
        assert_eq!(empty.into_result().unwrap(), Value::Null);
    }
}
