//! # fleet-core
//!
//! Core crate for the fleet connectivity layer, providing:
//!
//! - **Types** (`types`): service records, configuration values, connection and health types
//! - **Configuration** (`config`): JSON config deserialization and validation
//! - **Error types** (`error`): domain-specific `FleetError` via thiserror
//! - **Expiring store** (`store`): TTL key-value contract with memory and Redis backends
//! - **Peer RPC** (`rpc`): WebSocket JSON-RPC channel and server with health checks
//! - **Logging** (`logging`): tracing-based structured logging

pub mod config;
pub mod error;
pub mod logging;
pub mod rpc;
pub mod store;
pub mod types;

pub use error::{FleetError, Result};
// Re-export types at crate root for convenience.
pub use types::*;
