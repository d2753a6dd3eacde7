//! Core data types shared by the directory, configuration client, and
//! connection manager.
//!
//! Everything that crosses a process boundary (registry records, configuration
//! values, RPC payloads) derives `serde` so the JSON wire shape is defined in
//! one place.

pub mod configuration;
pub mod connection;
pub mod service;

pub use configuration::*;
pub use connection::*;
pub use service::*;
