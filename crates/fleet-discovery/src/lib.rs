//! # fleet-discovery
//!
//! Self-registration and peer lookup over an expiring key-value store.
//!
//! A [`ServiceDirectory`] writes this process's [`ServiceRecord`] under
//! `{prefix}{name}:{host}:{rpc_port}` with a TTL, keeps it alive from a
//! heartbeat task, and answers `discover(name)` by scanning the store. There is
//! no local cache of peer data: every lookup reads the store.
//!
//! [`ServiceRecord`]: fleet_core::ServiceRecord

pub mod directory;

pub use directory::{DirectoryConfig, ServiceDirectory};
