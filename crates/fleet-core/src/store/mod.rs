//! Expiring key-value store contract used by the service directory.
//!
//! Any backend that can `SET` with a TTL, `GET`, `DELETE`, and list keys by
//! glob pattern satisfies the contract. Two backends ship with the crate:
//!
//! - [`MemoryStore`]: in-process map, used for tests and single-host fleets
//! - [`RespStore`]: Redis over RESP2 on a single TCP connection
//!
//! Use [`open_store`] to pick a backend from a registry URL.

pub mod memory;
pub mod resp;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{FleetError, Result};

pub use memory::MemoryStore;
pub use resp::RespStore;

/// Key-value store whose entries vanish once their TTL elapses.
///
/// All methods take `&self` so one store can be shared (`Arc<dyn ExpiringStore>`)
/// between the directory, its heartbeat task, and tests.
#[async_trait]
pub trait ExpiringStore: Send + Sync {
    /// Establish the connection. Fails with [`FleetError::StoreUnavailable`].
    async fn connect(&self) -> Result<()>;

    /// Round-trip liveness check.
    async fn ping(&self) -> Result<()>;

    /// Write `value` under `key`, replacing any previous value and TTL.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Read `key`; `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Remove `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All live keys matching a Redis-style glob `pattern`.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Release the connection.
    async fn close(&self) -> Result<()>;
}

/// Build a store from a registry URL.
///
/// - `memory://`: fresh [`MemoryStore`]
/// - `redis://[user][:password@]host[:port][/db]`: [`RespStore`]
///
/// The returned store is not connected yet.
pub fn open_store(url: &str, request_timeout: Duration) -> Result<Arc<dyn ExpiringStore>> {
    let parsed = url::Url::parse(url)
        .map_err(|e| FleetError::Config(format!("invalid registry url '{url}': {e}")))?;
    match parsed.scheme() {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        "redis" => Ok(Arc::new(RespStore::from_url(&parsed, request_timeout)?)),
        other => Err(FleetError::Config(format!("unsupported registry scheme '{other}'"))),
    }
}

// ---------------------------------------------------------------------------
// Glob helpers
// ---------------------------------------------------------------------------

/// Escape glob metacharacters so `literal` only matches itself.
pub fn escape_glob(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Redis `KEYS`/`SCAN MATCH` glob matching.
///
/// Supports `*`, `?`, `[abc]`, `[^abc]`, `[a-z]`, and `\` escapes.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    glob_match_bytes(pattern.as_bytes(), text.as_bytes())
}

fn glob_match_bytes(mut p: &[u8], mut t: &[u8]) -> bool {
    while let Some(&pc) = p.first() {
        match pc {
            b'*' => {
                while p.first() == Some(&b'*') {
                    p = &p[1..];
                }
                if p.is_empty() {
                    return true;
                }
                return (0..=t.len()).any(|i| glob_match_bytes(p, &t[i..]));
            }
            b'?' => {
                if t.is_empty() {
                    return false;
                }
                p = &p[1..];
                t = &t[1..];
            }
            b'[' => {
                let Some(&tc) = t.first() else { return false };
                let (matched, rest) = match_class(&p[1..], tc);
                if !matched {
                    return false;
                }
                p = rest;
                t = &t[1..];
            }
            _ => {
                let (lit, rest) = if pc == b'\\' && p.len() > 1 {
                    (p[1], &p[2..])
                } else {
                    (pc, &p[1..])
                };
                if t.first() != Some(&lit) {
                    return false;
                }
                p = rest;
                t = &t[1..];
            }
        }
    }
    t.is_empty()
}

/// Match `c` against a `[...]` class body; returns the remainder after `]`.
fn match_class(mut p: &[u8], c: u8) -> (bool, &[u8]) {
    let negate = p.first() == Some(&b'^');
    if negate {
        p = &p[1..];
    }
    let mut matched = false;
    while let Some(&pc) = p.first() {
        if pc == b']' {
            p = &p[1..];
            return (matched != negate, p);
        }
        if pc == b'\\' && p.len() > 1 {
            matched |= p[1] == c;
            p = &p[2..];
        } else if p.len() > 2 && p[1] == b'-' && p[2] != b']' {
            let (lo, hi) = if pc <= p[2] { (pc, p[2]) } else { (p[2], pc) };
            matched |= (lo..=hi).contains(&c);
            p = &p[3..];
        } else {
            matched |= pc == c;
            p = &p[1..];
        }
    }
    // Unterminated class: Redis treats the end of pattern as closing it.
    (matched != negate, p)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_star_and_question() {
        assert!(glob_match("services:exchange:*", "services:exchange:localhost:9091"));
        assert!(!glob_match("services:exchange:*", "services:exchange-simulator:localhost:9091"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
        assert!(glob_match("*", ""));
    }

    #[test]
    fn glob_classes() {
        assert!(glob_match("h[ae]llo", "hello"));
        assert!(!glob_match("h[^e]llo", "hello"));
        assert!(glob_match("port-[0-9]", "port-7"));
        assert!(!glob_match("port-[0-9]", "port-x"));
    }

    #[test]
    fn escaped_name_only_matches_itself() {
        let pattern = format!("services:{}:*", escape_glob("odd*name"));
        assert!(glob_match(&pattern, "services:odd*name:localhost:1"));
        assert!(!glob_match(&pattern, "services:oddXname:localhost:1"));
    }

    #[test]
    fn open_store_rejects_unknown_scheme() {
        assert!(open_store("memory://", Duration::from_secs(1)).is_ok());
        assert!(matches!(
            open_store("etcd://localhost", Duration::from_secs(1)),
            Err(FleetError::Config(_))
        ));
        assert!(open_store("not a url", Duration::from_secs(1)).is_err());
    }
}
