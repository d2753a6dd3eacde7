//! Redis-backed expiring store over RESP2.
//!
//! A small client: one TCP connection guarded by a mutex, only the commands
//! the directory needs. Every command is bounded by the request timeout. After
//! an I/O error or timeout the connection is dropped because the stream
//! position is no longer known; the next command redials (handshake included)
//! and reports [`FleetError::StoreUnavailable`] if that fails.
//!
//! # Wire format
//!
//! ```text
//! request : *<argc>\r\n ( $<len>\r\n <bytes>\r\n ){argc}
//! reply   : +simple | -error | :integer | $bulk | *array   (each line \r\n-terminated)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::ExpiringStore;
use crate::error::{FleetError, Result};

/// Keys requested per `SCAN` round trip.
const SCAN_COUNT: &str = "100";

/// Default Redis port when the URL omits one.
const DEFAULT_PORT: u16 = 6379;

/// Largest bulk string accepted from the server (Redis `proto-max-bulk-len`).
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Largest array accepted from the server.
const MAX_ARRAY_LEN: i64 = 1 << 20;

/// Upper bound on up-front allocation for an announced array.
const PREALLOC_LIMIT: usize = 1024;

// ---------------------------------------------------------------------------
// Reply
// ---------------------------------------------------------------------------

/// A decoded RESP2 reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Reply>>),
}

enum Frame {
    Value(Reply),
    ArrayStart(usize),
}

/// Encode a command as a RESP array of bulk strings.
pub fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    buf.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.extend_from_slice(arg);
        buf.extend_from_slice(b"\r\n");
    }
    buf
}

/// Read one complete reply (arrays are assembled without recursion).
pub async fn read_reply<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<Reply> {
    let mut stack: Vec<(usize, Vec<Reply>)> = Vec::new();
    loop {
        let mut value = match read_frame(r).await? {
            Frame::ArrayStart(n) => {
                stack.push((n, Vec::with_capacity(n.min(PREALLOC_LIMIT))));
                continue;
            }
            Frame::Value(v) => v,
        };

        // Fold the finished value into its parent arrays.
        loop {
            let Some((remaining, items)) = stack.last_mut() else {
                return Ok(value);
            };
            items.push(value);
            *remaining -= 1;
            if *remaining > 0 {
                break;
            }
            value = Reply::Array(Some(stack.pop().map(|(_, items)| items).unwrap_or_default()));
        }
    }
}

async fn read_frame<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<Frame> {
    let line = read_line(r).await?;
    let Some((&tag, body)) = line.split_first() else {
        return Err(FleetError::Store("empty reply line".into()));
    };
    let text = String::from_utf8_lossy(body).into_owned();

    let frame = match tag {
        b'+' => Frame::Value(Reply::Simple(text)),
        b'-' => Frame::Value(Reply::Error(text)),
        b':' => Frame::Value(Reply::Integer(parse_int(&text)?)),
        b'$' => {
            let len = parse_int(&text)?;
            if len > MAX_BULK_LEN {
                return Err(FleetError::Store(format!("bulk length {len} exceeds limit")));
            }
            if len < 0 {
                Frame::Value(Reply::Bulk(None))
            } else {
                let mut data = vec![0u8; len as usize + 2];
                r.read_exact(&mut data).await?;
                data.truncate(len as usize);
                Frame::Value(Reply::Bulk(Some(data)))
            }
        }
        b'*' => match parse_int(&text)? {
            n if n > MAX_ARRAY_LEN => {
                return Err(FleetError::Store(format!("array length {n} exceeds limit")));
            }
            n if n < 0 => Frame::Value(Reply::Array(None)),
            0 => Frame::Value(Reply::Array(Some(Vec::new()))),
            n => Frame::ArrayStart(n as usize),
        },
        other => {
            let msg = format!("unexpected reply tag '{}'", other as char);
            return Err(FleetError::Store(msg));
        }
    };
    Ok(frame)
}

async fn read_line<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<Vec<u8>> {
    let mut line = Vec::new();
    let n = r.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Err(FleetError::Store("connection closed by server".into()));
    }
    if !line.ends_with(b"\r\n") {
        return Err(FleetError::Store("reply line not CRLF-terminated".into()));
    }
    line.truncate(line.len() - 2);
    Ok(line)
}

fn parse_int(text: &str) -> Result<i64> {
    text.parse::<i64>()
        .map_err(|_| FleetError::Store(format!("invalid integer in reply: '{text}'")))
}

// ---------------------------------------------------------------------------
// RespStore
// ---------------------------------------------------------------------------

/// Redis store on a single multiplexed-by-mutex connection.
pub struct RespStore {
    addr: String,
    username: Option<String>,
    password: Option<String>,
    db: Option<u32>,
    request_timeout: Duration,
    /// Set by `connect`, cleared by `close`. Commands only redial while set.
    enabled: AtomicBool,
    conn: Mutex<Option<BufStream<TcpStream>>>,
}

impl RespStore {
    pub fn new(addr: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            username: None,
            password: None,
            db: None,
            request_timeout,
            enabled: AtomicBool::new(false),
            conn: Mutex::new(None),
        }
    }

    /// Parse `redis://[user][:password@]host[:port][/db]`.
    pub fn from_url(url: &url::Url, request_timeout: Duration) -> Result<Self> {
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .unwrap_or("localhost");
        let port = url.port().unwrap_or(DEFAULT_PORT);
        let db = match url.path().trim_start_matches('/') {
            "" => None,
            path => Some(
                path.parse::<u32>()
                    .map_err(|_| FleetError::Config(format!("invalid redis db '{path}'")))?,
            ),
        };

        let mut store = Self::new(format!("{host}:{port}"), request_timeout);
        store.username = Some(url.username())
            .filter(|u| !u.is_empty())
            .map(decode_credential)
            .transpose()?;
        store.password = url.password().map(decode_credential).transpose()?;
        store.db = db;
        Ok(store)
    }

    /// `host:port` this store dials.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn handshake(&self, stream: &mut BufStream<TcpStream>) -> Result<()> {
        if let Some(password) = &self.password {
            let reply = match &self.username {
                Some(user) => {
                    round_trip(stream, &[b"AUTH", user.as_bytes(), password.as_bytes()]).await?
                }
                None => round_trip(stream, &[b"AUTH", password.as_bytes()]).await?,
            };
            expect_ok(reply)?;
        }
        if let Some(db) = self.db {
            expect_ok(round_trip(stream, &[b"SELECT", db.to_string().as_bytes()]).await?)?;
        }
        match round_trip(stream, &[b"PING"]).await? {
            Reply::Simple(s) if s == "PONG" => Ok(()),
            other => Err(FleetError::Store(format!("unexpected PING reply: {other:?}"))),
        }
    }

    /// Open a connection and run the handshake, bounded by the request timeout.
    async fn dial(&self) -> Result<BufStream<TcpStream>> {
        let attempt = async {
            let tcp = TcpStream::connect(&self.addr).await?;
            tcp.set_nodelay(true)?;
            let mut stream = BufStream::new(tcp);
            self.handshake(&mut stream).await?;
            Ok::<_, FleetError>(stream)
        };

        match timeout(self.request_timeout, attempt).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(FleetError::StoreUnavailable(format!("{}: {e}", self.addr))),
            Err(_) => Err(FleetError::StoreUnavailable(format!(
                "{}: connect timed out after {:?}",
                self.addr, self.request_timeout
            ))),
        }
    }

    async fn command(&self, args: &[&[u8]]) -> Result<Reply> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            if !self.enabled.load(Ordering::Acquire) {
                return Err(FleetError::StoreUnavailable(format!("not connected to {}", self.addr)));
            }
            *guard = Some(self.dial().await?);
            info!("[store] reconnected to redis at {}", self.addr);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(FleetError::StoreUnavailable(format!("not connected to {}", self.addr)));
        };

        let outcome = timeout(self.request_timeout, round_trip(stream, args)).await;
        match outcome {
            Ok(Ok(Reply::Error(msg))) => Err(FleetError::Store(msg)),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                warn!("[store] redis command failed, dropping connection: {e}");
                *guard = None;
                Err(e)
            }
            Err(_) => {
                warn!(
                    "[store] redis command timed out after {:?}, dropping connection",
                    self.request_timeout
                );
                *guard = None;
                Err(FleetError::Timeout(format!("redis command after {:?}", self.request_timeout)))
            }
        }
    }
}

async fn round_trip(stream: &mut BufStream<TcpStream>, args: &[&[u8]]) -> Result<Reply> {
    stream.write_all(&encode_command(args)).await?;
    stream.flush().await?;
    read_reply(stream).await
}

fn expect_ok(reply: Reply) -> Result<()> {
    match reply {
        Reply::Simple(s) if s == "OK" => Ok(()),
        Reply::Error(msg) => Err(FleetError::Store(msg)),
        other => Err(FleetError::Store(format!("expected OK, got {other:?}"))),
    }
}

fn decode_credential(raw: &str) -> Result<String> {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .map_err(|e| FleetError::Config(format!("invalid redis credential encoding: {e}")))
}

fn bulk_to_string(data: Vec<u8>) -> Result<String> {
    String::from_utf8(data).map_err(|e| FleetError::Store(format!("non-utf8 value: {e}")))
}

#[async_trait]
impl ExpiringStore for RespStore {
    async fn connect(&self) -> Result<()> {
        let stream = self.dial().await?;
        *self.conn.lock().await = Some(stream);
        self.enabled.store(true, Ordering::Release);
        info!("[store] connected to redis at {}", self.addr);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        match self.command(&[b"PING"]).await? {
            Reply::Simple(s) if s == "PONG" => Ok(()),
            other => Err(FleetError::Store(format!("unexpected PING reply: {other:?}"))),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let ttl_ms = ttl.as_millis().max(1).to_string();
        let reply = self
            .command(&[b"SET", key.as_bytes(), value.as_bytes(), b"PX", ttl_ms.as_bytes()])
            .await?;
        expect_ok(reply)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.command(&[b"GET", key.as_bytes()]).await? {
            Reply::Bulk(None) => Ok(None),
            Reply::Bulk(Some(data)) => bulk_to_string(data).map(Some),
            other => Err(FleetError::Store(format!("unexpected GET reply: {other:?}"))),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        match self.command(&[b"DEL", key.as_bytes()]).await? {
            Reply::Integer(n) => Ok(n > 0),
            other => Err(FleetError::Store(format!("unexpected DEL reply: {other:?}"))),
        }
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut cursor = String::from("0");
        let mut keys = Vec::new();

        loop {
            let reply = self
                .command(&[
                    b"SCAN",
                    cursor.as_bytes(),
                    b"MATCH",
                    pattern.as_bytes(),
                    b"COUNT",
                    SCAN_COUNT.as_bytes(),
                ])
                .await?;
            let mut parts = match reply {
                Reply::Array(Some(parts)) => parts,
                other => return Err(FleetError::Store(format!("unexpected SCAN reply: {other:?}"))),
            };
            if parts.len() != 2 {
                return Err(FleetError::Store(format!("SCAN reply has {} parts", parts.len())));
            }
            let batch = parts.pop();
            let next = parts.pop();

            match (next, batch) {
                (Some(Reply::Bulk(Some(next))), Some(Reply::Array(Some(batch)))) => {
                    for item in batch {
                        if let Reply::Bulk(Some(key)) = item {
                            keys.push(bulk_to_string(key)?);
                        }
                    }
                    cursor = bulk_to_string(next)?;
                }
                other => return Err(FleetError::Store(format!("malformed SCAN reply: {other:?}"))),
            }

            if cursor == "0" {
                break;
            }
        }

        // SCAN may return a key more than once.
        keys.sort();
        keys.dedup();
        debug!("[store] redis scan '{pattern}' matched {} key(s)", keys.len());
        Ok(keys)
    }

    async fn close(&self) -> Result<()> {
        self.enabled.store(false, Ordering::Release);
        if let Some(mut stream) = self.conn.lock().await.take() {
            let _ = stream.get_mut().shutdown().await;
            info!("[store] closed redis connection to {}", self.addr);
        }
        Ok(())
    }
}
