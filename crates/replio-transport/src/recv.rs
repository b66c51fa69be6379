//! Receive side of the object transport
//!
//! A `Registry` owns per-network handler tables; each registered
//! endpoint gets a `Handler` with its own session statistics. One PUT
//! request is parsed by a frame iterator; every non-terminal frame is
//! dispatched to the registered callback together with a reader clipped
//! to the object payload. The stream is strictly sequential within a
//! request: the receiver drains whatever the callback left unread before
//! advancing to the next frame.

use crate::codec::{ext_headers, hash64, ObjHdr, MAX_HEADER_SIZE, SIZEOF_U64};
use async_trait::async_trait;
use axum::extract::{Path, Request, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use futures_util::TryStreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tokio_util::io::StreamReader;
use tracing::{error, trace, warn};

/// Networks an endpoint can be registered on
pub const NETWORK_PUBLIC: &str = "public";
pub const NETWORK_INTRA: &str = "intra";
pub const NETWORK_REPL: &str = "replication";

const KNOWN_NETWORKS: [&str; 3] = [NETWORK_PUBLIC, NETWORK_INTRA, NETWORK_REPL];

/// Closed-session tombstones older than this are swept, together with
/// their stats, when any session of the handler terminates.
pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Receive-side errors; all are fatal to the current request only
#[derive(Debug, Error)]
pub enum RecvError {
    #[error("{trname}: stream breakage type #1: header length {hlen}")]
    Breakage1 { trname: String, hlen: u64 },

    #[error("{trname}: stream breakage type #2: header length {hlen} checksum {got:x} != {expected:x}")]
    Breakage2 { trname: String, hlen: u64, got: u64, expected: u64 },

    #[error("{trname}: bad object header")]
    BadHeader { trname: String },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("unknown network: {0}")]
    UnknownNetwork(String),
}

/// Per-session monotonic counters, updated atomically
#[derive(Debug, Default)]
pub struct Stats {
    /// objects delivered to the callback
    pub num: AtomicU64,
    /// sum of object sizes
    pub size: AtomicU64,
    /// total bytes consumed off the wire (headers included)
    pub offset: AtomicU64,
}

impl Stats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            num: self.num.load(Ordering::Relaxed),
            size: self.size.load(Ordering::Relaxed),
            offset: self.offset.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of one session's counters. Fields are read
/// independently; the snapshot is not linearizable across fields.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub num: u64,
    pub size: u64,
    pub offset: u64,
}

/// Stats for every live session of one endpoint
pub type EndpointStats = HashMap<u64, StatsSnapshot>;

/// The receive callback: invoked once per non-terminal frame with the
/// parsed header and a reader over exactly `hdr.dsize` payload bytes.
/// An error terminates the request with HTTP 400.
#[async_trait]
pub trait Receive: Send + Sync {
    async fn recv(&self, hdr: ObjHdr, obj: &mut ObjReader<'_>) -> io::Result<()>;
}

/// Reader over one object's payload, clipped to `dsize` bytes of the
/// underlying request body.
pub struct ObjReader<'a> {
    body: &'a mut (dyn AsyncRead + Unpin + Send),
    dsize: u64,
    off: u64,
}

impl<'a> ObjReader<'a> {
    fn new(body: &'a mut (dyn AsyncRead + Unpin + Send), dsize: u64) -> Self {
        Self { body, dsize, off: 0 }
    }

    #[must_use]
    pub fn dsize(&self) -> u64 {
        self.dsize
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.off
    }

    /// Read the next chunk; returns `Ok(0)` once `dsize` bytes were
    /// consumed. A genuine upstream EOF short of `dsize` is logged but
    /// not masked; other errors (typically cancellation) pass through.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let rem = self.dsize - self.off;
        if rem == 0 {
            debug_assert!(self.off == self.dsize);
            return Ok(0);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let max = usize::try_from(rem).unwrap_or(usize::MAX).min(buf.len());
        let n = (&mut *self.body).read(&mut buf[..max]).await?;
        self.off += n as u64;
        if n == 0 && self.off != self.dsize {
            error!(off = self.off, dsize = self.dsize, "premature end of object payload");
        }
        Ok(n)
    }

    /// Read the remainder of the payload into `buf`
    pub async fn read_to_end(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        let mut chunk = [0u8; 8 * 1024];
        let mut total = 0;
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(total);
            }
            buf.extend_from_slice(&chunk[..n]);
            total += n;
        }
    }

    /// Consume and discard whatever is left of the payload
    pub async fn discard(&mut self) -> io::Result<u64> {
        let mut chunk = [0u8; 8 * 1024];
        let mut total = 0u64;
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(total);
            }
            total += n as u64;
        }
    }
}

enum Frame {
    Obj { hdr: ObjHdr, sessid: u64, hl64: u64 },
    Last { sessid: u64, hl64: u64 },
    Eof,
}

struct FrameIterator<'a, R> {
    trname: &'a str,
    body: &'a mut R,
    hbuf: Vec<u8>,
}

impl<'a, R: AsyncRead + Unpin + Send> FrameIterator<'a, R> {
    fn new(trname: &'a str, body: &'a mut R) -> Self {
        Self { trname, body, hbuf: vec![0u8; MAX_HEADER_SIZE] }
    }

    async fn next(&mut self) -> Result<Frame, RecvError> {
        // 16-byte prefix: header length and its checksum
        let n = read_full(self.body, &mut self.hbuf[..SIZEOF_U64 * 2]).await?;
        if n == 0 {
            return Ok(Frame::Eof);
        }
        if n < SIZEOF_U64 * 2 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{}: truncated frame prefix ({n} bytes)", self.trname),
            )
            .into());
        }
        let hl64 = u64::from_be_bytes(self.hbuf[..SIZEOF_U64].try_into().expect("8 bytes"));
        if hl64 > MAX_HEADER_SIZE as u64 {
            return Err(RecvError::Breakage1 { trname: self.trname.to_string(), hlen: hl64 });
        }
        let checksum =
            u64::from_be_bytes(self.hbuf[SIZEOF_U64..SIZEOF_U64 * 2].try_into().expect("8 bytes"));
        let expected = hash64(hl64);
        if checksum != expected {
            return Err(RecvError::Breakage2 {
                trname: self.trname.to_string(),
                hlen: hl64,
                got: checksum,
                expected,
            });
        }

        let hlen = hl64 as usize;
        let n = read_full(self.body, &mut self.hbuf[..hlen]).await?;
        if n == 0 {
            return Ok(Frame::Eof);
        }
        if n < hlen {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{}: truncated header ({n} != {hlen})", self.trname),
            )
            .into());
        }
        let (hdr, sessid) = ext_headers(&self.hbuf[..hlen])
            .ok_or_else(|| RecvError::BadHeader { trname: self.trname.to_string() })?;
        // frame accounting includes the prefix words
        let hl64 = hl64 + (SIZEOF_U64 as u64) * 2;
        if hdr.is_last() {
            trace!(trname = self.trname, sessid, "last");
            return Ok(Frame::Last { sessid, hl64 });
        }
        trace!(trname = self.trname, sessid, dsize = hdr.dsize, "new object");
        Ok(Frame::Obj { hdr, sessid, hl64 })
    }
}

async fn read_full<R: AsyncRead + Unpin + Send>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut nread = 0;
    while nread < buf.len() {
        let n = r.read(&mut buf[nread..]).await?;
        if n == 0 {
            break;
        }
        nread += n;
    }
    Ok(nread)
}

/// One registered endpoint: its callback plus per-session stats
pub struct Handler {
    trname: String,
    callback: Arc<dyn Receive>,
    sessions: Mutex<HashMap<u64, Arc<Stats>>>,
    old_sessions: Mutex<HashMap<u64, Instant>>,
}

impl Handler {
    fn new(trname: &str, callback: Arc<dyn Receive>) -> Self {
        Self {
            trname: trname.to_string(),
            callback,
            sessions: Mutex::new(HashMap::new()),
            old_sessions: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn trname(&self) -> &str {
        &self.trname
    }

    /// Snapshot of every live session's counters
    #[must_use]
    pub fn endpoint_stats(&self) -> EndpointStats {
        self.sessions
            .lock()
            .iter()
            .map(|(sessid, stats)| (*sessid, stats.snapshot()))
            .collect()
    }

    fn session_stats(&self, sessid: u64) -> Arc<Stats> {
        let mut sessions = self.sessions.lock();
        Arc::clone(sessions.entry(sessid).or_insert_with(|| {
            trace!(trname = %self.trname, sessid, "start-of-stream");
            Arc::new(Stats::default())
        }))
    }

    /// Tombstone a finished session, sweeping tombstones that outlived
    /// [`CLEANUP_TIMEOUT`] (and their stats) along the way.
    fn close_session(&self, sessid: u64) {
        let now = Instant::now();
        let mut old = self.old_sessions.lock();
        let mut sessions = self.sessions.lock();
        old.retain(|id, closed_at| {
            if now.duration_since(*closed_at) > CLEANUP_TIMEOUT {
                sessions.remove(id);
                false
            } else {
                true
            }
        });
        old.insert(sessid, now);
    }

    /// The receive loop for one PUT request
    pub async fn receive<R>(&self, body: &mut R) -> Result<(), RecvError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut it = FrameIterator::new(&self.trname, body);
        loop {
            match it.next().await? {
                Frame::Obj { hdr, sessid, hl64 } => {
                    let stats = (sessid != 0).then(|| self.session_stats(sessid));
                    if let Some(stats) = &stats {
                        let off = stats.offset.fetch_add(hl64, Ordering::Relaxed) + hl64;
                        trace!(trname = %self.trname, sessid, off, hlen = hl64, "frame");
                    }
                    let dsize = hdr.dsize;
                    let mut obj = ObjReader::new(&mut *it.body, dsize);
                    self.callback.recv(hdr, &mut obj).await?;
                    // keep the iterator frame-aligned no matter how much
                    // the callback consumed
                    obj.discard().await?;
                    if let Some(stats) = &stats {
                        let num = stats.num.fetch_add(1, Ordering::Relaxed) + 1;
                        let size = stats.size.fetch_add(dsize, Ordering::Relaxed) + dsize;
                        let off = stats.offset.fetch_add(dsize, Ordering::Relaxed) + dsize;
                        trace!(trname = %self.trname, sessid, off, size, num, "object done");
                    }
                }
                Frame::Last { sessid, hl64 } => {
                    if sessid != 0 {
                        let stats = self.session_stats(sessid);
                        stats.offset.fetch_add(hl64, Ordering::Relaxed);
                        self.close_session(sessid);
                    }
                    return Ok(());
                }
                Frame::Eof => return Ok(()),
            }
        }
    }
}

/// Per-endpoint handler registry, keyed by `(network, trname)`.
///
/// Registration must precede traffic on the network; the registry is an
/// explicit handle rather than process-global state.
#[derive(Default)]
pub struct Registry {
    networks: Mutex<HashMap<String, HashMap<String, Arc<Handler>>>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a handler table for `network` (the Rust rendition of
    /// binding a per-network HTTP multiplexer).
    pub fn set_mux(&self, network: &str) {
        if !KNOWN_NETWORKS.contains(&network) {
            warn!(network, expected = ?KNOWN_NETWORKS, "unknown network");
        }
        self.networks.lock().insert(network.to_string(), HashMap::new());
    }

    /// Register `callback` under `/v1/transport/<trname>` on `network`;
    /// returns the path. Re-registering an endpoint replaces it with a
    /// warning.
    pub fn register(
        &self,
        network: &str,
        trname: &str,
        callback: Arc<dyn Receive>,
    ) -> Result<String, RecvError> {
        let mut networks = self.networks.lock();
        let handlers = networks
            .get_mut(network)
            .ok_or_else(|| RecvError::UnknownNetwork(network.to_string()))?;
        if handlers.contains_key(trname) {
            warn!(trname, "re-registering transport handler");
        }
        handlers.insert(trname.to_string(), Arc::new(Handler::new(trname, callback)));
        Ok(format!("/v1/transport/{trname}"))
    }

    #[must_use]
    pub fn handler(&self, network: &str, trname: &str) -> Option<Arc<Handler>> {
        self.networks.lock().get(network)?.get(trname).cloned()
    }

    /// Atomically snapshot the counters of every endpoint on `network`
    pub fn network_stats(&self, network: &str) -> Result<HashMap<String, EndpointStats>, RecvError> {
        let networks = self.networks.lock();
        let handlers = networks
            .get(network)
            .ok_or_else(|| RecvError::UnknownNetwork(network.to_string()))?;
        Ok(handlers
            .iter()
            .map(|(trname, h)| (trname.clone(), h.endpoint_stats()))
            .collect())
    }
}

//
// axum surface
//

#[derive(Clone)]
struct TransportState {
    registry: Arc<Registry>,
    network: Arc<str>,
}

/// Build the router exposing `PUT /v1/transport/{trname}` for `network`
#[must_use]
pub fn router(registry: Arc<Registry>, network: &str) -> Router {
    Router::new()
        .route("/v1/transport/{trname}", any(receive_handler))
        .with_state(TransportState { registry, network: Arc::from(network) })
}

async fn receive_handler(
    State(state): State<TransportState>,
    Path(trname): Path<String>,
    req: Request,
) -> Response {
    if req.method() != Method::PUT {
        return (
            StatusCode::BAD_REQUEST,
            format!("invalid http method {}", req.method()),
        )
            .into_response();
    }
    let Some(handler) = state.registry.handler(&state.network, &trname) else {
        return (
            StatusCode::BAD_REQUEST,
            format!("invalid transport handler name {trname}"),
        )
            .into_response();
    };
    let stream = req.into_body().into_data_stream().map_err(io::Error::other);
    let mut body = StreamReader::new(stream);
    match handler.receive(&mut body).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            error!(%trname, %e, "receive failed");
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
    }
}
