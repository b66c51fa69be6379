//! Replio Transport - streaming object transport over HTTP
//!
//! Objects travel as a concatenation of length-prefixed, checksum-framed
//! records inside long-bodied HTTP PUTs. One PUT carries one session;
//! many sessions multiplex onto one registered endpoint. The codec here
//! is the sender contract; `recv` is the receive side with per-session
//! statistics and tombstone GC.

pub mod codec;
pub mod recv;

pub use codec::{hash64, serialize_frame, serialize_last, ObjHdr, LAST_MARKER, MAX_HEADER_SIZE};
pub use recv::{
    router, EndpointStats, Handler, ObjReader, Receive, RecvError, Registry, StatsSnapshot,
    CLEANUP_TIMEOUT, NETWORK_INTRA, NETWORK_PUBLIC, NETWORK_REPL,
};
