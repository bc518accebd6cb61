//! SRPC: the custom binary RPC transport.
//!
//! A call starts as an HTTP-style CONNECT request addressed to
//! `ServiceName.MethodName`. On success the connection is upgraded to a raw
//! bidirectional byte stream owned by that one call; request and response
//! bodies travel as length-prefixed bincode records over it. Method
//! handlers are registered once at startup in a process-wide registry and
//! looked up by name; no runtime type inspection is involved.

mod client;
mod conn;
mod server;

pub use client::{call, Client};
pub use conn::Conn;
pub use server::{MethodHandler, Registry, Server};

/// URL path prefix all calls are addressed under.
pub const RPC_PATH: &str = "/_SRPC_/";

/// Status line text confirming a successful upgrade. Fixed by the wire
/// contract; both ends compare it verbatim.
pub const CONNECT_STATUS: &str = "200 Connected to SRPC";

/// Ceiling for one framed record. Keeps a malformed or hostile peer from
/// ballooning memory; bulk data uses the blob framing instead.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Ceiling for one blob transfer (snapshots, content objects).
pub const MAX_BLOB_SIZE: u64 = 1024 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum SrpcError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed mid-record")]
    UnexpectedEof,
    #[error("record of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("blob of {size} bytes exceeds the {limit} byte limit")]
    BlobTooLarge { size: u64, limit: u64 },
    #[error("encode failed: {0}")]
    Encode(#[source] bincode::Error),
    #[error("decode failed: {0}")]
    Decode(#[source] bincode::Error),
    #[error("malformed handshake response: {0:?}")]
    BadStatusLine(String),
    #[error("call refused: {0}")]
    Refused(String),
}
