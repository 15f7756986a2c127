//! Error types for the proxy.
//!
//! The taxonomy follows where an error is handled:
//!
//! - [`ConfigError`]: rejected at startup, before any connection is accepted.
//! - [`FramingError`]: a byte stream could not be read or written as frames.
//!   On a client connection it ends that session; on the backend channel it
//!   drains the whole proxy.
//! - [`BackendError`]: the shared backend channel can no longer be used.
//! - [`RoutingError`]: a backend reply that cannot be delivered to anyone.
//!   Logged and dropped, never surfaced to a client.
//!
//! Protocol errors are not Rust errors at all: they become JSON-RPC error
//! responses (see [`crate::jsonrpc::JsonRpcError`]).

use std::path::PathBuf;

use thiserror::Error;

/// Invalid operator configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Unknown channel framing {0:?}")]
    UnknownFraming(String),

    #[error("You must provide an address to listen on")]
    MissingAddress,

    #[error("Invalid listen address {0:?}")]
    InvalidAddress(String),

    #[error("You must provide a command to execute")]
    MissingCommand,

    #[error("Concurrency limit must be at least 1")]
    ZeroConcurrency,

    #[error("Unknown batch mode {0:?} (expected \"split\" or \"native\")")]
    UnknownBatchMode(String),
}

/// Failure to move a frame across a byte stream.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the stream with a partial frame buffered.
    #[error("Connection closed mid-frame ({0} bytes buffered)")]
    Truncated(usize),

    #[error("Message size {size} exceeds maximum {max} bytes")]
    TooLarge { size: usize, max: usize },

    /// The stream is out of sync and cannot be read further.
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The backend channel is unusable.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend connection is closed")]
    Dead,

    #[error("Backend write failed: {0}")]
    Write(#[source] FramingError),

    #[error("Backend send cancelled by shutdown")]
    Cancelled,
}

/// A backend reply that cannot be routed to a client.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("response for unknown backend id {0}")]
    UnknownId(u64),

    #[error("response id {0} is not a backend id")]
    ForeignId(String),

    #[error("response without an id: {0}")]
    MissingId(String),

    #[error("unexpected {0:?} message from backend")]
    UnexpectedRequest(String),
}

/// Fatal errors from starting or running the proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Listen tcp {addr:?}: {source}")]
    ListenTcp {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Listen unix {path:?}: {source}")]
    ListenUnix {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Multiplexer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
