//! Byte-stream plumbing shared by the proxy and the demo programs.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐  client framing  ┌──────────┐  backend framing  ┌────────────┐
//! │ clients  │ ◄──────────────► │  jproxy  │ ◄───────────────► │ subprocess │
//! │ (N conns)│   TCP or Unix    │          │   stdin / stdout  │ (1 channel)│
//! └──────────┘                  └──────────┘                   └────────────┘
//! ```
//!
//! - [`framing`]: pluggable message delimiting, selected by name
//! - [`listener`]: TCP or Unix-domain listener chosen from the address string
//! - [`client`]: a small sequential JSON-RPC client used by the demo client
//!   and the integration tests

pub mod client;
pub mod framing;
pub mod listener;

use tokio::io::{AsyncRead, AsyncWrite};

pub use client::{ClientError, RpcClient};
pub use framing::{FrameReader, FrameWriter, Framing, MAX_MESSAGE_SIZE};
pub use listener::{Connection, ListenAddr, Listener};

/// Type-erased read half of a connection or pipe.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Type-erased write half of a connection or pipe.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;
