//! jproxy: a JSON-RPC 2.0 multiplexing reverse proxy.
//!
//! The proxy starts one backend program, speaks JSON-RPC to it over its
//! stdin/stdout, and lets any number of clients share that single channel
//! over TCP or a Unix-domain socket. Request ids are rewritten on the way
//! in and restored on the way out, so clients never see each other's ids.
//!
//! - `jsonrpc` - message values and protocol error helpers
//! - `ipc` - framing, listener and a small client
//! - `proxy` - route table, backend channel, sessions and the multiplexer
//! - `config` / `logging` / `app` - the glue used by the `jproxy` binary
//!
//! # Example
//!
//! ```ignore
//! use jproxy::ipc::{Framing, ListenAddr, RpcClient};
//!
//! let addr: ListenAddr = "127.0.0.1:9000".parse()?;
//! let mut client = RpcClient::connect(&addr, Framing::Raw).await?;
//! let sum = client.call("Math.Add", serde_json::json!([1, 3, 5, 7])).await?;
//! ```

pub mod app;
pub mod config;
pub mod error;
pub mod ipc;
pub mod jsonrpc;
pub mod logging;
pub mod proxy;
