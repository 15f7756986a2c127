//! Sequential JSON-RPC 2.0 client.
//!
//! This module provides `RpcClient`, an async client that connects to the
//! proxy (or any JSON-RPC peer) over TCP or a Unix socket and sends requests
//! with automatic timeout handling. One request is outstanding at a time per
//! client; open several clients to exercise concurrency.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::time::timeout;

use crate::error::FramingError;
use crate::ipc::framing::{FrameReader, FrameWriter, Framing};
use crate::ipc::listener::{connect, ListenAddr};
use crate::ipc::{BoxReader, BoxWriter};
use crate::jsonrpc::{Id, JsonRpcError, JsonRpcRequest, JsonRpcResponse};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Client-side error types.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Failed to connect to the server.
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] std::io::Error),

    /// Request timed out waiting for response.
    #[error("Request timed out after {0}s")]
    Timeout(u64),

    /// Protocol-level error (framing, encoding, unexpected reply).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server returned a JSON-RPC error response.
    #[error("Server error {code}: {message}")]
    ServerError {
        /// JSON-RPC error code
        code: i32,
        /// Error message
        message: String,
        /// Optional additional data
        data: Option<Value>,
    },

    /// The server closed the connection.
    #[error("Connection closed by server")]
    Closed,

    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                ClientError::ConnectionFailed(err)
            }
            _ => ClientError::Io(err),
        }
    }
}

impl From<JsonRpcError> for ClientError {
    fn from(err: JsonRpcError) -> Self {
        ClientError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

impl From<FramingError> for ClientError {
    fn from(err: FramingError) -> Self {
        match err {
            FramingError::Io(e) => ClientError::Io(e),
            other => ClientError::Protocol(other.to_string()),
        }
    }
}

/// JSON-RPC client over one framed connection.
///
/// # Example
///
/// ```ignore
/// use jproxy::ipc::{Framing, RpcClient};
/// use serde_json::json;
///
/// let addr = "127.0.0.1:8080".parse()?;
/// let mut client = RpcClient::connect(&addr, Framing::Raw).await?;
/// let sum = client.call("Math.Add", json!([1, 3, 5, 7])).await?;
/// ```
pub struct RpcClient {
    reader: FrameReader<BoxReader>,
    writer: FrameWriter<BoxWriter>,
    /// Monotonically increasing request ID counter.
    request_id: AtomicU64,
    /// Request timeout duration.
    timeout: Duration,
}

impl RpcClient {
    /// Connect to a listener address.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ConnectionFailed` if the socket does not exist
    /// or the connection is refused.
    pub async fn connect(addr: &ListenAddr, framing: Framing) -> Result<Self, ClientError> {
        let (reader, writer) = connect(addr).await?;
        Ok(Self::from_io(reader, writer, framing))
    }

    /// Connect with automatic retry and exponential backoff.
    ///
    /// Retries with delays of 100ms, 200ms, 400ms, etc. Useful right after
    /// starting the proxy, while its listener may not be bound yet.
    pub async fn connect_with_retry(
        addr: &ListenAddr,
        framing: Framing,
        max_attempts: u32,
    ) -> Result<Self, ClientError> {
        let mut last_error = ClientError::Protocol("no connection attempts made".to_string());

        for attempt in 1..=max_attempts {
            match Self::connect(addr, framing.clone()).await {
                Ok(client) => return Ok(client),
                Err(e) => {
                    last_error = e;
                    if attempt < max_attempts {
                        let delay = Duration::from_millis(100 * (1 << (attempt - 1).min(6)));
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(last_error)
    }

    /// Wrap already-connected stream halves.
    pub fn from_io(reader: BoxReader, writer: BoxWriter, framing: Framing) -> Self {
        Self {
            reader: FrameReader::new(reader, framing.clone()),
            writer: FrameWriter::new(writer, framing),
            request_id: AtomicU64::new(1),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Set the request timeout duration.
    ///
    /// Default is 30 seconds.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Generate the next request ID.
    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a call and wait for its result.
    ///
    /// `params` of `Value::Null` are omitted from the request.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Request times out (`ClientError::Timeout`)
    /// - Connection is lost (`ClientError::Io`, `ClientError::Closed`)
    /// - Server returns error (`ClientError::ServerError`)
    /// - The reply is not for this request (`ClientError::Protocol`)
    pub async fn call(&mut self, method: &str, params: Value) -> Result<Value, ClientError> {
        let id = Id::from(self.next_id());
        let request = JsonRpcRequest::new(method, non_null(params), id.clone());

        let response = with_timeout(self.timeout, async {
            self.send_value(&request.to_value()).await?;
            self.recv_response().await
        })
        .await?;

        if response.id.as_ref() != Some(&id) {
            return Err(ClientError::Protocol(format!(
                "expected response id {}, got {:?}",
                id, response.id
            )));
        }
        Ok(response.into_result()?)
    }

    /// Send a notification. No reply is expected.
    pub async fn notify(&mut self, method: &str, params: Value) -> Result<(), ClientError> {
        let request = JsonRpcRequest::notification(method, non_null(params));
        with_timeout(self.timeout, self.send_value(&request.to_value())).await
    }

    /// Send several calls as one batch and return their results in order.
    ///
    /// # Errors
    ///
    /// The outer error covers transport and framing failures; each element
    /// carries its own server error independently.
    pub async fn batch(
        &mut self,
        calls: Vec<(String, Value)>,
    ) -> Result<Vec<Result<Value, ClientError>>, ClientError> {
        let ids: Vec<Id> = calls.iter().map(|_| Id::from(self.next_id())).collect();
        let frame = Value::Array(
            calls
                .into_iter()
                .zip(&ids)
                .map(|((method, params), id)| {
                    JsonRpcRequest::new(method, non_null(params), id.clone()).to_value()
                })
                .collect(),
        );

        let reply = with_timeout(self.timeout, async {
            self.send_value(&frame).await?;
            self.recv_value().await
        })
        .await?;

        let items = match reply {
            Value::Array(items) => items,
            other => {
                return Err(ClientError::Protocol(format!(
                    "expected batch response, got {}",
                    other
                )))
            }
        };

        let mut by_id: HashMap<Id, JsonRpcResponse> = HashMap::new();
        for item in items {
            let response = JsonRpcResponse::from_value(item)
                .map_err(|e| ClientError::Protocol(e.to_string()))?;
            if let Some(id) = response.id.clone() {
                by_id.insert(id, response);
            }
        }

        Ok(ids
            .iter()
            .map(|id| match by_id.remove(id) {
                Some(response) => response.into_result().map_err(ClientError::from),
                None => Err(ClientError::Protocol(format!("no response for id {}", id))),
            })
            .collect())
    }

    /// Write one raw JSON value as a frame.
    pub async fn send_value(&mut self, value: &Value) -> Result<(), ClientError> {
        self.writer.write_value(value).await?;
        Ok(())
    }

    /// Write raw bytes as a frame, bypassing JSON encoding.
    pub async fn send_bytes(&mut self, body: &[u8]) -> Result<(), ClientError> {
        self.writer.write_frame(body).await?;
        Ok(())
    }

    /// Read the next frame as a JSON value.
    pub async fn recv_value(&mut self) -> Result<Value, ClientError> {
        let frame = self.reader.read_frame().await?.ok_or(ClientError::Closed)?;
        serde_json::from_slice(&frame)
            .map_err(|e| ClientError::Protocol(format!("Failed to parse response: {}", e)))
    }

    /// Read the next frame as a single response.
    pub async fn recv_response(&mut self) -> Result<JsonRpcResponse, ClientError> {
        let value = self.recv_value().await?;
        JsonRpcResponse::from_value(value).map_err(|e| ClientError::Protocol(e.to_string()))
    }

    /// Close the write side; the server sees end of stream.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

async fn with_timeout<T>(
    limit: Duration,
    fut: impl std::future::Future<Output = Result<T, ClientError>>,
) -> Result<T, ClientError> {
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::Timeout(limit.as_secs())),
    }
}

fn non_null(params: Value) -> Option<Value> {
    match params {
        Value::Null => None,
        params => Some(params),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::duplex;

    use pretty_assertions::assert_eq;
    use tokio::io::DuplexStream;

    /// A client wired to an in-memory peer speaking line framing.
    fn client_pair() -> (RpcClient, FrameReader<DuplexStream>, FrameWriter<DuplexStream>) {
        let (to_client, client_in) = duplex(64 * 1024);
        let (client_out, from_client) = duplex(64 * 1024);
        let client = RpcClient::from_io(Box::new(client_in), Box::new(client_out), Framing::Line);
        (
            client,
            FrameReader::new(from_client, Framing::Line),
            FrameWriter::new(to_client, Framing::Line),
        )
    }

    async fn read_request(reader: &mut FrameReader<DuplexStream>) -> Value {
        let frame = reader.read_frame().await.unwrap().expect("request frame");
        serde_json::from_slice(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let (mut client, mut peer_in, mut peer_out) = client_pair();

        let peer = tokio::spawn(async move {
            let req = read_request(&mut peer_in).await;
            assert_eq!(req["method"], "Math.Add");
            assert_eq!(req["params"], json!([1, 3, 5, 7]));
            peer_out
                .write_value(&json!({"jsonrpc": "2.0", "id": req["id"], "result": 16}))
                .await
                .unwrap();
        });

        let result = client.call("Math.Add", json!([1, 3, 5, 7])).await.unwrap();
        assert_eq!(result, json!(16));
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_call_maps_server_error() {
        let (mut client, mut peer_in, mut peer_out) = client_pair();

        let peer = tokio::spawn(async move {
            let req = read_request(&mut peer_in).await;
            assert!(req.get("params").is_none());
            peer_out
                .write_value(&json!({
                    "jsonrpc": "2.0",
                    "id": req["id"],
                    "error": {"code": -32601, "message": "no such method"}
                }))
                .await
                .unwrap();
        });

        let err = client.call("Nope", Value::Null).await.unwrap_err();
        assert!(matches!(err, ClientError::ServerError { code: -32601, .. }), "got {:?}", err);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_call_rejects_foreign_id() {
        let (mut client, mut peer_in, mut peer_out) = client_pair();

        let peer = tokio::spawn(async move {
            read_request(&mut peer_in).await;
            peer_out
                .write_value(&json!({"jsonrpc": "2.0", "id": 999, "result": 0}))
                .await
                .unwrap();
        });

        assert!(matches!(
            client.call("Math.Status", Value::Null).await,
            Err(ClientError::Protocol(_))
        ));
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_results_follow_request_order() {
        let (mut client, mut peer_in, mut peer_out) = client_pair();

        let peer = tokio::spawn(async move {
            let batch = read_request(&mut peer_in).await;
            let items = batch.as_array().unwrap();
            assert_eq!(items.len(), 2);
            // Answer in reverse order; the second call fails.
            peer_out
                .write_value(&json!([
                    {"jsonrpc": "2.0", "id": items[1]["id"], "error": {"code": -32602, "message": "bad"}},
                    {"jsonrpc": "2.0", "id": items[0]["id"], "result": 6},
                ]))
                .await
                .unwrap();
        });

        let results = client
            .batch(vec![
                ("Math.Mul".to_string(), json!({"X": 2, "Y": 3})),
                ("Math.Mul".to_string(), json!("oops")),
            ])
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap(), &json!(6));
        assert!(matches!(results[1], Err(ClientError::ServerError { code: -32602, .. })));
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_call_times_out() {
        let (mut client, _peer_in, _peer_out) = client_pair();
        client.set_timeout(Duration::from_millis(50));

        assert!(matches!(
            client.call("Math.Status", Value::Null).await,
            Err(ClientError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_connection() {
        let (mut client, _peer_in, peer_out) = client_pair();
        drop(peer_out);
        assert!(matches!(client.recv_value().await, Err(ClientError::Closed)));
    }

    #[test]
    fn test_client_error_display() {
        let timeout_err = ClientError::Timeout(30);
        assert_eq!(timeout_err.to_string(), "Request timed out after 30s");

        let server_err = ClientError::ServerError {
            code: -32000,
            message: "Database error".to_string(),
            data: None,
        };
        assert_eq!(server_err.to_string(), "Server error -32000: Database error");

        let protocol_err = ClientError::Protocol("Invalid JSON".to_string());
        assert_eq!(protocol_err.to_string(), "Protocol error: Invalid JSON");
    }

    #[test]
    fn test_client_error_from_io() {
        let not_found = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let err: ClientError = not_found.into();
        assert!(matches!(err, ClientError::ConnectionFailed(_)));

        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: ClientError = refused.into();
        assert!(matches!(err, ClientError::ConnectionFailed(_)));

        let other = std::io::Error::new(std::io::ErrorKind::Other, "other");
        let err: ClientError = other.into();
        assert!(matches!(err, ClientError::Io(_)));
    }

    #[test]
    fn test_client_error_from_json_rpc() {
        let json_err = JsonRpcError::new(-32601, "Method not found").with_data(json!({"method": "unknown"}));

        match ClientError::from(json_err) {
            ClientError::ServerError { code, message, data } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
                assert!(data.is_some());
            }
            other => panic!("Expected ServerError, got {:?}", other),
        }
    }
}
