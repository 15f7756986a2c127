//! JSON-RPC 2.0 message values.
//!
//! The proxy never interprets `params` or `result`. It only needs to tell
//! calls from notifications, validate the envelope well enough to answer
//! protocol errors, and rewrite the `id` member in both directions.
//!
//! Parsing is deliberately split by direction:
//!
//! - [`parse_inbound`] classifies a client frame into a single request or a
//!   batch, producing ready-made error responses for invalid elements.
//! - [`JsonRpcResponse::from_value`] reads backend replies leniently so a
//!   reply with a routable id but a broken body can still be failed back.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Protocol version tag carried by every message.
pub const VERSION: &str = "2.0";

/// Error codes used by the proxy and the demo programs.
pub mod code {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    /// The backend is gone or could not be written to.
    pub const SYSTEM_ERROR: i32 = -32098;
    pub const CANCELLED: i32 = -32097;
    pub const DEADLINE_EXCEEDED: i32 = -32096;
}

// =============================================================================
// Identifiers
// =============================================================================

/// A request identifier as it appears on the wire.
///
/// Client ids are only unique within one connection, so the proxy treats
/// them as opaque and restores them byte-for-byte on the way back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(serde_json::Number),
    String(String),
}

impl Id {
    /// Read an id from a JSON value. `null` and structured values are not ids.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => Some(Id::Number(n.clone())),
            Value::String(s) => Some(Id::String(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Id::Number(n) => Value::Number(n.clone()),
            Id::String(s) => Value::String(s.clone()),
        }
    }

    /// The id as a backend id, if it is a non-negative integer.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Id::Number(n) => n.as_u64(),
            Id::String(_) => None,
        }
    }
}

impl From<u64> for Id {
    fn from(n: u64) -> Self {
        Id::Number(n.into())
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Id::String(s.to_string())
    }
}

impl From<String> for Id {
    fn from(s: String) -> Self {
        Id::String(s)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Number(n) => write!(f, "{}", n),
            Id::String(s) => write!(f, "{:?}", s),
        }
    }
}

fn id_value(id: Option<&Id>) -> Value {
    id.map(Id::to_value).unwrap_or(Value::Null)
}

// =============================================================================
// Error Object
// =============================================================================

/// The `error` member of a failed response.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("JSON-RPC error {code}: {message}")]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(detail: impl fmt::Display) -> Self {
        Self::new(code::PARSE_ERROR, format!("parse error: {}", detail))
    }

    pub fn invalid_request(detail: impl fmt::Display) -> Self {
        Self::new(code::INVALID_REQUEST, format!("invalid request: {}", detail))
    }

    /// A call reused a client-local id that is still awaiting its reply.
    pub fn duplicate_id(id: &Id) -> Self {
        Self::invalid_request(format!("duplicate request id {}", id))
    }

    pub fn backend_unavailable() -> Self {
        Self::new(code::SYSTEM_ERROR, "backend unavailable")
    }

    pub fn backend_write_failed(detail: impl fmt::Display) -> Self {
        Self::new(code::SYSTEM_ERROR, format!("backend write failed: {}", detail))
    }

    pub fn deadline_exceeded() -> Self {
        Self::new(code::DEADLINE_EXCEEDED, "deadline exceeded")
    }
}

// =============================================================================
// Request
// =============================================================================

/// A call (`id` present) or a notification (`id` absent).
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcRequest {
    pub method: String,
    pub params: Option<Value>,
    pub id: Option<Id>,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Option<Value>, id: impl Into<Id>) -> Self {
        Self {
            method: method.into(),
            params,
            id: Some(id.into()),
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            id: None,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), Value::String(VERSION.into()));
        if let Some(id) = &self.id {
            obj.insert("id".into(), id.to_value());
        }
        obj.insert("method".into(), Value::String(self.method.clone()));
        if let Some(params) = &self.params {
            obj.insert("params".into(), params.clone());
        }
        Value::Object(obj)
    }

    /// Validate one request object.
    ///
    /// On failure the error response is returned ready to send: it echoes
    /// the request id when one could be read, and `null` otherwise.
    pub fn from_value(value: Value) -> Result<Self, JsonRpcResponse> {
        let mut obj = match value {
            Value::Object(obj) => obj,
            other => {
                return Err(JsonRpcResponse::failure(
                    None,
                    JsonRpcError::invalid_request(format!("expected object, got {}", kind(&other))),
                ))
            }
        };

        let id = match obj.remove("id") {
            None => None,
            Some(Value::Null) => {
                return Err(JsonRpcResponse::failure(
                    None,
                    JsonRpcError::invalid_request("request id must not be null"),
                ))
            }
            Some(v) => match Id::from_value(&v) {
                Some(id) => Some(id),
                None => {
                    return Err(JsonRpcResponse::failure(
                        None,
                        JsonRpcError::invalid_request("request id must be a number or string"),
                    ))
                }
            },
        };
        let fail = |detail: &str| JsonRpcResponse::failure(id.clone(), JsonRpcError::invalid_request(detail));

        match obj.get("jsonrpc") {
            Some(Value::String(v)) if v == VERSION => {}
            _ => return Err(fail("missing or invalid version tag")),
        }

        let method = match obj.remove("method") {
            Some(Value::String(m)) => m,
            Some(_) => return Err(fail("method must be a string")),
            None if obj.contains_key("result") || obj.contains_key("error") => {
                return Err(fail("unexpected response object"))
            }
            None => return Err(fail("missing method")),
        };

        let params = match obj.remove("params") {
            None | Some(Value::Null) => None,
            Some(p @ (Value::Array(_) | Value::Object(_))) => Some(p),
            Some(_) => return Err(fail("params must be an array or object")),
        };

        Ok(Self { method, params, id })
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// Response
// =============================================================================

/// A reply to a call. `id` is `None` only for errors that could not be tied
/// to a request (parse errors and unreadable ids).
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcResponse {
    pub id: Option<Id>,
    pub outcome: Result<Value, JsonRpcError>,
}

/// A backend reply that could not be decoded as a response.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("malformed response: {reason}")]
pub struct MalformedResponse {
    /// The id, when it was readable, so the call can still be failed back.
    pub id: Option<Id>,
    pub reason: String,
}

impl JsonRpcResponse {
    pub fn success(id: Id, result: Value) -> Self {
        Self {
            id: Some(id),
            outcome: Ok(result),
        }
    }

    pub fn failure(id: Option<Id>, error: JsonRpcError) -> Self {
        Self {
            id,
            outcome: Err(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.outcome.is_err()
    }

    pub fn error(&self) -> Option<&JsonRpcError> {
        self.outcome.as_ref().err()
    }

    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        self.outcome
    }

    pub fn to_value(&self) -> Value {
        match &self.outcome {
            Ok(result) => json!({
                "jsonrpc": VERSION,
                "id": id_value(self.id.as_ref()),
                "result": result,
            }),
            Err(error) => json!({
                "jsonrpc": VERSION,
                "id": id_value(self.id.as_ref()),
                "error": error,
            }),
        }
    }

    pub fn from_value(value: Value) -> Result<Self, MalformedResponse> {
        let mut obj = match value {
            Value::Object(obj) => obj,
            other => {
                return Err(MalformedResponse {
                    id: None,
                    reason: format!("expected object, got {}", kind(&other)),
                })
            }
        };

        let id = match obj.remove("id") {
            None | Some(Value::Null) => None,
            Some(v) => match Id::from_value(&v) {
                Some(id) => Some(id),
                None => {
                    return Err(MalformedResponse {
                        id: None,
                        reason: format!("id must be a number or string, got {}", kind(&v)),
                    })
                }
            },
        };

        match (obj.remove("result"), obj.remove("error")) {
            (_, Some(error)) if !error.is_null() => match serde_json::from_value(error) {
                Ok(error) => Ok(Self::failure(id, error)),
                Err(e) => Err(MalformedResponse {
                    id,
                    reason: format!("invalid error object: {}", e),
                }),
            },
            (Some(result), _) => Ok(Self {
                id,
                outcome: Ok(result),
            }),
            (None, _) => Err(MalformedResponse {
                id,
                reason: "missing both result and error".to_string(),
            }),
        }
    }
}

// =============================================================================
// Inbound Classification
// =============================================================================

/// One element of a client frame: a valid request, or the error response
/// it earned.
pub type Element = Result<JsonRpcRequest, JsonRpcResponse>;

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Single(Element),
    /// Possibly empty; an empty batch is itself an invalid request.
    Batch(Vec<Element>),
}

/// Classify one client frame.
///
/// Returns the parse-error response to send when the frame is not JSON.
pub fn parse_inbound(frame: &[u8]) -> Result<Inbound, JsonRpcResponse> {
    let value: Value = serde_json::from_slice(frame)
        .map_err(|e| JsonRpcResponse::failure(None, JsonRpcError::parse_error(e)))?;

    Ok(match value {
        Value::Array(items) => Inbound::Batch(items.into_iter().map(JsonRpcRequest::from_value).collect()),
        other => Inbound::Single(JsonRpcRequest::from_value(other)),
    })
}
