//! math-server - demo JSON-RPC 2.0 backend speaking over stdin/stdout.
//!
//! Run it behind the proxy:
//!
//! ```text
//! jproxy -a :8080 --sf line -- math-server --framing line
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use jproxy::ipc::{FrameReader, FrameWriter, Framing};
use jproxy::jsonrpc::{self, code, Id, Inbound, JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use jproxy::logging;

/// Server-defined error code for arithmetic failures.
const ARITHMETIC_ERROR: i32 = -32000;

#[derive(Parser, Debug)]
#[command(name = "math-server", version, about = "Demo JSON-RPC backend on stdin/stdout")]
struct Args {
    /// Channel framing
    #[arg(long, default_value = "raw")]
    framing: String,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Deserialize)]
struct BinArg {
    #[serde(rename = "X")]
    x: i64,
    #[serde(rename = "Y")]
    y: i64,
}

#[derive(Debug, Deserialize)]
struct Alert {
    #[serde(rename = "Msg")]
    msg: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(if args.verbose { "math_server=debug" } else { "math_server=info" });
    let framing: Framing = args.framing.parse()?;

    let mut reader = FrameReader::new(tokio::io::stdin(), framing.clone());
    let mut writer = FrameWriter::new(tokio::io::stdout(), framing);
    info!("math-server ready");

    while let Some(frame) = reader.read_frame().await.context("Failed to read request")? {
        let reply = match jsonrpc::parse_inbound(&frame) {
            Err(parse_error) => Some(parse_error.to_value()),
            Ok(Inbound::Single(element)) => answer(element).map(|r| r.to_value()),
            Ok(Inbound::Batch(elements)) if elements.is_empty() => Some(
                JsonRpcResponse::failure(None, JsonRpcError::invalid_request("empty batch")).to_value(),
            ),
            Ok(Inbound::Batch(elements)) => {
                let replies: Vec<Value> = elements
                    .into_iter()
                    .filter_map(answer)
                    .map(|r| r.to_value())
                    .collect();
                (!replies.is_empty()).then_some(Value::Array(replies))
            }
        };
        if let Some(reply) = reply {
            writer.write_value(&reply).await.context("Failed to write reply")?;
        }
    }

    info!("Input closed, exiting");
    Ok(())
}

/// Produce the reply for one element; notifications get none.
fn answer(element: jsonrpc::Element) -> Option<JsonRpcResponse> {
    let request = match element {
        Ok(request) => request,
        Err(invalid) => return Some(invalid),
    };
    let JsonRpcRequest { method, params, id } = request;
    let outcome = dispatch(&method, params);
    match id {
        Some(id) => Some(respond(id, outcome)),
        None => {
            if let Err(e) = outcome {
                warn!("Notification {} failed: {}", method, e);
            }
            None
        }
    }
}

fn respond(id: Id, outcome: Result<Value, JsonRpcError>) -> JsonRpcResponse {
    JsonRpcResponse { id: Some(id), outcome }
}

fn dispatch(method: &str, params: Option<Value>) -> Result<Value, JsonRpcError> {
    debug!("{} {:?}", method, params);
    match method {
        "Math.Add" => {
            let values: Vec<i64> = parse_params(params)?;
            Ok(json!(values.iter().sum::<i64>()))
        }
        "Math.Sub" => {
            let BinArg { x, y } = parse_params(params)?;
            Ok(json!(x - y))
        }
        "Math.Mul" => {
            let BinArg { x, y } = parse_params(params)?;
            Ok(json!(x * y))
        }
        "Math.Div" => {
            let BinArg { x, y } = parse_params(params)?;
            if y == 0 {
                return Err(JsonRpcError::new(ARITHMETIC_ERROR, "zero divisor"));
            }
            Ok(json!(x as f64 / y as f64))
        }
        "Math.Status" => Ok(json!("OK")),
        "Post.Alert" => {
            let Alert { msg } = parse_params(params)?;
            info!("[ALERT]: {}", msg);
            Ok(Value::Null)
        }
        other => Err(JsonRpcError::new(
            code::METHOD_NOT_FOUND,
            format!("no such method {:?}", other),
        )),
    }
}

fn parse_params<T: for<'de> Deserialize<'de>>(params: Option<Value>) -> Result<T, JsonRpcError> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| JsonRpcError::new(code::INVALID_PARAMS, format!("invalid params: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_math_methods() {
        assert_eq!(dispatch("Math.Add", Some(json!([1, 3, 5, 7]))), Ok(json!(16)));
        assert_eq!(dispatch("Math.Sub", Some(json!({"X": 9, "Y": 4}))), Ok(json!(5)));
        assert_eq!(dispatch("Math.Mul", Some(json!({"X": 6, "Y": 7}))), Ok(json!(42)));
        assert_eq!(dispatch("Math.Div", Some(json!({"X": 82, "Y": 19}))), Ok(json!(82.0 / 19.0)));
        assert_eq!(dispatch("Math.Status", None), Ok(json!("OK")));
    }

    #[test]
    fn test_errors() {
        let err = dispatch("Math.Div", Some(json!({"X": 15, "Y": 0}))).unwrap_err();
        assert_eq!(err.message, "zero divisor");
        assert_eq!(dispatch("Math.Pow", None).unwrap_err().code, code::METHOD_NOT_FOUND);
        assert_eq!(dispatch("Math.Add", Some(json!({"X": 1}))).unwrap_err().code, code::INVALID_PARAMS);
    }

    #[test]
    fn test_notifications_get_no_reply() {
        let note = JsonRpcRequest::notification("Post.Alert", Some(json!({"Msg": "There is a fire!"})));
        assert!(answer(Ok(note)).is_none());

        let call = JsonRpcRequest::new("Math.Status", None, 4u64);
        assert_eq!(answer(Ok(call)).unwrap().outcome, Ok(json!("OK")));
    }
}
