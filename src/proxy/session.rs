//! Per-connection session handler.
//!
//! A session reads client frames, validates them, and hands calls to the
//! multiplexer. Replies come back on the session's delivery channel already
//! carrying the client's own ids; batches are reassembled here.
//!
//! The session ends when the client disconnects, when a write to the client
//! fails, or when the multiplexer drops its delivery channel during drain.
//! However it ends, the multiplexer is told to forget its pending calls.

use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::Value;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tracing::{debug, warn};

use crate::error::FramingError;
use crate::ipc::{BoxReader, BoxWriter, Connection, FrameReader, FrameWriter, Framing};
use crate::jsonrpc::{self, Element, Id, Inbound, JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use crate::proxy::mux::{BatchItem, Command, Delivery, MuxHandle};
use crate::proxy::routes::{CallTag, SessionId};
use crate::proxy::BatchMode;

/// Messages queued behind the admission gate before the session stops
/// reading from its client.
const MAX_WAITING: usize = 1024;

/// Sends `Detach` when the session is dropped, including on task abort.
struct DetachGuard {
    mux: MuxHandle,
    session: SessionId,
}

impl Drop for DetachGuard {
    fn drop(&mut self) {
        self.mux.detach(self.session);
    }
}

/// A batch waiting for the rest of its replies.
struct PendingBatch {
    slots: Vec<Option<JsonRpcResponse>>,
    remaining: usize,
}

/// A client message not yet handed to the multiplexer.
///
/// Notifications queue too, so they never overtake earlier calls.
struct Waiting {
    request: JsonRpcRequest,
    tag: CallTag,
}

pub struct Session {
    id: SessionId,
    peer: String,
    reader: FrameReader<BoxReader>,
    writer: FrameWriter<BoxWriter>,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    mux: MuxHandle,
    batch_mode: BatchMode,
    /// Client ids with a reply still owed on this connection.
    in_flight: HashSet<Id>,
    batches: HashMap<u64, PendingBatch>,
    next_batch: u64,
    waiting: VecDeque<Waiting>,
    _detach: DetachGuard,
}

impl Session {
    /// Register a new connection with the multiplexer.
    pub fn new(connection: Connection, framing: &Framing, mux: MuxHandle, batch_mode: BatchMode) -> Self {
        let (id, deliveries) = mux.attach();
        debug!("{} accepted from {}", id, connection.peer);
        Self {
            id,
            peer: connection.peer,
            reader: FrameReader::new(connection.reader, framing.clone()),
            writer: FrameWriter::new(connection.writer, framing.clone()),
            deliveries,
            mux: mux.clone(),
            batch_mode,
            in_flight: HashSet::new(),
            batches: HashMap::new(),
            next_batch: 1,
            waiting: VecDeque::new(),
            _detach: DetachGuard { mux, session: id },
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Serve the connection until it closes.
    ///
    /// Waiting for an admission slot is one more branch of the loop, so the
    /// session keeps reading while its calls are held back. A client that
    /// disconnects in the meantime takes its queued calls with it.
    pub async fn run(mut self) {
        let reason = loop {
            tokio::select! {
                biased;

                delivery = self.deliveries.recv() => match delivery {
                    Some(delivery) => {
                        if let Err(e) = self.on_delivery(delivery).await {
                            break format!("write failed: {}", e);
                        }
                    }
                    None => break "proxy draining".to_string(),
                },

                permit = self.mux.admit(), if !self.waiting.is_empty() => {
                    let result = match permit {
                        Some(permit) => self.forward_waiting(Some(permit)).await,
                        None => self.refuse_waiting().await,
                    };
                    if let Err(e) = result {
                        break format!("write failed: {}", e);
                    }
                }

                frame = self.reader.read_frame(), if self.waiting.len() < MAX_WAITING => match frame {
                    Ok(Some(frame)) => {
                        if let Err(e) = self.on_frame(&frame).await {
                            break format!("write failed: {}", e);
                        }
                    }
                    Ok(None) => break "client disconnected".to_string(),
                    Err(FramingError::Malformed(detail)) => {
                        // The stream cannot be resynchronised; answer, then hang up.
                        let response = JsonRpcResponse::failure(None, JsonRpcError::parse_error(&detail));
                        let _ = self.write(&response).await;
                        break format!("unreadable input: {}", detail);
                    }
                    Err(e) => break format!("read failed: {}", e),
                },
            }
        };

        if !self.waiting.is_empty() {
            debug!("{}: {} queued messages dropped", self.id, self.waiting.len());
        }
        debug!("{} ({}) closed: {}", self.id, self.peer, reason);
        if let Err(e) = self.writer.shutdown().await {
            debug!("{} shutdown: {}", self.id, e);
        }
    }

    async fn on_frame(&mut self, frame: &[u8]) -> Result<(), FramingError> {
        match jsonrpc::parse_inbound(frame) {
            Err(parse_error) => self.write(&parse_error).await,
            Ok(Inbound::Single(Err(invalid))) => self.write(&invalid).await,
            Ok(Inbound::Single(Ok(request))) => self.forward_single(request).await,
            Ok(Inbound::Batch(elements)) if elements.is_empty() => {
                let response = JsonRpcResponse::failure(None, JsonRpcError::invalid_request("empty batch"));
                self.write(&response).await
            }
            Ok(Inbound::Batch(elements)) => self.forward_batch(elements).await,
        }
    }

    async fn forward_single(&mut self, request: JsonRpcRequest) -> Result<(), FramingError> {
        if let Some(id) = &request.id {
            if !self.in_flight.insert(id.clone()) {
                let response = JsonRpcResponse::failure(Some(id.clone()), JsonRpcError::duplicate_id(id));
                return self.write(&response).await;
            }
        }
        self.waiting.push_back(Waiting {
            request,
            tag: CallTag::Single,
        });
        self.forward_waiting(None).await
    }

    async fn forward_batch(&mut self, elements: Vec<Element>) -> Result<(), FramingError> {
        let batch = self.next_batch;
        self.next_batch += 1;

        let mut slots: Vec<Option<JsonRpcResponse>> = Vec::new();
        let mut queued = Vec::new();
        for element in elements {
            match element {
                Err(invalid) => slots.push(Some(invalid)),
                Ok(request) => match request.id.clone() {
                    // Notifications carry no reply slot.
                    None => queued.push(Waiting {
                        request,
                        tag: CallTag::Batch { batch, slot: 0 },
                    }),
                    Some(id) if !self.in_flight.insert(id.clone()) => {
                        let error = JsonRpcError::duplicate_id(&id);
                        slots.push(Some(JsonRpcResponse::failure(Some(id), error)));
                    }
                    Some(_) => {
                        queued.push(Waiting {
                            request,
                            tag: CallTag::Batch {
                                batch,
                                slot: slots.len(),
                            },
                        });
                        slots.push(None);
                    }
                },
            }
        }

        // A batch of notifications only gets no reply at all.
        let remaining = slots.iter().filter(|slot| slot.is_none()).count();
        if remaining > 0 {
            self.batches.insert(batch, PendingBatch { slots, remaining });
        } else if !slots.is_empty() {
            self.write_batch(slots).await?;
        }

        self.waiting.extend(queued);
        self.forward_waiting(None).await
    }

    /// Hand queued messages to the multiplexer in order, for as long as
    /// admission slots are free.
    ///
    /// `permit` is a slot already acquired for the first queued call. In
    /// native mode, consecutive elements of one batch travel together as one
    /// backend frame, so a batch larger than the free slots goes out in
    /// several frames instead of holding slots it cannot use yet.
    async fn forward_waiting(&mut self, mut permit: Option<OwnedSemaphorePermit>) -> Result<(), FramingError> {
        let mut refused = Vec::new();
        let mut chunk: Option<(u64, Vec<BatchItem>)> = None;

        while let Some(next) = self.waiting.front() {
            let is_call = next.request.id.is_some();
            let native_batch = match (self.batch_mode, next.tag) {
                (BatchMode::Native, CallTag::Batch { batch, .. }) => Some(batch),
                _ => None,
            };

            if chunk.as_ref().map(|(batch, _)| *batch) != native_batch {
                if let Some((batch, items)) = chunk.take() {
                    refused.extend(self.send_chunk(batch, items));
                }
            }

            let slot_permit = if is_call {
                match permit.take().or_else(|| self.mux.try_admit()) {
                    Some(permit) => Some(permit),
                    None => break,
                }
            } else {
                None
            };
            let Some(Waiting { request, tag }) = self.waiting.pop_front() else {
                break;
            };

            match native_batch {
                Some(batch) => {
                    let slot = match tag {
                        CallTag::Batch { slot, .. } => slot,
                        CallTag::Single => 0,
                    };
                    let item = BatchItem {
                        request,
                        slot,
                        permit: slot_permit,
                    };
                    chunk.get_or_insert_with(|| (batch, Vec::new())).1.push(item);
                }
                None => refused.extend(self.send_one(request, tag, slot_permit)),
            }
        }
        if let Some((batch, items)) = chunk {
            refused.extend(self.send_chunk(batch, items));
        }

        for (id, tag) in refused {
            self.on_delivery(unavailable(id, tag)).await?;
        }
        Ok(())
    }

    /// Forward one call or notification. Returns the call back if the
    /// multiplexer has stopped.
    fn send_one(
        &self,
        request: JsonRpcRequest,
        tag: CallTag,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Option<(Id, CallTag)> {
        let id = request.id.clone();
        let sent = match id {
            Some(_) => self.mux.send(Command::Call {
                session: self.id,
                request,
                tag,
                permit,
            }),
            None => self.mux.send(Command::Notify {
                session: self.id,
                request,
            }),
        };
        match id {
            Some(id) if !sent => Some((id, tag)),
            _ => None,
        }
    }

    /// Forward part of a native batch as one backend frame. Returns the
    /// calls that could not be sent.
    fn send_chunk(&self, batch: u64, items: Vec<BatchItem>) -> Vec<(Id, CallTag)> {
        let calls: Vec<(Id, CallTag)> = items
            .iter()
            .filter_map(|item| {
                let tag = CallTag::Batch { batch, slot: item.slot };
                item.request.id.clone().map(|id| (id, tag))
            })
            .collect();
        let sent = self.mux.send(Command::Batch {
            session: self.id,
            batch,
            items,
        });
        if sent {
            Vec::new()
        } else {
            calls
        }
    }

    /// The proxy stopped admitting calls; answer everything still queued.
    async fn refuse_waiting(&mut self) -> Result<(), FramingError> {
        while let Some(Waiting { request, tag }) = self.waiting.pop_front() {
            if let Some(id) = request.id {
                self.on_delivery(unavailable(id, tag)).await?;
            }
        }
        Ok(())
    }

    async fn on_delivery(&mut self, delivery: Delivery) -> Result<(), FramingError> {
        let Delivery { tag, response } = delivery;
        if let Some(id) = &response.id {
            self.in_flight.remove(id);
        }

        match tag {
            CallTag::Single => self.write(&response).await,
            CallTag::Batch { batch, slot } => {
                let Some(pending) = self.batches.get_mut(&batch) else {
                    warn!("{}: reply for unknown batch {} dropped", self.id, batch);
                    return Ok(());
                };
                match pending.slots.get_mut(slot) {
                    Some(entry) if entry.is_none() => {
                        *entry = Some(response);
                        pending.remaining -= 1;
                    }
                    _ => {
                        warn!("{}: unexpected reply for batch {} slot {}", self.id, batch, slot);
                        return Ok(());
                    }
                }
                if pending.remaining > 0 {
                    return Ok(());
                }
                match self.batches.remove(&batch) {
                    Some(done) => self.write_batch(done.slots).await,
                    None => Ok(()),
                }
            }
        }
    }

    async fn write(&mut self, response: &JsonRpcResponse) -> Result<(), FramingError> {
        self.writer.write_value(&response.to_value()).await
    }

    async fn write_batch(&mut self, slots: Vec<Option<JsonRpcResponse>>) -> Result<(), FramingError> {
        let replies: Vec<Value> = slots.iter().flatten().map(JsonRpcResponse::to_value).collect();
        self.writer.write_value(&Value::Array(replies)).await
    }
}

fn unavailable(id: Id, tag: CallTag) -> Delivery {
    Delivery {
        tag,
        response: JsonRpcResponse::failure(Some(id), JsonRpcError::backend_unavailable()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::code;
    use crate::proxy::backend::{BackendClient, BackendEvent};
    use crate::proxy::mux::Multiplexer;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    const WAIT: Duration = Duration::from_secs(2);

    /// A session wired to a multiplexer whose backend is a line-framed
    /// duplex stream the test reads and answers by hand.
    struct Rig {
        client_in: FrameWriter<DuplexStream>,
        client_out: FrameReader<DuplexStream>,
        backend_in: FrameReader<DuplexStream>,
        mux: MuxHandle,
        shutdown: CancellationToken,
    }

    fn rig(batch_mode: BatchMode) -> Rig {
        rig_with(batch_mode, 4)
    }

    fn rig_with(batch_mode: BatchMode, concurrency: usize) -> Rig {
        let (backend_near, backend_far) = tokio::io::duplex(64 * 1024);
        let shutdown = CancellationToken::new();
        let backend = BackendClient::new(Box::new(backend_near), Framing::Line);
        let (mux, handle) = Multiplexer::new(backend, concurrency, None, shutdown.clone());
        tokio::spawn(mux.run());

        let (to_session, session_in) = tokio::io::duplex(64 * 1024);
        let (session_out, from_session) = tokio::io::duplex(64 * 1024);
        let connection = Connection {
            reader: Box::new(session_in),
            writer: Box::new(session_out),
            peer: "test".to_string(),
        };
        let session = Session::new(connection, &Framing::Line, handle.clone(), batch_mode);
        tokio::spawn(session.run());

        Rig {
            client_in: FrameWriter::new(to_session, Framing::Line),
            client_out: FrameReader::new(from_session, Framing::Line),
            backend_in: FrameReader::new(backend_far, Framing::Line),
            mux: handle,
            shutdown,
        }
    }

    impl Rig {
        async fn send(&mut self, raw: &str) {
            self.client_in.write_frame(raw.as_bytes()).await.unwrap();
        }

        async fn recv(&mut self) -> Value {
            let frame = timeout(WAIT, self.client_out.read_frame())
                .await
                .expect("reply within timeout")
                .unwrap()
                .expect("connection open");
            serde_json::from_slice(&frame).unwrap()
        }

        async fn backend_recv(&mut self) -> Value {
            let frame = timeout(WAIT, self.backend_in.read_frame())
                .await
                .expect("backend frame within timeout")
                .unwrap()
                .expect("backend open");
            serde_json::from_slice(&frame).unwrap()
        }

        fn backend_reply(&self, value: Value) {
            assert!(self.mux.send(Command::Backend(BackendEvent::Frame(value))));
        }
    }

    #[tokio::test]
    async fn test_parse_error_keeps_connection_open() {
        let mut rig = rig(BatchMode::Split);
        rig.send("{oops").await;
        let reply = rig.recv().await;
        assert_eq!(reply["id"], Value::Null);
        assert_eq!(reply["error"]["code"], code::PARSE_ERROR);

        rig.send(r#"{"jsonrpc":"2.0","id":1,"method":"Math.Status"}"#).await;
        let sent = rig.backend_recv().await;
        assert_eq!(sent["method"], "Math.Status");
    }

    #[tokio::test]
    async fn test_invalid_request_echoes_id() {
        let mut rig = rig(BatchMode::Split);
        rig.send(r#"{"jsonrpc":"1.0","id":"q","method":"m"}"#).await;
        let reply = rig.recv().await;
        assert_eq!(reply["id"], "q");
        assert_eq!(reply["error"]["code"], code::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_duplicate_in_flight_id_rejected() {
        let mut rig = rig(BatchMode::Split);
        rig.send(r#"{"jsonrpc":"2.0","id":5,"method":"first"}"#).await;
        let first = rig.backend_recv().await;
        rig.send(r#"{"jsonrpc":"2.0","id":5,"method":"second"}"#).await;

        let reply = rig.recv().await;
        assert_eq!(reply["id"], 5);
        assert_eq!(reply["error"]["code"], code::INVALID_REQUEST);
        assert!(reply["error"]["message"].as_str().unwrap().contains("duplicate"));

        // The original call is untouched.
        rig.backend_reply(json!({"jsonrpc": "2.0", "id": first["id"], "result": "first"}));
        assert_eq!(rig.recv().await, json!({"jsonrpc": "2.0", "id": 5, "result": "first"}));

        // Once answered, the id may be used again.
        rig.send(r#"{"jsonrpc":"2.0","id":5,"method":"third"}"#).await;
        assert_eq!(rig.backend_recv().await["method"], "third");
    }

    #[tokio::test]
    async fn test_split_batch_reassembled_in_order() {
        let mut rig = rig(BatchMode::Split);
        rig.send(
            r#"[{"jsonrpc":"2.0","id":1,"method":"a"},
                {"jsonrpc":"2.0","method":"note"},
                42,
                {"jsonrpc":"2.0","id":2,"method":"b"}]"#
                .replace('\n', "")
                .as_str(),
        )
        .await;

        let a = rig.backend_recv().await;
        let note = rig.backend_recv().await;
        let b = rig.backend_recv().await;
        assert_eq!(note["method"], "note");
        assert!(note.get("id").is_none());

        rig.backend_reply(json!({"jsonrpc": "2.0", "id": b["id"], "error": {"code": -32601, "message": "nope"}}));
        rig.backend_reply(json!({"jsonrpc": "2.0", "id": a["id"], "result": "A"}));

        let reply = rig.recv().await;
        let replies = reply.as_array().expect("array reply");
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0], json!({"jsonrpc": "2.0", "id": 1, "result": "A"}));
        assert_eq!(replies[1]["error"]["code"], code::INVALID_REQUEST);
        assert_eq!(replies[2]["id"], 2);
        assert_eq!(replies[2]["error"]["code"], code::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_native_batch_single_backend_frame() {
        let mut rig = rig(BatchMode::Native);
        rig.send(r#"[{"jsonrpc":"2.0","id":"x","method":"a"},{"jsonrpc":"2.0","id":"y","method":"b"}]"#)
            .await;

        let frame = rig.backend_recv().await;
        let calls = frame.as_array().expect("batch frame");
        assert_eq!(calls.len(), 2);
        rig.backend_reply(json!([
            {"jsonrpc": "2.0", "id": calls[1]["id"], "result": "B"},
            {"jsonrpc": "2.0", "id": calls[0]["id"], "result": "A"},
        ]));

        assert_eq!(
            rig.recv().await,
            json!([
                {"jsonrpc": "2.0", "id": "x", "result": "A"},
                {"jsonrpc": "2.0", "id": "y", "result": "B"},
            ])
        );
    }

    fn batch_of(methods: &[&str]) -> String {
        let calls: Vec<Value> = methods
            .iter()
            .enumerate()
            .map(|(i, m)| json!({"jsonrpc": "2.0", "id": i + 1, "method": m}))
            .collect();
        Value::Array(calls).to_string()
    }

    fn echo(call: &Value) -> Value {
        json!({"jsonrpc": "2.0", "id": call["id"], "result": call["method"]})
    }

    #[tokio::test]
    async fn test_native_batch_larger_than_limit_goes_out_in_chunks() {
        let mut rig = rig_with(BatchMode::Native, 2);
        rig.send(&batch_of(&["a", "b", "c"])).await;

        let first = rig.backend_recv().await;
        let first = first.as_array().expect("batch frame");
        assert_eq!(first.len(), 2);
        rig.backend_reply(Value::Array(first.iter().map(echo).collect()));

        let rest = rig.backend_recv().await;
        let rest = rest.as_array().expect("batch frame");
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0]["method"], "c");
        rig.backend_reply(Value::Array(rest.iter().map(echo).collect()));

        assert_eq!(
            rig.recv().await,
            json!([
                {"jsonrpc": "2.0", "id": 1, "result": "a"},
                {"jsonrpc": "2.0", "id": 2, "result": "b"},
                {"jsonrpc": "2.0", "id": 3, "result": "c"},
            ])
        );
    }

    #[tokio::test]
    async fn test_split_batch_larger_than_limit() {
        let mut rig = rig_with(BatchMode::Split, 2);
        rig.send(&batch_of(&["a", "b", "c"])).await;

        let a = rig.backend_recv().await;
        let b = rig.backend_recv().await;
        rig.backend_reply(echo(&a));
        let c = rig.backend_recv().await;
        assert_eq!(c["method"], "c");
        rig.backend_reply(echo(&c));
        rig.backend_reply(echo(&b));

        let reply = rig.recv().await;
        let ids: Vec<&Value> = reply.as_array().expect("array reply").iter().map(|r| &r["id"]).collect();
        assert_eq!(ids, vec![&json!(1), &json!(2), &json!(3)]);
    }

    #[tokio::test]
    async fn test_disconnect_while_waiting_for_admission() {
        let mut rig = rig_with(BatchMode::Split, 1);
        rig.send(r#"{"jsonrpc":"2.0","id":1,"method":"slow"}"#).await;
        let slow = rig.backend_recv().await;
        rig.send(r#"{"jsonrpc":"2.0","id":2,"method":"queued"}"#).await;

        // The session notices the hang-up while its second call waits.
        drop(rig.client_in);
        let end = timeout(WAIT, rig.client_out.read_frame()).await.unwrap().unwrap();
        assert!(end.is_none(), "session should close on disconnect");

        // Freeing the slot must not release the abandoned call.
        assert!(rig.mux.send(Command::Backend(BackendEvent::Frame(echo(&slow)))));
        let quiet = timeout(Duration::from_millis(200), rig.backend_in.read_frame()).await;
        assert!(quiet.is_err(), "queued call reached the backend: {:?}", quiet);
    }

    #[tokio::test]
    async fn test_batch_edge_cases() {
        let mut rig = rig(BatchMode::Split);

        rig.send("[]").await;
        let reply = rig.recv().await;
        assert_eq!(reply["error"]["code"], code::INVALID_REQUEST);
        assert_eq!(reply["id"], Value::Null);

        // Only notifications: forwarded, never answered.
        rig.send(r#"[{"jsonrpc":"2.0","method":"n1"},{"jsonrpc":"2.0","method":"n2"}]"#)
            .await;
        assert_eq!(rig.backend_recv().await["method"], "n1");
        assert_eq!(rig.backend_recv().await["method"], "n2");

        // Repeated id inside one batch.
        rig.send(r#"[{"jsonrpc":"2.0","id":9,"method":"a"},{"jsonrpc":"2.0","id":9,"method":"b"}]"#)
            .await;
        let call = rig.backend_recv().await;
        assert_eq!(call["method"], "a");
        rig.backend_reply(json!({"jsonrpc": "2.0", "id": call["id"], "result": true}));

        let reply = rig.recv().await;
        assert_eq!(reply[0], json!({"jsonrpc": "2.0", "id": 9, "result": true}));
        assert_eq!(reply[1]["error"]["code"], code::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_drain_fails_call_then_closes() {
        let mut rig = rig(BatchMode::Split);
        rig.send(r#"{"jsonrpc":"2.0","id":1,"method":"slow"}"#).await;
        rig.backend_recv().await;

        rig.shutdown.cancel();
        let reply = rig.recv().await;
        assert_eq!(reply["id"], 1);
        assert_eq!(reply["error"]["code"], code::SYSTEM_ERROR);

        let end = timeout(WAIT, rig.client_out.read_frame()).await.unwrap().unwrap();
        assert!(end.is_none(), "connection should close after drain");
    }
}
