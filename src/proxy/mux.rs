//! The multiplexer actor.
//!
//! One task owns the backend writer, the route table and the map of live
//! sessions. Everything else talks to it through [`Command`]s, so allocating
//! a backend id, rewriting the request and writing it out happen as one step
//! that no resolve or purge can interleave with.
//!
//! ```text
//!   Session ──Call/Notify/Batch──┐
//!   Session ──Attach/Detach──────┼──► Multiplexer ──frames──► backend stdin
//!   backend reader ──Backend─────┘        │
//!                                         └──Delivery──► Session
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{BackendError, FramingError, RoutingError};
use crate::jsonrpc::{code, Id, JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use crate::proxy::backend::{BackendClient, BackendEvent};
use crate::proxy::routes::{CallTag, PendingCall, RouteTable, SessionId};

/// A message for the multiplexer.
#[derive(Debug)]
pub enum Command {
    /// Register a session and the channel its replies go to.
    Attach {
        session: SessionId,
        deliveries: mpsc::UnboundedSender<Delivery>,
    },
    /// The session is gone; forget its outstanding calls.
    Detach { session: SessionId },
    /// Forward one call. `request.id` is the client-local id.
    Call {
        session: SessionId,
        request: JsonRpcRequest,
        tag: CallTag,
        permit: Option<OwnedSemaphorePermit>,
    },
    Notify {
        session: SessionId,
        request: JsonRpcRequest,
    },
    /// Forward batch elements together as a single backend frame. A large
    /// batch may arrive as several of these.
    Batch {
        session: SessionId,
        batch: u64,
        items: Vec<BatchItem>,
    },
    Backend(BackendEvent),
}

/// One element of a natively forwarded batch.
#[derive(Debug)]
pub struct BatchItem {
    pub request: JsonRpcRequest,
    /// Reply slot; unused for notifications.
    pub slot: usize,
    pub permit: Option<OwnedSemaphorePermit>,
}

/// A reply routed back to a session, with the client's own id restored.
#[derive(Debug)]
pub struct Delivery {
    pub tag: CallTag,
    pub response: JsonRpcResponse,
}

/// Cloneable entry point to the multiplexer.
#[derive(Debug, Clone)]
pub struct MuxHandle {
    tx: mpsc::UnboundedSender<Command>,
    permits: Arc<Semaphore>,
    next_session: Arc<AtomicU64>,
}

impl MuxHandle {
    /// Register a new session. Returns its id and the channel its replies
    /// arrive on; the channel closes when the proxy drains.
    pub fn attach(&self) -> (SessionId, mpsc::UnboundedReceiver<Delivery>) {
        let session = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        let (deliveries, rx) = mpsc::unbounded_channel();
        // If the multiplexer is gone the sender is dropped with the command
        // and the session sees a closed channel straight away.
        let _ = self.tx.send(Command::Attach { session, deliveries });
        (session, rx)
    }

    pub fn detach(&self, session: SessionId) {
        let _ = self.tx.send(Command::Detach { session });
    }

    /// Queue a command. Returns false once the multiplexer stopped.
    pub fn send(&self, command: Command) -> bool {
        self.tx.send(command).is_ok()
    }

    /// Wait for an admission slot. `None` once the proxy is draining.
    pub async fn admit(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().acquire_owned().await.ok()
    }

    /// Take an admission slot if one is free right now.
    pub fn try_admit(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().try_acquire_owned().ok()
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<Command> {
        self.tx.clone()
    }
}

/// Counts reported when the multiplexer stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainSummary {
    pub failed_calls: usize,
    pub sessions: usize,
}

pub struct Multiplexer {
    commands: mpsc::UnboundedReceiver<Command>,
    backend: BackendClient,
    routes: RouteTable,
    sessions: HashMap<SessionId, mpsc::UnboundedSender<Delivery>>,
    permits: Arc<Semaphore>,
    call_timeout: Option<Duration>,
    shutdown: CancellationToken,
}

impl Multiplexer {
    /// Create the actor and its handle. Nothing runs until [`Multiplexer::run`].
    pub fn new(
        backend: BackendClient,
        concurrency: usize,
        call_timeout: Option<Duration>,
        shutdown: CancellationToken,
    ) -> (Self, MuxHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        let permits = Arc::new(Semaphore::new(concurrency));
        let handle = MuxHandle {
            tx,
            permits: permits.clone(),
            next_session: Arc::new(AtomicU64::new(1)),
        };
        let mux = Self {
            commands,
            backend,
            routes: RouteTable::new(),
            sessions: HashMap::new(),
            permits,
            call_timeout,
            shutdown,
        };
        (mux, handle)
    }

    /// Process commands until shutdown, then drain.
    pub async fn run(mut self) -> DrainSummary {
        let mut sweep = self.call_timeout.map(|limit| {
            let period = (limit / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                _ = tick(&mut sweep) => self.expire_calls(),

                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
            }
        }

        let summary = self.drain();
        self.backend.close().await;
        summary
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Attach { session, deliveries } => {
                debug!("{} attached", session);
                self.sessions.insert(session, deliveries);
            }
            Command::Detach { session } => self.detach(session),
            Command::Call {
                session,
                request,
                tag,
                permit,
            } => self.forward_call(session, request, tag, permit).await,
            Command::Notify { session, request } => {
                if let Err(e) = self.send(&request.to_value()).await {
                    warn!("{}: notification {} not forwarded: {}", session, request.method, e);
                    self.backend_lost(&e);
                }
            }
            Command::Batch { session, batch, items } => self.forward_batch(session, batch, items).await,
            Command::Backend(BackendEvent::Frame(frame)) => self.route_frame(frame),
            Command::Backend(BackendEvent::Closed(reason)) => {
                warn!("Backend channel closed: {}", reason);
                self.backend.mark_dead();
                self.shutdown.cancel();
            }
        }
    }

    fn detach(&mut self, session: SessionId) {
        self.sessions.remove(&session);
        let purged = self.routes.purge(session);
        if purged.is_empty() {
            debug!("{} detached", session);
        } else {
            debug!("{} detached, abandoning {} pending calls", session, purged.len());
        }
    }

    fn pending_call(
        &self,
        session: SessionId,
        client_id: Id,
        tag: CallTag,
        permit: Option<OwnedSemaphorePermit>,
    ) -> PendingCall {
        let call = PendingCall::new(session, client_id, tag)
            .with_deadline(self.call_timeout.map(|limit| Instant::now() + limit));
        match permit {
            Some(permit) => call.with_permit(permit),
            None => call,
        }
    }

    async fn forward_call(
        &mut self,
        session: SessionId,
        mut request: JsonRpcRequest,
        tag: CallTag,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let Some(client_id) = request.id.take() else {
            warn!("{}: call without an id dropped", session);
            return;
        };
        if !self.sessions.contains_key(&session) {
            debug!("{}: call {} from detached session dropped", session, client_id);
            return;
        }
        if self.backend.is_dead() {
            self.reply(session, client_id, tag, Err(JsonRpcError::backend_unavailable()));
            return;
        }

        let call = self.pending_call(session, client_id, tag, permit);
        let backend_id = self.routes.allocate(call);
        request.id = Some(Id::from(backend_id));
        debug!("{}: {} -> backend id {}", session, request.method, backend_id);

        if let Err(e) = self.send(&request.to_value()).await {
            if let Some(call) = self.routes.resolve(backend_id) {
                self.deliver(call, Err(send_failure(&e)));
            }
            self.backend_lost(&e);
        }
    }

    async fn forward_batch(&mut self, session: SessionId, batch: u64, items: Vec<BatchItem>) {
        if !self.sessions.contains_key(&session) {
            debug!("{}: batch from detached session dropped", session);
            return;
        }

        let mut allocated = Vec::new();
        let mut frame = Vec::with_capacity(items.len());
        for BatchItem {
            mut request,
            slot,
            permit,
        } in items
        {
            if let Some(client_id) = request.id.take() {
                let tag = CallTag::Batch { batch, slot };
                if self.backend.is_dead() {
                    self.reply(session, client_id, tag, Err(JsonRpcError::backend_unavailable()));
                    continue;
                }
                let call = self.pending_call(session, client_id, tag, permit);
                let backend_id = self.routes.allocate(call);
                request.id = Some(Id::from(backend_id));
                allocated.push(backend_id);
            }
            frame.push(request.to_value());
        }
        if self.backend.is_dead() {
            return;
        }

        debug!("{}: batch of {} -> {} backend calls", session, frame.len(), allocated.len());
        if let Err(e) = self.send(&Value::Array(frame)).await {
            let error = send_failure(&e);
            for backend_id in allocated {
                if let Some(call) = self.routes.resolve(backend_id) {
                    self.deliver(call, Err(error.clone()));
                }
            }
            self.backend_lost(&e);
        }
    }

    async fn send(&mut self, message: &Value) -> Result<(), BackendError> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(BackendError::Cancelled),
            result = self.backend.send(message) => result,
        }
    }

    fn backend_lost(&mut self, error: &BackendError) {
        if matches!(error, BackendError::Write(FramingError::Encode(_))) {
            return;
        }
        if !self.shutdown.is_cancelled() {
            warn!("Backend unusable, draining: {}", error);
        }
        self.backend.mark_dead();
        self.shutdown.cancel();
    }

    fn route_frame(&mut self, frame: Value) {
        let messages = match frame {
            Value::Array(items) => items,
            other => vec![other],
        };
        for message in messages {
            if let Err(e) = self.route_response(message) {
                warn!("Dropping backend message: {}", e);
            }
        }
    }

    fn route_response(&mut self, message: Value) -> Result<(), RoutingError> {
        if let Some(method) = message.get("method").and_then(Value::as_str) {
            return Err(RoutingError::UnexpectedRequest(method.to_string()));
        }

        let (id, outcome) = match JsonRpcResponse::from_value(message) {
            Ok(response) => match response.id {
                Some(id) => (id, response.outcome),
                None => {
                    let detail = match response.outcome {
                        Err(error) => error.to_string(),
                        Ok(_) => "result".to_string(),
                    };
                    return Err(RoutingError::MissingId(detail));
                }
            },
            Err(bad) => match bad.id.clone() {
                Some(id) => (id, Err(JsonRpcError::new(code::INTERNAL_ERROR, bad.to_string()))),
                None => return Err(RoutingError::MissingId(bad.reason)),
            },
        };

        let backend_id = id.as_u64().ok_or_else(|| RoutingError::ForeignId(id.to_string()))?;
        match self.routes.resolve(backend_id) {
            Some(call) => {
                self.deliver(call, outcome);
                Ok(())
            }
            None if self.routes.take_orphan(backend_id) => {
                debug!("Late reply for abandoned backend id {} dropped", backend_id);
                Ok(())
            }
            None => Err(RoutingError::UnknownId(backend_id)),
        }
    }

    fn expire_calls(&mut self) {
        for (backend_id, call) in self.routes.expire(Instant::now()) {
            debug!("{}: backend id {} exceeded its deadline", call.session, backend_id);
            self.deliver(call, Err(JsonRpcError::deadline_exceeded()));
        }
    }

    /// Hand a resolved call's outcome to its session. The admission permit
    /// is released here, whether or not the session is still around.
    fn deliver(&mut self, call: PendingCall, outcome: Result<Value, JsonRpcError>) {
        let session = call.session;
        let tag = call.tag;
        let client_id = call.client_id.clone();
        drop(call);
        self.reply(session, client_id, tag, outcome);
    }

    fn reply(&self, session: SessionId, client_id: Id, tag: CallTag, outcome: Result<Value, JsonRpcError>) {
        let Some(deliveries) = self.sessions.get(&session) else {
            debug!("{} gone, reply for {} dropped", session, client_id);
            return;
        };
        let response = JsonRpcResponse {
            id: Some(client_id),
            outcome,
        };
        if deliveries.send(Delivery { tag, response }).is_err() {
            debug!("{} stopped reading, reply dropped", session);
        }
    }

    /// Fail everything still in flight, then release every session.
    fn drain(&mut self) -> DrainSummary {
        self.permits.close();
        self.commands.close();
        self.backend.mark_dead();

        // Commands already queued: replies the backend sent before it went
        // away are still routed, new calls are refused.
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Attach { .. } => {}
                Command::Detach { session } => self.detach(session),
                Command::Call {
                    session, request, tag, ..
                } => {
                    if let Some(client_id) = request.id {
                        self.reply(session, client_id, tag, Err(JsonRpcError::backend_unavailable()));
                    }
                }
                Command::Notify { session, request } => {
                    debug!("{}: notification {} dropped while draining", session, request.method);
                }
                Command::Batch { session, batch, items } => {
                    for item in items {
                        if let Some(client_id) = item.request.id {
                            let tag = CallTag::Batch { batch, slot: item.slot };
                            self.reply(session, client_id, tag, Err(JsonRpcError::backend_unavailable()));
                        }
                    }
                }
                Command::Backend(BackendEvent::Frame(frame)) => self.route_frame(frame),
                Command::Backend(BackendEvent::Closed(_)) => {}
            }
        }

        let pending = self.routes.drain();
        let summary = DrainSummary {
            failed_calls: pending.len(),
            sessions: self.sessions.len(),
        };
        for (_, call) in pending {
            self.deliver(call, Err(JsonRpcError::backend_unavailable()));
        }
        self.sessions.clear();

        info!(
            "Drained {} pending calls across {} sessions",
            summary.failed_calls, summary.sessions
        );
        summary
    }
}

fn send_failure(error: &BackendError) -> JsonRpcError {
    match error {
        BackendError::Cancelled | BackendError::Dead => JsonRpcError::backend_unavailable(),
        BackendError::Write(e) => JsonRpcError::backend_write_failed(e),
    }
}

async fn tick(sweep: &mut Option<Interval>) {
    match sweep {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
