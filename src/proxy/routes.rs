//! Backend id translation table.
//!
//! Maps every backend id the proxy has put on the wire to the session and
//! client-local id it stands for. Backend ids come from a counter private to
//! the table, so two clients that both pick id `1` never collide.
//!
//! The table is owned by the multiplexer task and is never shared, so it
//! needs no lock: allocate, resolve and purge are serialized by construction.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;

use crate::jsonrpc::Id;

/// Identifies one accepted client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Where a reply belongs inside its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTag {
    Single,
    /// Element `slot` of the session's batch number `batch`.
    Batch { batch: u64, slot: usize },
}

/// A forwarded call awaiting its backend reply.
#[derive(Debug)]
pub struct PendingCall {
    pub session: SessionId,
    pub client_id: Id,
    pub tag: CallTag,
    pub deadline: Option<Instant>,
    /// Admission slot, released when the call is dropped.
    permit: Option<OwnedSemaphorePermit>,
}

impl PendingCall {
    pub fn new(session: SessionId, client_id: Id, tag: CallTag) -> Self {
        Self {
            session,
            client_id,
            tag,
            deadline: None,
            permit: None,
        }
    }

    pub fn with_permit(mut self, permit: OwnedSemaphorePermit) -> Self {
        self.permit = Some(permit);
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }
}

/// Late-reply ids remembered at most. Beyond this the oldest are forgotten
/// and a very late reply is reported as unknown.
pub const MAX_ORPHANS: usize = 4096;

/// The translation table.
#[derive(Debug)]
pub struct RouteTable {
    next_id: u64,
    pending: HashMap<u64, PendingCall>,
    /// Ids whose session went away before the backend answered, oldest
    /// first. Capped at [`MAX_ORPHANS`].
    orphaned: BTreeSet<u64>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
            orphaned: BTreeSet::new(),
        }
    }

    /// Register a call and return the backend id to send it under.
    pub fn allocate(&mut self, call: PendingCall) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(id, call);
        id
    }

    /// Remove and return the call a backend reply belongs to.
    pub fn resolve(&mut self, backend_id: u64) -> Option<PendingCall> {
        self.pending.remove(&backend_id)
    }

    /// Whether `backend_id` belonged to a session that has since gone away
    /// (or to a call that already expired). Forgets the id.
    pub fn take_orphan(&mut self, backend_id: u64) -> bool {
        self.orphaned.remove(&backend_id)
    }

    /// Remove every call issued by `session`, leaving all other sessions'
    /// entries untouched. The ids are remembered as orphans so their late
    /// replies are recognised.
    pub fn purge(&mut self, session: SessionId) -> Vec<(u64, PendingCall)> {
        let ids: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, call)| call.session == session)
            .map(|(&id, _)| id)
            .collect();
        self.take_as_orphans(ids)
    }

    /// Remove every call whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<(u64, PendingCall)> {
        let ids: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, call)| call.deadline.is_some_and(|d| d <= now))
            .map(|(&id, _)| id)
            .collect();
        self.take_as_orphans(ids)
    }

    /// Remove every call. Used when the backend is gone, so nothing is
    /// remembered.
    pub fn drain(&mut self) -> Vec<(u64, PendingCall)> {
        self.orphaned.clear();
        let mut calls: Vec<(u64, PendingCall)> = self.pending.drain().collect();
        calls.sort_by_key(|(id, _)| *id);
        calls
    }

    fn take_as_orphans(&mut self, mut ids: Vec<u64>) -> Vec<(u64, PendingCall)> {
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| {
                let call = self.pending.remove(&id)?;
                self.orphaned.insert(id);
                if self.orphaned.len() > MAX_ORPHANS {
                    // Backend ids only grow, so the smallest is the oldest.
                    self.orphaned.pop_first();
                }
                Some((id, call))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of outstanding calls issued by `session`.
    pub fn pending_for(&self, session: SessionId) -> usize {
        self.pending.values().filter(|c| c.session == session).count()
    }
}
