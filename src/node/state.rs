//! `Node`'s protected internal state (`spec.md` §3 `Node` fields).
//!
//! The connection list is a `BTreeMap` keyed by a monotonic creation
//! sequence number rather than an intrusive linked list — the alternative
//! `spec.md` §9 explicitly allows, and simpler in safe Rust. Oldest access
//! is `BTreeMap::iter().next()` (O(log n)); removal by connection id goes
//! through the side `id_to_seq` index.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;

use crate::driver::Connection;
use crate::id::ConnectionId;

pub(crate) struct ConnectionSlot<C: Connection> {
    pub(crate) id: ConnectionId,
    pub(crate) birth: Instant,
    pub(crate) leased: bool,
    pub(crate) conn: Arc<AsyncMutex<C>>,
}

pub(crate) struct NodeState<C: Connection> {
    pub(crate) connections: BTreeMap<u64, ConnectionSlot<C>>,
    pub(crate) id_to_seq: HashMap<ConnectionId, u64>,
    pub(crate) next_seq: u64,
    pub(crate) creating_count: u32,
    pub(crate) throttling: bool,
    pub(crate) throttle_time: Duration,
    pub(crate) ended: bool,
    pub(crate) error_checking: bool,
    pub(crate) last_error_check: Option<Instant>,
    pub(crate) loaded: bool,
}

impl<C: Connection> NodeState<C> {
    pub(crate) fn new(initial_throttle_time: Duration) -> Self {
        NodeState {
            connections: BTreeMap::new(),
            id_to_seq: HashMap::new(),
            next_seq: 0,
            creating_count: 0,
            // True on startup, per `spec.md` §3.
            throttling: true,
            throttle_time: initial_throttle_time,
            ended: false,
            error_checking: false,
            last_error_check: None,
            loaded: false,
        }
    }

    pub(crate) fn count(&self) -> u32 {
        self.connections.len() as u32
    }

    pub(crate) fn oldest(&self) -> Option<(u64, ConnectionId, Arc<AsyncMutex<C>>)> {
        self.connections
            .iter()
            .next()
            .map(|(seq, slot)| (*seq, slot.id, slot.conn.clone()))
    }

    pub(crate) fn insert(&mut self, id: ConnectionId, conn: C) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.connections.insert(
            seq,
            ConnectionSlot {
                id,
                birth: Instant::now(),
                leased: false,
                conn: Arc::new(AsyncMutex::new(conn)),
            },
        );
        self.id_to_seq.insert(id, seq);
        seq
    }

    /// Atomically leases the connection: succeeds only if it was idle,
    /// preventing two concurrent dispatches of the same connection when it
    /// is (transiently) queued in more than one pool's idle set.
    pub(crate) fn try_lease(&mut self, id: ConnectionId) -> bool {
        match self
            .id_to_seq
            .get(&id)
            .and_then(|seq| self.connections.get_mut(seq))
        {
            Some(slot) if !slot.leased => {
                slot.leased = true;
                true
            }
            _ => false,
        }
    }

    /// Marks the connection idle again. Returns `false` if it is no longer
    /// tracked (killed by a concurrent `reset_node`/`end` while leased).
    pub(crate) fn release(&mut self, id: ConnectionId) -> bool {
        match self
            .id_to_seq
            .get(&id)
            .and_then(|seq| self.connections.get_mut(seq))
        {
            Some(slot) => {
                slot.leased = false;
                true
            }
            None => false,
        }
    }

    pub(crate) fn get_conn(&self, id: ConnectionId) -> Option<Arc<AsyncMutex<C>>> {
        self.id_to_seq
            .get(&id)
            .and_then(|seq| self.connections.get(seq))
            .map(|slot| slot.conn.clone())
    }

    /// Drains every tracked connection handle, clearing the list. Used by
    /// `reset_node` and `end`.
    pub(crate) fn drain(&mut self) -> Vec<Arc<AsyncMutex<C>>> {
        let conns = self
            .connections
            .values()
            .map(|slot| slot.conn.clone())
            .collect();
        self.connections.clear();
        self.id_to_seq.clear();
        conns
    }
}
