//! Handles to a single live connection: [`ConnectionHandle`] (idle, owned by
//! a `Cluster` idle-set or about to be dispatched) and [`LeasedConnection`]
//! (checked out, exclusive to one caller until released).

use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use crate::driver::{Connection, QueryContext};
use crate::error::ClusterError;
use crate::id::ConnectionId;
use crate::node::Node;

/// A connection believed idle, ready to be hand out to a waiting request or
/// parked in a `Cluster` idle set.
pub struct ConnectionHandle<C: Connection> {
    pub(crate) id: ConnectionId,
    pub(crate) pools: Arc<[String]>,
    pub(crate) conn: Arc<AsyncMutex<C>>,
    pub(crate) node: Node<C>,
}

impl<C: Connection> Clone for ConnectionHandle<C> {
    fn clone(&self) -> Self {
        ConnectionHandle {
            id: self.id,
            pools: self.pools.clone(),
            conn: self.conn.clone(),
            node: self.node.clone(),
        }
    }
}

impl<C: Connection> ConnectionHandle<C> {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The pools this connection's owning node serves.
    pub fn pools(&self) -> &[String] {
        &self.pools
    }

    /// Marks this connection leased inside its owning node's bookkeeping
    /// and returns an exclusive [`LeasedConnection`]. Returns `None` if the
    /// node has since dropped this connection (e.g. a concurrent
    /// `reset_node`/`end`) — the caller should simply discard the stale
    /// handle and try the next one.
    pub async fn lease(self) -> Option<LeasedConnection<C>> {
        if !self.node.try_lease(self.id).await {
            return None;
        }
        Some(LeasedConnection {
            id: self.id,
            conn: self.conn,
            node: self.node,
            released: false,
        })
    }
}

/// An exclusively-checked-out connection. The caller is responsible for
/// releasing it by letting it drop (or calling [`LeasedConnection::release`]
/// explicitly); release is what makes the connection eligible for dispatch
/// again (`spec.md` §3: "leased to a requester, returned to idle after the
/// caller releases it").
pub struct LeasedConnection<C: Connection> {
    id: ConnectionId,
    conn: Arc<AsyncMutex<C>>,
    node: Node<C>,
    released: bool,
}

impl<C: Connection> LeasedConnection<C> {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Runs `ctx` against the underlying connection. A connectivity
    /// problem flagged by the driver during this call schedules the
    /// node's `handle_connectivity_problem` recovery path, matching
    /// `spec.md` §4.2 without requiring a dedicated event stream per
    /// connection.
    pub async fn query(&self, ctx: QueryContext<'_>) -> Result<C::Output, ClusterError<C::Error>> {
        let mut guard = self.conn.lock().await;
        let result = guard.query(ctx).await;
        let flagged = guard.take_connectivity_problem();
        drop(guard);
        if flagged {
            self.node.spawn_handle_connectivity_problem();
        }
        result.map_err(ClusterError::QueryError)
    }

    pub async fn create_transaction(&self) -> Result<(), ClusterError<C::Error>> {
        let mut guard = self.conn.lock().await;
        guard.create_transaction().await.map_err(ClusterError::QueryError)
    }

    pub async fn rollback(&self) -> Result<(), ClusterError<C::Error>> {
        let mut guard = self.conn.lock().await;
        guard.rollback().await.map_err(ClusterError::QueryError)
    }

    /// Releases the connection back to its node now, instead of waiting for
    /// `Drop`.
    pub fn release(mut self) {
        self.released = true;
        self.node.release_connection(self.id);
    }
}

impl<C: Connection> Drop for LeasedConnection<C> {
    fn drop(&mut self) {
        if !self.released {
            self.node.release_connection(self.id);
        }
    }
}
