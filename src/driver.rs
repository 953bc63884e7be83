//! The external driver contract (`spec.md` §6).
//!
//! The SQL driver itself is out of scope (`spec.md` §1); this module only
//! pins down the shape a pluggable driver must have so `Node` and `Cluster`
//! can drive it. Generalizes the teacher's `bb8::ManageConnection`, split
//! into the operations `spec.md` names explicitly.

use async_trait::async_trait;

use crate::id::ConnectionId;
use crate::node::NodeConfig;

/// How a query should be run against a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    /// A statement expected to return rows.
    Select,
    /// A statement run for effect (insert/update/delete/ddl).
    Execute,
}

/// The arguments `query` is invoked with (`spec.md` §6:
/// `{ sql | SQL, mode, pool }`).
#[derive(Debug, Clone, Copy)]
pub struct QueryContext<'a> {
    pub sql: &'a str,
    pub mode: QueryMode,
    pub pool: &'a str,
}

impl<'a> QueryContext<'a> {
    /// The trivial liveness probe `Node` issues in `handle_connectivity_problem`.
    pub(crate) fn probe(pool: &'a str) -> Self {
        QueryContext {
            sql: "SELECT 1;",
            mode: QueryMode::Select,
            pool,
        }
    }
}

/// A pluggable driver connection.
///
/// `spec.md` §3: "identified by a per-node id string; belongs to the node's
/// ordered list; emits `end(err?)` exactly once; emits `connectivityProblem`
/// zero or more times before `end`." Rust has no ambient event emitter, so
/// `end` is modeled as `Drop` plus the node observing task completion, and
/// `connectivityProblem` is modeled as a flag the node drains after every
/// round-trip (`take_connectivity_problem`), matching the synchronous,
/// polled style the rest of this crate uses for node-internal state.
#[async_trait]
pub trait Connection: Send + Sized + 'static {
    /// The error type returned by driver operations.
    type Error: std::error::Error + Send + Sync + 'static;
    /// The result shape returned by a successful `query` (opaque to the
    /// pool; query construction and result decoding are out of scope).
    type Output: Send + 'static;

    /// Opens the session. Rejects with a typed error on failure.
    async fn connect(config: &NodeConfig, id: ConnectionId) -> Result<Self, Self::Error>;

    /// Executes `ctx`; any rejection is a pool-level `QueryError`, not a
    /// connectivity error — the connection itself decides whether to also
    /// flag a connectivity problem via `take_connectivity_problem`.
    async fn query(&mut self, ctx: QueryContext<'_>) -> Result<Self::Output, Self::Error>;

    /// Tear down as soon as possible: idle immediately, busy after the
    /// current query, transactions honored by the driver's own semantics.
    /// Takes `&mut self` rather than consuming the connection — every live
    /// connection is shared as `Arc<tokio::sync::Mutex<C>>`, so only a
    /// guard, never ownership, is ever available to call this through.
    async fn kill(&mut self);

    async fn create_transaction(&mut self) -> Result<(), Self::Error>;

    async fn rollback(&mut self) -> Result<(), Self::Error>;

    /// Drains and resets the "a connectivity problem was observed" flag.
    /// Polled by the node after every query/probe round-trip, standing in
    /// for the source's zero-or-more `connectivityProblem` event.
    fn take_connectivity_problem(&mut self) -> bool {
        false
    }
}
