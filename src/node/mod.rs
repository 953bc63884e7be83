//! `Node` — a per-host state machine that opens, replenishes, throttles,
//! health-checks, and tears down connections (`spec.md` §4.2).

mod config;
mod handle;
mod state;

pub use config::{NodeConfig, NodeConfigBuilder};
pub use handle::{ConnectionHandle, LeasedConnection};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::driver::{Connection, QueryContext};
use crate::error::ClusterError;
use crate::id::{ConnectionId, NodeId};
use state::NodeState;

/// Schedules `fut` on a brand-new task so it runs no earlier than the next
/// scheduling turn (`spec.md` §9's "defer to the next step" primitive). A
/// fresh task, not `tokio::task::yield_now`, since a subscriber on another
/// task needs a chance to attach before `fut` runs, not just this task to
/// yield and resume.
fn defer<F>(fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(fut);
}

/// Events a [`Node`] emits for a [`crate::cluster::Cluster`] to dispatch.
///
/// `connectivityProblem` (`spec.md` §3) is intentionally not a variant here:
/// it is node-internal and handled by [`Node::handle_connectivity_problem`]
/// directly rather than surfaced to the cluster.
pub enum NodeEvent<C: Connection> {
    /// A connection (new or returned-to-idle) is available for dispatch.
    Available(ConnectionHandle<C>),
    /// Fired once, strictly after the first `Available`, on a later
    /// scheduling turn.
    Load,
    /// Fired exactly once when the node ends.
    End,
}

struct Inner<C: Connection> {
    id: NodeId,
    config: NodeConfig,
    pools: Arc<[String]>,
    state: tokio::sync::Mutex<NodeState<C>>,
    events: mpsc::UnboundedSender<NodeEvent<C>>,
    span: tracing::Span,
}

/// A per-host connection pool with its own lifecycle and health state.
///
/// Cheaply `Clone`-able (an `Arc` handle), matching the teacher's `Pool<M>`.
pub struct Node<C: Connection> {
    inner: Arc<Inner<C>>,
}

impl<C: Connection> Clone for Node<C> {
    fn clone(&self) -> Self {
        Node {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connection> Node<C> {
    /// Constructs a node and immediately schedules `create_connection`
    /// (`spec.md` §4.2).
    pub fn new(config: NodeConfig) -> (Self, mpsc::UnboundedReceiver<NodeEvent<C>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = NodeId::next();
        let span = tracing::info_span!("node", id = %id, pools = %config.composite_name());
        let pools: Arc<[String]> = config.pools().to_vec().into();
        let throttle_time = config.initial_throttle_time;
        let inner = Arc::new(Inner {
            id,
            config,
            pools,
            state: tokio::sync::Mutex::new(NodeState::new(throttle_time)),
            events: tx,
            span,
        });
        let node = Node { inner };
        node.spawn_create_connection();
        (node, rx)
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    fn pools_arc(&self) -> Arc<[String]> {
        self.inner.pools.clone()
    }

    pub async fn count(&self) -> u32 {
        self.inner.state.lock().await.count()
    }

    pub async fn creating_count(&self) -> u32 {
        self.inner.state.lock().await.creating_count
    }

    pub async fn is_throttling(&self) -> bool {
        self.inner.state.lock().await.throttling
    }

    pub async fn is_ended(&self) -> bool {
        self.inner.state.lock().await.ended
    }

    /// `round(count / max_connections * 100)` (`spec.md` §4.2).
    pub async fn idle(&self) -> u32 {
        let count = self.count().await as f64;
        let max = self.inner.config.max_connections as f64;
        (count / max * 100.0).round() as u32
    }

    fn spawn_create_connection(&self) {
        let node = self.clone();
        defer(async move {
            node.create_connection().await;
        });
    }

    fn spawn_handle_connectivity_problem(&self) {
        let node = self.clone();
        defer(async move {
            node.handle_connectivity_problem().await;
        });
    }

    fn defer_emit_load(&self) {
        let events = self.inner.events.clone();
        defer(async move {
            let _ = events.send(NodeEvent::Load);
        });
    }

    /// The central state machine (`spec.md` §4.2 "createConnection
    /// algorithm"). Recursive, so it must be boxed.
    fn create_connection(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let (ended, at_capacity) = {
                let state = self.inner.state.lock().await;
                (
                    state.ended,
                    state.count() + state.creating_count >= self.inner.config.max_connections,
                )
            };
            if ended || at_capacity {
                return;
            }

            let throttling = self.inner.state.lock().await.throttling;
            if throttling {
                let creating = self.inner.state.lock().await.creating_count;
                if creating > 0 {
                    return;
                }

                let delay = {
                    let mut state = self.inner.state.lock().await;
                    let next_ms = (state.throttle_time.as_secs_f64() * 1000.0 * 1.1).ceil();
                    state.throttle_time = std::time::Duration::from_millis(next_ms as u64);
                    state.throttle_time
                };
                tracing::debug!(
                    parent: &self.inner.span,
                    delay_ms = delay.as_millis() as u64,
                    "throttling before next open attempt"
                );
                tokio::time::sleep(delay).await;

                match self.execute_create_connection().await {
                    Ok(true) => {
                        {
                            let mut state = self.inner.state.lock().await;
                            state.throttling = false;
                            state.throttle_time = self.inner.config.initial_throttle_time;
                        }
                        self.create_connection().await;
                    }
                    Ok(false) => {}
                    Err(_) => {
                        self.create_connection().await;
                    }
                }
            } else {
                let first = self.clone();
                tokio::spawn(async move {
                    let _ = first.execute_create_connection().await;
                });
                // Scheduled before awaiting the first attempt: non-throttled
                // fill is concurrent up to max_connections (spec.md §9 open
                // question — preserved as specified).
                self.spawn_create_connection();
            }
        })
    }

    /// `spec.md` §4.2 "executeCreateConnection". `Ok(true)` on a newly
    /// opened connection, `Ok(false)` if the guard at the top was already
    /// unsatisfied (no-op), `Err` on a failed `connect()`.
    async fn execute_create_connection(&self) -> Result<bool, ClusterError<C::Error>> {
        {
            let mut state = self.inner.state.lock().await;
            if state.ended {
                return Ok(false);
            }
            if state.count() + state.creating_count >= self.inner.config.max_connections {
                return Ok(false);
            }
            state.creating_count += 1;
        }

        let id = ConnectionId::next();
        tracing::debug!(parent: &self.inner.span, connection = %id, "opening connection");

        match C::connect(&self.inner.config, id).await {
            Ok(conn) => {
                let (was_loaded, conn_arc) = {
                    let mut state = self.inner.state.lock().await;
                    state.creating_count -= 1;
                    state.insert(id, conn);
                    state.throttling = false;
                    let was_loaded = state.loaded;
                    state.loaded = true;
                    (was_loaded, state.get_conn(id).expect("just inserted"))
                };
                tracing::debug!(parent: &self.inner.span, connection = %id, "connection opened");

                let handle = ConnectionHandle {
                    id,
                    pools: self.pools_arc(),
                    conn: conn_arc,
                    node: self.clone(),
                };
                let _ = self.inner.events.send(NodeEvent::Available(handle));
                if !was_loaded {
                    self.defer_emit_load();
                }
                Ok(true)
            }
            Err(e) => {
                let ended = {
                    let mut state = self.inner.state.lock().await;
                    state.creating_count -= 1;
                    state.throttling = true;
                    state.ended
                };
                tracing::warn!(parent: &self.inner.span, error = %e, "connection open failed");
                if !ended {
                    self.spawn_handle_connectivity_problem();
                }
                Err(ClusterError::OpenFailure(e))
            }
        }
    }

    /// `spec.md` §4.2 "handleConnectivityProblem".
    async fn handle_connectivity_problem(&self) {
        {
            let state = self.inner.state.lock().await;
            if state.ended || state.error_checking {
                return;
            }
            if let Some(last) = state.last_error_check {
                if last.elapsed() <= self.inner.config.error_check_interval {
                    return;
                }
            }
        }

        let oldest = self.inner.state.lock().await.oldest();
        let Some((_, id, conn_arc)) = oldest else {
            tracing::debug!(parent: &self.inner.span, "no connections to probe, requesting a new one");
            self.spawn_create_connection();
            return;
        };

        {
            let mut state = self.inner.state.lock().await;
            state.error_checking = true;
            state.last_error_check = Some(Instant::now());
        }

        let probe_pool = self.inner.config.pools()[0].clone();
        tracing::debug!(parent: &self.inner.span, connection = %id, "probing oldest connection");
        let probe = async {
            let mut guard = conn_arc.lock().await;
            guard.query(QueryContext::probe(&probe_pool)).await
        };

        match tokio::time::timeout(self.inner.config.error_check_timeout, probe).await {
            Ok(Ok(_)) => {
                self.inner.state.lock().await.error_checking = false;
                tracing::debug!(parent: &self.inner.span, "probe succeeded");
            }
            Ok(Err(_)) => {
                tracing::warn!(parent: &self.inner.span, "probe failed, resetting node");
                self.reset_node().await;
            }
            Err(_) => {
                tracing::warn!(parent: &self.inner.span, "probe timed out, resetting node");
                self.reset_node().await;
            }
        }
    }

    /// `spec.md` §4.2 "resetNode".
    async fn reset_node(&self) {
        let conns = {
            let mut state = self.inner.state.lock().await;
            let conns = state.drain();
            state.creating_count = 0;
            state.throttling = true;
            state.throttle_time = self.inner.config.initial_throttle_time;
            state.error_checking = false;
            conns
        };
        for conn in conns {
            tokio::spawn(async move {
                conn.lock().await.kill().await;
            });
        }
        tracing::info!(parent: &self.inner.span, "node reset, rebuilding connections");
        self.spawn_create_connection();
    }

    /// Idempotent. Kills all connections and emits `End` exactly once.
    pub async fn end(&self) {
        let conns = {
            let mut state = self.inner.state.lock().await;
            if state.ended {
                return;
            }
            state.ended = true;
            state.drain()
        };
        for conn in conns {
            tokio::spawn(async move {
                conn.lock().await.kill().await;
            });
        }
        tracing::info!(parent: &self.inner.span, "node ended");
        let _ = self.inner.events.send(NodeEvent::End);
    }

    pub(crate) async fn try_lease(&self, id: ConnectionId) -> bool {
        self.inner.state.lock().await.try_lease(id)
    }

    /// Called from [`LeasedConnection::release`]/`Drop`. Cannot be async
    /// (Drop), so it spawns the bookkeeping + re-dispatch as a task.
    pub(crate) fn release_connection(&self, id: ConnectionId) {
        let node = self.clone();
        tokio::spawn(async move {
            let (still_tracked, conn_arc) = {
                let mut state = node.inner.state.lock().await;
                let tracked = state.release(id);
                (tracked, state.get_conn(id))
            };
            if !still_tracked {
                // Killed by a concurrent reset/end while leased out.
                return;
            }
            if let Some(conn_arc) = conn_arc {
                let handle = ConnectionHandle {
                    id,
                    pools: node.pools_arc(),
                    conn: conn_arc,
                    node: node.clone(),
                };
                let _ = node.inner.events.send(NodeEvent::Available(handle));
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockConnection;
    use std::time::Duration;

    #[tokio::test]
    async fn cold_start_opens_max_connections() {
        let config = NodeConfig::builder("localhost")
            .max_connections(3)
            .pools(vec!["read".into(), "write".into()])
            .build();
        let (node, mut events): (Node<MockConnection>, _) = Node::new(config);

        let mut available = 0;
        let mut saw_load = false;
        while available < 3 || !saw_load {
            match events.recv().await.unwrap() {
                NodeEvent::Available(_) => available += 1,
                NodeEvent::Load => saw_load = true,
                NodeEvent::End => panic!("unexpected end"),
            }
        }

        assert_eq!(available, 3);
        assert!(saw_load);
        assert_eq!(node.count().await, 3);
        assert_eq!(node.creating_count().await, 0);
        assert!(!node.is_throttling().await);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_law_grows_by_1_1_and_resets_on_success() {
        let host = "throttle-law-node";
        let control = crate::testing::MockControl::for_host(host);
        control.fail_next_connects(2);

        let config = NodeConfig::builder(host).max_connections(1).build();
        let (node, mut events): (Node<MockConnection>, _) = Node::new(config);

        // First throttled attempt bumps 10 -> ceil(11) before delaying.
        tokio::time::advance(Duration::from_millis(11)).await;
        // Second throttled attempt bumps 11 -> ceil(12.1) = 13.
        tokio::time::advance(Duration::from_millis(13)).await;
        // Third attempt succeeds; throttling clears and throttle_time resets.
        tokio::time::advance(Duration::from_millis(20)).await;

        loop {
            match events.recv().await.unwrap() {
                NodeEvent::Available(_) => break,
                NodeEvent::End => panic!("unexpected end"),
                NodeEvent::Load => {}
            }
        }

        assert_eq!(control.connect_attempts(), 3);
        assert!(!node.is_throttling().await);
    }

    #[tokio::test]
    async fn end_is_idempotent_and_emits_once() {
        let config = NodeConfig::builder("localhost").max_connections(1).build();
        let (node, mut events): (Node<MockConnection>, _) = Node::new(config);

        // Drain until we've seen Load, so the node has finished its first
        // connection cycle before we end it.
        loop {
            if matches!(events.recv().await.unwrap(), NodeEvent::Load) {
                break;
            }
        }

        node.end().await;
        node.end().await; // no-op, must not re-emit

        let mut ends = 0;
        // Give any stray tasks a chance to run, then drain without blocking.
        tokio::time::sleep(Duration::from_millis(10)).await;
        while let Ok(evt) = events.try_recv() {
            if matches!(evt, NodeEvent::End) {
                ends += 1;
            }
        }
        assert_eq!(ends, 1);
        assert!(node.is_ended().await);
    }
}
