//! A scripted [`Connection`] for deterministic tests, in the spirit of the
//! teacher's own `tests/` fakes (e.g. `bb8`'s `FakeConnection`): behavior is
//! driven by explicit, host-keyed scripts rather than real I/O, so tests can
//! force the exact connect/query/probe failures `spec.md` §8's scenarios
//! describe without a live database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use once_cell::sync::Lazy;

use crate::driver::{Connection, QueryContext};
use crate::id::ConnectionId;
use crate::node::NodeConfig;

#[derive(Debug, thiserror::Error)]
#[error("mock driver error: {0}")]
pub struct MockError(pub String);

/// Sentinel SQL recognized by [`MockConnection::query`] as a deliberately
/// invalid statement: always fails, independent of any scripted counter.
pub const INVALID_SQL: &str = "INVALID STATEMENT";

#[derive(Default)]
struct Script {
    fail_connects: AtomicU32,
    fail_queries: AtomicU32,
    flag_problem_on_next_query: AtomicBool,
    fail_next_probe: AtomicBool,
    connects: AtomicU32,
    kills: AtomicU32,
}

static REGISTRY: Lazy<StdMutex<HashMap<String, Arc<Script>>>> = Lazy::new(|| StdMutex::new(HashMap::new()));

fn script_for(host: &str) -> Arc<Script> {
    let mut registry = REGISTRY.lock().expect("registry mutex poisoned");
    registry
        .entry(host.to_string())
        .or_insert_with(|| Arc::new(Script::default()))
        .clone()
}

/// Handle for scripting a single host's [`MockConnection`] behavior. Build
/// before constructing the `Node`/`Cluster` that will connect to `host`;
/// host names are process-global, so give every test its own unique host.
pub struct MockControl {
    script: Arc<Script>,
}

impl MockControl {
    pub fn for_host(host: &str) -> Self {
        MockControl {
            script: script_for(host),
        }
    }

    /// The next `n` `connect()` calls against this host fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.script.fail_connects.store(n, Ordering::SeqCst);
    }

    /// The next `n` `query()` calls (including health probes) against this
    /// host fail.
    pub fn fail_next_queries(&self, n: u32) {
        self.script.fail_queries.store(n, Ordering::SeqCst);
    }

    /// The connection that runs the next query reports a connectivity
    /// problem immediately after that query completes.
    pub fn flag_connectivity_problem(&self) {
        self.script
            .flag_problem_on_next_query
            .store(true, Ordering::SeqCst);
    }

    /// The next health probe (`SELECT 1;`) against this host fails,
    /// independent of [`Self::fail_next_queries`].
    pub fn fail_next_probe(&self) {
        self.script.fail_next_probe.store(true, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.script.connects.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> u32 {
        self.script.kills.load(Ordering::SeqCst)
    }
}

/// A scripted [`Connection`]. Failures, connectivity flags, and kill/connect
/// counters are all driven through a host's [`MockControl`].
pub struct MockConnection {
    pub id: ConnectionId,
    script: Arc<Script>,
    problem_pending: bool,
}

#[async_trait]
impl Connection for MockConnection {
    type Error = MockError;
    type Output = ();

    async fn connect(config: &NodeConfig, id: ConnectionId) -> Result<Self, Self::Error> {
        let script = script_for(&config.host);
        script.connects.fetch_add(1, Ordering::SeqCst);
        let should_fail = script
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n > 0 {
                    Some(n - 1)
                } else {
                    None
                }
            })
            .is_ok();
        if should_fail {
            return Err(MockError(format!(
                "scripted connect failure for {}",
                config.host
            )));
        }
        Ok(MockConnection {
            id,
            script,
            problem_pending: false,
        })
    }

    async fn query(&mut self, ctx: QueryContext<'_>) -> Result<Self::Output, Self::Error> {
        if ctx.sql == INVALID_SQL {
            return Err(MockError("invalid statement".into()));
        }
        if ctx.sql == "SELECT 1;"
            && self
                .script
                .fail_next_probe
                .swap(false, Ordering::SeqCst)
        {
            return Err(MockError("scripted probe failure".into()));
        }
        let should_fail = self
            .script
            .fail_queries
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n > 0 {
                    Some(n - 1)
                } else {
                    None
                }
            })
            .is_ok();
        if should_fail {
            return Err(MockError("scripted query failure".into()));
        }
        if self
            .script
            .flag_problem_on_next_query
            .swap(false, Ordering::SeqCst)
        {
            self.problem_pending = true;
        }
        Ok(())
    }

    async fn kill(&mut self) {
        self.script.kills.fetch_add(1, Ordering::SeqCst);
    }

    async fn create_transaction(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn take_connectivity_problem(&mut self) -> bool {
        std::mem::take(&mut self.problem_pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ConnectionId;

    #[tokio::test]
    async fn scripted_connect_failure_is_consumed_once() {
        let host = "mock-connect-fail";
        let control = MockControl::for_host(host);
        control.fail_next_connects(1);

        let config = NodeConfig::builder(host).build();
        assert!(MockConnection::connect(&config, ConnectionId::next())
            .await
            .is_err());
        assert!(MockConnection::connect(&config, ConnectionId::next())
            .await
            .is_ok());
        assert_eq!(control.connect_attempts(), 2);
    }
}
