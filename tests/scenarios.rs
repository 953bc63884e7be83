//! Integration tests for the concrete scenarios named in `spec.md` §8.

use std::time::Duration;

use clustered_pool::testing::{MockConnection, MockControl, INVALID_SQL};
use clustered_pool::{Cluster, ClusterConfig, ClusterError, NodeConfig, QueryContext, QueryMode};

fn unique_host(tag: &str) -> String {
    format!("{tag}-{}", RequestIdGen::next())
}

// Integration tests run as separate processes per test binary target but
// share this one; a tiny counter keeps each test's scripted host name
// unique so `MockControl`'s host-keyed registry never leaks state between
// tests (ids themselves come from the crate, not re-exposed here).
struct RequestIdGen;
impl RequestIdGen {
    fn next() -> u32 {
        use std::sync::atomic::{AtomicU32, Ordering};
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        COUNTER.fetch_add(1, Ordering::SeqCst)
    }
}

#[tokio::test]
async fn cold_start_opens_exactly_max_connections() {
    let host = unique_host("cold-start");
    MockControl::for_host(&host);

    let cluster: Cluster<MockConnection> = Cluster::new(ClusterConfig::new());
    let config = NodeConfig::builder(host.as_str())
        .max_connections(3)
        .pools(vec!["read".into(), "write".into()])
        .build();

    let node = cluster.add_node(config).await.expect("node should load");

    assert_eq!(node.count().await, 3);
    assert_eq!(node.creating_count().await, 0);
    assert!(!node.is_throttling().await);
}

#[tokio::test]
async fn bulk_reads_all_resolve_without_exceeding_capacity() {
    let host = unique_host("bulk-reads");
    MockControl::for_host(&host);

    let cluster: Cluster<MockConnection> = Cluster::new(ClusterConfig::new());
    let config = NodeConfig::builder(host.as_str())
        .max_connections(10)
        .pools(vec!["read".into()])
        .build();
    cluster.add_node(config).await.expect("node should load");

    let mut handles = Vec::with_capacity(1000);
    for _ in 0..1000 {
        let cluster = cluster.clone();
        handles.push(tokio::spawn(async move {
            let conn = cluster
                .get_connection("read")
                .await
                .expect("request should resolve");
            conn.query(QueryContext {
                sql: "SELECT 1;",
                mode: QueryMode::Select,
                pool: "read",
            })
            .await
            .expect("query should succeed");
        }));
    }

    for handle in handles {
        handle.await.expect("task should not panic");
    }
}

#[tokio::test]
async fn failed_transactions_recover_and_further_requests_succeed() {
    let host = unique_host("failed-tx");
    MockControl::for_host(&host);

    let cluster: Cluster<MockConnection> = Cluster::new(ClusterConfig::new());
    let config = NodeConfig::builder(host.as_str())
        .max_connections(5)
        .pools(vec!["write".into()])
        .build();
    let node = cluster.add_node(config).await.expect("node should load");

    let mut handles = Vec::with_capacity(100);
    for _ in 0..100 {
        let cluster = cluster.clone();
        handles.push(tokio::spawn(async move {
            let conn = cluster.get_connection("write").await.unwrap();
            conn.create_transaction().await.unwrap();
            let result = conn
                .query(QueryContext {
                    sql: INVALID_SQL,
                    mode: QueryMode::Execute,
                    pool: "write",
                })
                .await;
            let _ = conn.rollback().await;
            result
        }));
    }

    for handle in handles {
        let result = handle.await.expect("task should not panic");
        assert!(result.is_err());
    }

    assert!(node.count().await <= 5);

    let conn = cluster
        .get_connection("write")
        .await
        .expect("further requests should still succeed");
    conn.query(QueryContext {
        sql: "SELECT 1;",
        mode: QueryMode::Select,
        pool: "write",
    })
    .await
    .expect("connection should still be usable");
}

#[tokio::test]
async fn host_death_triggers_reset_and_rebuild() {
    let host = unique_host("host-death");
    let control = MockControl::for_host(&host);

    let cluster: Cluster<MockConnection> = Cluster::new(ClusterConfig::new());
    let config = NodeConfig::builder(host.as_str())
        .max_connections(1)
        .pools(vec!["read".into()])
        .build();
    let node = cluster.add_node(config).await.expect("node should load");
    assert_eq!(node.count().await, 1);

    let conn = cluster.get_connection("read").await.unwrap();
    // `fail_next_probe` only matches the literal probe SQL `Node` issues
    // internally, so this ordinary query is unaffected by it.
    control.fail_next_probe();
    control.flag_connectivity_problem();
    conn.query(QueryContext {
        sql: "SELECT now();",
        mode: QueryMode::Select,
        pool: "read",
    })
    .await
    .expect("the flagged query itself still succeeds");
    drop(conn);

    // Give the spawned connectivity-problem / reset / rebuild tasks a few
    // scheduling turns to run.
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(control.kills(), 1);
    // Reset clears the old connection list; the node is either still
    // throttling its way back in or has already rebuilt to one connection.
    assert!(node.is_throttling().await || node.count().await == 1);
}

#[tokio::test]
async fn expired_request_times_out_and_drains() {
    let cluster: Cluster<MockConnection> =
        Cluster::new(ClusterConfig::new().request_ttl(Duration::from_millis(50)));

    let start = tokio::time::Instant::now();
    let result = cluster.get_connection("read").await;
    assert!(matches!(result, Err(ClusterError::RequestTimeout { .. })));
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[tokio::test]
async fn graceful_shutdown_rejects_pending_and_kills_live_connections() {
    let host = unique_host("shutdown");
    let control = MockControl::for_host(&host);

    let cluster: Cluster<MockConnection> = Cluster::new(ClusterConfig::new());
    let config = NodeConfig::builder(host.as_str())
        .max_connections(2)
        .pools(vec!["read".into()])
        .build();
    cluster.add_node(config).await.expect("node should load");

    // Lease both connections so the pool's idle set is empty, forcing a
    // further request to queue instead of resolving immediately.
    let a = cluster.get_connection("read").await.unwrap();
    let b = cluster.get_connection("read").await.unwrap();

    let cluster2 = cluster.clone();
    let pending = tokio::spawn(async move { cluster2.get_connection("read").await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    cluster.end().await;

    let result = pending.await.expect("task should not panic");
    assert!(matches!(result, Err(ClusterError::Shutdown)));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(control.kills(), 2);

    drop(a);
    drop(b);
}
