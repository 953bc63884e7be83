//! Cluster-wide configuration (`spec.md` §3 `Cluster.requestTtl`).

use std::time::Duration;

/// `spec.md` §6 does not name a concrete default for `requestTtl`; 30
/// seconds matches the teacher's own `Builder::connection_timeout` default,
/// which plays the same "how long may a caller wait" role.
const DEFAULT_REQUEST_TTL_MS: u64 = 30_000;

/// Cluster-wide settings not specific to any one node.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Default ms a [`crate::request::ConnectionRequest`] may wait before
    /// it is aborted with `RequestTimeout`.
    pub request_ttl: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            request_ttl: Duration::from_millis(DEFAULT_REQUEST_TTL_MS),
        }
    }
}

impl ClusterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_ttl(mut self, ttl: Duration) -> Self {
        assert!(ttl > Duration::from_millis(0), "request_ttl must be non-zero");
        self.request_ttl = ttl;
        self
    }
}
