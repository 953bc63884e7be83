//! Per-node configuration (`spec.md` §6), built with the teacher's
//! `bb8::Builder<M>` assert-on-build style generalized to a single node.

use std::time::Duration;

const DEFAULT_MAX_CONNECTIONS: u32 = 50;
const DEFAULT_THROTTLE_TIME_MS: u64 = 10;
const DEFAULT_ERROR_CHECK_INTERVAL_MS: u64 = 30_000;
const DEFAULT_ERROR_CHECK_TIMEOUT_MS: u64 = 30_000;

/// Driver credentials and tuning for a single host (`spec.md` §3 `Node.config`,
/// §6's `addNode` option table).
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub database: String,
    pub schema: Option<String>,
    /// Non-empty set of pool names this node serves.
    pub(crate) pools: Vec<String>,
    pub max_connections: u32,
    pub(crate) initial_throttle_time: Duration,
    pub error_check_interval: Duration,
    pub error_check_timeout: Duration,
}

impl NodeConfig {
    pub fn builder(host: impl Into<String>) -> NodeConfigBuilder {
        NodeConfigBuilder::new(host)
    }

    /// Deterministic string join of `pools`, for observability (tracing
    /// spans, error messages) — `spec.md` §3 `Node.compositeName`.
    pub fn composite_name(&self) -> String {
        self.pools.join("+")
    }

    pub fn pools(&self) -> &[String] {
        &self.pools
    }
}

/// Builder for [`NodeConfig`]. Defaults match `spec.md` §6 exactly.
#[derive(Debug)]
pub struct NodeConfigBuilder {
    host: String,
    port: u16,
    user: String,
    pass: String,
    database: String,
    schema: Option<String>,
    pools: Vec<String>,
    max_connections: u32,
    initial_throttle_time: Duration,
    error_check_interval: Duration,
    error_check_timeout: Duration,
}

impl NodeConfigBuilder {
    pub fn new(host: impl Into<String>) -> Self {
        NodeConfigBuilder {
            host: host.into(),
            port: 0,
            user: String::new(),
            pass: String::new(),
            database: String::new(),
            schema: None,
            // Default pools a node serves when `addNode` omits them.
            pools: vec!["read".into(), "write".into(), "master".into()],
            max_connections: DEFAULT_MAX_CONNECTIONS,
            initial_throttle_time: Duration::from_millis(DEFAULT_THROTTLE_TIME_MS),
            error_check_interval: Duration::from_millis(DEFAULT_ERROR_CHECK_INTERVAL_MS),
            error_check_timeout: Duration::from_millis(DEFAULT_ERROR_CHECK_TIMEOUT_MS),
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn pass(mut self, pass: impl Into<String>) -> Self {
        self.pass = pass.into();
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Overrides the default `["read", "write", "master"]` pool set.
    pub fn pools(mut self, pools: Vec<String>) -> Self {
        assert!(!pools.is_empty(), "a node must serve at least one pool");
        self.pools = pools;
        self
    }

    pub fn max_connections(mut self, max_connections: u32) -> Self {
        assert!(max_connections > 0, "max_connections must be greater than zero!");
        self.max_connections = max_connections;
        self
    }

    pub fn throttle_time(mut self, throttle_time: Duration) -> Self {
        assert!(
            throttle_time > Duration::from_millis(0),
            "throttle_time must be non-zero"
        );
        self.initial_throttle_time = throttle_time;
        self
    }

    pub fn error_check_interval(mut self, interval: Duration) -> Self {
        self.error_check_interval = interval;
        self
    }

    pub fn error_check_timeout(mut self, timeout: Duration) -> Self {
        self.error_check_timeout = timeout;
        self
    }

    pub fn build(self) -> NodeConfig {
        NodeConfig {
            host: self.host,
            port: self.port,
            user: self.user,
            pass: self.pass,
            database: self.database,
            schema: self.schema,
            pools: self.pools,
            max_connections: self.max_connections,
            initial_throttle_time: self.initial_throttle_time,
            error_check_interval: self.error_check_interval,
            error_check_timeout: self.error_check_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = NodeConfig::builder("localhost").build();
        assert_eq!(config.max_connections, 50);
        assert_eq!(config.initial_throttle_time, Duration::from_millis(10));
        assert_eq!(config.error_check_interval, Duration::from_millis(30_000));
        assert_eq!(config.error_check_timeout, Duration::from_millis(30_000));
        assert_eq!(config.pools, vec!["read", "write", "master"]);
        assert_eq!(config.composite_name(), "read+write+master");
    }

    #[test]
    #[should_panic(expected = "max_connections must be greater than zero")]
    fn zero_max_connections_panics() {
        NodeConfig::builder("localhost").max_connections(0);
    }
}
