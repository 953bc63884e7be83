//! Typed error kinds (`spec.md` §7).
//!
//! Connectivity noise is absorbed inside [`crate::node::Node`] and never
//! surfaced to a caller unless the node has ended; callers match on the
//! variant, never on a formatted message.

use std::fmt;

/// Errors surfaced by a [`crate::node::Node`] or the [`crate::cluster::Cluster`].
///
/// Generic over `E`, the driver's own [`crate::driver::Connection::Error`].
#[derive(Debug, thiserror::Error)]
pub enum ClusterError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// `connect()` rejected and the owning node has since ended, so the
    /// failure is surfaced rather than retried locally.
    #[error("connection open failed: {0}")]
    OpenFailure(#[source] E),

    /// A driver-reported or probe-detected connectivity problem that could
    /// not be recovered by resetting the node (surfaced only alongside
    /// `end()`, never as a per-request error).
    #[error("connectivity problem on node {node}")]
    ConnectivityProblem {
        /// The node that detected the problem.
        node: crate::id::NodeId,
    },

    /// The health probe (`SELECT 1;`) did not complete within
    /// `error_check_timeout`.
    #[error("health probe on node {node} timed out")]
    ProbeTimeout {
        /// The node whose probe timed out.
        node: crate::id::NodeId,
    },

    /// A query failed for semantic reasons; passed through unchanged, never
    /// retried.
    #[error("query failed: {0}")]
    QueryError(#[source] E),

    /// A [`crate::request::ConnectionRequest`] was not matched before its
    /// TTL elapsed.
    #[error("request for pool {pool:?} timed out after {waited_ms}ms")]
    RequestTimeout {
        /// The pool the request was enqueued against.
        pool: String,
        /// How long the request waited before expiring.
        waited_ms: u64,
    },

    /// [`crate::cluster::Cluster::end`] was called while the request or
    /// connection was still outstanding.
    #[error("cluster is shutting down")]
    Shutdown,
}

impl<E> ClusterError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// A stable, string-free discriminator callers can match on without
    /// depending on the wrapped driver error's `Debug`/`Display` output.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClusterError::OpenFailure(_) => ErrorKind::OpenFailure,
            ClusterError::ConnectivityProblem { .. } => ErrorKind::ConnectivityProblem,
            ClusterError::ProbeTimeout { .. } => ErrorKind::ProbeTimeout,
            ClusterError::QueryError(_) => ErrorKind::QueryError,
            ClusterError::RequestTimeout { .. } => ErrorKind::RequestTimeout,
            ClusterError::Shutdown => ErrorKind::Shutdown,
        }
    }
}

/// The discriminator half of [`ClusterError`], useful when `E` isn't in scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    OpenFailure,
    ConnectivityProblem,
    ProbeTimeout,
    QueryError,
    RequestTimeout,
    Shutdown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
