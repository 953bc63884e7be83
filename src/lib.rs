//! A concurrent connection-lifecycle engine for a client-side database
//! cluster connection manager: a [`cluster::Cluster`] of [`node::Node`]s,
//! each opening, throttling, health-checking, and tearing down connections
//! to a single host, dispatched to callers through [`request::ConnectionRequest`].
//!
//! The SQL driver itself — query construction, result decoding, the wire
//! protocol — is out of scope; [`driver::Connection`] is the seam a real
//! driver plugs into.

pub mod cluster;
pub mod driver;
pub mod error;
pub mod id;
pub mod node;
pub mod request;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use cluster::{Cluster, ClusterConfig};
pub use driver::{Connection, QueryContext, QueryMode};
pub use error::{ClusterError, ErrorKind};
pub use id::{ConnectionId, NodeId, RequestId};
pub use node::{ConnectionHandle, LeasedConnection, Node, NodeConfig, NodeConfigBuilder, NodeEvent};
pub use request::ConnectionRequest;
