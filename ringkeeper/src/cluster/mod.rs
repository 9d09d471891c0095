//! The cluster as seen through the control connection.
//!
//! This includes:
//! - the [Host] registry, kept in [ClusterState] together with keyspace
//!   replication options and the token map,
//! - [metadata] descriptors read from system tables,
//! - the [ControlConnection], which reads that metadata, follows server
//!   events and keeps [ClusterState] current.

mod control_connection;
pub use control_connection::{ControlConnection, ControlConnectionState};

mod debouncer;

mod host;
pub use host::Host;

pub mod metadata;

mod state;
pub use state::{ClusterState, LocalInfo};

mod topology;
