//! Control connection and cluster metadata for CQL database drivers.
//!
//! A [`ControlConnection`] keeps one connection to one node of a
//! Cassandra-compatible cluster. Through it, it discovers the nodes of the
//! cluster and the replication options of its keyspaces, and listens to the
//! events the server pushes. From that it maintains:
//! * the host registry, with each host's datacenter, rack, tokens and status,
//! * a [token map](routing::locator::TokenMap) answering which hosts hold the
//!   replicas of a partition key in a given keyspace.
//!
//! Opening connections and speaking the wire protocol is left to the driver,
//! which plugs it in through the [`network::Connector`] trait.
//!
//! # Example
//! ```no_run
//! # use std::sync::Arc;
//! # use ringkeeper::ControlConnectionBuilder;
//! # use ringkeeper::network::Connector;
//! # async fn example(connector: Arc<dyn Connector>) -> Result<(), Box<dyn std::error::Error>> {
//! let control_connection = ControlConnectionBuilder::new()
//!     .known_node("127.0.0.1:9042")
//!     .build(connector);
//! control_connection.init().await?;
//!
//! let replicas = control_connection.get_replicas("my_keyspace", b"partition key")?;
//! for host in replicas {
//!     println!("{host}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod cluster;
pub mod config;
pub mod errors;
pub mod network;
pub mod policies;
pub mod routing;
pub mod utils;

pub use cluster::{ClusterState, ControlConnection, ControlConnectionState, Host};
pub use config::{ControlConnectionBuilder, ControlConnectionConfig};
pub use errors::{ControlConnectionError, NoHostAvailableError};
