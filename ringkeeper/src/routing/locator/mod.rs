//! The replica locator: which hosts hold replicas of which token ranges.
//!
//! [`TokenRing`] orders owners by token, `ReplicationInfo` walks it according to
//! a replication strategy, and [`TokenMap`] keeps the precomputed result for
//! every keyspace as an immutable snapshot.

mod replication_info;
#[cfg(test)]
pub(crate) mod test;
mod token_map;
mod token_ring;

pub use token_map::{KeyspaceReplicas, ReplicaSet, TokenMap};
pub use token_ring::TokenRing;
