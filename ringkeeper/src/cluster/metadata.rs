//! Descriptors read from system tables: node rows and keyspace replication options.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use ringkeeper_cql::value::{CqlValue, QueryResult, Row};
use uuid::Uuid;

use crate::errors::{KeyspaceStrategyError, MetadataError};
use crate::network::{query_with_timeout, Connection};
use crate::routing::Token;

/// A node descriptor, as read from `system.local` or `system.peers`.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct Peer {
    pub address: SocketAddr,
    pub host_id: Option<Uuid>,
    pub datacenter: Option<String>,
    pub rack: Option<String>,
    pub tokens: Vec<Token>,
    pub schema_version: Option<Uuid>,
    pub release_version: Option<String>,
    pub dse_version: Option<String>,
}

impl Peer {
    /// A descriptor carrying only an address, as known for contact points
    /// before any metadata was read.
    pub fn from_address(address: SocketAddr) -> Self {
        Self {
            address,
            host_id: None,
            datacenter: None,
            rack: None,
            tokens: Vec::new(),
            schema_version: None,
            release_version: None,
            dse_version: None,
        }
    }
}

/// Replication strategy of a keyspace.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[allow(clippy::enum_variant_names)]
pub enum Strategy {
    SimpleStrategy {
        replication_factor: usize,
    },
    NetworkTopologyStrategy {
        // Replication factors of datacenters with given names
        datacenter_repfactors: BTreeMap<String, usize>,
    },
    LocalStrategy, // replication_factor == 1
    Other {
        name: String,
        data: BTreeMap<String, String>,
    },
}

/// Replication descriptor of one keyspace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyspaceMetadata {
    pub name: String,
    pub durable_writes: bool,
    pub strategy: Strategy,
}

/// Parses a replication factor. Keyspaces using transient replication report
/// `"<all>/<transient>"`, every one of the `<all>` replicas owns the range.
fn parse_replication_factor(value: &str) -> Result<usize, std::num::ParseIntError> {
    let all_replicas = value.split_once('/').map_or(value, |(all, _transient)| all);
    usize::from_str(all_replicas.trim())
}

pub(crate) fn strategy_from_string_map(
    mut strategy_map: BTreeMap<String, String>,
) -> Result<Strategy, KeyspaceStrategyError> {
    let strategy_name: String = strategy_map
        .remove("class")
        .ok_or(KeyspaceStrategyError::MissingClassForStrategyDefinition)?;

    let strategy: Strategy = match strategy_name.as_str() {
        "org.apache.cassandra.locator.SimpleStrategy" | "SimpleStrategy" => {
            let rep_factor_str: String = strategy_map
                .remove("replication_factor")
                .ok_or(KeyspaceStrategyError::MissingReplicationFactorForSimpleStrategy)?;

            let replication_factor = parse_replication_factor(&rep_factor_str)
                .map_err(KeyspaceStrategyError::ReplicationFactorParseError)?;

            Strategy::SimpleStrategy { replication_factor }
        }
        "org.apache.cassandra.locator.NetworkTopologyStrategy" | "NetworkTopologyStrategy" => {
            let mut datacenter_repfactors = BTreeMap::new();

            for (key, value) in strategy_map {
                let rep_factor = parse_replication_factor(&value).map_err(|_| {
                    // Only 'class' (resolved above) and per-dc factors are expected.
                    KeyspaceStrategyError::UnexpectedNetworkTopologyStrategyOption {
                        key: key.clone(),
                        value,
                    }
                })?;

                datacenter_repfactors.insert(key, rep_factor);
            }

            Strategy::NetworkTopologyStrategy {
                datacenter_repfactors,
            }
        }
        "org.apache.cassandra.locator.LocalStrategy" | "LocalStrategy" => Strategy::LocalStrategy,
        _ => Strategy::Other {
            name: strategy_name,
            data: strategy_map,
        },
    };

    Ok(strategy)
}

const KEYSPACES_TABLE: &str = "system_schema.keyspaces";
const KEYSPACES_QUERY: &str =
    "SELECT keyspace_name, durable_writes, replication FROM system_schema.keyspaces";

fn text_map(value: &CqlValue) -> Option<BTreeMap<String, String>> {
    value
        .as_map()?
        .iter()
        .map(|(k, v)| Some((k.as_text()?.to_owned(), v.as_text()?.to_owned())))
        .collect()
}

fn keyspace_from_row(row: &Row) -> Result<KeyspaceMetadata, MetadataError> {
    let malformed = |error| MetadataError::MalformedRow {
        table: KEYSPACES_TABLE,
        error,
    };

    let name = row
        .get_required("keyspace_name", "text", CqlValue::as_text)
        .map_err(malformed)?
        .to_owned();
    let durable_writes = row
        .get_opt("durable_writes", "boolean", CqlValue::as_boolean)
        .map_err(malformed)?
        .unwrap_or(true);
    let replication = row
        .get_required("replication", "map<text, text>", text_map)
        .map_err(malformed)?;

    let strategy =
        strategy_from_string_map(replication).map_err(|error| MetadataError::KeyspaceStrategy {
            keyspace: name.clone(),
            error,
        })?;

    Ok(KeyspaceMetadata {
        name,
        durable_writes,
        strategy,
    })
}

/// Fails on the first keyspace that cannot be read, a partial listing would
/// look like the missing keyspaces were dropped.
fn keyspaces_from_result(result: &QueryResult) -> Result<Vec<KeyspaceMetadata>, MetadataError> {
    result.rows.iter().map(keyspace_from_row).collect()
}

/// Reads the replication options of every keyspace.
pub(crate) async fn query_keyspaces(
    connection: &dyn Connection,
    timeout: Option<Duration>,
) -> Result<Vec<KeyspaceMetadata>, MetadataError> {
    let result = query_with_timeout(connection, KEYSPACES_QUERY, Vec::new(), timeout).await?;
    keyspaces_from_result(&result)
}

/// Reads the replication options of one keyspace, `None` if it does not exist.
pub(crate) async fn query_keyspace(
    connection: &dyn Connection,
    keyspace: &str,
    timeout: Option<Duration>,
) -> Result<Option<KeyspaceMetadata>, MetadataError> {
    let result = query_with_timeout(
        connection,
        &format!("{KEYSPACES_QUERY} WHERE keyspace_name = ?"),
        vec![CqlValue::Text(keyspace.to_owned())],
        timeout,
    )
    .await?;
    match result.first_row() {
        None => Ok(None),
        Some(row) => keyspace_from_row(row).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::setup_tracing;
    use assert_matches::assert_matches;

    fn map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn strategy_parsing() {
        setup_tracing();
        assert_eq!(
            strategy_from_string_map(map(&[
                ("class", "org.apache.cassandra.locator.SimpleStrategy"),
                ("replication_factor", "3"),
            ])),
            Ok(Strategy::SimpleStrategy {
                replication_factor: 3
            })
        );
        assert_eq!(
            strategy_from_string_map(map(&[
                ("class", "NetworkTopologyStrategy"),
                ("eu", "3/1"),
                ("us", "2"),
            ])),
            Ok(Strategy::NetworkTopologyStrategy {
                datacenter_repfactors: [("eu".to_owned(), 3), ("us".to_owned(), 2)]
                    .into_iter()
                    .collect()
            })
        );
        assert_eq!(
            strategy_from_string_map(map(&[("class", "LocalStrategy")])),
            Ok(Strategy::LocalStrategy)
        );
        assert_matches!(
            strategy_from_string_map(map(&[("class", "EverywhereStrategy"), ("x", "y")])),
            Ok(Strategy::Other { name, data }) if name == "EverywhereStrategy" && data.len() == 1
        );
    }

    #[test]
    fn invalid_strategies() {
        setup_tracing();
        assert_eq!(
            strategy_from_string_map(map(&[("replication_factor", "3")])),
            Err(KeyspaceStrategyError::MissingClassForStrategyDefinition)
        );
        assert_eq!(
            strategy_from_string_map(map(&[("class", "SimpleStrategy")])),
            Err(KeyspaceStrategyError::MissingReplicationFactorForSimpleStrategy)
        );
        assert_matches!(
            strategy_from_string_map(map(&[("class", "SimpleStrategy"), ("replication_factor", "x")])),
            Err(KeyspaceStrategyError::ReplicationFactorParseError(_))
        );
        assert_matches!(
            strategy_from_string_map(map(&[("class", "NetworkTopologyStrategy"), ("eu", "many")])),
            Err(KeyspaceStrategyError::UnexpectedNetworkTopologyStrategyOption { key, .. }) if key == "eu"
        );
    }

    #[test]
    fn keyspace_rows() {
        setup_tracing();
        let good = || {
            let replication = CqlValue::Map(vec![
                (
                    CqlValue::Text("class".to_owned()),
                    CqlValue::Text("SimpleStrategy".to_owned()),
                ),
                (
                    CqlValue::Text("replication_factor".to_owned()),
                    CqlValue::Text("2".to_owned()),
                ),
            ]);
            Row::new()
                .with("keyspace_name", CqlValue::Text("ks".to_owned()))
                .with("durable_writes", CqlValue::Boolean(false))
                .with("replication", replication)
        };
        let no_class = || {
            Row::new()
                .with("keyspace_name", CqlValue::Text("broken".to_owned()))
                .with("replication", CqlValue::Map(Vec::new()))
        };

        assert_matches!(
            keyspace_from_row(&no_class()),
            Err(MetadataError::KeyspaceStrategy { keyspace, .. }) if keyspace == "broken"
        );

        assert_matches!(
            keyspaces_from_result(&QueryResult::new(vec![good()])),
            Ok(keyspaces) if keyspaces == vec![KeyspaceMetadata {
                name: "ks".to_owned(),
                durable_writes: false,
                strategy: Strategy::SimpleStrategy {
                    replication_factor: 2
                },
            }]
        );

        // One unreadable keyspace fails the whole listing instead of vanishing from it.
        assert_matches!(
            keyspaces_from_result(&QueryResult::new(vec![good(), no_class()])),
            Err(MetadataError::KeyspaceStrategy { keyspace, .. }) if keyspace == "broken"
        );
    }
}
