use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use ringkeeper_cql::value::{ColumnAccessError, CqlValue, QueryResult, Row};
use tracing::{debug, trace, warn};

use super::host::Host;
use super::metadata::Peer;
use super::state::{ClusterState, LocalInfo, NodeListChanges};
use crate::errors::{DbError, MetadataError, RequestError};
use crate::network::{query_with_timeout, Connection};
use crate::policies::host_listener::HostListener;
use crate::routing::partitioner::PartitionerName;
use crate::routing::Token;

const LOCAL_TABLE: &str = "system.local";
const PEERS_TABLE: &str = "system.peers";
const PEERS_V2_TABLE: &str = "system.peers_v2";

const LOCAL_QUERY: &str = "SELECT * FROM system.local WHERE key='local'";
const PEERS_QUERY: &str = "SELECT * FROM system.peers";
const PEERS_V2_QUERY: &str = "SELECT * FROM system.peers_v2";

/// Outcome of [`TopologyRefresher::refresh_node_list`].
#[derive(Debug)]
pub(crate) struct NodeListRefresh {
    /// The host the connection used for the refresh is attached to.
    pub(crate) current_host: Arc<Host>,
    pub(crate) changes: NodeListChanges,
}

/// Reads node descriptors from the system tables and reconciles them into
/// the host registry.
pub(crate) struct TopologyRefresher {
    state: Arc<ClusterState>,
    host_listener: Option<Arc<dyn HostListener>>,
    request_timeout: Option<Duration>,
    // Set once a node rejects queries to system.peers_v2, it is never tried again.
    peers_v2_unsupported: AtomicBool,
}

impl TopologyRefresher {
    pub(crate) fn new(
        state: Arc<ClusterState>,
        host_listener: Option<Arc<dyn HostListener>>,
        request_timeout: Option<Duration>,
    ) -> Self {
        Self {
            state,
            host_listener,
            request_timeout,
            peers_v2_unsupported: AtomicBool::new(false),
        }
    }

    /// Queries the node list through `connection` and publishes it as the new
    /// host registry. Hosts absent from the listing are removed.
    pub(crate) async fn refresh_node_list(
        &self,
        connection: &dyn Connection,
    ) -> Result<NodeListRefresh, MetadataError> {
        let connect_address = connection.connect_address();

        let local = self.query(connection, LOCAL_QUERY).await?;
        let local_row = local.first_row().ok_or(MetadataError::MissingLocalRow)?;
        let (local_peer, local_info) = local_from_row(local_row, connect_address)?;

        let peer_rows = self.query_peers(connection).await?;

        let mut peers = Vec::with_capacity(peer_rows.len() + 1);
        peers.push(local_peer);
        peers.extend(peer_rows);

        self.state.set_local_info(local_info);
        let changes = self
            .state
            .apply_node_list(&peers, self.host_listener.as_deref());
        trace!(
            hosts = peers.len(),
            added = changes.added.len(),
            removed = changes.removed.len(),
            updated = changes.updated.len(),
            "Node list refreshed"
        );

        let current_host = self
            .state
            .get_host(connect_address)
            .ok_or(MetadataError::MissingLocalRow)?;
        Ok(NodeListRefresh {
            current_host,
            changes,
        })
    }

    async fn query(
        &self,
        connection: &dyn Connection,
        statement: &str,
    ) -> Result<QueryResult, RequestError> {
        query_with_timeout(connection, statement, Vec::new(), self.request_timeout).await
    }

    async fn query_peers(&self, connection: &dyn Connection) -> Result<Vec<Peer>, MetadataError> {
        let connect_port = connection.connect_address().port();

        if connection.protocol_version().supports_peers_v2()
            && !self.peers_v2_unsupported.load(Ordering::Relaxed)
        {
            match self.query(connection, PEERS_V2_QUERY).await {
                Ok(result) => return peers_from_result(&result, PEERS_V2_TABLE, connect_port),
                Err(RequestError::DbError(DbError::Invalid, message)) => {
                    debug!(
                        %message,
                        "system.peers_v2 is not available, falling back to system.peers"
                    );
                    self.peers_v2_unsupported.store(true, Ordering::Relaxed);
                }
                Err(error) => return Err(error.into()),
            }
        }

        let result = self.query(connection, PEERS_QUERY).await?;
        peers_from_result(&result, PEERS_TABLE, connect_port)
    }
}

fn peers_from_result(
    result: &QueryResult,
    table: &'static str,
    connect_port: u16,
) -> Result<Vec<Peer>, MetadataError> {
    let mut peers = Vec::with_capacity(result.rows.len());
    for row in result.rows.iter() {
        if let Some(peer) = peer_from_row(row, table, connect_port)? {
            peers.push(peer);
        }
    }
    Ok(peers)
}

fn malformed(table: &'static str) -> impl Fn(ColumnAccessError) -> MetadataError {
    move |error| MetadataError::MalformedRow { table, error }
}

fn inet(row: &Row, column: &str) -> Result<Option<IpAddr>, ColumnAccessError> {
    row.get_opt(column, "inet", CqlValue::as_inet)
}

/// Address clients should connect to, as advertised in a peers row.
///
/// A node bound to the wildcard address advertises `0.0.0.0`, the `peer`
/// column holds its real address then.
fn peer_address(
    row: &Row,
    table: &'static str,
    connect_port: u16,
) -> Result<Option<SocketAddr>, MetadataError> {
    let (rpc_column, port) = if table == PEERS_V2_TABLE {
        let native_port = row
            .get_opt("native_port", "int", CqlValue::as_int)
            .map_err(malformed(table))?
            .and_then(|port| u16::try_from(port).ok())
            .unwrap_or(connect_port);
        ("native_address", native_port)
    } else {
        ("rpc_address", connect_port)
    };

    let rpc_address = inet(row, rpc_column).map_err(malformed(table))?;
    let peer = inet(row, "peer").map_err(malformed(table))?;
    let ip = match rpc_address {
        Some(address) if !address.is_unspecified() => Some(address),
        _ => peer,
    };
    Ok(ip.map(|ip| SocketAddr::new(ip, port)))
}

fn peer_from_row(
    row: &Row,
    table: &'static str,
    connect_port: u16,
) -> Result<Option<Peer>, MetadataError> {
    let Some(address) = peer_address(row, table, connect_port)? else {
        warn!(table, "Node row without a usable address, skipping it");
        return Ok(None);
    };
    node_from_row(row, table, address).map(Some)
}

fn local_from_row(
    row: &Row,
    connect_address: SocketAddr,
) -> Result<(Peer, LocalInfo), MetadataError> {
    // rpc_address in system.local may be wrong, the address we reached the node at is not.
    let peer = node_from_row(row, LOCAL_TABLE, connect_address)?;

    let partitioner = row
        .get_opt("partitioner", "text", CqlValue::as_text)
        .map_err(malformed(LOCAL_TABLE))?
        .map(PartitionerName::from_str_or_default)
        .unwrap_or_default();
    let cluster_name = row
        .get_opt("cluster_name", "text", CqlValue::as_text)
        .map_err(malformed(LOCAL_TABLE))?
        .map(str::to_owned);

    Ok((
        peer,
        LocalInfo {
            cluster_name,
            partitioner,
        },
    ))
}

fn node_from_row(row: &Row, table: &'static str, address: SocketAddr) -> Result<Peer, MetadataError> {
    let text = |column: &str| {
        row.get_opt(column, "text", CqlValue::as_text)
            .map(|value| value.map(str::to_owned))
            .map_err(malformed(table))
    };
    let uuid = |column: &str| {
        row.get_opt(column, "uuid", CqlValue::as_uuid)
            .map_err(malformed(table))
    };

    let token_values = row
        .get_opt("tokens", "set<text>", CqlValue::as_collection)
        .map_err(malformed(table))?
        .unwrap_or(&[]);

    let mut peer = Peer::from_address(address);
    peer.host_id = uuid("host_id")?;
    peer.datacenter = text("data_center")?;
    peer.rack = text("rack")?;
    peer.schema_version = uuid("schema_version")?;
    peer.release_version = text("release_version")?;
    peer.dse_version = text("dse_version")?;
    peer.tokens = parse_tokens(token_values, address);
    Ok(peer)
}

fn parse_tokens(values: &[CqlValue], address: SocketAddr) -> Vec<Token> {
    let parsed: Result<Vec<Token>, String> = values
        .iter()
        .map(|value| {
            let text = value.as_text().ok_or_else(|| format!("{value:?}"))?;
            Token::from_str(text).map_err(|e| format!("{text}: {e}"))
        })
        .collect();

    match parsed {
        Ok(tokens) => tokens,
        Err(error) => {
            // Other partitioners use tokens which are not 64-bit integers.
            warn!(
                host = %address,
                %error,
                "Couldn't parse tokens as 64-bit integers, proceeding with a dummy token"
            );
            vec![Token::new(rand::rng().random::<i64>())]
        }
    }
}
