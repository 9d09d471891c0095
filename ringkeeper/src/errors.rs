//! This module contains various errors which can be returned by the control connection
//! and the metadata structures it maintains.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::num::ParseIntError;
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use ringkeeper_cql::frame::frame_errors::CqlEventParseError;
use ringkeeper_cql::value::ColumnAccessError;
use ringkeeper_cql::ProtocolVersion;
use thiserror::Error;

/// Error code returned by the server along with a message.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum DbError {
    #[error("The query is syntactically correct but invalid")]
    Invalid,
    #[error("The submitted query has a syntax error")]
    SyntaxError,
    #[error("The logged user doesn't have the right to perform the query")]
    Unauthorized,
    #[error("Not enough nodes are alive to satisfy required consistency level")]
    Unavailable,
    #[error("The request cannot be processed because the coordinator node is overloaded")]
    Overloaded,
    #[error("Internal server error")]
    ServerError,
    #[error("Other error not specified, error code: {0}")]
    Other(i32),
}

/// The connection was closed, either by the server or because of a transport failure.
#[derive(Error, Debug, Clone)]
#[error("Connection broken, reason: {0}")]
pub struct BrokenConnectionError(pub String);

/// Failure of a single metadata request sent over the control connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestError {
    /// Database sent a response containing some error with a message
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// Input/Output error has occurred, connection broken etc.
    #[error("IO Error: {0}")]
    IoError(Arc<std::io::Error>),

    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    /// Client timeout occurred before a response arrived.
    #[error("Request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// The response could not be interpreted.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// There is no live control connection to send the request on.
    #[error("Control connection is not established")]
    NotConnected,

    /// The control connection has been shut down.
    #[error("Control connection was shut down")]
    Shutdown,
}

impl RequestError {
    /// Whether the failure says something about the connection rather than the request.
    ///
    /// Transport errors make the control connection reconnect.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            RequestError::IoError(_)
                | RequestError::BrokenConnection(_)
                | RequestError::RequestTimeout(_)
                | RequestError::NotConnected
        )
    }
}

impl From<std::io::Error> for RequestError {
    fn from(error: std::io::Error) -> RequestError {
        RequestError::IoError(Arc::new(error))
    }
}

/// Failure to open or set up a connection to one endpoint.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    /// Timeout error has occurred, couldn't connect to node in time.
    #[error("Connect timeout elapsed")]
    ConnectTimeout,

    #[error("IO Error: {0}")]
    IoError(Arc<std::io::Error>),

    /// The server refused the offered protocol version.
    #[error(
        "Server rejected protocol version {requested}{}",
        suggestion_suffix(.server_suggested)
    )]
    ProtocolVersionUnsupported {
        requested: ProtocolVersion,
        server_suggested: Option<u8>,
    },

    /// Handshake (STARTUP, authentication) failed.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    /// REGISTER request for server events failed.
    #[error("Failed to register for server events: {0}")]
    RegisterFailed(RequestError),

    /// The connection was opened but reading topology through it failed.
    #[error("Failed to read topology: {0}")]
    Metadata(#[from] MetadataError),
}

impl From<std::io::Error> for ConnectionError {
    fn from(error: std::io::Error) -> ConnectionError {
        ConnectionError::IoError(Arc::new(error))
    }
}

fn suggestion_suffix(server_suggested: &Option<u8>) -> String {
    server_suggested
        .map(|v| format!(", it suggests version {v}"))
        .unwrap_or_default()
}

/// An error that occurred when parsing keyspace replication options.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum KeyspaceStrategyError {
    #[error("keyspace strategy definition is missing a 'class' field")]
    MissingClassForStrategyDefinition,

    #[error("Missing replication factor field for SimpleStrategy")]
    MissingReplicationFactorForSimpleStrategy,

    #[error("Failed to parse a replication factor as unsigned integer: {0}")]
    ReplicationFactorParseError(ParseIntError),

    #[error("Unexpected NetworkTopologyStrategy option: '{key}': '{value}'")]
    UnexpectedNetworkTopologyStrategyOption { key: String, value: String },
}

/// Failure to turn system table contents into metadata.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum MetadataError {
    #[error("Metadata query failed: {0}")]
    Request(#[from] RequestError),

    /// `system.local` returned no row for the node we are connected to.
    #[error("system.local returned no row")]
    MissingLocalRow,

    #[error("Malformed row in {table}: {error}")]
    MalformedRow {
        table: &'static str,
        error: ColumnAccessError,
    },

    #[error("Invalid replication options of keyspace {keyspace}: {error}")]
    KeyspaceStrategy {
        keyspace: String,
        error: KeyspaceStrategyError,
    },

    /// A server event could not be decoded.
    #[error("Malformed server event: {0}")]
    MalformedEvent(#[from] CqlEventParseError),

    /// The control connection was shut down before the refresh could run.
    #[error("Control connection was shut down")]
    Shutdown,
}

impl MetadataError {
    pub(crate) fn is_transport_error(&self) -> bool {
        matches!(self, MetadataError::Request(e) if e.is_transport_error())
    }
}

/// Error returned by replica lookups.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TokenMapError {
    /// The keyspace is unknown, which is different from a keyspace with no replicas.
    #[error("Keyspace {0} not found in the token map")]
    KeyspaceNotFound(String),

    /// No token map was built yet because the control connection never connected.
    #[error("Token map has not been built yet")]
    NotBuilt,
}

/// A status event named an address that is not in the host registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Host with address {0} not found")]
pub struct HostNotFoundError(pub IpAddr);

/// Every candidate endpoint failed.
///
/// `Display` lists at most a few causes inline, [`NoHostAvailableError::errors`]
/// gives all of them.
#[derive(Debug, Clone)]
pub struct NoHostAvailableError {
    errors: Vec<(SocketAddr, ConnectionError)>,
}

impl NoHostAvailableError {
    const INLINE_ERRORS: usize = 3;

    pub fn new(errors: Vec<(SocketAddr, ConnectionError)>) -> Self {
        Self { errors }
    }

    /// Per-endpoint failures, in the order endpoints were tried.
    pub fn errors(&self) -> &[(SocketAddr, ConnectionError)] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for NoHostAvailableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            return write!(f, "No host available, there were no hosts to try");
        }
        write!(
            f,
            "All hosts tried for the control connection failed (tried: {})",
            self.errors
                .iter()
                .take(Self::INLINE_ERRORS)
                .map(|(addr, err)| format!("{addr}: {err}"))
                .join("; ")
        )?;
        if self.errors.len() > Self::INLINE_ERRORS {
            write!(f, " and {} more", self.errors.len() - Self::INLINE_ERRORS)?;
        }
        Ok(())
    }
}

impl std::error::Error for NoHostAvailableError {}

/// Errors surfaced by [`ControlConnection`](crate::cluster::ControlConnection) operations.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ControlConnectionError {
    #[error(transparent)]
    NoHostAvailable(#[from] NoHostAvailableError),

    /// List of known nodes passed to the builder is empty.
    #[error("Empty known nodes list")]
    EmptyKnownNodesList,

    /// None of the configured hostnames could be resolved.
    #[error("Couldn't resolve any hostname: {0:?}")]
    FailedToResolveAnyHostname(Vec<String>),

    /// The server changed its protocol expectations after initialization.
    #[error(
        "{endpoint} rejected protocol version {negotiated} negotiated during initialization"
    )]
    ProtocolVersionMismatch {
        endpoint: SocketAddr,
        negotiated: ProtocolVersion,
        server_suggested: Option<u8>,
    },

    #[error("Control connection was shut down")]
    Shutdown,

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Request(#[from] RequestError),
}

#[cfg(test)]
mod tests {
    use super::{ConnectionError, NoHostAvailableError};
    use std::net::SocketAddr;

    #[test]
    fn no_host_available_caps_inline_errors() {
        let errors: Vec<(SocketAddr, ConnectionError)> = (1..=5)
            .map(|i| {
                (
                    SocketAddr::from(([10, 0, 0, i], 9042)),
                    ConnectionError::ConnectTimeout,
                )
            })
            .collect();
        let error = NoHostAvailableError::new(errors);

        let message = error.to_string();
        assert!(message.contains("10.0.0.1:9042: Connect timeout elapsed"));
        assert!(message.contains("10.0.0.3:9042"));
        assert!(!message.contains("10.0.0.4:9042"));
        assert!(message.ends_with("and 2 more"));
        assert_eq!(error.errors().len(), 5);
    }

    #[test]
    fn no_host_available_without_candidates() {
        let error = NoHostAvailableError::new(Vec::new());
        assert!(error.is_empty());
        assert!(error.to_string().contains("no hosts to try"));
    }
}
