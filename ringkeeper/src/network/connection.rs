use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ringkeeper_cql::frame::server_event_type::EventType;
use ringkeeper_cql::value::{CqlValue, QueryResult};
use ringkeeper_cql::ProtocolVersion;
use tokio::sync::{mpsc, oneshot};

use crate::errors::{ConnectionError, RequestError};

/// A single established connection to a node.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    /// Sends a query and waits for its complete result.
    async fn query(
        &self,
        statement: &str,
        values: Vec<CqlValue>,
    ) -> Result<QueryResult, RequestError>;

    /// Sends a REGISTER request. Afterwards the server pushes events of the
    /// given types, which arrive through [`OpenedConnection::events`].
    async fn register(&self, event_types: &[EventType]) -> Result<(), RequestError>;

    /// The address the connection was opened to.
    fn connect_address(&self) -> SocketAddr;

    /// Protocol version negotiated for this connection.
    fn protocol_version(&self) -> ProtocolVersion;

    /// Closes the connection. Requests issued afterwards fail.
    fn close(&self);
}

/// Everything [`Connector::open`] hands back for a new connection.
pub struct OpenedConnection {
    pub connection: Arc<dyn Connection>,
    /// Bodies of `EVENT` responses pushed by the server, still encoded.
    pub events: mpsc::Receiver<Vec<u8>>,
    /// Completes once with the error that broke the connection.
    pub error_receiver: oneshot::Receiver<ConnectionError>,
}

impl fmt::Debug for OpenedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedConnection")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

/// Opens connections to nodes.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a connection and performs the handshake using `protocol_version`.
    ///
    /// If the server does not speak that version, implementations return
    /// [`ConnectionError::ProtocolVersionUnsupported`] with the version the
    /// server suggested, if any.
    async fn open(
        &self,
        address: SocketAddr,
        protocol_version: ProtocolVersion,
    ) -> Result<OpenedConnection, ConnectionError>;
}

/// Sends a query, failing with [`RequestError::RequestTimeout`] if no response
/// arrives within `timeout`.
pub(crate) async fn query_with_timeout(
    connection: &dyn Connection,
    statement: &str,
    values: Vec<CqlValue>,
    timeout: Option<Duration>,
) -> Result<QueryResult, RequestError> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, connection.query(statement, values))
            .await
            .map_err(|_| RequestError::RequestTimeout(timeout))?,
        None => connection.query(statement, values).await,
    }
}
