use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use ringkeeper_cql::frame::response::event::SchemaChangeEvent;
use ringkeeper_cql::frame::server_event_type::EventType;
use ringkeeper_cql::frame::types::{write_inet, write_string};
use ringkeeper_cql::value::{CqlValue, QueryResult, Row};
use ringkeeper_cql::ProtocolVersion;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::cluster::metadata::Peer;
use crate::cluster::Host;
use crate::errors::{
    BrokenConnectionError, ConnectionError, ControlConnectionError, DbError, RequestError,
};
use crate::network::{Connection, Connector, EndpointResolver, OpenedConnection, ResolvedContactPoint};
use crate::policies::host_listener::{HostEvent, HostEventContext, HostListener};
use crate::policies::schema_listener::SchemaChangeListener;
use crate::routing::Token;

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

/// A host with a fake address, identified by its port.
pub(crate) fn mock_host(id: u16, datacenter: &str, rack: &str, tokens: &[i64]) -> Arc<Host> {
    let mut peer = Peer::from_address(SocketAddr::from(([255, 255, 255, 255], id)));
    peer.datacenter = Some(datacenter.to_owned());
    peer.rack = Some(rack.to_owned());
    peer.tokens = tokens.iter().copied().map(Token::new).collect();
    Arc::new(Host::new(&peer))
}

/// Polls `condition` until it holds. Relies on paused time to return quickly.
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition was not reached in time");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

#[derive(Debug, Default)]
pub(crate) struct RecordingHostListener {
    events: Mutex<Vec<(SocketAddr, HostEvent)>>,
}

impl RecordingHostListener {
    pub(crate) fn events(&self) -> Vec<(SocketAddr, HostEvent)> {
        lock(&self.events).clone()
    }
}

impl HostListener for RecordingHostListener {
    fn on_event(&self, ctx: &HostEventContext, event: &HostEvent) {
        lock(&self.events).push((ctx.addr(), *event));
    }
}

#[derive(Debug, Default)]
pub(crate) struct RecordingSchemaListener {
    objects: Mutex<Vec<SchemaChangeEvent>>,
    dropped: Mutex<Vec<String>>,
}

impl RecordingSchemaListener {
    pub(crate) fn objects(&self) -> Vec<SchemaChangeEvent> {
        lock(&self.objects).clone()
    }

    pub(crate) fn dropped_keyspaces(&self) -> Vec<String> {
        lock(&self.dropped).clone()
    }
}

impl SchemaChangeListener for RecordingSchemaListener {
    fn on_object_changed(&self, event: &SchemaChangeEvent) {
        lock(&self.objects).push(event.clone());
    }

    fn on_keyspace_dropped(&self, keyspace: &str) {
        lock(&self.dropped).push(keyspace.to_owned());
    }
}

/// Contact points given as addresses, no DNS involved.
#[derive(Debug)]
pub(crate) struct StaticResolver {
    addresses: Vec<SocketAddr>,
    refreshes: AtomicUsize,
}

impl StaticResolver {
    pub(crate) fn new(addresses: Vec<SocketAddr>) -> Self {
        Self {
            addresses,
            refreshes: AtomicUsize::new(0),
        }
    }

    /// How many times contact points were resolved again, bypassing the cache.
    pub(crate) fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EndpointResolver for StaticResolver {
    async fn resolve_contact_points(
        &self,
        refresh_cache: bool,
    ) -> Result<Vec<ResolvedContactPoint>, ControlConnectionError> {
        if refresh_cache {
            self.refreshes.fetch_add(1, Ordering::Relaxed);
        }
        if self.addresses.is_empty() {
            return Err(ControlConnectionError::EmptyKnownNodesList);
        }
        Ok(self
            .addresses
            .iter()
            .map(|&address| ResolvedContactPoint {
                address,
                hostname: None,
            })
            .collect())
    }
}

pub(crate) fn node_address(id: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, id], 9042))
}

/// A node of a [`MockCluster`].
#[derive(Debug, Clone)]
pub(crate) struct MockNode {
    address: SocketAddr,
    host_id: Uuid,
    datacenter: String,
    rack: String,
    tokens: Vec<i64>,
}

impl MockNode {
    pub(crate) fn new(id: u8, datacenter: &str, rack: &str, tokens: &[i64]) -> Self {
        Self {
            address: node_address(id),
            host_id: Uuid::new_v4(),
            datacenter: datacenter.to_owned(),
            rack: rack.to_owned(),
            tokens: tokens.to_vec(),
        }
    }

    fn token_set(&self) -> CqlValue {
        CqlValue::Set(
            self.tokens
                .iter()
                .map(|token| CqlValue::Text(token.to_string()))
                .collect(),
        )
    }

    fn local_row(&self) -> Row {
        Row::new()
            .with("key", CqlValue::Text("local".to_owned()))
            .with("rpc_address", CqlValue::Inet(self.address.ip()))
            .with("data_center", CqlValue::Text(self.datacenter.clone()))
            .with("rack", CqlValue::Text(self.rack.clone()))
            .with("tokens", self.token_set())
            .with("host_id", CqlValue::Uuid(self.host_id))
            .with(
                "partitioner",
                CqlValue::Text("org.apache.cassandra.dht.Murmur3Partitioner".to_owned()),
            )
            .with("cluster_name", CqlValue::Text("mock cluster".to_owned()))
            .with("release_version", CqlValue::Text("4.0.11".to_owned()))
    }

    fn peer_row(&self, v2: bool) -> Row {
        let row = Row::new()
            .with("peer", CqlValue::Inet(self.address.ip()))
            .with("data_center", CqlValue::Text(self.datacenter.clone()))
            .with("rack", CqlValue::Text(self.rack.clone()))
            .with("tokens", self.token_set())
            .with("host_id", CqlValue::Uuid(self.host_id))
            .with("release_version", CqlValue::Text("4.0.11".to_owned()));
        if v2 {
            row.with("native_address", CqlValue::Inet(self.address.ip()))
                .with("native_port", CqlValue::Int(i32::from(self.address.port())))
        } else {
            row.with("rpc_address", CqlValue::Inet(self.address.ip()))
        }
    }
}

struct MockState {
    nodes: Vec<MockNode>,
    keyspaces: BTreeMap<String, Vec<(String, String)>>,
    peers_v2_supported: bool,
    max_protocol_version: ProtocolVersion,
    unreachable: HashSet<SocketAddr>,
    open_delay: Duration,
    open_attempts: Vec<SocketAddr>,
    queries: Vec<String>,
    connections: Vec<Weak<MockConnection>>,
}

/// An in-memory cluster serving system tables and pushing events through
/// the connections it opens.
pub(crate) struct MockCluster {
    state: Arc<Mutex<MockState>>,
}

impl MockCluster {
    pub(crate) fn new(nodes: Vec<MockNode>) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(MockState {
                nodes,
                keyspaces: BTreeMap::new(),
                peers_v2_supported: true,
                max_protocol_version: ProtocolVersion::MAX_SUPPORTED,
                unreachable: HashSet::new(),
                open_delay: Duration::ZERO,
                open_attempts: Vec::new(),
                queries: Vec::new(),
                connections: Vec::new(),
            })),
        })
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        lock(&self.state)
    }

    pub(crate) fn add_node(&self, node: MockNode) {
        self.state().nodes.push(node);
    }

    pub(crate) fn remove_node(&self, id: u8) {
        self.state()
            .nodes
            .retain(|node| node.address != node_address(id));
    }

    pub(crate) fn add_keyspace(&self, name: &str, replication: &[(&str, &str)]) {
        let replication = replication
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.state().keyspaces.insert(name.to_owned(), replication);
    }

    pub(crate) fn drop_keyspace(&self, name: &str) {
        self.state().keyspaces.remove(name);
    }

    pub(crate) fn set_peers_v2_supported(&self, supported: bool) {
        self.state().peers_v2_supported = supported;
    }

    pub(crate) fn set_max_protocol_version(&self, version: ProtocolVersion) {
        self.state().max_protocol_version = version;
    }

    pub(crate) fn set_reachable(&self, id: u8, reachable: bool) {
        let mut state = self.state();
        if reachable {
            state.unreachable.remove(&node_address(id));
        } else {
            state.unreachable.insert(node_address(id));
        }
    }

    pub(crate) fn set_open_delay(&self, delay: Duration) {
        self.state().open_delay = delay;
    }

    /// Addresses of all connection attempts, successful or not.
    pub(crate) fn open_attempts(&self) -> Vec<SocketAddr> {
        self.state().open_attempts.clone()
    }

    /// Number of queries which read from `table`.
    pub(crate) fn queries_to(&self, table: &str) -> usize {
        self.state()
            .queries
            .iter()
            .filter(|query| table_of(query) == Some(table))
            .count()
    }

    fn live_connections(&self) -> Vec<Arc<MockConnection>> {
        self.state()
            .connections
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|connection| !connection.closed.load(Ordering::Acquire))
            .collect()
    }

    /// Addresses of connections which have been neither closed nor broken.
    pub(crate) fn live_connection_addresses(&self) -> Vec<SocketAddr> {
        self.live_connections()
            .iter()
            .map(|connection| connection.address)
            .collect()
    }

    /// Sends an event body to every connection registered for events.
    pub(crate) fn push_event(&self, body: Vec<u8>) {
        for connection in self.live_connections() {
            if !connection.registered.load(Ordering::Acquire) {
                continue;
            }
            if let Some(events) = lock(&connection.events).as_ref() {
                let _ = events.try_send(body.clone());
            }
        }
    }

    /// Breaks every live connection to `address`, as a network failure would.
    pub(crate) fn break_connection(&self, address: SocketAddr) {
        for connection in self.live_connections() {
            if connection.address == address {
                connection.closed.store(true, Ordering::Release);
                lock(&connection.events).take();
                if let Some(error_sender) = lock(&connection.error_sender).take() {
                    let _ = error_sender.send(ConnectionError::BrokenConnection(
                        BrokenConnectionError("connection reset by peer".to_owned()),
                    ));
                }
            }
        }
    }
}

fn table_of(query: &str) -> Option<&str> {
    let (_, rest) = query.split_once("FROM ")?;
    rest.split_whitespace().next()
}

fn replication_map(options: &[(String, String)]) -> CqlValue {
    CqlValue::Map(
        options
            .iter()
            .map(|(k, v)| (CqlValue::Text(k.clone()), CqlValue::Text(v.clone())))
            .collect(),
    )
}

impl MockState {
    fn respond(
        &mut self,
        address: SocketAddr,
        protocol_version: ProtocolVersion,
        statement: &str,
        values: &[CqlValue],
    ) -> Result<QueryResult, RequestError> {
        self.queries.push(statement.to_owned());
        let invalid = || {
            Err(RequestError::DbError(
                DbError::Invalid,
                format!("unconfigured table in {statement}"),
            ))
        };

        match table_of(statement) {
            Some("system.local") => Ok(self
                .nodes
                .iter()
                .filter(|node| node.address == address)
                .map(MockNode::local_row)
                .collect()),
            Some("system.peers") => Ok(self.peer_rows(address, false)),
            Some("system.peers_v2")
                if self.peers_v2_supported && protocol_version.supports_peers_v2() =>
            {
                Ok(self.peer_rows(address, true))
            }
            Some("system_schema.keyspaces") => {
                let filter = values.first().and_then(CqlValue::as_text);
                Ok(self
                    .keyspaces
                    .iter()
                    .filter(|(name, _)| filter.map_or(true, |f| f == name.as_str()))
                    .map(|(name, replication)| {
                        Row::new()
                            .with("keyspace_name", CqlValue::Text(name.clone()))
                            .with("durable_writes", CqlValue::Boolean(true))
                            .with("replication", replication_map(replication))
                    })
                    .collect())
            }
            _ => invalid(),
        }
    }

    fn peer_rows(&self, address: SocketAddr, v2: bool) -> QueryResult {
        self.nodes
            .iter()
            .filter(|node| node.address != address)
            .map(|node| node.peer_row(v2))
            .collect()
    }
}

#[async_trait]
impl Connector for MockCluster {
    async fn open(
        &self,
        address: SocketAddr,
        protocol_version: ProtocolVersion,
    ) -> Result<OpenedConnection, ConnectionError> {
        let delay = {
            let mut state = self.state();
            state.open_attempts.push(address);
            state.open_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        let exists = state.nodes.iter().any(|node| node.address == address);
        if !exists || state.unreachable.contains(&address) {
            return Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into());
        }
        if protocol_version > state.max_protocol_version {
            return Err(ConnectionError::ProtocolVersionUnsupported {
                requested: protocol_version,
                server_suggested: Some(state.max_protocol_version.as_u8()),
            });
        }

        let (events_sender, events) = mpsc::channel(64);
        let (error_sender, error_receiver) = oneshot::channel();
        let connection = Arc::new(MockConnection {
            address,
            protocol_version,
            state: self.state.clone(),
            closed: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            events: Mutex::new(Some(events_sender)),
            error_sender: Mutex::new(Some(error_sender)),
        });
        state.connections.push(Arc::downgrade(&connection));

        Ok(OpenedConnection {
            connection,
            events,
            error_receiver,
        })
    }
}

pub(crate) struct MockConnection {
    address: SocketAddr,
    protocol_version: ProtocolVersion,
    state: Arc<Mutex<MockState>>,
    closed: AtomicBool,
    registered: AtomicBool,
    events: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    error_sender: Mutex<Option<oneshot::Sender<ConnectionError>>>,
}

impl std::fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConnection")
            .field("address", &self.address)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl MockConnection {
    fn check_open(&self) -> Result<(), RequestError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokenConnectionError("connection closed".to_owned()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn query(
        &self,
        statement: &str,
        values: Vec<CqlValue>,
    ) -> Result<QueryResult, RequestError> {
        self.check_open()?;
        lock(&self.state).respond(self.address, self.protocol_version, statement, &values)
    }

    async fn register(&self, event_types: &[EventType]) -> Result<(), RequestError> {
        self.check_open()?;
        assert_eq!(event_types, EventType::ALL);
        self.registered.store(true, Ordering::Release);
        Ok(())
    }

    fn connect_address(&self) -> SocketAddr {
        self.address
    }

    fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        lock(&self.events).take();
        lock(&self.error_sender).take();
    }
}

fn event_body(event_type: EventType, parts: &[&str]) -> Vec<u8> {
    let mut body = Vec::new();
    write_string(&event_type.to_string(), &mut body).unwrap();
    for part in parts {
        write_string(part, &mut body).unwrap();
    }
    body
}

/// `change` is `NEW_NODE` or `REMOVED_NODE`.
pub(crate) fn topology_event(change: &str, address: SocketAddr) -> Vec<u8> {
    let mut body = event_body(EventType::TopologyChange, &[change]);
    write_inet(address, &mut body);
    body
}

/// `change` is `UP` or `DOWN`.
pub(crate) fn status_event(change: &str, address: SocketAddr) -> Vec<u8> {
    let mut body = event_body(EventType::StatusChange, &[change]);
    write_inet(address, &mut body);
    body
}

/// `change` is `CREATED`, `UPDATED` or `DROPPED`.
pub(crate) fn keyspace_event(change: &str, keyspace: &str) -> Vec<u8> {
    event_body(EventType::SchemaChange, &[change, "KEYSPACE", keyspace])
}

pub(crate) fn table_event(change: &str, keyspace: &str, table: &str) -> Vec<u8> {
    event_body(EventType::SchemaChange, &[change, "TABLE", keyspace, table])
}
