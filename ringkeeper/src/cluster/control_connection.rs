//! The control connection: one connection to one node, dedicated to metadata
//! queries and to server-pushed events.
//!
//! It keeps [`ClusterState`] up to date. On startup it reads the node list and
//! the keyspace replication options and builds the token map, afterwards it
//! follows topology, status and schema events and refreshes what they name.
//! When the connection breaks, or the node it is attached to goes down, it
//! reconnects to another node chosen by the load balancing policy, pacing
//! failed attempts with the reconnection policy.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use futures::future::{BoxFuture, RemoteHandle, Shared};
use futures::FutureExt;
use ringkeeper_cql::frame::response::event::{
    Event, SchemaChangeEvent, StatusChangeEvent, TopologyChangeEvent,
};
use ringkeeper_cql::frame::server_event_type::EventType;
use ringkeeper_cql::value::{CqlValue, QueryResult};
use ringkeeper_cql::ProtocolVersion;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::debouncer::{EventDebouncer, RefreshEvent, RefreshScope};
use super::host::Host;
use super::metadata::{query_keyspace, query_keyspaces};
use super::state::{notify, ClusterState};
use super::topology::TopologyRefresher;
use crate::config::ControlConnectionConfig;
use crate::errors::{
    ConnectionError, ControlConnectionError, HostNotFoundError, MetadataError,
    NoHostAvailableError, RequestError, TokenMapError,
};
use crate::network::{
    query_with_timeout, Connection, Connector, DnsEndpointResolver, Endpoint, EndpointResolver,
    OpenedConnection,
};
use crate::policies::host_listener::HostEvent;
use crate::policies::load_balancing::HostDistance;
use crate::policies::reconnection::ReconnectionSchedule;
use crate::policies::schema_listener::{is_drop, is_keyspace_scoped};
use crate::routing::locator::{KeyspaceReplicas, TokenMap};

/// Lifecycle of a [`ControlConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlConnectionState {
    /// Not connected, either never initialized or initialization failed.
    Disconnected,
    /// Initialization is in progress.
    Connecting,
    Connected,
    /// The connection is being replaced, or the next attempt is scheduled.
    Reconnecting,
    /// Terminal. No further attempts are made.
    Shutdown,
}

type InFlight<E> = Mutex<Option<Shared<BoxFuture<'static, Result<(), E>>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// The connection currently in use, along with the tasks serving it.
/// Dropping it stops those tasks.
struct ActiveConnection {
    connection: Arc<dyn Connection>,
    endpoint: Endpoint,
    host: Arc<Host>,
    generation: u64,
    _event_handler: RemoteHandle<()>,
    _error_watcher: RemoteHandle<()>,
}

/// Why connecting to one endpoint failed.
enum AttemptError {
    /// Try the next endpoint.
    Endpoint(ConnectionError),
    /// Stop trying altogether.
    Abort(ControlConnectionError),
}

/// Keeps a single metadata connection to the cluster and the [`ClusterState`] it feeds.
///
/// Cloning gives another handle to the same control connection.
#[derive(Clone)]
pub struct ControlConnection {
    inner: Arc<Inner>,
}

struct Inner {
    config: ControlConnectionConfig,
    connector: Arc<dyn Connector>,
    resolver: Arc<dyn EndpointResolver>,
    metadata: Arc<ClusterState>,
    topology: TopologyRefresher,
    debouncer: EventDebouncer,

    state: Mutex<ControlConnectionState>,
    current: ArcSwapOption<ActiveConnection>,
    generation: AtomicU64,
    protocol_version: AtomicU8,
    protocol_downgraded: AtomicBool,
    initialized: AtomicBool,
    shutdown: AtomicBool,
    init_lock: tokio::sync::Mutex<()>,

    reconnect_in_flight: InFlight<ControlConnectionError>,
    refresh_in_flight: InFlight<MetadataError>,
    reconnection_schedule: Mutex<Option<Box<dyn ReconnectionSchedule>>>,
    reconnect_timer: Mutex<Option<JoinHandle<()>>>,
}

fn reconnect_slot(inner: &Inner) -> &InFlight<ControlConnectionError> {
    &inner.reconnect_in_flight
}

fn refresh_slot(inner: &Inner) -> &InFlight<MetadataError> {
    &inner.refresh_in_flight
}

impl ControlConnection {
    /// Creates a control connection. Nothing is connected until [`ControlConnection::init`].
    ///
    /// Must be called within a tokio runtime, the event dispatch loop is spawned here.
    pub fn new(config: ControlConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        let resolver: Arc<dyn EndpointResolver> = match &config.endpoint_resolver {
            Some(resolver) => resolver.clone(),
            None => Arc::new(DnsEndpointResolver::new(
                config.known_nodes.clone(),
                config.hostname_resolution_timeout,
            )),
        };
        let metadata = Arc::new(ClusterState::new());
        let topology = TopologyRefresher::new(
            metadata.clone(),
            config.host_listener.clone(),
            config.metadata_request_timeout,
        );
        let debouncer =
            EventDebouncer::new(config.refresh_schema_delay, config.max_refresh_schema_delay);
        let protocol_version = AtomicU8::new(config.protocol_version.as_u8());

        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                resolver,
                metadata,
                topology,
                debouncer,
                state: Mutex::new(ControlConnectionState::Disconnected),
                current: ArcSwapOption::empty(),
                generation: AtomicU64::new(0),
                protocol_version,
                protocol_downgraded: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                init_lock: tokio::sync::Mutex::new(()),
                reconnect_in_flight: Mutex::new(None),
                refresh_in_flight: Mutex::new(None),
                reconnection_schedule: Mutex::new(None),
                reconnect_timer: Mutex::new(None),
            }),
        }
    }

    /// Connects for the first time, reads the node list and builds the token map.
    ///
    /// Contact points are tried in order, followed by hosts already known.
    /// Fails with [`ControlConnectionError::NoHostAvailable`] listing every
    /// endpoint's failure if none of them works. Once initialized, further
    /// calls return immediately.
    pub async fn init(&self) -> Result<(), ControlConnectionError> {
        let inner = &self.inner;
        let _guard = inner.init_lock.lock().await;
        if inner.is_shutdown() {
            return Err(ControlConnectionError::Shutdown);
        }
        if inner.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        inner.set_state(ControlConnectionState::Connecting);
        match inner.connect(true).await {
            Ok(()) => {
                inner.initialized.store(true, Ordering::Release);
                inner.set_state(ControlConnectionState::Connected);
                Ok(())
            }
            Err(error) => {
                error!(%error, "Could not initialize the control connection");
                inner.set_state(ControlConnectionState::Disconnected);
                Err(error)
            }
        }
    }

    /// Replaces the current connection with a new one.
    ///
    /// Concurrent calls share one attempt and its outcome. On failure the
    /// next attempt is scheduled according to the reconnection policy.
    pub async fn reconnect(&self) -> Result<(), ControlConnectionError> {
        self.inner.start_reconnect().await
    }

    /// Re-reads the node list and, if metadata sync is enabled and the ring
    /// changed, rebuilds the token map.
    ///
    /// Concurrent calls share one refresh. A transport failure starts a
    /// reconnection instead of being returned.
    pub async fn refresh(&self) -> Result<(), ControlConnectionError> {
        self.inner.start_refresh().await.map_err(Into::into)
    }

    /// Closes the connection and cancels scheduled work. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn state(&self) -> ControlConnectionState {
        *lock(&self.inner.state)
    }

    /// Protocol version in use, possibly lowered during initialization.
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.inner.protocol_version()
    }

    /// The host the control connection is attached to.
    pub fn current_host(&self) -> Option<Arc<Host>> {
        let active = self.inner.current.load_full()?;
        Some(
            self.inner
                .metadata
                .get_host(active.host.address)
                .unwrap_or_else(|| active.host.clone()),
        )
    }

    /// The endpoint the current connection was opened to.
    pub fn current_endpoint(&self) -> Option<Endpoint> {
        self.inner
            .current
            .load()
            .as_ref()
            .map(|active| active.endpoint.clone())
    }

    /// Host registry, keyspaces and token map maintained by this control connection.
    pub fn metadata(&self) -> &Arc<ClusterState> {
        &self.inner.metadata
    }

    pub fn token_map(&self) -> Option<Arc<TokenMap>> {
        self.inner.metadata.token_map()
    }

    pub fn get_by_keyspace(&self, keyspace: &str) -> Result<Arc<KeyspaceReplicas>, TokenMapError> {
        self.inner.metadata.get_by_keyspace(keyspace)
    }

    pub fn get_replicas(
        &self,
        keyspace: &str,
        partition_key: &[u8],
    ) -> Result<Vec<Arc<Host>>, TokenMapError> {
        self.inner.metadata.get_replicas(keyspace, partition_key)
    }

    /// Sends a query over the control connection.
    ///
    /// A transport failure starts a reconnection in the background and is returned.
    pub async fn send_query_request(
        &self,
        statement: &str,
        values: Vec<CqlValue>,
    ) -> Result<QueryResult, RequestError> {
        let active = self.inner.active()?;
        self.inner.send_on(&active, statement, values).await
    }

    /// Runs a metadata query. With `retry_on_failure`, a transport failure is
    /// followed by a reconnection and one more attempt on the new connection.
    pub async fn query(
        &self,
        statement: &str,
        retry_on_failure: bool,
    ) -> Result<QueryResult, ControlConnectionError> {
        let active = self.inner.active()?;
        let error = match self.inner.send_on(&active, statement, Vec::new()).await {
            Ok(result) => return Ok(result),
            Err(error) if retry_on_failure && error.is_transport_error() => error,
            Err(error) => return Err(error.into()),
        };

        debug!(%error, "Metadata query failed, retrying after reconnection");
        if self.inner.is_current_generation(active.generation) {
            self.inner.start_reconnect().await?;
        }
        let active = self.inner.active()?;
        Ok(self.inner.send_on(&active, statement, Vec::new()).await?)
    }

    /// Refreshes the replication options of `keyspace` and its token map entry.
    ///
    /// Without `process_now` the refresh waits for the debounce window and
    /// may be merged with other refreshes of the keyspace.
    pub async fn schedule_keyspace_refresh(
        &self,
        keyspace: &str,
        process_now: bool,
    ) -> Result<(), MetadataError> {
        let event = self.inner.keyspace_refresh_event(keyspace.to_owned());
        self.inner.debouncer.schedule_event(event, process_now).await
    }

    /// Re-reads all keyspaces and rebuilds the token map.
    pub async fn schedule_all_keyspaces_refresh(&self, process_now: bool) -> Result<(), MetadataError> {
        let event = self.inner.all_keyspaces_refresh_event();
        self.inner.debouncer.schedule_event(event, process_now).await
    }

    /// Applies a schema change reported by the server.
    ///
    /// Keyspace changes refresh the keyspace, changes of tables, types,
    /// functions and aggregates are passed to the schema listener.
    pub async fn handle_schema_change_event(
        &self,
        event: SchemaChangeEvent,
        process_now: bool,
    ) -> Result<(), MetadataError> {
        let event = self.inner.schema_change_refresh_event(event);
        self.inner.debouncer.schedule_event(event, process_now).await
    }

    /// Refreshes one keyspace, or all of them, right away.
    ///
    /// Works with metadata sync disabled, which makes it the only way to
    /// update the token map then.
    pub async fn refresh_schema(&self, keyspace: Option<&str>) -> Result<(), MetadataError> {
        let event = match keyspace {
            Some(keyspace) => self.inner.keyspace_refresh_event(keyspace.to_owned()),
            None => self.inner.all_keyspaces_refresh_event(),
        };
        self.inner.debouncer.handle_event(event).await
    }
}

impl fmt::Debug for ControlConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlConnection")
            .field("state", &self.state())
            .field("endpoint", &self.current_endpoint())
            .field("protocol_version", &self.protocol_version())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn set_state(&self, new: ControlConnectionState) {
        let mut state = lock(&self.state);
        if *state != ControlConnectionState::Shutdown && *state != new {
            trace!(from = ?*state, to = ?new, "Control connection state changed");
            *state = new;
        }
    }

    fn protocol_version(&self) -> ProtocolVersion {
        ProtocolVersion::from_u8(self.protocol_version.load(Ordering::Acquire))
            .unwrap_or(self.config.protocol_version)
    }

    fn active(&self) -> Result<Arc<ActiveConnection>, RequestError> {
        if self.is_shutdown() {
            return Err(RequestError::Shutdown);
        }
        self.current.load_full().ok_or(RequestError::NotConnected)
    }

    fn active_for_refresh(&self) -> Result<Arc<ActiveConnection>, MetadataError> {
        self.active().map_err(|error| match error {
            RequestError::Shutdown => MetadataError::Shutdown,
            other => MetadataError::Request(other),
        })
    }

    fn is_current_generation(&self, generation: u64) -> bool {
        self.current
            .load()
            .as_ref()
            .is_some_and(|active| active.generation == generation)
    }

    fn is_current_host(&self, host: &Host) -> bool {
        self.current
            .load()
            .as_ref()
            .is_some_and(|active| active.host.address == host.address)
    }

    async fn send_on(
        self: &Arc<Self>,
        active: &ActiveConnection,
        statement: &str,
        values: Vec<CqlValue>,
    ) -> Result<QueryResult, RequestError> {
        let result = query_with_timeout(
            active.connection.as_ref(),
            statement,
            values,
            self.config.metadata_request_timeout,
        )
        .await;
        if let Err(error) = &result {
            if error.is_transport_error() && self.is_current_generation(active.generation) {
                warn!(%error, endpoint = %active.endpoint, "Control connection query failed, reconnecting");
                self.reconnect_in_background();
            }
        }
        result
    }

    /// Joins the operation in flight in `slot`, or starts `work` there.
    ///
    /// The work runs in its own task and clears the slot before resolving,
    /// so nobody can join an operation that has already finished.
    fn join_or_start<E, Fut>(
        self: &Arc<Self>,
        slot: fn(&Inner) -> &InFlight<E>,
        cancelled: E,
        work: impl FnOnce(Arc<Inner>) -> Fut,
    ) -> Shared<BoxFuture<'static, Result<(), E>>>
    where
        E: Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let mut in_flight = lock(slot(self));
        if let Some(operation) = in_flight.as_ref() {
            return operation.clone();
        }

        let work = work(self.clone());
        let inner = self.clone();
        let task = tokio::spawn(async move {
            let result = work.await;
            *lock(slot(&inner)) = None;
            result
        });
        let operation = task
            .map(move |joined| joined.unwrap_or(Err(cancelled)))
            .boxed()
            .shared();
        *in_flight = Some(operation.clone());
        operation
    }

    fn start_reconnect(self: &Arc<Self>) -> Shared<BoxFuture<'static, Result<(), ControlConnectionError>>> {
        self.join_or_start(
            reconnect_slot,
            ControlConnectionError::Shutdown,
            |inner| async move { inner.reconnect_now().await },
        )
    }

    fn start_refresh(self: &Arc<Self>) -> Shared<BoxFuture<'static, Result<(), MetadataError>>> {
        self.join_or_start(refresh_slot, MetadataError::Shutdown, |inner| async move {
            inner.refresh_now().await
        })
    }

    fn reconnect_in_background(self: &Arc<Self>) {
        if !self.is_shutdown() {
            // The attempt runs in its own task, nobody needs to wait for it here.
            drop(self.start_reconnect());
        }
    }

    async fn reconnect_now(self: &Arc<Self>) -> Result<(), ControlConnectionError> {
        if self.is_shutdown() {
            return Err(ControlConnectionError::Shutdown);
        }
        self.set_state(ControlConnectionState::Reconnecting);

        match self.connect(false).await {
            Ok(()) => {
                lock(&self.reconnection_schedule).take();
                if let Some(timer) = lock(&self.reconnect_timer).take() {
                    timer.abort();
                }
                self.set_state(ControlConnectionState::Connected);
                Ok(())
            }
            Err(error) if self.is_shutdown() => {
                trace!(%error, "Reconnection abandoned because of shutdown");
                Err(ControlConnectionError::Shutdown)
            }
            Err(error) => {
                let delay = lock(&self.reconnection_schedule)
                    .get_or_insert_with(|| self.config.reconnection_policy.new_schedule())
                    .next_delay();
                warn!(%error, ?delay, "Control connection reconnection failed, will retry");
                self.schedule_reconnect(delay);
                Err(error)
            }
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, delay: Duration) {
        let inner = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                inner.reconnect_in_background();
            }
        });
        if let Some(previous) = lock(&self.reconnect_timer).replace(timer) {
            previous.abort();
        }
    }

    async fn refresh_now(self: &Arc<Self>) -> Result<(), MetadataError> {
        let result = match self.active_for_refresh() {
            Ok(active) => self.refresh_topology(&active).await,
            Err(error) => Err(error),
        };
        match result {
            Err(error) if error.is_transport_error() => {
                debug!(%error, "Topology refresh failed, reconnecting");
                self.reconnect_in_background();
                Ok(())
            }
            other => other,
        }
    }

    async fn refresh_topology(&self, active: &ActiveConnection) -> Result<(), MetadataError> {
        let refresh = self
            .topology
            .refresh_node_list(active.connection.as_ref())
            .await?;
        if self.config.metadata_sync_enabled && refresh.changes.affects_ring() {
            self.metadata.rebuild_token_map();
        }
        Ok(())
    }

    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        *lock(&self.state) = ControlConnectionState::Shutdown;
        if let Some(timer) = lock(&self.reconnect_timer).take() {
            timer.abort();
        }
        self.debouncer.shutdown();
        if let Some(active) = self.current.swap(None) {
            active.connection.close();
        }
        info!("Control connection shut down");
    }

    async fn connect(self: &Arc<Self>, initializing: bool) -> Result<(), ControlConnectionError> {
        let mut tried: HashSet<SocketAddr> = HashSet::new();
        let mut errors: Vec<(SocketAddr, ConnectionError)> = Vec::new();

        let candidates = if initializing {
            self.initial_candidates().await?
        } else {
            self.reconnection_candidates()
        };
        if self
            .try_candidates(candidates, initializing, &mut tried, &mut errors)
            .await?
        {
            return Ok(());
        }

        if !initializing {
            // The cluster may have moved to addresses we don't know, start over from the contact points.
            match self.resolver.resolve_contact_points(true).await {
                Ok(contact_points) => {
                    let candidates = contact_points
                        .into_iter()
                        .map(Endpoint::ContactPoint)
                        .collect();
                    if self
                        .try_candidates(candidates, initializing, &mut tried, &mut errors)
                        .await?
                    {
                        return Ok(());
                    }
                }
                Err(error) => warn!(%error, "Could not resolve contact points again"),
            }
        }

        if self.is_shutdown() {
            return Err(ControlConnectionError::Shutdown);
        }
        Err(NoHostAvailableError::new(errors).into())
    }

    async fn initial_candidates(&self) -> Result<Vec<Endpoint>, ControlConnectionError> {
        let contact_points = self.resolver.resolve_contact_points(false).await?;
        let addresses: HashSet<SocketAddr> =
            contact_points.iter().map(|cp| cp.address).collect();

        let known_hosts = self.metadata.hosts();
        let known = known_hosts
            .values()
            .filter(|host| !addresses.contains(&host.address))
            .cloned()
            .map(Endpoint::Host);

        Ok(contact_points
            .into_iter()
            .map(Endpoint::ContactPoint)
            .chain(known)
            .collect())
    }

    fn reconnection_candidates(&self) -> Vec<Endpoint> {
        let policy = &self.config.load_balancing_policy;
        let hosts: Vec<Arc<Host>> = self.metadata.hosts().values().cloned().collect();
        policy
            .new_query_plan(&hosts)
            .into_iter()
            .filter(|host| host.is_up() && policy.distance(host) != HostDistance::Ignored)
            .map(Endpoint::Host)
            .collect()
    }

    /// Returns whether one of the candidates got connected.
    async fn try_candidates(
        self: &Arc<Self>,
        candidates: Vec<Endpoint>,
        initializing: bool,
        tried: &mut HashSet<SocketAddr>,
        errors: &mut Vec<(SocketAddr, ConnectionError)>,
    ) -> Result<bool, ControlConnectionError> {
        for endpoint in candidates {
            if !tried.insert(endpoint.address()) {
                continue;
            }
            if self.is_shutdown() {
                return Err(ControlConnectionError::Shutdown);
            }
            match self.try_endpoint(&endpoint, initializing).await {
                Ok(()) => return Ok(true),
                Err(AttemptError::Abort(error)) => return Err(error),
                Err(AttemptError::Endpoint(error)) => {
                    warn!(endpoint = %endpoint, %error, "Failed to open the control connection");
                    errors.push((endpoint.address(), error));
                }
            }
        }
        Ok(false)
    }

    async fn open(
        &self,
        address: SocketAddr,
        initializing: bool,
    ) -> Result<OpenedConnection, AttemptError> {
        let mut version = self.protocol_version();
        loop {
            match self.connector.open(address, version).await {
                Ok(opened) => return Ok(opened),
                Err(ConnectionError::ProtocolVersionUnsupported {
                    requested,
                    server_suggested,
                }) if !initializing => {
                    return Err(AttemptError::Abort(
                        ControlConnectionError::ProtocolVersionMismatch {
                            endpoint: address,
                            negotiated: requested,
                            server_suggested,
                        },
                    ));
                }
                Err(ConnectionError::ProtocolVersionUnsupported {
                    requested,
                    server_suggested,
                }) if !self.protocol_downgraded.swap(true, Ordering::AcqRel) => {
                    let Some(lower) = requested.negotiate_after_rejection(server_suggested) else {
                        return Err(AttemptError::Endpoint(
                            ConnectionError::ProtocolVersionUnsupported {
                                requested,
                                server_suggested,
                            },
                        ));
                    };
                    info!(
                        host = %address,
                        rejected = %requested,
                        retrying_with = %lower,
                        "Protocol version rejected, downgrading"
                    );
                    self.protocol_version.store(lower.as_u8(), Ordering::Release);
                    version = lower;
                }
                Err(error) => return Err(AttemptError::Endpoint(error)),
            }
        }
    }

    async fn try_endpoint(
        self: &Arc<Self>,
        endpoint: &Endpoint,
        initializing: bool,
    ) -> Result<(), AttemptError> {
        let address = endpoint.address();
        trace!(endpoint = %endpoint, initializing, "Opening control connection");
        let OpenedConnection {
            connection,
            events,
            error_receiver,
        } = self.open(address, initializing).await?;

        let host = match self.prepare(connection.as_ref()).await {
            Ok(host) => host,
            Err(error) => {
                connection.close();
                return Err(AttemptError::Endpoint(error));
            }
        };

        if self.is_shutdown() {
            debug!(endpoint = %endpoint, "Discarding connection established during shutdown");
            connection.close();
            return Err(AttemptError::Abort(ControlConnectionError::Shutdown));
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (event_handler, event_handler_handle) =
            Self::handle_events(Arc::downgrade(self), events).remote_handle();
        tokio::spawn(event_handler);
        let (error_watcher, error_watcher_handle) =
            Self::watch_errors(Arc::downgrade(self), error_receiver, generation).remote_handle();
        tokio::spawn(error_watcher);

        let previous = self.current.swap(Some(Arc::new(ActiveConnection {
            connection,
            endpoint: endpoint.clone(),
            host,
            generation,
            _event_handler: event_handler_handle,
            _error_watcher: error_watcher_handle,
        })));
        if let Some(previous) = previous {
            previous.connection.close();
        }
        if self.is_shutdown() {
            // Shutdown ran between the check above and the swap.
            if let Some(active) = self.current.swap(None) {
                active.connection.close();
            }
            return Err(AttemptError::Abort(ControlConnectionError::Shutdown));
        }

        info!(endpoint = %endpoint, protocol_version = %self.protocol_version(), "Control connection established");
        if self.initialized.load(Ordering::Acquire) && self.config.metadata_sync_enabled {
            // Events may have been missed while disconnected.
            drop(
                self.debouncer
                    .schedule_event(self.all_keyspaces_refresh_event(), false),
            );
        }
        Ok(())
    }

    /// Reads the topology through a freshly opened connection and subscribes
    /// to events. Builds the token map the first time.
    async fn prepare(&self, connection: &dyn Connection) -> Result<Arc<Host>, ConnectionError> {
        let refresh = self.topology.refresh_node_list(connection).await?;
        connection
            .register(&EventType::ALL)
            .await
            .map_err(ConnectionError::RegisterFailed)?;

        if !self.initialized.load(Ordering::Acquire) {
            let keyspaces =
                query_keyspaces(connection, self.config.metadata_request_timeout).await?;
            self.metadata.set_keyspaces(keyspaces);
            self.metadata.rebuild_token_map();
        } else if self.config.metadata_sync_enabled && refresh.changes.affects_ring() {
            self.metadata.rebuild_token_map();
        }
        Ok(refresh.current_host)
    }

    async fn watch_errors(
        weak: Weak<Inner>,
        error_receiver: oneshot::Receiver<ConnectionError>,
        generation: u64,
    ) {
        // A closed channel means the connection was closed on purpose.
        let Ok(error) = error_receiver.await else {
            return;
        };
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if inner.is_shutdown() || !inner.is_current_generation(generation) {
            return;
        }
        warn!(%error, "Control connection broke, reconnecting");
        inner.reconnect_in_background();
    }

    async fn handle_events(weak: Weak<Inner>, mut events: mpsc::Receiver<Vec<u8>>) {
        while let Some(body) = events.recv().await {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match Event::deserialize(&mut &body[..]) {
                Ok(event) => inner.handle_event(event),
                Err(error) => error!(error = %MetadataError::from(error), "Dropping server event"),
            }
        }
    }

    fn handle_event(self: &Arc<Self>, event: Event) {
        debug!(?event, "Received server event");
        match event {
            Event::TopologyChange(TopologyChangeEvent::NewNode(_))
            | Event::TopologyChange(TopologyChangeEvent::RemovedNode(_)) => {
                drop(
                    self.debouncer
                        .schedule_event(self.topology_refresh_event(), false),
                );
            }
            Event::StatusChange(StatusChangeEvent::Up(address)) => {
                self.handle_status_change(address, true)
            }
            Event::StatusChange(StatusChangeEvent::Down(address)) => {
                self.handle_status_change(address, false)
            }
            Event::SchemaChange(change) if self.config.metadata_sync_enabled => {
                let event = self.schema_change_refresh_event(change);
                drop(self.debouncer.schedule_event(event, false));
            }
            Event::SchemaChange(change) => {
                trace!(?change, "Metadata sync disabled, ignoring schema change");
            }
        }
    }

    fn handle_status_change(self: &Arc<Self>, address: SocketAddr, up: bool) {
        let Some(host) = self.metadata.find_host(address) else {
            warn!(error = %HostNotFoundError(address.ip()), "Ignoring status change");
            return;
        };
        if self.config.load_balancing_policy.distance(&host) == HostDistance::Ignored {
            trace!(host = %host, up, "Ignoring status change of an ignored host");
            return;
        }

        let changed = if up { host.set_up() } else { host.set_down() };
        if changed {
            info!(host = %host, up, "Host status changed");
            let event = if up { HostEvent::Up } else { HostEvent::Down };
            notify(self.config.host_listener.as_deref(), &host, event);
        }
        if !up && self.is_current_host(&host) {
            warn!(host = %host, "Control connection host went down, reconnecting");
            self.reconnect_in_background();
        }
    }

    fn refresh_event<F, Fut>(self: &Arc<Self>, scope: RefreshScope, work: F) -> RefreshEvent
    where
        F: FnOnce(Arc<Inner>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), MetadataError>> + Send + 'static,
    {
        let inner = Arc::downgrade(self);
        RefreshEvent::new(scope, move || async move {
            let inner = inner.upgrade().ok_or(MetadataError::Shutdown)?;
            work(inner).await
        })
    }

    fn topology_refresh_event(self: &Arc<Self>) -> RefreshEvent {
        self.refresh_event(RefreshScope::Topology, |inner| async move {
            inner.start_refresh().await
        })
    }

    fn keyspace_refresh_event(self: &Arc<Self>, keyspace: String) -> RefreshEvent {
        let scope = RefreshScope::Keyspace(keyspace.clone());
        self.refresh_event(scope, move |inner| async move {
            inner.refresh_keyspace(&keyspace).await
        })
    }

    fn all_keyspaces_refresh_event(self: &Arc<Self>) -> RefreshEvent {
        self.refresh_event(RefreshScope::AllKeyspaces, |inner| async move {
            inner.refresh_all_keyspaces().await
        })
    }

    fn schema_change_refresh_event(self: &Arc<Self>, change: SchemaChangeEvent) -> RefreshEvent {
        let keyspace = change.keyspace_name().to_owned();
        if is_keyspace_scoped(&change) && is_drop(&change) {
            return self.refresh_event(RefreshScope::Keyspace(keyspace.clone()), move |inner| {
                async move {
                    inner.drop_keyspace(&keyspace);
                    Ok(())
                }
            });
        }
        if is_keyspace_scoped(&change) {
            return self.keyspace_refresh_event(keyspace);
        }

        let scope = RefreshScope::Object {
            key: object_key(&change),
            keyspace,
        };
        self.refresh_event(scope, move |inner| async move {
            if let Some(listener) = &inner.config.schema_listener {
                listener.on_object_changed(&change);
            }
            Ok(())
        })
    }

    /// Turns a transport failure of a refresh into a reconnection.
    fn on_refresh_failure(self: &Arc<Self>, error: MetadataError) -> MetadataError {
        if error.is_transport_error() {
            self.reconnect_in_background();
        }
        error
    }

    async fn refresh_keyspace(self: &Arc<Self>, keyspace: &str) -> Result<(), MetadataError> {
        let active = self.active_for_refresh()?;
        let descriptor = query_keyspace(
            active.connection.as_ref(),
            keyspace,
            self.config.metadata_request_timeout,
        )
        .await
        .map_err(|error| self.on_refresh_failure(error))?;

        match descriptor {
            Some(descriptor) => {
                debug!(keyspace, strategy = ?descriptor.strategy, "Keyspace refreshed");
                self.metadata.set_keyspace(descriptor);
                self.metadata.refresh_token_map_keyspace(keyspace);
            }
            None => self.drop_keyspace(keyspace),
        }
        Ok(())
    }

    async fn refresh_all_keyspaces(self: &Arc<Self>) -> Result<(), MetadataError> {
        let active = self.active_for_refresh()?;
        let keyspaces = query_keyspaces(
            active.connection.as_ref(),
            self.config.metadata_request_timeout,
        )
        .await
        .map_err(|error| self.on_refresh_failure(error))?;

        let dropped = self.metadata.set_keyspaces(keyspaces);
        self.metadata.rebuild_token_map();
        debug!(dropped = dropped.len(), "All keyspaces refreshed");
        if let Some(listener) = &self.config.schema_listener {
            for keyspace in dropped.iter() {
                listener.on_keyspace_dropped(keyspace);
            }
        }
        Ok(())
    }

    fn drop_keyspace(&self, keyspace: &str) {
        if !self.metadata.remove_keyspace(keyspace) {
            trace!(keyspace, "Dropped keyspace was not known");
            return;
        }
        self.metadata.refresh_token_map_keyspace(keyspace);
        debug!(keyspace, "Keyspace dropped");
        if let Some(listener) = &self.config.schema_listener {
            listener.on_keyspace_dropped(keyspace);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.reconnect_timer).take() {
            timer.abort();
        }
        if let Some(active) = self.current.swap(None) {
            active.connection.close();
        }
    }
}

/// Identifies a schema object within its keyspace. Functions and aggregates
/// are overloaded, so their argument types are part of the key.
fn object_key(change: &SchemaChangeEvent) -> String {
    match change {
        SchemaChangeEvent::KeyspaceChange { .. } => String::new(),
        SchemaChangeEvent::TableChange { object_name, .. } => format!("table {object_name}"),
        SchemaChangeEvent::TypeChange { type_name, .. } => format!("type {type_name}"),
        SchemaChangeEvent::FunctionChange {
            function_name,
            arguments,
            ..
        } => format!("function {function_name}({})", arguments.join(",")),
        SchemaChangeEvent::AggregateChange {
            aggregate_name,
            arguments,
            ..
        } => format!("aggregate {aggregate_name}({})", arguments.join(",")),
    }
}
