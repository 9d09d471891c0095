//! Configuration of the control connection.

use std::borrow::Borrow;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ringkeeper_cql::ProtocolVersion;

use crate::cluster::ControlConnection;
use crate::network::{Connector, EndpointResolver, KnownNode};
use crate::policies::host_listener::HostListener;
use crate::policies::load_balancing::{LoadBalancingPolicy, RoundRobinPolicy};
use crate::policies::reconnection::{ExponentialReconnectionPolicy, ReconnectionPolicy};
use crate::policies::schema_listener::SchemaChangeListener;

/// Configuration options for [`ControlConnection`].
/// Can be created manually, but usually it's easier to use
/// [`ControlConnectionBuilder`].
#[derive(Clone)]
#[non_exhaustive]
pub struct ControlConnectionConfig {
    /// List of database servers known on startup.
    /// The control connection connects to these nodes to discover the rest of the cluster.
    /// Each node can be represented as a hostname or an IP address.
    pub known_nodes: Vec<KnownNode>,

    /// Highest protocol version offered. It is lowered once if the first
    /// node contacted during initialization rejects it.
    pub protocol_version: ProtocolVersion,

    /// Whether schema events are followed and the token map kept up to date.
    ///
    /// When disabled, schema events are ignored, topology events only refresh
    /// the host list, and the token map changes only on an explicit
    /// [`ControlConnection::refresh_schema`].
    pub metadata_sync_enabled: bool,

    /// How long refresh events wait for further events to be coalesced with.
    /// Every new event restarts the wait. Zero disables debouncing.
    pub refresh_schema_delay: Duration,

    /// The longest a refresh can be postponed by a stream of new events.
    pub max_refresh_schema_delay: Duration,

    /// Timeout of contact point hostname resolution. `None` means no timeout.
    pub hostname_resolution_timeout: Option<Duration>,

    /// Client-side timeout of metadata queries. `None` means no timeout.
    pub metadata_request_timeout: Option<Duration>,

    /// Delays between attempts to re-establish a broken control connection.
    pub reconnection_policy: Arc<dyn ReconnectionPolicy>,

    /// Chooses the order in which hosts are tried on reconnection,
    /// and which hosts are ignored altogether.
    pub load_balancing_policy: Arc<dyn LoadBalancingPolicy>,

    /// Overrides the DNS based resolution of [`ControlConnectionConfig::known_nodes`].
    pub endpoint_resolver: Option<Arc<dyn EndpointResolver>>,

    /// Notified about hosts being added, removed, going up or down.
    pub host_listener: Option<Arc<dyn HostListener>>,

    /// Notified about schema objects changing.
    pub schema_listener: Option<Arc<dyn SchemaChangeListener>>,
}

impl ControlConnectionConfig {
    /// Creates a config with default values.
    pub fn new() -> Self {
        Self {
            known_nodes: Vec::new(),
            protocol_version: ProtocolVersion::default(),
            metadata_sync_enabled: true,
            refresh_schema_delay: Duration::from_secs(1),
            max_refresh_schema_delay: Duration::from_secs(10),
            hostname_resolution_timeout: Some(Duration::from_secs(5)),
            metadata_request_timeout: Some(Duration::from_secs(2)),
            reconnection_policy: Arc::new(ExponentialReconnectionPolicy::default()),
            load_balancing_policy: Arc::new(RoundRobinPolicy::new()),
            endpoint_resolver: None,
            host_listener: None,
            schema_listener: None,
        }
    }

    /// Adds a known database server with a hostname.
    /// If the port is not explicitly specified, 9042 is used as default.
    pub fn add_known_node(&mut self, hostname: impl AsRef<str>) {
        self.known_nodes
            .push(KnownNode::Hostname(hostname.as_ref().to_string()));
    }

    /// Adds a known database server with an IP address.
    pub fn add_known_node_addr(&mut self, node_addr: SocketAddr) {
        self.known_nodes.push(KnownNode::Address(node_addr));
    }
}

impl Default for ControlConnectionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ControlConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlConnectionConfig")
            .field("known_nodes", &self.known_nodes)
            .field("protocol_version", &self.protocol_version)
            .field("metadata_sync_enabled", &self.metadata_sync_enabled)
            .field("refresh_schema_delay", &self.refresh_schema_delay)
            .field("max_refresh_schema_delay", &self.max_refresh_schema_delay)
            .field(
                "hostname_resolution_timeout",
                &self.hostname_resolution_timeout,
            )
            .field("metadata_request_timeout", &self.metadata_request_timeout)
            .field("reconnection_policy", &self.reconnection_policy)
            .field("load_balancing_policy", &self.load_balancing_policy)
            .finish_non_exhaustive()
    }
}

/// ControlConnectionBuilder provides an easy way to create a [`ControlConnection`].
///
/// # Example
/// ```no_run
/// # use std::sync::Arc;
/// # use ringkeeper::ControlConnectionBuilder;
/// # use ringkeeper::network::Connector;
/// # async fn example(connector: Arc<dyn Connector>) -> Result<(), Box<dyn std::error::Error>> {
/// let control_connection = ControlConnectionBuilder::new()
///     .known_node("127.0.0.1:9042")
///     .known_node("db1.example.com")
///     .build(connector);
/// control_connection.init().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct ControlConnectionBuilder {
    pub config: ControlConnectionConfig,
}

impl ControlConnectionBuilder {
    /// Creates new ControlConnectionBuilder with default configuration.
    pub fn new() -> Self {
        Self {
            config: ControlConnectionConfig::new(),
        }
    }

    /// Add a known node with a hostname.
    pub fn known_node(mut self, hostname: impl AsRef<str>) -> Self {
        self.config.add_known_node(hostname);
        self
    }

    /// Add a known node with an IP address.
    pub fn known_node_addr(mut self, node_addr: SocketAddr) -> Self {
        self.config.add_known_node_addr(node_addr);
        self
    }

    /// Add a list of known nodes with hostnames.
    pub fn known_nodes(mut self, hostnames: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        for hostname in hostnames {
            self.config.add_known_node(hostname);
        }
        self
    }

    /// Add a list of known nodes with IP addresses.
    pub fn known_nodes_addr(
        mut self,
        node_addrs: impl IntoIterator<Item = impl Borrow<SocketAddr>>,
    ) -> Self {
        for address in node_addrs {
            self.config.add_known_node_addr(*address.borrow());
        }
        self
    }

    /// Set the highest protocol version to offer. The default is v4.
    pub fn protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.config.protocol_version = version;
        self
    }

    /// Enable or disable following schema changes. Enabled by default.
    pub fn metadata_sync(mut self, enabled: bool) -> Self {
        self.config.metadata_sync_enabled = enabled;
        self
    }

    /// Set the debounce window of refresh events. The default is 1 second.
    pub fn refresh_schema_delay(mut self, delay: Duration) -> Self {
        self.config.refresh_schema_delay = delay;
        self
    }

    /// Set the upper bound on postponing a refresh. The default is 10 seconds.
    pub fn max_refresh_schema_delay(mut self, delay: Duration) -> Self {
        self.config.max_refresh_schema_delay = delay;
        self
    }

    /// Changes DNS hostname resolution timeout.
    /// The default is 5 seconds.
    /// Using `None` disables the timeout.
    pub fn hostname_resolution_timeout(mut self, duration: Option<Duration>) -> Self {
        self.config.hostname_resolution_timeout = duration;
        self
    }

    /// Changes the client-side timeout of metadata queries.
    /// The default is 2 seconds.
    pub fn metadata_request_timeout(mut self, duration: Option<Duration>) -> Self {
        self.config.metadata_request_timeout = duration;
        self
    }

    pub fn reconnection_policy(mut self, policy: Arc<dyn ReconnectionPolicy>) -> Self {
        self.config.reconnection_policy = policy;
        self
    }

    pub fn load_balancing_policy(mut self, policy: Arc<dyn LoadBalancingPolicy>) -> Self {
        self.config.load_balancing_policy = policy;
        self
    }

    pub fn endpoint_resolver(mut self, resolver: Arc<dyn EndpointResolver>) -> Self {
        self.config.endpoint_resolver = Some(resolver);
        self
    }

    pub fn host_listener(mut self, listener: Arc<dyn HostListener>) -> Self {
        self.config.host_listener = Some(listener);
        self
    }

    pub fn schema_listener(mut self, listener: Arc<dyn SchemaChangeListener>) -> Self {
        self.config.schema_listener = Some(listener);
        self
    }

    /// Creates a control connection which opens connections through `connector`.
    /// Nothing is connected until [`ControlConnection::init`] is called.
    pub fn build(self, connector: Arc<dyn Connector>) -> ControlConnection {
        ControlConnection::new(self.config, connector)
    }
}
