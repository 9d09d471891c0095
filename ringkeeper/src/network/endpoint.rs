use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use itertools::Itertools;
use thiserror::Error;
use tokio::net::{lookup_host, ToSocketAddrs};
use tracing::{debug, warn};

use crate::cluster::Host;
use crate::errors::ControlConnectionError;

/// Port used for contact points given without one.
pub const DEFAULT_PORT: u16 = 9042;

/// A node address given in the configuration, before resolution.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[non_exhaustive]
pub enum KnownNode {
    /// A hostname, optionally followed by `:port`.
    Hostname(String),
    Address(SocketAddr),
}

/// A configured contact point, resolved to a socket address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedContactPoint {
    pub address: SocketAddr,
    /// The hostname it was resolved from, if it was given as a name.
    pub hostname: Option<String>,
}

/// Something the control connection can connect to.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// Provided by the user in the configuration.
    ContactPoint(ResolvedContactPoint),
    /// A host discovered through the system tables.
    Host(Arc<Host>),
}

impl Endpoint {
    pub fn address(&self) -> SocketAddr {
        match self {
            Endpoint::ContactPoint(contact_point) => contact_point.address,
            Endpoint::Host(host) => host.address,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::ContactPoint(ResolvedContactPoint {
                address,
                hostname: Some(hostname),
            }) => write!(f, "{address} ({hostname})"),
            Endpoint::ContactPoint(ResolvedContactPoint { address, .. }) => write!(f, "{address}"),
            Endpoint::Host(host) => write!(f, "{}", host.address),
        }
    }
}

/// Maps configured contact points to socket addresses.
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    /// Resolves all contact points. Cached results are reused unless `refresh_cache` is set.
    ///
    /// Fails only if no contact point could be resolved.
    async fn resolve_contact_points(
        &self,
        refresh_cache: bool,
    ) -> Result<Vec<ResolvedContactPoint>, ControlConnectionError>;
}

#[derive(Error, Debug)]
enum DnsLookupError {
    #[error("Failed to perform DNS lookup within {0}ms")]
    Timeout(u128),
    #[error("Empty address list returned by DNS for {0}")]
    EmptyAddressListForHost(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

async fn lookup_host_with_timeout(
    host: impl ToSocketAddrs,
    hostname_resolution_timeout: Option<Duration>,
) -> Result<impl Iterator<Item = SocketAddr>, DnsLookupError> {
    if let Some(timeout) = hostname_resolution_timeout {
        match tokio::time::timeout(timeout, lookup_host(host)).await {
            Ok(res) => res.map_err(Into::into),
            // Elapsed error from tokio library does not provide any context.
            Err(_) => Err(DnsLookupError::Timeout(timeout.as_millis())),
        }
    } else {
        lookup_host(host).await.map_err(Into::into)
    }
}

// Resolves the hostname, trying the default port if it was given without one.
// Of multiple addresses the first IPv4 one is preferred.
async fn resolve_hostname(
    hostname: &str,
    hostname_resolution_timeout: Option<Duration>,
) -> Result<SocketAddr, DnsLookupError> {
    let addrs = match lookup_host_with_timeout(hostname, hostname_resolution_timeout).await {
        Ok(addrs) => itertools::Either::Left(addrs),
        // A timeout has nothing to do with the missing port, retrying is pointless.
        Err(DnsLookupError::Timeout(t)) => return Err(DnsLookupError::Timeout(t)),
        Err(e) => {
            let addrs =
                lookup_host_with_timeout((hostname, DEFAULT_PORT), hostname_resolution_timeout)
                    .await
                    .or(Err(e))?;
            itertools::Either::Right(addrs)
        }
    };

    addrs
        .find_or_last(|addr| matches!(addr, SocketAddr::V4(_)))
        .ok_or_else(|| DnsLookupError::EmptyAddressListForHost(hostname.to_owned()))
}

/// Resolves hostnames through the system resolver and caches the outcome.
pub struct DnsEndpointResolver {
    known_nodes: Vec<KnownNode>,
    hostname_resolution_timeout: Option<Duration>,
    cache: ArcSwapOption<Vec<ResolvedContactPoint>>,
}

impl DnsEndpointResolver {
    pub fn new(known_nodes: Vec<KnownNode>, hostname_resolution_timeout: Option<Duration>) -> Self {
        Self {
            known_nodes,
            hostname_resolution_timeout,
            cache: ArcSwapOption::empty(),
        }
    }

    // Returns the resolved contact points and the hostnames that were attempted.
    async fn resolve_all(&self) -> (Vec<ResolvedContactPoint>, Vec<String>) {
        let mut resolved: Vec<ResolvedContactPoint> = Vec::with_capacity(self.known_nodes.len());
        let mut hostnames: Vec<&String> = Vec::new();

        for node in self.known_nodes.iter() {
            match node {
                KnownNode::Hostname(hostname) => hostnames.push(hostname),
                KnownNode::Address(address) => resolved.push(ResolvedContactPoint {
                    address: *address,
                    hostname: None,
                }),
            }
        }

        let timeout = self.hostname_resolution_timeout;
        let resolve_futures = hostnames.iter().map(|hostname| async move {
            match resolve_hostname(hostname, timeout).await {
                Ok(address) => Some(ResolvedContactPoint {
                    address,
                    hostname: Some((*hostname).clone()),
                }),
                Err(e) => {
                    warn!("Hostname resolution failed for {}: {}", hostname, &e);
                    None
                }
            }
        });
        let from_names: Vec<_> = futures::future::join_all(resolve_futures).await;
        resolved.extend(from_names.into_iter().flatten());

        (resolved, hostnames.into_iter().cloned().collect())
    }
}

#[async_trait]
impl EndpointResolver for DnsEndpointResolver {
    async fn resolve_contact_points(
        &self,
        refresh_cache: bool,
    ) -> Result<Vec<ResolvedContactPoint>, ControlConnectionError> {
        if self.known_nodes.is_empty() {
            return Err(ControlConnectionError::EmptyKnownNodesList);
        }
        if !refresh_cache {
            if let Some(cached) = self.cache.load_full() {
                return Ok(Vec::clone(&cached));
            }
        }

        let (resolved, hostnames) = self.resolve_all().await;
        if resolved.is_empty() {
            return Err(ControlConnectionError::FailedToResolveAnyHostname(hostnames));
        }
        debug!(contact_points = ?resolved, "Resolved contact points");
        self.cache.store(Some(Arc::new(resolved.clone())));
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::{DnsEndpointResolver, EndpointResolver, KnownNode};
    use crate::errors::ControlConnectionError;
    use crate::utils::test_utils::setup_tracing;
    use assert_matches::assert_matches;
    use std::net::SocketAddr;
    use std::time::Duration;

    #[tokio::test]
    async fn addresses_and_literal_hostnames_resolve() {
        setup_tracing();
        let addr: SocketAddr = "10.1.2.3:9043".parse().unwrap();
        let resolver = DnsEndpointResolver::new(
            vec![
                KnownNode::Address(addr),
                KnownNode::Hostname("127.0.0.1".to_owned()),
            ],
            Some(Duration::from_secs(5)),
        );

        let resolved = resolver.resolve_contact_points(false).await.unwrap();
        let addresses: Vec<SocketAddr> = resolved.iter().map(|cp| cp.address).collect();
        assert_eq!(
            addresses,
            vec![addr, "127.0.0.1:9042".parse::<SocketAddr>().unwrap()]
        );
        assert_eq!(resolved[1].hostname.as_deref(), Some("127.0.0.1"));

        // Served from the cache now.
        assert_eq!(resolver.resolve_contact_points(false).await.unwrap(), resolved);
    }

    #[tokio::test]
    async fn empty_known_nodes_are_rejected() {
        setup_tracing();
        let resolver = DnsEndpointResolver::new(Vec::new(), None);
        assert_matches!(
            resolver.resolve_contact_points(true).await,
            Err(ControlConnectionError::EmptyKnownNodesList)
        );
    }
}
