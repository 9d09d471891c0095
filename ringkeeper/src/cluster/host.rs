use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use uuid::Uuid;

use crate::cluster::metadata::Peer;
use crate::routing::Token;

/// A cluster node, as seen by the control connection.
///
/// Hosts are shared as `Arc<Host>` through registry snapshots. Topology
/// attributes never change on a published host: when a refresh observes new
/// tokens, datacenter or rack, a new `Host` replaces the old one in the next
/// snapshot. Only the up/down marker is updated in place, as a single atomic word.
#[derive(Debug)]
pub struct Host {
    /// Address used to connect to the node. Host identity is stable by address.
    pub address: SocketAddr,
    pub host_id: Option<Uuid>,
    pub datacenter: Option<String>,
    pub rack: Option<String>,
    /// Tokens owned by the node, in the order reported by the server.
    pub tokens: Vec<Token>,
    pub schema_version: Option<Uuid>,
    /// Cassandra version the node runs, e.g. `"4.1.3"`.
    pub release_version: Option<String>,
    pub dse_version: Option<String>,

    up: AtomicBool,
}

impl Host {
    /// Creates a host from its descriptor. New hosts are considered up.
    pub(crate) fn new(peer: &Peer) -> Self {
        Self::with_status(peer, true)
    }

    /// Builds a replacement for `previous` carrying over its up/down status.
    pub(crate) fn inherit_status(peer: &Peer, previous: &Host) -> Self {
        Self::with_status(peer, previous.is_up())
    }

    fn with_status(peer: &Peer, up: bool) -> Self {
        Self {
            address: peer.address,
            host_id: peer.host_id,
            datacenter: peer.datacenter.clone(),
            rack: peer.rack.clone(),
            tokens: peer.tokens.clone(),
            schema_version: peer.schema_version,
            release_version: peer.release_version.clone(),
            dse_version: peer.dse_version.clone(),
            up: AtomicBool::new(up),
        }
    }

    /// Whether a refresh reporting `peer` leaves this host's published attributes unchanged.
    pub(crate) fn matches(&self, peer: &Peer) -> bool {
        self.address == peer.address
            && self.host_id == peer.host_id
            && self.datacenter == peer.datacenter
            && self.rack == peer.rack
            && self.tokens == peer.tokens
            && self.schema_version == peer.schema_version
            && self.release_version == peer.release_version
            && self.dse_version == peer.dse_version
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    /// Marks the host up. Returns `true` if it was down before.
    pub(crate) fn set_up(&self) -> bool {
        !self.up.swap(true, Ordering::AcqRel)
    }

    /// Marks the host down. Returns `true` if it was up before.
    pub(crate) fn set_down(&self) -> bool {
        self.up.swap(false, Ordering::AcqRel)
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Host {}

impl Hash for Host {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)?;
        if let Some(dc) = &self.datacenter {
            write!(f, " (dc: {dc}")?;
            if let Some(rack) = &self.rack {
                write!(f, ", rack: {rack}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}
