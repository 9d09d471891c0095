//! Host listeners can subscribe to events regarding hosts.
//!
//! This includes events when a host is added or removed from the cluster,
//! as well as when a host is marked as up or down.

use std::net::SocketAddr;

use uuid::Uuid;

use crate::cluster::Host;

/// Context provided to [HostListener] callbacks.
#[non_exhaustive]
#[derive(Debug)]
pub struct HostEventContext {
    pub(crate) host_id: Option<Uuid>,
    pub(crate) addr: SocketAddr,
}

impl HostEventContext {
    pub(crate) fn for_host(host: &Host) -> Self {
        Self {
            host_id: host.host_id,
            addr: host.address,
        }
    }

    /// ID of the host related to the event, if the node reported one.
    pub fn host_id(&self) -> Option<Uuid> {
        self.host_id
    }

    /// Address of the host related to the event.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Kind of host event being signalled by [HostListener].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    /// Signalled when the control connection discovers a new peer.
    Added,

    /// Signalled when a known peer is absent from a full node list refresh,
    /// or was announced as removed by the cluster.
    Removed,

    /// Signalled when a status event reports a known host as up.
    Up,

    /// Signalled when a status event reports a known host as down.
    Down,
}

/// Allows listening to host events: ADD, REMOVE, UP, DOWN.
///
/// UP and DOWN events are deduplicated, so if a host is already marked as UP,
/// there won't be another UP event until a DOWN event occurs, and vice versa.
/// Listeners are called synchronously from the control connection's tasks and
/// must not block.
pub trait HostListener: Send + Sync {
    /// Called when a host event occurs.
    fn on_event(&self, ctx: &HostEventContext, event: &HostEvent);
}
