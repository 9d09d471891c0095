use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::{ArcSwap, ArcSwapOption};
use tracing::{debug, trace};

use super::host::Host;
use super::metadata::{KeyspaceMetadata, Peer};
use crate::errors::TokenMapError;
use crate::policies::host_listener::{HostEvent, HostEventContext, HostListener};
use crate::routing::locator::{KeyspaceReplicas, TokenMap};
use crate::routing::partitioner::PartitionerName;
use crate::utils::snapshot::CowMap;

/// Cluster-wide facts reported by the node the control connection is attached to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalInfo {
    pub cluster_name: Option<String>,
    pub partitioner: PartitionerName,
}

/// What a node list refresh changed in the registry.
#[derive(Debug, Default)]
pub(crate) struct NodeListChanges {
    pub(crate) added: Vec<Arc<Host>>,
    pub(crate) removed: Vec<Arc<Host>>,
    /// Hosts replaced because their tokens, datacenter or rack changed.
    pub(crate) updated: Vec<Arc<Host>>,
}

impl NodeListChanges {
    /// Whether the ring or replica placement may differ after the refresh.
    pub(crate) fn affects_ring(&self) -> bool {
        !(self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty())
    }
}

/// The picture of the cluster maintained by the control connection.
///
/// Every part is an immutable snapshot replaced atomically: the host registry,
/// the keyspace replication descriptors and the token map. Readers never block
/// and never observe a partially applied change.
#[derive(Debug)]
pub struct ClusterState {
    hosts: CowMap<SocketAddr, Arc<Host>>,
    keyspaces: CowMap<String, Arc<KeyspaceMetadata>>,
    token_map: ArcSwapOption<TokenMap>,
    // Serializes the read-compute-swap sections publishing a new token map.
    token_map_lock: Mutex<()>,
    local_info: ArcSwap<LocalInfo>,
}

impl ClusterState {
    pub(crate) fn new() -> Self {
        Self {
            hosts: CowMap::new(),
            keyspaces: CowMap::new(),
            token_map: ArcSwapOption::empty(),
            token_map_lock: Mutex::new(()),
            local_info: ArcSwap::from_pointee(LocalInfo::default()),
        }
    }

    /// Snapshot of the host registry, keyed by address.
    pub fn hosts(&self) -> Arc<BTreeMap<SocketAddr, Arc<Host>>> {
        self.hosts.snapshot()
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn get_host(&self, address: SocketAddr) -> Option<Arc<Host>> {
        self.hosts.get(&address)
    }

    /// Finds a host by the address a server event names.
    ///
    /// Events carry the node's RPC address, whose port may differ from the one
    /// connections use, so an exact match is preferred and the IP alone is used otherwise.
    pub fn find_host(&self, address: SocketAddr) -> Option<Arc<Host>> {
        let hosts = self.hosts.snapshot();
        if let Some(host) = hosts.get(&address) {
            return Some(host.clone());
        }
        find_by_ip(&hosts, address.ip())
    }

    /// Snapshot of keyspace replication descriptors, keyed by name.
    pub fn keyspaces(&self) -> Arc<BTreeMap<String, Arc<KeyspaceMetadata>>> {
        self.keyspaces.snapshot()
    }

    pub fn get_keyspace(&self, keyspace: &str) -> Option<Arc<KeyspaceMetadata>> {
        self.keyspaces.get(keyspace)
    }

    pub fn local_info(&self) -> Arc<LocalInfo> {
        self.local_info.load_full()
    }

    /// The current token map, `None` until it was built for the first time.
    ///
    /// The returned map never changes. Comparing two results with `Arc::ptr_eq`
    /// tells whether the map was replaced in between.
    pub fn token_map(&self) -> Option<Arc<TokenMap>> {
        self.token_map.load_full()
    }

    /// Replica mapping of one keyspace.
    pub fn get_by_keyspace(&self, keyspace: &str) -> Result<Arc<KeyspaceReplicas>, TokenMapError> {
        let token_map = self.token_map().ok_or(TokenMapError::NotBuilt)?;
        token_map.get_by_keyspace(keyspace).cloned()
    }

    /// Replicas of the partition with the given serialized key, primary owner first.
    pub fn get_replicas(
        &self,
        keyspace: &str,
        partition_key: &[u8],
    ) -> Result<Vec<Arc<Host>>, TokenMapError> {
        let token_map = self.token_map().ok_or(TokenMapError::NotBuilt)?;
        token_map
            .get_replicas(keyspace, partition_key)
            .map(<[Arc<Host>]>::to_vec)
    }

    pub(crate) fn set_local_info(&self, local_info: LocalInfo) {
        if **self.local_info.load() != local_info {
            debug!(?local_info, "Cluster information changed");
            self.local_info.store(Arc::new(local_info));
        }
    }

    /// Reconciles the registry with a complete node listing.
    ///
    /// Unchanged hosts keep their identity, hosts whose attributes changed are
    /// replaced keeping their up/down status, and hosts absent from the listing
    /// are removed. The whole change is published as one snapshot.
    pub(crate) fn apply_node_list(
        &self,
        peers: &[Peer],
        host_listener: Option<&dyn HostListener>,
    ) -> NodeListChanges {
        let mut changes = NodeListChanges::default();

        self.hosts.update(|hosts| {
            let mut refreshed: BTreeMap<SocketAddr, Arc<Host>> = BTreeMap::new();
            for peer in peers {
                if refreshed.contains_key(&peer.address) {
                    debug!(address = %peer.address, "Node listed more than once, keeping the first row");
                    continue;
                }
                let host = match hosts.remove(&peer.address) {
                    Some(existing) if existing.matches(peer) => existing,
                    Some(existing) => {
                        let replacement = Arc::new(Host::inherit_status(peer, &existing));
                        changes.updated.push(replacement.clone());
                        replacement
                    }
                    None => {
                        let added = Arc::new(Host::new(peer));
                        changes.added.push(added.clone());
                        added
                    }
                };
                refreshed.insert(peer.address, host);
            }
            changes.removed = std::mem::replace(hosts, refreshed).into_values().collect();
        });

        for host in changes.added.iter() {
            debug!(host = %host, "Host added");
            notify(host_listener, host, HostEvent::Added);
        }
        for host in changes.removed.iter() {
            debug!(host = %host, "Host removed");
            notify(host_listener, host, HostEvent::Removed);
        }
        for host in changes.updated.iter() {
            debug!(host = %host, "Host topology attributes changed");
        }
        changes
    }

    /// Replaces all keyspace descriptors. Returns the names of keyspaces which disappeared.
    pub(crate) fn set_keyspaces(&self, keyspaces: Vec<KeyspaceMetadata>) -> Vec<String> {
        let new: BTreeMap<String, Arc<KeyspaceMetadata>> = keyspaces
            .into_iter()
            .map(|keyspace| (keyspace.name.clone(), Arc::new(keyspace)))
            .collect();
        let removed: Vec<String> = self
            .keyspaces
            .snapshot()
            .keys()
            .filter(|name| !new.contains_key(*name))
            .cloned()
            .collect();
        self.keyspaces.replace(new);
        removed
    }

    pub(crate) fn set_keyspace(&self, keyspace: KeyspaceMetadata) {
        self.keyspaces
            .insert(keyspace.name.clone(), Arc::new(keyspace));
    }

    pub(crate) fn remove_keyspace(&self, keyspace: &str) -> bool {
        self.keyspaces.remove(keyspace).is_some()
    }

    fn lock_token_map(&self) -> MutexGuard<'_, ()> {
        // The guarded data is `()`, a panicking writer cannot leave it inconsistent.
        self.token_map_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Recomputes the token map of all keyspaces from the current registry.
    ///
    /// Entries which the current ring and descriptors leave unchanged keep
    /// their identity.
    pub(crate) fn rebuild_token_map(&self) -> Arc<TokenMap> {
        let _guard = self.lock_token_map();
        let hosts = self.hosts.snapshot();
        let keyspaces = self.keyspaces.snapshot();
        let partitioner = self.local_info.load().partitioner;
        let descriptors = keyspaces.values().map(|keyspace| keyspace.as_ref());
        let token_map = Arc::new(match self.token_map.load_full() {
            Some(previous) => previous.rebuild(partitioner, hosts.values(), descriptors),
            None => TokenMap::build(partitioner, hosts.values(), descriptors),
        });
        self.token_map.store(Some(token_map.clone()));
        token_map
    }

    /// Recomputes the token map entry of one keyspace, from its current descriptor.
    ///
    /// A keyspace without descriptor is removed from the map. Nothing is
    /// published if the map was never built.
    pub(crate) fn refresh_token_map_keyspace(&self, keyspace: &str) {
        let _guard = self.lock_token_map();
        let Some(current) = self.token_map.load_full() else {
            trace!(keyspace, "Token map not built yet, nothing to update");
            return;
        };
        let updated = match self.keyspaces.get(keyspace) {
            Some(descriptor) => current.with_keyspace(&descriptor),
            None => current.without_keyspace(keyspace),
        };
        self.token_map.store(Some(Arc::new(updated)));
    }
}

fn find_by_ip(hosts: &BTreeMap<SocketAddr, Arc<Host>>, ip: IpAddr) -> Option<Arc<Host>> {
    hosts
        .values()
        .find(|host| host.address.ip() == ip)
        .cloned()
}

pub(crate) fn notify(host_listener: Option<&dyn HostListener>, host: &Host, event: HostEvent) {
    if let Some(listener) = host_listener {
        listener.on_event(&HostEventContext::for_host(host), &event);
    }
}
