use indexmap::IndexSet;
use itertools::Itertools;

use super::TokenRing;
use crate::cluster::Host;
use crate::routing::Token;

use std::cmp;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Per-datacenter counts the NetworkTopologyStrategy walk needs to know when
/// a datacenter is complete.
#[derive(Debug, Clone, Default)]
pub(crate) struct DatacenterInfo {
    unique_hosts: usize,
    /// Hosts without a rack are not counted as a rack.
    racks: HashSet<String>,
}

impl DatacenterInfo {
    pub(crate) fn rack_count(&self) -> usize {
        self.racks.len()
    }
}

/// ReplicationInfo keeps information about the token ring
/// and provides methods to calculate replica lists for SimpleStrategy and NetworkTopologyStrategy.
#[derive(Debug, Clone)]
pub(crate) struct ReplicationInfo {
    global_ring: TokenRing<Arc<Host>>,
    unique_hosts_in_global_ring: Vec<Arc<Host>>,
    datacenters: HashMap<String, DatacenterInfo>,
}

impl ReplicationInfo {
    pub(crate) fn new(ring_iter: impl Iterator<Item = (Token, Arc<Host>)>) -> ReplicationInfo {
        let global_ring: TokenRing<Arc<Host>> = TokenRing::new(ring_iter);

        let unique_hosts_in_global_ring: Vec<Arc<Host>> = global_ring
            .iter()
            .map(|(_t, h)| h)
            .unique()
            .cloned()
            .collect();

        let mut datacenters: HashMap<String, DatacenterInfo> = HashMap::new();
        for host in unique_hosts_in_global_ring.iter() {
            if let Some(datacenter_name) = host.datacenter.as_deref() {
                let dc = datacenters.entry(datacenter_name.to_owned()).or_default();
                dc.unique_hosts += 1;
                if let Some(rack) = host.rack.as_deref() {
                    dc.racks.insert(rack.to_owned());
                }
            }
        }

        ReplicationInfo {
            global_ring,
            unique_hosts_in_global_ring,
            datacenters,
        }
    }

    /// Whether both rings consist of the same hosts at the same tokens.
    pub(crate) fn same_ring(&self, other: &ReplicationInfo) -> bool {
        self.global_ring.len() == other.global_ring.len()
            && self
                .global_ring
                .iter()
                .zip(other.global_ring.iter())
                .all(|((t1, h1), (t2, h2))| t1 == t2 && Arc::ptr_eq(h1, h2))
    }

    pub(crate) fn global_ring(&self) -> &TokenRing<Arc<Host>> {
        &self.global_ring
    }

    pub(crate) fn unique_hosts_in_global_ring(&self) -> &[Arc<Host>] {
        &self.unique_hosts_in_global_ring
    }

    /// Creates an iterator over SimpleStrategy replicas for the given token and replication factor.
    /// The iterator computes consecutive replicas lazily as needed.
    pub(crate) fn simple_strategy_replicas(
        &self,
        token: Token,
        replication_factor: usize,
    ) -> impl Iterator<Item = &Arc<Host>> {
        let num_to_take = cmp::min(replication_factor, self.unique_hosts_in_global_ring.len());

        self.global_ring
            .ring_range(token)
            .unique()
            .take(num_to_take)
    }

    /// Computes NetworkTopologyStrategy replicas of all datacenters at once.
    ///
    /// The global ring is walked once starting at `token`. Within a datacenter
    /// a host is taken if its rack has not been used yet. A host on an already
    /// used rack is put aside and taken only once every rack of the datacenter
    /// was used, in the order the hosts were put aside. Hosts without a rack are
    /// always taken. Replicas of different datacenters are interleaved in ring order.
    pub(crate) fn nts_replicas(
        &self,
        token: Token,
        datacenter_repfactors: &BTreeMap<String, usize>,
    ) -> IndexSet<Arc<Host>> {
        let mut walks: HashMap<&str, DatacenterWalk<'_>> = datacenter_repfactors
            .iter()
            .filter_map(|(dc_name, rf)| {
                let dc = self.datacenters.get(dc_name)?;
                let target = cmp::min(*rf, dc.unique_hosts);
                (target > 0).then(|| (dc_name.as_str(), DatacenterWalk::new(dc, target)))
            })
            .collect();

        let total: usize = walks.values().map(|w| w.target).sum();
        let mut replicas: IndexSet<Arc<Host>> = IndexSet::with_capacity(total);
        let mut complete_datacenters = 0;

        for host in self.global_ring.ring_range(token) {
            if complete_datacenters == walks.len() {
                break;
            }
            let Some(walk) = host
                .datacenter
                .as_deref()
                .and_then(|dc_name| walks.get_mut(dc_name))
            else {
                continue;
            };
            if walk.is_complete() || replicas.contains(host) || walk.skipped.contains(host) {
                continue;
            }

            walk.offer(host, &mut replicas);
            if walk.is_complete() {
                complete_datacenters += 1;
            }
        }

        // Every rack is seen by the end of a full walk, but datacenters whose
        // last rack appears late may still hold hosts put aside.
        for walk in walks.values_mut() {
            walk.drain_skipped(&mut replicas);
        }

        replicas
    }

    /// NetworkTopologyStrategy replicas restricted to one datacenter.
    pub(crate) fn nts_replicas_in_datacenter(
        &self,
        token: Token,
        datacenter_name: &str,
        replication_factor: usize,
    ) -> IndexSet<Arc<Host>> {
        let single: BTreeMap<String, usize> =
            [(datacenter_name.to_owned(), replication_factor)].into();
        self.nts_replicas(token, &single)
    }
}

/// State of one datacenter during an NTS ring walk.
struct DatacenterWalk<'a> {
    info: &'a DatacenterInfo,
    target: usize,
    taken: usize,
    seen_racks: HashSet<&'a str>,
    skipped: IndexSet<Arc<Host>>,
}

impl<'a> DatacenterWalk<'a> {
    fn new(info: &'a DatacenterInfo, target: usize) -> Self {
        Self {
            info,
            target,
            taken: 0,
            seen_racks: HashSet::new(),
            skipped: IndexSet::new(),
        }
    }

    fn is_complete(&self) -> bool {
        self.taken >= self.target
    }

    fn all_racks_seen(&self) -> bool {
        self.seen_racks.len() >= self.info.rack_count()
    }

    fn take(&mut self, host: &Arc<Host>, replicas: &mut IndexSet<Arc<Host>>) {
        if replicas.insert(host.clone()) {
            self.taken += 1;
        }
    }

    fn offer(&mut self, host: &'a Arc<Host>, replicas: &mut IndexSet<Arc<Host>>) {
        let rack = match host.rack.as_deref() {
            Some(rack) if !self.all_racks_seen() => rack,
            _ => {
                self.take(host, replicas);
                return;
            }
        };

        if self.seen_racks.contains(rack) {
            self.skipped.insert(host.clone());
            return;
        }

        self.take(host, replicas);
        self.seen_racks.insert(rack);
        if self.all_racks_seen() {
            self.drain_skipped(replicas);
        }
    }

    fn drain_skipped(&mut self, replicas: &mut IndexSet<Arc<Host>>) {
        let skipped = std::mem::take(&mut self.skipped);
        for host in skipped.iter() {
            if self.is_complete() {
                break;
            }
            self.take(host, replicas);
        }
    }
}
