//! Host selection for the control connection.
//!
//! The policy decides in which order hosts are tried when the control
//! connection reconnects, and which hosts are not relevant at all
//! ([`HostDistance::Ignored`]). Ignored hosts are never connected to and
//! their status events are not applied.

use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;

use crate::cluster::Host;

/// How far a host is from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HostDistance {
    Local,
    Remote,
    Ignored,
}

/// Decides the relevance of hosts and the order in which they are tried.
pub trait LoadBalancingPolicy: Debug + Send + Sync {
    fn distance(&self, host: &Host) -> HostDistance;

    /// Orders `hosts` for a sequence of connection attempts.
    fn new_query_plan(&self, hosts: &[Arc<Host>]) -> Vec<Arc<Host>>;
}

/// Rotates the starting host on every plan. Every host is local.
#[derive(Debug)]
pub struct RoundRobinPolicy {
    index: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self {
            index: AtomicUsize::new(rand::rng().random_range(0..1024)),
        }
    }
}

impl Default for RoundRobinPolicy {
    fn default() -> Self {
        Self::new()
    }
}

fn rotated(hosts: &[Arc<Host>], start: usize) -> impl Iterator<Item = &Arc<Host>> {
    let start = if hosts.is_empty() {
        0
    } else {
        start % hosts.len()
    };
    hosts[start..].iter().chain(hosts[..start].iter())
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn distance(&self, _host: &Host) -> HostDistance {
        HostDistance::Local
    }

    fn new_query_plan(&self, hosts: &[Arc<Host>]) -> Vec<Arc<Host>> {
        let start = self.index.fetch_add(1, Ordering::Relaxed);
        rotated(hosts, start).cloned().collect()
    }
}

/// Prefers hosts of one datacenter, trying remote ones afterwards.
#[derive(Debug)]
pub struct DcAwareRoundRobinPolicy {
    local_datacenter: String,
    ignore_remote_hosts: bool,
    index: AtomicUsize,
}

impl DcAwareRoundRobinPolicy {
    pub fn new(local_datacenter: impl Into<String>) -> Self {
        Self {
            local_datacenter: local_datacenter.into(),
            ignore_remote_hosts: false,
            index: AtomicUsize::new(rand::rng().random_range(0..1024)),
        }
    }

    /// Makes hosts outside the local datacenter [`HostDistance::Ignored`].
    pub fn ignore_remote_hosts(mut self, ignore: bool) -> Self {
        self.ignore_remote_hosts = ignore;
        self
    }

    fn is_local(&self, host: &Host) -> bool {
        host.datacenter.as_deref() == Some(self.local_datacenter.as_str())
    }
}

impl LoadBalancingPolicy for DcAwareRoundRobinPolicy {
    fn distance(&self, host: &Host) -> HostDistance {
        if self.is_local(host) {
            HostDistance::Local
        } else if self.ignore_remote_hosts {
            HostDistance::Ignored
        } else {
            HostDistance::Remote
        }
    }

    fn new_query_plan(&self, hosts: &[Arc<Host>]) -> Vec<Arc<Host>> {
        let start = self.index.fetch_add(1, Ordering::Relaxed);
        let (local, remote): (Vec<Arc<Host>>, Vec<Arc<Host>>) =
            hosts.iter().cloned().partition(|h| self.is_local(h));

        let mut plan: Vec<Arc<Host>> = rotated(&local, start).cloned().collect();
        if !self.ignore_remote_hosts {
            plan.extend(rotated(&remote, start).cloned());
        }
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::{mock_host, setup_tracing};

    fn ports(plan: &[Arc<Host>]) -> Vec<u16> {
        plan.iter().map(|h| h.address.port()).collect()
    }

    #[test]
    fn round_robin_rotates() {
        setup_tracing();
        let hosts: Vec<Arc<Host>> = (1..=3).map(|i| mock_host(i, "dc1", "r1", &[])).collect();
        let policy = RoundRobinPolicy {
            index: AtomicUsize::new(0),
        };

        assert_eq!(ports(&policy.new_query_plan(&hosts)), vec![1, 2, 3]);
        assert_eq!(ports(&policy.new_query_plan(&hosts)), vec![2, 3, 1]);
        assert_eq!(ports(&policy.new_query_plan(&hosts)), vec![3, 1, 2]);
        assert!(policy.new_query_plan(&[]).is_empty());
    }

    #[test]
    fn dc_aware_prefers_local_datacenter() {
        setup_tracing();
        let hosts: Vec<Arc<Host>> = vec![
            mock_host(1, "remote", "r1", &[]),
            mock_host(2, "local", "r1", &[]),
            mock_host(3, "remote", "r1", &[]),
            mock_host(4, "local", "r2", &[]),
        ];
        let policy = DcAwareRoundRobinPolicy::new("local");
        let plan = ports(&policy.new_query_plan(&hosts));
        assert_eq!(plan.len(), 4);
        assert!(plan[..2].contains(&2) && plan[..2].contains(&4));

        assert_eq!(policy.distance(&hosts[0]), HostDistance::Remote);
        let strict = DcAwareRoundRobinPolicy::new("local").ignore_remote_hosts(true);
        assert_eq!(strict.distance(&hosts[0]), HostDistance::Ignored);
        assert_eq!(strict.distance(&hosts[1]), HostDistance::Local);
        assert_eq!(strict.new_query_plan(&hosts).len(), 2);
    }
}
