use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::replication_info::ReplicationInfo;
use super::TokenRing;
use crate::cluster::metadata::{KeyspaceMetadata, Strategy};
use crate::cluster::Host;
use crate::errors::TokenMapError;
use crate::routing::partitioner::PartitionerName;
use crate::routing::Token;

/// Replicas of one token range, primary owner first.
pub type ReplicaSet = Arc<[Arc<Host>]>;

/// Precomputed replica sets of one keyspace.
///
/// For every token on the ring, the set of hosts holding replicas of the range
/// that ends at that token. Keyspaces sharing a replication strategy share one
/// instance.
#[derive(Debug)]
pub struct KeyspaceReplicas {
    strategy: Strategy,
    ring: TokenRing<ReplicaSet>,
}

impl KeyspaceReplicas {
    fn compute(replication_info: &ReplicationInfo, strategy: &Strategy) -> Self {
        let ring = replication_info.global_ring().map(|token, _owner| {
            let replicas: Vec<Arc<Host>> = match strategy {
                Strategy::SimpleStrategy { replication_factor } => replication_info
                    .simple_strategy_replicas(token, *replication_factor)
                    .cloned()
                    .collect(),
                Strategy::NetworkTopologyStrategy {
                    datacenter_repfactors,
                } => replication_info
                    .nts_replicas(token, datacenter_repfactors)
                    .into_iter()
                    .collect(),
                // Everything else is served by the owner alone.
                Strategy::LocalStrategy | Strategy::Other { .. } => replication_info
                    .simple_strategy_replicas(token, 1)
                    .cloned()
                    .collect(),
            };
            ReplicaSet::from(replicas)
        });

        Self {
            strategy: strategy.clone(),
            ring,
        }
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    /// Replicas of the range containing `token`. Empty if the ring has no tokens.
    pub fn replicas_for_token(&self, token: Token) -> &[Arc<Host>] {
        self.ring
            .get_elem_for_token(token)
            .map(|replicas| &replicas[..])
            .unwrap_or(&[])
    }

    /// Every `(range end token, replicas)` pair, in ring order.
    pub fn iter(&self) -> impl Iterator<Item = (Token, &[Arc<Host>])> {
        self.ring.iter().map(|(token, replicas)| (*token, &replicas[..]))
    }

    /// Number of token ranges.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

fn ring_of<'a>(hosts: impl IntoIterator<Item = &'a Arc<Host>>) -> Vec<(Token, Arc<Host>)> {
    hosts
        .into_iter()
        .flat_map(|host| host.tokens.iter().map(move |token| (*token, host.clone())))
        .collect()
}

/// Immutable mapping from keyspaces to their token-to-replica maps.
///
/// A map is never modified once built. Changes produce a new map which shares
/// the entries of keyspaces the change did not affect, so `Arc::ptr_eq` on two
/// [`TokenMap::get_by_keyspace`] results tells whether a keyspace's replicas changed.
#[derive(Debug)]
pub struct TokenMap {
    partitioner: PartitionerName,
    replication_info: Arc<ReplicationInfo>,
    keyspaces: HashMap<String, Arc<KeyspaceReplicas>>,
}

impl TokenMap {
    /// Computes replica sets of all keyspaces from scratch.
    pub(crate) fn build<'a>(
        partitioner: PartitionerName,
        hosts: impl IntoIterator<Item = &'a Arc<Host>>,
        keyspaces: impl IntoIterator<Item = &'a KeyspaceMetadata>,
    ) -> TokenMap {
        let replication_info = Arc::new(ReplicationInfo::new(ring_of(hosts).into_iter()));
        Self::compute(partitioner, replication_info, HashMap::new(), keyspaces)
    }

    /// Computes replica sets of all keyspaces, starting from this map.
    ///
    /// If neither the ring nor the partitioner changed, entries of keyspaces
    /// whose strategy is unchanged are carried over as is.
    pub(crate) fn rebuild<'a>(
        &self,
        partitioner: PartitionerName,
        hosts: impl IntoIterator<Item = &'a Arc<Host>>,
        keyspaces: impl IntoIterator<Item = &'a KeyspaceMetadata>,
    ) -> TokenMap {
        let replication_info = ReplicationInfo::new(ring_of(hosts).into_iter());
        if partitioner != self.partitioner || !replication_info.same_ring(&self.replication_info) {
            return Self::compute(partitioner, Arc::new(replication_info), HashMap::new(), keyspaces);
        }

        let reusable: HashMap<Strategy, Arc<KeyspaceReplicas>> = self
            .keyspaces
            .values()
            .map(|replicas| (replicas.strategy.clone(), replicas.clone()))
            .collect();
        Self::compute(
            partitioner,
            self.replication_info.clone(),
            reusable,
            keyspaces,
        )
    }

    fn compute<'a>(
        partitioner: PartitionerName,
        replication_info: Arc<ReplicationInfo>,
        mut by_strategy: HashMap<Strategy, Arc<KeyspaceReplicas>>,
        keyspaces: impl IntoIterator<Item = &'a KeyspaceMetadata>,
    ) -> TokenMap {
        let reused = by_strategy.len();
        let mut computed: HashMap<String, Arc<KeyspaceReplicas>> = HashMap::new();
        for keyspace in keyspaces {
            let replicas = by_strategy
                .entry(keyspace.strategy.clone())
                .or_insert_with(|| {
                    Arc::new(KeyspaceReplicas::compute(
                        &replication_info,
                        &keyspace.strategy,
                    ))
                })
                .clone();
            computed.insert(keyspace.name.clone(), replicas);
        }

        debug!(
            hosts = replication_info.unique_hosts_in_global_ring().len(),
            tokens = replication_info.global_ring().len(),
            keyspaces = computed.len(),
            strategies = by_strategy.len(),
            reused,
            "Built token map"
        );

        TokenMap {
            partitioner,
            replication_info,
            keyspaces: computed,
        }
    }

    /// A copy of this map with the entry of one keyspace recomputed.
    ///
    /// The ring is unchanged, so an entry whose strategy did not change is kept
    /// as is, and an entry of another keyspace with the same strategy is reused.
    pub(crate) fn with_keyspace(&self, keyspace: &KeyspaceMetadata) -> TokenMap {
        let reusable = self
            .keyspaces
            .get(&keyspace.name)
            .into_iter()
            .chain(self.keyspaces.values())
            .find(|replicas| replicas.strategy == keyspace.strategy)
            .cloned();

        let replicas = reusable.unwrap_or_else(|| {
            Arc::new(KeyspaceReplicas::compute(
                &self.replication_info,
                &keyspace.strategy,
            ))
        });

        let mut keyspaces = self.keyspaces.clone();
        keyspaces.insert(keyspace.name.clone(), replicas);
        TokenMap {
            partitioner: self.partitioner,
            replication_info: self.replication_info.clone(),
            keyspaces,
        }
    }

    /// A copy of this map without the given keyspace.
    pub(crate) fn without_keyspace(&self, keyspace: &str) -> TokenMap {
        let mut keyspaces = self.keyspaces.clone();
        keyspaces.remove(keyspace);
        TokenMap {
            partitioner: self.partitioner,
            replication_info: self.replication_info.clone(),
            keyspaces,
        }
    }

    /// Replica mapping of one keyspace.
    ///
    /// An unknown keyspace is an error, while a known keyspace on a ring
    /// without tokens yields an empty mapping.
    pub fn get_by_keyspace(&self, keyspace: &str) -> Result<&Arc<KeyspaceReplicas>, TokenMapError> {
        self.keyspaces
            .get(keyspace)
            .ok_or_else(|| TokenMapError::KeyspaceNotFound(keyspace.to_owned()))
    }

    /// Replicas of the partition with the given serialized key.
    pub fn get_replicas(
        &self,
        keyspace: &str,
        partition_key: &[u8],
    ) -> Result<&[Arc<Host>], TokenMapError> {
        let token = self.partitioner.hash(partition_key);
        self.get_replicas_for_token(keyspace, token)
    }

    pub fn get_replicas_for_token(
        &self,
        keyspace: &str,
        token: Token,
    ) -> Result<&[Arc<Host>], TokenMapError> {
        Ok(self.get_by_keyspace(keyspace)?.replicas_for_token(token))
    }

    /// Host owning the range containing `token`.
    pub fn owner_of(&self, token: Token) -> Option<&Arc<Host>> {
        self.replication_info.global_ring().get_elem_for_token(token)
    }

    /// Names of the keyspaces the map covers.
    pub fn keyspaces(&self) -> impl Iterator<Item = &str> {
        self.keyspaces.keys().map(String::as_str)
    }

    /// Every distinct host which owns at least one token.
    pub fn hosts(&self) -> &[Arc<Host>] {
        self.replication_info.unique_hosts_in_global_ring()
    }

    pub fn partitioner(&self) -> PartitionerName {
        self.partitioner
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;

    use super::TokenMap;
    use crate::cluster::metadata::{KeyspaceMetadata, Strategy};
    use crate::errors::TokenMapError;
    use crate::routing::locator::test::{
        mock_hosts_for_token_aware_tests, mock_keyspaces, replica_ids, A, B, C, D, E, F, G,
        KEYSPACE_NTS_RF_2, KEYSPACE_NTS_RF_3, KEYSPACE_SS_RF_2,
    };
    use crate::routing::partitioner::PartitionerName;
    use crate::routing::Token;
    use crate::utils::test_utils::{mock_host, setup_tracing};

    fn build(keyspaces: &[KeyspaceMetadata]) -> TokenMap {
        TokenMap::build(
            PartitionerName::Murmur3,
            mock_hosts_for_token_aware_tests().iter(),
            keyspaces.iter(),
        )
    }

    fn simple(name: &str, replication_factor: usize) -> KeyspaceMetadata {
        KeyspaceMetadata {
            name: name.to_owned(),
            durable_writes: true,
            strategy: Strategy::SimpleStrategy { replication_factor },
        }
    }

    #[test]
    fn replicas_per_keyspace() {
        setup_tracing();
        let map = build(&mock_keyspaces());

        let check = |keyspace: &str, token: i64, expected: Vec<u16>| {
            let replicas = map
                .get_replicas_for_token(keyspace, Token::new(token))
                .unwrap();
            assert_eq!(replica_ids(replicas), expected, "{keyspace} at {token}");
        };

        check(KEYSPACE_SS_RF_2, 160, vec![F, A]);
        check(KEYSPACE_SS_RF_2, 901, vec![A, B]);
        check(KEYSPACE_NTS_RF_2, 160, vec![F, A, D, G]);
        check(KEYSPACE_NTS_RF_3, 160, vec![F, A, D, G, C, E]);
        check(KEYSPACE_NTS_RF_3, 710, vec![E, G, B, A, F, D]);

        assert_eq!(map.owner_of(Token::new(160)).map(|h| h.address.port()), Some(F));
    }

    #[test]
    fn unknown_keyspace_is_distinct_from_empty_ring() {
        setup_tracing();
        let map = build(&mock_keyspaces());
        assert_matches!(
            map.get_by_keyspace("no_such_keyspace"),
            Err(TokenMapError::KeyspaceNotFound(ks)) if ks == "no_such_keyspace"
        );

        let empty = TokenMap::build(
            PartitionerName::Murmur3,
            std::iter::empty(),
            [simple("ks", 3)].iter(),
        );
        let replicas = empty.get_by_keyspace("ks").unwrap();
        assert!(replicas.is_empty());
        assert!(empty.get_replicas("ks", b"key").unwrap().is_empty());
    }

    #[test]
    fn replica_count_invariant() {
        setup_tracing();
        for rf in 0..=9 {
            let map = build(&[simple("ks", rf)]);
            let replicas = map.get_by_keyspace("ks").unwrap();
            assert_eq!(replicas.len(), 17);
            for (token, set) in replicas.iter() {
                let ids = replica_ids(set);
                let mut unique = ids.clone();
                unique.sort_unstable();
                unique.dedup();
                assert_eq!(unique.len(), ids.len(), "duplicates at {token}");
                assert_eq!(ids.len(), rf.min(7), "rf {rf} at {token}");
                let owner = map.owner_of(token).map(|h| h.address.port());
                assert_eq!(ids.first().copied(), owner.filter(|_| rf > 0));
            }
        }
    }

    #[test]
    fn rebuild_is_deterministic() {
        setup_tracing();
        let first = build(&mock_keyspaces());
        let second = build(&mock_keyspaces());

        for keyspace in [KEYSPACE_SS_RF_2, KEYSPACE_NTS_RF_2, KEYSPACE_NTS_RF_3] {
            let a = first.get_by_keyspace(keyspace).unwrap();
            let b = second.get_by_keyspace(keyspace).unwrap();
            let a: Vec<_> = a.iter().map(|(t, r)| (t, replica_ids(r))).collect();
            let b: Vec<_> = b.iter().map(|(t, r)| (t, replica_ids(r))).collect();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn three_node_ring_with_full_replication() {
        setup_tracing();
        let hosts = [
            mock_host(1, "dc", "r1", &[0]),
            mock_host(2, "dc", "r1", &[100]),
            mock_host(3, "dc", "r1", &[200]),
        ];
        let map = TokenMap::build(PartitionerName::Murmur3, hosts.iter(), [simple("ks", 3)].iter());

        let replicas = map.get_by_keyspace("ks").unwrap();
        let ranges: Vec<(i64, Vec<u16>)> = replicas
            .iter()
            .map(|(t, r)| (t.value(), replica_ids(r)))
            .collect();
        assert_eq!(
            ranges,
            vec![
                (0, vec![1, 2, 3]),
                (100, vec![2, 3, 1]),
                (200, vec![3, 1, 2]),
            ]
        );
    }

    #[test]
    fn single_keyspace_rebuild_keeps_other_entries() {
        setup_tracing();
        let map = build(&mock_keyspaces());
        // Keyspaces with equal strategies share their replica sets.
        let other = map.with_keyspace(&simple("other", 2));
        assert!(Arc::ptr_eq(
            other.get_by_keyspace("other").unwrap(),
            other.get_by_keyspace(KEYSPACE_SS_RF_2).unwrap()
        ));

        let altered = map.with_keyspace(&simple(KEYSPACE_SS_RF_2, 3));
        for keyspace in [KEYSPACE_NTS_RF_2, KEYSPACE_NTS_RF_3] {
            assert!(Arc::ptr_eq(
                map.get_by_keyspace(keyspace).unwrap(),
                altered.get_by_keyspace(keyspace).unwrap()
            ));
        }
        assert!(!Arc::ptr_eq(
            map.get_by_keyspace(KEYSPACE_SS_RF_2).unwrap(),
            altered.get_by_keyspace(KEYSPACE_SS_RF_2).unwrap()
        ));
        assert_eq!(
            replica_ids(altered.get_replicas_for_token(KEYSPACE_SS_RF_2, Token::new(160)).unwrap()),
            vec![F, A, C]
        );

        let unchanged = map.with_keyspace(&simple(KEYSPACE_SS_RF_2, 2));
        assert!(Arc::ptr_eq(
            map.get_by_keyspace(KEYSPACE_SS_RF_2).unwrap(),
            unchanged.get_by_keyspace(KEYSPACE_SS_RF_2).unwrap()
        ));

        let dropped = map.without_keyspace(KEYSPACE_NTS_RF_2);
        assert_matches!(
            dropped.get_by_keyspace(KEYSPACE_NTS_RF_2),
            Err(TokenMapError::KeyspaceNotFound(_))
        );
        assert_eq!(dropped.keyspaces().count(), 2);
    }

    #[test]
    fn full_rebuild_keeps_entries_while_ring_is_unchanged() {
        setup_tracing();
        let hosts = mock_hosts_for_token_aware_tests();
        let keyspaces = mock_keyspaces();
        let map = TokenMap::build(PartitionerName::Murmur3, hosts.iter(), keyspaces.iter());

        let mut altered = keyspaces.clone();
        altered[0] = simple(KEYSPACE_SS_RF_2, 1);
        let rebuilt = map.rebuild(PartitionerName::Murmur3, hosts.iter(), altered.iter());
        assert!(Arc::ptr_eq(
            map.get_by_keyspace(KEYSPACE_NTS_RF_3).unwrap(),
            rebuilt.get_by_keyspace(KEYSPACE_NTS_RF_3).unwrap()
        ));
        assert!(!Arc::ptr_eq(
            map.get_by_keyspace(KEYSPACE_SS_RF_2).unwrap(),
            rebuilt.get_by_keyspace(KEYSPACE_SS_RF_2).unwrap()
        ));

        // Without host B every range may change.
        let shrunk: Vec<_> = hosts.iter().filter(|h| h.address.port() != B).cloned().collect();
        let rebuilt = map.rebuild(PartitionerName::Murmur3, shrunk.iter(), keyspaces.iter());
        assert!(!Arc::ptr_eq(
            map.get_by_keyspace(KEYSPACE_NTS_RF_3).unwrap(),
            rebuilt.get_by_keyspace(KEYSPACE_NTS_RF_3).unwrap()
        ));
        assert_eq!(rebuilt.hosts().len(), 6);
    }
}
