use std::sync::Arc;

use crate::cluster::metadata::{KeyspaceMetadata, Strategy};
use crate::cluster::Host;
use crate::routing::Token;
use crate::utils::test_utils::mock_host;

pub(crate) const KEYSPACE_NTS_RF_2: &str = "keyspace_with_nts_rf_2";
pub(crate) const KEYSPACE_NTS_RF_3: &str = "keyspace_with_nts_rf_3";
pub(crate) const KEYSPACE_SS_RF_2: &str = "keyspace_with_ss_rf_2";

pub(crate) const A: u16 = 1;
pub(crate) const B: u16 = 2;
pub(crate) const C: u16 = 3;
pub(crate) const D: u16 = 4;
pub(crate) const E: u16 = 5;
pub(crate) const F: u16 = 6;
pub(crate) const G: u16 = 7;

// 7 hosts living in 2 datacenters, each with 2 racks. Host ids are their ports.
// num | host | DC | rack
// 1     A      eu   r1
// 2     B      eu   r1
// 3     C      eu   r1
// 4     D      us   r1
// 5     E      us   r1
// 6     F      us   r2
// 7     G      eu   r2
//
// The ring built from these hosts is populated as follows (tokens 0-900):
// Ring tokens:             50 100 150 200 250 300 350 400 450 500 550 600 650 700 750 800 900
// Corresponding host ids:  A  B   E   F   A   C   D   A   F   G   D   B   C   C   E   G   B
// Corresponding host nums: 1  2   5   6   1   3   4   1   6   7   4   2   3   3   5   7   2
pub(crate) fn mock_hosts_for_token_aware_tests() -> Vec<Arc<Host>> {
    vec![
        mock_host(A, "eu", "r1", &[50, 250, 400]),
        mock_host(B, "eu", "r1", &[100, 600, 900]),
        mock_host(C, "eu", "r1", &[300, 650, 700]),
        mock_host(D, "us", "r1", &[350, 550]),
        mock_host(E, "us", "r1", &[150, 750]),
        mock_host(F, "us", "r2", &[200, 450]),
        mock_host(G, "eu", "r2", &[500, 800]),
    ]
}

pub(crate) fn mock_keyspaces() -> Vec<KeyspaceMetadata> {
    let nts = |rf: usize| Strategy::NetworkTopologyStrategy {
        datacenter_repfactors: [("eu".to_owned(), rf), ("us".to_owned(), rf)]
            .into_iter()
            .collect(),
    };
    [
        (
            KEYSPACE_SS_RF_2,
            Strategy::SimpleStrategy {
                replication_factor: 2,
            },
        ),
        (KEYSPACE_NTS_RF_2, nts(2)),
        (KEYSPACE_NTS_RF_3, nts(3)),
    ]
    .into_iter()
    .map(|(name, strategy)| KeyspaceMetadata {
        name: name.to_owned(),
        durable_writes: true,
        strategy,
    })
    .collect()
}

pub(crate) fn create_ring(hosts: &[Arc<Host>]) -> impl Iterator<Item = (Token, Arc<Host>)> + '_ {
    hosts
        .iter()
        .flat_map(|host| host.tokens.iter().map(move |token| (*token, host.clone())))
}

pub(crate) fn replica_ids(replicas: &[Arc<Host>]) -> Vec<u16> {
    replicas.iter().map(|host| host.address.port()).collect()
}
