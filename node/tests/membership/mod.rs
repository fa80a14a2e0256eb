//! Cluster-level membership behavior: bootstrap convergence, failure
//! detection and the view invariants that must hold through churn.

use std::collections::{BTreeSet, HashMap};

use swimkv::network::NodeAddress;
use test_log::test;

use crate::common::{cluster, converge_membership, T_FAIL, T_REMOVE};

#[test]
fn bootstrap_converges_on_one_view() {
    let mut sim = cluster(4);
    sim.run(2 * T_FAIL);

    let expected: Vec<NodeAddress> = (1..=4).map(|id| NodeAddress::new(id, 0)).collect();
    for node in sim.nodes() {
        assert!(node.membership().in_group());
        let view: Vec<NodeAddress> = node.membership().member_addrs().collect();
        assert_eq!(view, expected, "view of {}", node.addr());
    }
}

#[test]
fn single_failure_is_detected_everywhere_exactly_once() {
    let mut sim = cluster(10);
    converge_membership(&mut sim, 10, 30);

    let failed = NodeAddress::new(7, 0);
    sim.fail(7);
    sim.run(T_REMOVE + 8);

    for node in sim.live_nodes() {
        assert!(
            node.membership().entry(failed).is_none(),
            "{} still knows the failed node",
            node.addr()
        );
        assert_eq!(node.journal().removals_of(failed), 1, "{}", node.addr());
        // Never re-learned from a straggler after eviction.
        assert_eq!(node.journal().additions_of(failed), 1, "{}", node.addr());
    }
}

#[test]
fn views_keep_their_invariants_through_churn() {
    let mut sim = cluster(6);
    // (viewer, peer) -> highest heartbeat seen so far.
    let mut heartbeats: HashMap<(NodeAddress, NodeAddress), u64> = HashMap::new();

    for tick in 0..40 {
        if tick == 15 {
            sim.fail(4);
        }
        sim.tick();

        for node in sim.live_nodes() {
            let view = node.membership().members();
            let unique: BTreeSet<NodeAddress> = view.iter().map(|e| e.addr).collect();
            assert_eq!(unique.len(), view.len(), "duplicate entry in a view");
            assert_eq!(
                view.iter().filter(|e| e.addr == node.addr()).count(),
                1,
                "a view must contain its owner exactly once"
            );

            for entry in view {
                let seen = heartbeats.entry((node.addr(), entry.addr)).or_insert(0);
                assert!(
                    entry.heartbeat >= *seen,
                    "heartbeat of {} regressed in the view of {}",
                    entry.addr,
                    node.addr()
                );
                *seen = entry.heartbeat;
            }
        }
    }
}
