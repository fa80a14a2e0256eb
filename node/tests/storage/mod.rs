//! Cluster-level storage behavior: quorum CRUD, read-repair, timeouts and
//! the stabilization protocol around node failures.

use assert_matches::assert_matches;
use swimkv::driver::Simulation;
use swimkv::events::{Event, Operation};
use swimkv::network::NodeAddress;
use swimkv::storage::ReplicaRole;
use test_log::test;

use crate::common::{cluster, converge_membership, TIMEOUT, T_REMOVE};

fn replicas_of(sim: &Simulation, viewer: u32, key: &str) -> [NodeAddress; 3] {
    sim.node(viewer)
        .ring()
        .replicas_for(key)
        .expect("ring too small")
        .map(|n| n.addr)
}

#[test]
fn create_reaches_quorum_with_assigned_roles() {
    let mut sim = cluster(5);
    converge_membership(&mut sim, 5, 30);

    sim.create_from(1, "k", "v1");
    sim.run(3);

    let coordinator = sim.node(1).journal();
    assert_eq!(coordinator.count_outcomes(Operation::Create, true, true), 1);
    assert_eq!(coordinator.count_outcomes(Operation::Create, true, false), 0);

    let replicas = replicas_of(&sim, 1, "k");
    for (position, addr) in replicas.iter().enumerate() {
        let node = sim.node(addr.id);
        let entry = node.store().read("k").expect("replica lost the key");
        assert_eq!(entry.value, "v1");
        assert_eq!(entry.role, ReplicaRole::of_position(position));
        assert_eq!(
            node.journal().count_outcomes(Operation::Create, false, true),
            1
        );
    }
    for node in sim.live_nodes() {
        if !replicas.contains(&node.addr()) {
            assert!(!node.store().contains_key("k"));
        }
    }
}

#[test]
fn read_returns_the_quorum_value() {
    let mut sim = cluster(5);
    converge_membership(&mut sim, 5, 30);

    sim.create_from(1, "k", "v1");
    sim.run(3);
    sim.read_from(2, "k");
    sim.run(3);

    let outcomes: Vec<&Event> = sim
        .node(2)
        .journal()
        .op_outcomes(Operation::Read, true)
        .collect();
    assert_eq!(outcomes.len(), 1);
    assert_matches!(
        outcomes[0],
        Event::OpOutcome {
            success: true,
            value: Some(v),
            ..
        } if v == "v1"
    );
}

#[test]
fn update_of_a_missing_key_fails_at_every_level() {
    let mut sim = cluster(5);
    converge_membership(&mut sim, 5, 30);

    sim.update_from(2, "ghost", "v");
    sim.run(3);

    let coordinator = sim.node(2).journal();
    assert_eq!(coordinator.count_outcomes(Operation::Update, true, false), 1);
    assert_eq!(coordinator.count_outcomes(Operation::Update, true, true), 0);

    for addr in replicas_of(&sim, 1, "ghost") {
        let node = sim.node(addr.id);
        assert_eq!(
            node.journal().count_outcomes(Operation::Update, false, false),
            1
        );
        assert!(!node.store().contains_key("ghost"));
    }
}

#[test]
fn create_then_delete_leaves_no_replica_behind() {
    let mut sim = cluster(5);
    converge_membership(&mut sim, 5, 30);

    sim.create_from(3, "k", "v");
    sim.run(3);
    sim.delete_from(1, "k");
    sim.run(3);

    assert_eq!(
        sim.node(1).journal().count_outcomes(Operation::Delete, true, true),
        1
    );
    for node in sim.live_nodes() {
        assert!(!node.store().contains_key("k"), "{} kept the key", node.addr());
    }
}

#[test]
fn read_repair_converges_a_divergent_replica() {
    let mut sim = cluster(5);
    converge_membership(&mut sim, 5, 30);

    sim.create_from(1, "k", "v1");
    sim.run(3);

    let replicas = replicas_of(&sim, 1, "k");
    let divergent = replicas[2];
    sim.node_mut(divergent.id)
        .store_mut()
        .update("k", "v2", ReplicaRole::Reserved, 0)
        .unwrap();

    sim.read_from(1, "k");
    sim.run(TIMEOUT + 2);

    // One read success with the majority value, despite three replies.
    let coordinator = sim.node(1).journal();
    let outcomes: Vec<&Event> = coordinator.op_outcomes(Operation::Read, true).collect();
    assert_eq!(outcomes.len(), 1);
    assert_matches!(
        outcomes[0],
        Event::OpOutcome {
            success: true,
            value: Some(v),
            ..
        } if v == "v1"
    );

    // Exactly one repair went out, towards the dissenter, with its role kept.
    assert_eq!(coordinator.count_outcomes(Operation::Update, true, true), 1);
    let repaired = sim.node(divergent.id);
    let entry = repaired.store().read("k").unwrap();
    assert_eq!(entry.value, "v1");
    assert_eq!(entry.role, ReplicaRole::of_position(2));
    assert_eq!(
        repaired.journal().count_outcomes(Operation::Update, false, true),
        1
    );
    for addr in &replicas[..2] {
        assert_eq!(
            sim.node(addr.id)
                .journal()
                .op_outcomes(Operation::Update, false)
                .count(),
            0
        );
    }
}

#[test]
fn total_message_loss_times_out_exactly_once() {
    let mut sim = cluster(5);
    converge_membership(&mut sim, 5, 30);

    sim.net().set_drop_rate(1.0);
    sim.update_from(1, "k", "v");
    sim.run(TIMEOUT + 2);

    let failures = |sim: &Simulation| {
        sim.node(1)
            .journal()
            .count_outcomes(Operation::Update, true, false)
    };
    assert_eq!(failures(&sim), 1);

    // Once the network heals nothing changes the verdict, and the short
    // outage was not long enough to evict anyone.
    sim.net().set_drop_rate(0.0);
    sim.run(5);
    assert_eq!(failures(&sim), 1);
    assert_eq!(
        sim.node(1).journal().count_outcomes(Operation::Update, true, true),
        0
    );
    for node in sim.live_nodes() {
        assert_eq!(node.membership().members().len(), 5);
    }
}

#[test]
fn undersized_ring_fails_by_timeout_without_traffic() {
    let mut sim = cluster(2);
    converge_membership(&mut sim, 2, 20);

    sim.create_from(1, "k", "v");
    sim.run(TIMEOUT + 2);

    assert_eq!(
        sim.node(1).journal().count_outcomes(Operation::Create, true, false),
        1
    );
    for node in sim.nodes() {
        assert_eq!(node.journal().op_outcomes(Operation::Create, false).count(), 0);
        assert!(!node.store().contains_key("k"));
    }
}

#[test]
fn stabilization_replaces_a_failed_secondary() {
    let mut sim = cluster(6);
    converge_membership(&mut sim, 6, 30);

    sim.create_from(1, "k", "v");
    sim.run(3);

    let [primary, secondary, tertiary] = replicas_of(&sim, 1, "k");
    sim.fail(secondary.id);
    sim.run(T_REMOVE + 10);

    let replicas = replicas_of(&sim, primary.id, "k");
    assert_eq!(replicas[0], primary, "the primary must not move");
    assert_eq!(replicas[1], tertiary, "the old tertiary moves up");
    let newcomer = replicas[2];
    assert!(newcomer != secondary);

    for (position, addr) in replicas.iter().enumerate() {
        let entry = sim.node(addr.id).store().read("k").expect("missing copy");
        assert_eq!(entry.value, "v");
        assert_eq!(entry.role, ReplicaRole::of_position(position));
    }
    for node in sim.live_nodes() {
        if !replicas.contains(&node.addr()) {
            assert!(!node.store().contains_key("k"));
        }
    }

    // The newcomer was pushed to exactly once, and nobody re-pushed to the
    // old tertiary.
    let newcomer = sim.node(newcomer.id);
    assert_eq!(
        newcomer.journal().count_outcomes(Operation::Create, false, true),
        1
    );
    let survivor = sim.node(tertiary.id);
    assert_eq!(
        survivor.journal().count_outcomes(Operation::Create, false, false),
        0
    );

    // Quiesced stabilization is idempotent: more ticks, no new outcomes.
    sim.run(TIMEOUT + 2);
    let snapshot: Vec<usize> = sim
        .live_nodes()
        .map(|n| n.journal().events().len())
        .collect();
    sim.run(5);
    let after: Vec<usize> = sim
        .live_nodes()
        .map(|n| n.journal().events().len())
        .collect();
    assert_eq!(snapshot, after);
    for node in sim.live_nodes() {
        assert_eq!(node.storage().open_transactions(), 0);
    }
}

#[test]
fn tertiary_takes_over_when_both_ancestors_die() {
    let mut sim = cluster(6);
    converge_membership(&mut sim, 6, 30);

    sim.create_from(1, "k", "v");
    sim.run(3);

    let [primary, secondary, tertiary] = replicas_of(&sim, 1, "k");
    sim.fail(primary.id);
    sim.fail(secondary.id);
    sim.run(T_REMOVE + 12);

    let replicas = replicas_of(&sim, tertiary.id, "k");
    assert_eq!(
        replicas[0], tertiary,
        "the surviving tertiary becomes primary"
    );
    assert_eq!(
        sim.node(tertiary.id).store().read("k").unwrap().role,
        ReplicaRole::Primary
    );

    // Evictions of the two ancestors may land on different ticks, in which
    // case one push can be elided; a quorum of the new set always holds the
    // key and a quorum read still serves it.
    let holders = replicas
        .iter()
        .filter(|addr| sim.node(addr.id).store().read("k").map(|e| e.value.as_str()) == Some("v"))
        .count();
    assert!(holders >= 2, "only {holders} of the new replica set hold the key");

    sim.read_from(tertiary.id, "k");
    sim.run(TIMEOUT + 2);
    let outcomes: Vec<&Event> = sim
        .node(tertiary.id)
        .journal()
        .op_outcomes(Operation::Read, true)
        .collect();
    assert_eq!(outcomes.len(), 1);
    assert_matches!(
        outcomes[0],
        Event::OpOutcome {
            success: true,
            value: Some(v),
            ..
        } if v == "v"
    );
}
