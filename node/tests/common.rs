//! Shared harness for the cluster tests: small protocol constants so the
//! scenarios run in tens of ticks, and helpers to drive a cluster to
//! membership convergence.

use swimkv::driver::Simulation;
use swimkv::network::emulator::EmulatorConfig;
use swimkv::network::membership::MembershipConfig;
use swimkv::node::NodeConfig;
use swimkv::ring::RingConfig;
use swimkv::storage::StorageConfig;

pub const T_FAIL: u64 = 3;
pub const T_REMOVE: u64 = 10;
pub const TIMEOUT: u64 = 4;
pub const RING_SIZE: u64 = 512;

pub fn node_config() -> NodeConfig {
    NodeConfig {
        membership: MembershipConfig {
            t_fail: T_FAIL,
            t_remove: T_REMOVE,
            gossip_fanout: 3,
        },
        ring: RingConfig { size: RING_SIZE },
        storage: StorageConfig {
            transaction_timeout: TIMEOUT,
        },
    }
}

pub fn cluster(node_count: u32) -> Simulation {
    Simulation::new(
        node_count,
        node_config(),
        EmulatorConfig { drop_rate: 0.0 },
        7,
    )
}

/// Ticks until every live node's view holds exactly `expect` members, with
/// a hard upper bound so a broken protocol fails fast.
pub fn converge_membership(sim: &mut Simulation, expect: usize, max_ticks: u64) {
    for _ in 0..max_ticks {
        sim.tick();
        if sim
            .live_nodes()
            .all(|n| n.membership().members().len() == expect)
        {
            return;
        }
    }
    panic!("membership did not converge to {expect} members within {max_ticks} ticks");
}
