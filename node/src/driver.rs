//! Drives a whole cluster in simulated time: owns the emulator and every
//! node, ticks them round-robin, injects client operations and failures.
//! The binary runs the scripted scenario below; the integration tests drive
//! `Simulation` directly.

use anyhow::{bail, Result};
use log::info;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Deserialize;

use crate::events::Operation;
use crate::network::emulator::{EmulatorConfig, NetEmulator};
use crate::network::NodeAddress;
use crate::node::{NodeConfig, PeerNode};

#[derive(Clone, Deserialize, Debug)]
pub struct SimConfig {
    pub node_count: u32,
    /// Minimum total length of the scripted scenario.
    pub ticks: u64,
    pub seed: u64,
}

pub struct Simulation {
    net: NetEmulator,
    nodes: Vec<PeerNode>,
    elapsed: u64,
}

impl Simulation {
    /// Boots `node_count` nodes with ids 1..=node_count on port 0; id 1 is
    /// the introducer.
    pub fn new(
        node_count: u32,
        node_config: NodeConfig,
        emulator_config: EmulatorConfig,
        seed: u64,
    ) -> Self {
        let mut net = NetEmulator::new(emulator_config, seed);
        let mut nodes = Vec::with_capacity(node_count as usize);
        for id in 1..=node_count {
            let addr = NodeAddress::new(id, 0);
            net.register(addr);
            nodes.push(PeerNode::new(
                addr,
                node_config.clone(),
                seed.wrapping_add(id as u64),
            ));
        }
        for node in &mut nodes {
            node.start(&mut net);
        }
        Self {
            net,
            nodes,
            elapsed: 0,
        }
    }

    pub fn net(&mut self) -> &mut NetEmulator {
        &mut self.net
    }

    pub fn elapsed(&self) -> u64 {
        self.elapsed
    }

    pub fn tick(&mut self) {
        let Self { net, nodes, .. } = self;
        for node in nodes.iter_mut() {
            node.tick(net);
        }
        self.elapsed += 1;
    }

    pub fn run(&mut self, ticks: u64) {
        for _ in 0..ticks {
            self.tick();
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &PeerNode> {
        self.nodes.iter()
    }

    pub fn live_nodes(&self) -> impl Iterator<Item = &PeerNode> {
        self.nodes.iter().filter(|n| !n.has_failed())
    }

    pub fn node(&self, id: u32) -> &PeerNode {
        self.nodes
            .iter()
            .find(|n| n.addr().id == id)
            .expect("unknown node id")
    }

    pub fn node_mut(&mut self, id: u32) -> &mut PeerNode {
        self.nodes
            .iter_mut()
            .find(|n| n.addr().id == id)
            .expect("unknown node id")
    }

    pub fn fail(&mut self, id: u32) {
        self.node_mut(id).fail();
    }

    pub fn create_from(&mut self, id: u32, key: &str, value: &str) {
        let Self { net, nodes, .. } = self;
        let node = by_id(nodes, id);
        node.create(key, value, net);
    }

    pub fn read_from(&mut self, id: u32, key: &str) {
        let Self { net, nodes, .. } = self;
        let node = by_id(nodes, id);
        node.read(key, net);
    }

    pub fn update_from(&mut self, id: u32, key: &str, value: &str) {
        let Self { net, nodes, .. } = self;
        let node = by_id(nodes, id);
        node.update(key, value, net);
    }

    pub fn delete_from(&mut self, id: u32, key: &str) {
        let Self { net, nodes, .. } = self;
        let node = by_id(nodes, id);
        node.delete(key, net);
    }
}

fn by_id(nodes: &mut [PeerNode], id: u32) -> &mut PeerNode {
    nodes
        .iter_mut()
        .find(|n| n.addr().id == id)
        .expect("unknown node id")
}

/// The scripted run behind `swimkv-node`: boot, converge, push a small CRUD
/// workload through random coordinators, kill a node, let stabilization
/// repair placement, then read everything back and report.
pub fn run_scenario(
    node_config: NodeConfig,
    emulator_config: EmulatorConfig,
    sim_config: SimConfig,
) -> Result<()> {
    if sim_config.node_count < 4 {
        bail!("the scenario needs at least four nodes to survive a failure");
    }

    let t_remove = node_config.membership.t_remove;
    let timeout = node_config.storage.transaction_timeout;
    let mut rng = StdRng::seed_from_u64(sim_config.seed);
    let mut sim = Simulation::new(
        sim_config.node_count,
        node_config,
        emulator_config,
        sim_config.seed,
    );

    info!("Booting {} nodes", sim_config.node_count);
    sim.run(2 * t_remove);
    for node in sim.nodes() {
        info!(
            "{} sees {} members",
            node.addr(),
            node.membership().members().len()
        );
    }

    let keys: Vec<String> = (0..20).map(|i| format!("key-{i}")).collect();
    info!("Creating {} keys", keys.len());
    for key in &keys {
        let coordinator = rng.gen_range(1..=sim_config.node_count);
        sim.create_from(coordinator, key, &format!("value-of-{key}"));
    }
    sim.run(timeout + 2);

    let victim = sim_config.node_count;
    info!("Failing node {victim}");
    sim.fail(victim);
    sim.run(2 * t_remove);

    info!("Reading every key back");
    for key in &keys {
        let coordinator = rng.gen_range(1..sim_config.node_count);
        sim.read_from(coordinator, key);
    }
    sim.run(timeout + 2);

    let remaining = sim_config.ticks.saturating_sub(sim.elapsed());
    sim.run(remaining);

    for op in [
        Operation::Create,
        Operation::Read,
        Operation::Update,
        Operation::Delete,
    ] {
        let ok: usize = sim
            .nodes()
            .map(|n| n.journal().count_outcomes(op, true, true))
            .sum();
        let failed: usize = sim
            .nodes()
            .map(|n| n.journal().count_outcomes(op, true, false))
            .sum();
        if ok + failed > 0 {
            info!("{op}: {ok} succeeded, {failed} failed");
        }
    }
    let stats = sim.net().stats();
    info!(
        "network: {} sent, {} delivered, {} dropped",
        stats.sent, stats.delivered, stats.dropped
    );

    Ok(())
}
