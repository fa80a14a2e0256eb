//! Simulated message-passing substrate. One FIFO inbox per registered
//! address; delivery is at-most-once and may be dropped, nothing more is
//! guaranteed. The driver owns the emulator and hands it to each node tick.

use std::collections::{HashMap, VecDeque};

use log::trace;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Deserialize;

use super::NodeAddress;

#[derive(Clone, Deserialize, Debug)]
pub struct EmulatorConfig {
    pub drop_rate: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EmulatorStats {
    pub sent: u64,
    pub delivered: u64,
    pub dropped: u64,
}

pub struct NetEmulator {
    drop_rate: f64,
    inboxes: HashMap<NodeAddress, VecDeque<Vec<u8>>>,
    rng: StdRng,
    stats: EmulatorStats,
}

impl NetEmulator {
    pub fn new(config: EmulatorConfig, seed: u64) -> Self {
        Self {
            drop_rate: config.drop_rate,
            inboxes: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
            stats: EmulatorStats::default(),
        }
    }

    pub fn register(&mut self, addr: NodeAddress) {
        self.inboxes.entry(addr).or_default();
    }

    /// Lossiness can change mid-run; tests use this to cut a cluster off.
    pub fn set_drop_rate(&mut self, drop_rate: f64) {
        self.drop_rate = drop_rate;
    }

    pub fn send(&mut self, from: NodeAddress, to: NodeAddress, payload: Vec<u8>) {
        self.stats.sent += 1;
        if self.drop_rate > 0.0 && self.rng.gen::<f64>() < self.drop_rate {
            self.stats.dropped += 1;
            trace!("dropping {} byte datagram {from} -> {to}", payload.len());
            return;
        }
        match self.inboxes.get_mut(&to) {
            Some(inbox) => {
                inbox.push_back(payload);
                self.stats.delivered += 1;
            }
            None => {
                // Unregistered recipient, the payload just disappears.
                self.stats.dropped += 1;
            }
        }
    }

    pub fn drain(&mut self, addr: NodeAddress) -> Vec<Vec<u8>> {
        match self.inboxes.get_mut(&addr) {
            Some(inbox) => inbox.drain(..).collect(),
            None => vec![],
        }
    }

    pub fn stats(&self) -> EmulatorStats {
        self.stats
    }
}
