//! Gossip-based membership with heartbeat failure detection. Each node
//! keeps a flat member list; heartbeats are monotone per-owner counters, so
//! merging out-of-order gossip is safe. A peer that stays silent for
//! `t_fail` heartbeats is suspected (dropped from gossip), and evicted from
//! the list after `t_remove`.

pub mod wire;

use log::{debug, warn};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::Deserialize;

use crate::events::EventJournal;
use crate::network::{emulator::NetEmulator, NodeAddress};

use wire::{MemberMessage, PeerHeartbeat};

/// Well-known address every node joins through.
pub const INTRODUCER: NodeAddress = NodeAddress { id: 1, port: 0 };

#[derive(Clone, Deserialize, Debug)]
pub struct MembershipConfig {
    /// Heartbeats of silence before a peer is suspected.
    pub t_fail: u64,
    /// Heartbeats of silence before a suspected peer is evicted.
    pub t_remove: u64,
    /// Random gossip targets contacted per tick.
    pub gossip_fanout: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemberEntry {
    pub addr: NodeAddress,
    /// Latest heartbeat the owner of this entry has reported.
    pub heartbeat: u64,
    /// Our local heartbeat when `heartbeat` last advanced.
    pub last_seen: u64,
}

pub struct Membership {
    self_addr: NodeAddress,
    config: MembershipConfig,
    heartbeat: u64,
    in_group: bool,
    members: Vec<MemberEntry>,
    rng: StdRng,
}

impl Membership {
    pub fn new(
        self_addr: NodeAddress,
        config: MembershipConfig,
        seed: u64,
        journal: &mut EventJournal,
    ) -> Self {
        journal.node_added(self_addr);
        Self {
            self_addr,
            config,
            heartbeat: 0,
            in_group: false,
            members: vec![MemberEntry {
                addr: self_addr,
                heartbeat: 0,
                last_seen: 0,
            }],
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn heartbeat(&self) -> u64 {
        self.heartbeat
    }

    pub fn in_group(&self) -> bool {
        self.in_group
    }

    pub fn members(&self) -> &[MemberEntry] {
        &self.members
    }

    pub fn member_addrs(&self) -> impl Iterator<Item = NodeAddress> + '_ {
        self.members.iter().map(|e| e.addr)
    }

    pub fn entry(&self, addr: NodeAddress) -> Option<&MemberEntry> {
        self.members.iter().find(|e| e.addr == addr)
    }

    /// Bootstraps group membership. The introducer starts the group on its
    /// own; everybody else asks the introducer to be let in.
    pub fn start(&mut self, net: &mut NetEmulator) {
        if self.self_addr == INTRODUCER {
            debug!("{}: booting the group", self.self_addr);
            self.in_group = true;
        } else {
            debug!("{}: requesting to join via {INTRODUCER}", self.self_addr);
            let req = MemberMessage::JoinReq(PeerHeartbeat {
                addr: self.self_addr,
                heartbeat: self.heartbeat,
            });
            net.send(self.self_addr, INTRODUCER, req.encode());
        }
    }

    pub fn handle_datagram(
        &mut self,
        payload: &[u8],
        net: &mut NetEmulator,
        journal: &mut EventJournal,
    ) {
        match MemberMessage::decode(payload) {
            Ok(msg) => self.handle_message(msg, net, journal),
            Err(err) => warn!(
                "{}: dropping malformed membership datagram: {err}",
                self.self_addr
            ),
        }
    }

    fn handle_message(
        &mut self,
        msg: MemberMessage,
        net: &mut NetEmulator,
        journal: &mut EventJournal,
    ) {
        match msg {
            MemberMessage::JoinReq(peer) => {
                // Hand the joiner our entire view, one JOINREP per entry,
                // then merge the joiner itself like any other gossip.
                for entry in &self.members {
                    let rep = MemberMessage::JoinRep(PeerHeartbeat {
                        addr: entry.addr,
                        heartbeat: entry.heartbeat,
                    });
                    net.send(self.self_addr, peer.addr, rep.encode());
                }
                self.merge(peer, journal);
            }
            MemberMessage::JoinRep(peer) => {
                if !self.in_group {
                    debug!("{}: joined the group", self.self_addr);
                    self.in_group = true;
                }
                self.merge(peer, journal);
            }
            MemberMessage::GossipHb(peer) => self.merge(peer, journal),
        }
    }

    /// Gossip ingest. Heartbeats only ever move forward; stale or equal
    /// values are dropped so reordered gossip cannot resurrect staleness.
    fn merge(&mut self, peer: PeerHeartbeat, journal: &mut EventJournal) {
        match self.members.iter_mut().find(|e| e.addr == peer.addr) {
            Some(entry) => {
                if peer.heartbeat > entry.heartbeat {
                    entry.heartbeat = peer.heartbeat;
                    entry.last_seen = self.heartbeat;
                }
            }
            None => {
                self.members.push(MemberEntry {
                    addr: peer.addr,
                    heartbeat: peer.heartbeat,
                    last_seen: self.heartbeat,
                });
                journal.node_added(peer.addr);
            }
        }
    }

    /// One protocol round: age the view, evict the long-silent, refresh our
    /// own entry and gossip the healthy part of the view to a few random
    /// healthy peers.
    pub fn advance(&mut self, net: &mut NetEmulator, journal: &mut EventJournal) {
        if !self.in_group {
            return;
        }
        self.heartbeat += 1;
        let hb = self.heartbeat;
        self.members.sort_by_key(|e| e.addr);

        // The comparisons keep the silence thresholds on the `last_seen`
        // side so early ticks (hb < t_remove) cannot underflow.
        let t_fail = self.config.t_fail;
        let t_remove = self.config.t_remove;
        let (kept, evicted): (Vec<_>, Vec<_>) = self
            .members
            .drain(..)
            .partition(|e| e.last_seen + t_remove >= hb);
        for entry in evicted {
            journal.node_removed(entry.addr);
        }
        self.members = kept;

        if let Some(me) = self.members.iter_mut().find(|e| e.addr == self.self_addr) {
            me.heartbeat = hb;
            me.last_seen = hb;
        }

        // Suspected entries are kept in the view but neither gossiped about
        // nor gossiped to.
        let healthy: Vec<PeerHeartbeat> = self
            .members
            .iter()
            .filter(|e| e.last_seen + t_fail >= hb)
            .map(|e| PeerHeartbeat {
                addr: e.addr,
                heartbeat: e.heartbeat,
            })
            .collect();
        let candidates: Vec<NodeAddress> = healthy
            .iter()
            .map(|p| p.addr)
            .filter(|a| *a != self.self_addr)
            .collect();
        for target in candidates.choose_multiple(&mut self.rng, self.config.gossip_fanout) {
            for peer in &healthy {
                net.send(
                    self.self_addr,
                    *target,
                    MemberMessage::GossipHb(*peer).encode(),
                );
            }
        }
    }
}
