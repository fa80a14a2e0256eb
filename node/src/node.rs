//! One peer: the membership layer, the ring manager and the storage
//! coordinator wired together behind a single cooperative `tick()`.

use log::{info, warn};

use crate::events::EventJournal;
use crate::network::emulator::NetEmulator;
use crate::network::membership::{Membership, MembershipConfig};
use crate::network::{classify, Channel, NodeAddress};
use crate::ring::{Ring, RingConfig, RingManager};
use crate::storage::{LocalStore, StorageConfig, StorageCoordinator};

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub membership: MembershipConfig,
    pub ring: RingConfig,
    pub storage: StorageConfig,
}

pub struct PeerNode {
    addr: NodeAddress,
    failed: bool,
    journal: EventJournal,
    membership: Membership,
    ring: RingManager,
    storage: StorageCoordinator,
}

impl PeerNode {
    pub fn new(addr: NodeAddress, config: NodeConfig, seed: u64) -> Self {
        let mut journal = EventJournal::new(addr);
        let membership = Membership::new(addr, config.membership, seed, &mut journal);
        Self {
            addr,
            failed: false,
            journal,
            membership,
            ring: RingManager::new(config.ring),
            storage: StorageCoordinator::new(addr, config.storage),
        }
    }

    pub fn addr(&self) -> NodeAddress {
        self.addr
    }

    pub fn start(&mut self, net: &mut NetEmulator) {
        self.membership.start(net);
    }

    /// Marks the node crashed. It stops sending, receiving and ticking; the
    /// rest of the cluster finds out through missed heartbeats.
    pub fn fail(&mut self) {
        info!("{}: marked failed", self.addr);
        self.failed = true;
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }

    pub fn journal(&self) -> &EventJournal {
        &self.journal
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn ring(&self) -> &Ring {
        self.ring.ring()
    }

    pub fn storage(&self) -> &StorageCoordinator {
        &self.storage
    }

    pub fn store(&self) -> &LocalStore {
        self.storage.store()
    }

    pub fn store_mut(&mut self) -> &mut LocalStore {
        self.storage.store_mut()
    }

    /// One simulated time unit: drain the inbox, run the membership round,
    /// rebuild the ring, then let the storage coordinator ingest replies,
    /// expire transactions and chase any ring movement.
    pub fn tick(&mut self, net: &mut NetEmulator) {
        if self.failed {
            return;
        }

        let mut member_msgs = vec![];
        let mut storage_msgs = vec![];
        for payload in net.drain(self.addr) {
            match classify(&payload) {
                Some(Channel::Membership) => member_msgs.push(payload),
                Some(Channel::Storage) => storage_msgs.push(payload),
                None => warn!("{}: dropping unclassifiable datagram", self.addr),
            }
        }

        for payload in member_msgs {
            self.membership
                .handle_datagram(&payload, net, &mut self.journal);
        }
        self.membership.advance(net, &mut self.journal);

        self.ring.rebuild(self.membership.member_addrs());

        let now = self.membership.heartbeat();
        for payload in storage_msgs {
            self.storage
                .handle_datagram(&payload, net, &mut self.journal, now);
        }
        self.storage.expire_transactions(now, &mut self.journal);
        if let Some(change) = self.ring.take_change(self.addr) {
            self.storage
                .stabilize(self.ring.ring(), &change, net, now);
        }
    }

    /*
     * Client entry points, invoked by the driver on behalf of clients.
     */

    pub fn create(&mut self, key: &str, value: &str, net: &mut NetEmulator) {
        let now = self.membership.heartbeat();
        self.storage
            .client_create(key, value, self.ring.ring(), net, now);
    }

    pub fn read(&mut self, key: &str, net: &mut NetEmulator) {
        let now = self.membership.heartbeat();
        self.storage.client_read(key, self.ring.ring(), net, now);
    }

    pub fn update(&mut self, key: &str, value: &str, net: &mut NetEmulator) {
        let now = self.membership.heartbeat();
        self.storage
            .client_update(key, value, self.ring.ring(), net, now);
    }

    pub fn delete(&mut self, key: &str, net: &mut NetEmulator) {
        let now = self.membership.heartbeat();
        self.storage.client_delete(key, self.ring.ring(), net, now);
    }
}
