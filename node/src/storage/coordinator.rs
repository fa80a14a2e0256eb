//! Client-side coordination and server-side handling of the replicated
//! key-value protocol: per-transaction reply books with quorum decisions,
//! read-repair, timeouts, and the stabilization pushes that chase ring
//! changes.

use std::collections::BTreeMap;

use itertools::Itertools;
use log::{debug, warn};
use serde::Deserialize;

use crate::events::{EventJournal, Operation};
use crate::network::{emulator::NetEmulator, NodeAddress};
use crate::ring::{Ring, RingChange};
use crate::storage::store::{LocalStore, ReplicaRole};
use crate::storage::wire::StorageMessage;

/// Every key lives on this many successive ring nodes.
pub const REPLICA_COUNT: usize = 3;

#[derive(Clone, Deserialize, Debug)]
pub struct StorageConfig {
    /// Heartbeats before an open transaction is failed.
    pub transaction_timeout: u64,
}

/// Matching replies needed to decide a transaction with `expected` replies.
fn quorum(expected: usize) -> usize {
    (expected + 1) / 2
}

#[derive(Clone, Debug)]
struct Request {
    op: Operation,
    key: String,
    value: Option<String>,
}

#[derive(Clone, Debug)]
enum Reply {
    Ack { success: bool },
    Value { from: NodeAddress, value: String },
}

struct Transaction {
    started_at: u64,
    expected: usize,
    /// A READ logs its coordinator success as soon as two replies agree but
    /// stays open for the third; this stops the outcome being logged twice.
    logged: bool,
    request: Request,
    replies: Vec<Reply>,
}

pub struct StorageCoordinator {
    self_addr: NodeAddress,
    config: StorageConfig,
    store: LocalStore,
    transactions: BTreeMap<u64, Transaction>,
    next_trans_id: u64,
}

impl StorageCoordinator {
    pub fn new(self_addr: NodeAddress, config: StorageConfig) -> Self {
        Self {
            self_addr,
            config,
            store: LocalStore::new(),
            transactions: BTreeMap::new(),
            next_trans_id: 0,
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut LocalStore {
        &mut self.store
    }

    pub fn open_transactions(&self) -> usize {
        self.transactions.len()
    }

    fn begin(&mut self, request: Request, expected: usize, now: u64) -> u64 {
        let trans_id = self.next_trans_id;
        self.next_trans_id += 1;
        self.transactions.insert(
            trans_id,
            Transaction {
                started_at: now,
                expected,
                logged: false,
                request,
                replies: vec![],
            },
        );
        trans_id
    }

    /*
     * Client (coordinator) side
     */

    pub fn client_create(
        &mut self,
        key: &str,
        value: &str,
        ring: &Ring,
        net: &mut NetEmulator,
        now: u64,
    ) {
        self.dispatch_write(Operation::Create, key, value, ring, net, now);
    }

    pub fn client_update(
        &mut self,
        key: &str,
        value: &str,
        ring: &Ring,
        net: &mut NetEmulator,
        now: u64,
    ) {
        self.dispatch_write(Operation::Update, key, value, ring, net, now);
    }

    fn dispatch_write(
        &mut self,
        op: Operation,
        key: &str,
        value: &str,
        ring: &Ring,
        net: &mut NetEmulator,
        now: u64,
    ) {
        let request = Request {
            op,
            key: key.to_string(),
            value: Some(value.to_string()),
        };
        let trans_id = self.begin(request, REPLICA_COUNT, now);
        let Some(replicas) = ring.replicas_for(key) else {
            // Nothing to address; the transaction sits until it times out.
            debug!("{}: ring too small to place {key:?}", self.self_addr);
            return;
        };
        for (position, node) in replicas.iter().enumerate() {
            let role = ReplicaRole::of_position(position);
            let msg = match op {
                Operation::Create => StorageMessage::Create {
                    trans_id,
                    from: self.self_addr,
                    key: key.to_string(),
                    value: value.to_string(),
                    role,
                },
                Operation::Update => StorageMessage::Update {
                    trans_id,
                    from: self.self_addr,
                    key: key.to_string(),
                    value: value.to_string(),
                    role,
                },
                _ => unreachable!("dispatch_write only handles create and update"),
            };
            net.send(self.self_addr, node.addr, msg.encode());
        }
    }

    pub fn client_read(&mut self, key: &str, ring: &Ring, net: &mut NetEmulator, now: u64) {
        let request = Request {
            op: Operation::Read,
            key: key.to_string(),
            value: None,
        };
        let trans_id = self.begin(request, REPLICA_COUNT, now);
        let Some(replicas) = ring.replicas_for(key) else {
            debug!("{}: ring too small to read {key:?}", self.self_addr);
            return;
        };
        for node in replicas {
            let msg = StorageMessage::Read {
                trans_id,
                from: self.self_addr,
                key: key.to_string(),
            };
            net.send(self.self_addr, node.addr, msg.encode());
        }
    }

    pub fn client_delete(&mut self, key: &str, ring: &Ring, net: &mut NetEmulator, now: u64) {
        let request = Request {
            op: Operation::Delete,
            key: key.to_string(),
            value: None,
        };
        let trans_id = self.begin(request, REPLICA_COUNT, now);
        let Some(replicas) = ring.replicas_for(key) else {
            debug!("{}: ring too small to delete {key:?}", self.self_addr);
            return;
        };
        for node in replicas {
            let msg = StorageMessage::Delete {
                trans_id,
                from: self.self_addr,
                key: key.to_string(),
            };
            net.send(self.self_addr, node.addr, msg.encode());
        }
    }

    /*
     * Inbound messages
     */

    pub fn handle_datagram(
        &mut self,
        payload: &[u8],
        net: &mut NetEmulator,
        journal: &mut EventJournal,
        now: u64,
    ) {
        match StorageMessage::decode(payload) {
            Ok(msg) => self.handle_message(msg, net, journal, now),
            Err(err) => warn!(
                "{}: dropping malformed storage datagram: {err}",
                self.self_addr
            ),
        }
    }

    fn handle_message(
        &mut self,
        msg: StorageMessage,
        net: &mut NetEmulator,
        journal: &mut EventJournal,
        now: u64,
    ) {
        match msg {
            StorageMessage::Create {
                trans_id,
                from,
                key,
                value,
                role,
            } => {
                let success = self.store.create(&key, &value, role, now).is_ok();
                if success {
                    journal.op_success(Operation::Create, false, trans_id, &key, Some(&value));
                } else {
                    journal.op_fail(Operation::Create, false, trans_id, &key, Some(&value));
                }
                self.ack(trans_id, from, success, net);
            }
            StorageMessage::Read {
                trans_id,
                from,
                key,
            } => {
                let value = self.store.read(&key).map(|e| e.value.clone());
                match &value {
                    Some(v) => journal.op_success(Operation::Read, false, trans_id, &key, Some(v)),
                    None => journal.op_fail(Operation::Read, false, trans_id, &key, None),
                }
                let msg = StorageMessage::ReadReply {
                    trans_id,
                    from: self.self_addr,
                    value: value.unwrap_or_default(),
                };
                net.send(self.self_addr, from, msg.encode());
            }
            StorageMessage::Update {
                trans_id,
                from,
                key,
                value,
                role,
            } => {
                let success = self.store.update(&key, &value, role, now).is_ok();
                if success {
                    journal.op_success(Operation::Update, false, trans_id, &key, Some(&value));
                } else {
                    journal.op_fail(Operation::Update, false, trans_id, &key, Some(&value));
                }
                self.ack(trans_id, from, success, net);
            }
            StorageMessage::Delete {
                trans_id,
                from,
                key,
            } => {
                let success = self.store.delete(&key).is_ok();
                if success {
                    journal.op_success(Operation::Delete, false, trans_id, &key, None);
                } else {
                    journal.op_fail(Operation::Delete, false, trans_id, &key, None);
                }
                self.ack(trans_id, from, success, net);
            }
            StorageMessage::Reply {
                trans_id, success, ..
            } => self.on_reply(trans_id, Reply::Ack { success }, net, journal, now),
            StorageMessage::ReadReply {
                trans_id,
                from,
                value,
            } => self.on_reply(trans_id, Reply::Value { from, value }, net, journal, now),
        }
    }

    fn ack(&self, trans_id: u64, to: NodeAddress, success: bool, net: &mut NetEmulator) {
        let msg = StorageMessage::Reply {
            trans_id,
            from: self.self_addr,
            success,
        };
        net.send(self.self_addr, to, msg.encode());
    }

    /*
     * Quorum bookkeeping
     */

    fn on_reply(
        &mut self,
        trans_id: u64,
        reply: Reply,
        net: &mut NetEmulator,
        journal: &mut EventJournal,
        now: u64,
    ) {
        let Some(trans) = self.transactions.get_mut(&trans_id) else {
            // The transaction already decided or timed out.
            debug!("{}: dropping late reply for #{trans_id}", self.self_addr);
            return;
        };
        trans.replies.push(reply);
        if trans.replies.len() < quorum(trans.expected) {
            return;
        }
        match trans.request.op {
            Operation::Read => self.evaluate_read(trans_id, net, journal, now),
            _ => self.evaluate_write(trans_id, journal),
        }
    }

    /// CREATE, UPDATE and DELETE decide on the first reply that tips either
    /// the success or the failure count over the quorum line.
    fn evaluate_write(&mut self, trans_id: u64, journal: &mut EventJournal) {
        let trans = &self.transactions[&trans_id];
        let majority = quorum(trans.expected);
        let succ = trans
            .replies
            .iter()
            .filter(|r| matches!(r, Reply::Ack { success: true }))
            .count();
        let fail = trans
            .replies
            .iter()
            .filter(|r| matches!(r, Reply::Ack { success: false }))
            .count();
        if succ < majority && fail < majority {
            return;
        }

        let trans = self.transactions.remove(&trans_id).unwrap();
        let value = trans.request.value.as_deref();
        if succ >= majority {
            journal.op_success(trans.request.op, true, trans_id, &trans.request.key, value);
        } else {
            journal.op_fail(trans.request.op, true, trans_id, &trans.request.key, value);
        }
    }

    /// READ is decided value-wise: two matching replies log the success
    /// early (the record stays open for repair), the third reply settles
    /// repair and failure cases. Two distinct non-empty replies decide
    /// nothing; the third reply or the timeout resolves them.
    fn evaluate_read(
        &mut self,
        trans_id: u64,
        net: &mut NetEmulator,
        journal: &mut EventJournal,
        now: u64,
    ) {
        let trans = self.transactions.get_mut(&trans_id).unwrap();
        let key = trans.request.key.clone();
        let values: Vec<(NodeAddress, String)> = trans
            .replies
            .iter()
            .filter_map(|r| match r {
                Reply::Value { from, value } => Some((*from, value.clone())),
                Reply::Ack { .. } => None,
            })
            .collect();

        match values.len() {
            2 => {
                let (first, second) = (&values[0].1, &values[1].1);
                if first.is_empty() && second.is_empty() {
                    self.transactions.remove(&trans_id);
                    journal.op_fail(Operation::Read, true, trans_id, &key, None);
                } else if first == second {
                    journal.op_success(Operation::Read, true, trans_id, &key, Some(first));
                    trans.logged = true;
                }
            }
            3 => {
                let blank = values.iter().filter(|(_, v)| v.is_empty()).count();
                let tally = values
                    .iter()
                    .filter(|(_, v)| !v.is_empty())
                    .map(|(_, v)| v)
                    .counts();
                if blank > 1 || blank + tally.len() == REPLICA_COUNT {
                    // Majority of misses, or three-way disagreement.
                    self.transactions.remove(&trans_id);
                    journal.op_fail(Operation::Read, true, trans_id, &key, None);
                    return;
                }
                let value = tally
                    .into_iter()
                    .find(|(_, count)| *count >= 2)
                    .map(|(v, _)| v.clone())
                    .expect("a majority value must exist here");
                if !trans.logged {
                    journal.op_success(Operation::Read, true, trans_id, &key, Some(&value));
                }
                let dissenters: Vec<NodeAddress> = values
                    .iter()
                    .filter(|(_, v)| *v != value)
                    .map(|(from, _)| *from)
                    .collect();
                self.transactions.remove(&trans_id);
                for target in dissenters {
                    self.send_repair(target, &key, &value, net, now);
                }
            }
            _ => {}
        }
    }

    /// Read-repair: a single-target UPDATE that leaves the stored replica
    /// role untouched. It is an ordinary transaction, quorum of one.
    fn send_repair(
        &mut self,
        target: NodeAddress,
        key: &str,
        value: &str,
        net: &mut NetEmulator,
        now: u64,
    ) {
        let request = Request {
            op: Operation::Update,
            key: key.to_string(),
            value: Some(value.to_string()),
        };
        let trans_id = self.begin(request, 1, now);
        debug!(
            "{}: read-repair of {key:?} towards {target} as #{trans_id}",
            self.self_addr
        );
        let msg = StorageMessage::Update {
            trans_id,
            from: self.self_addr,
            key: key.to_string(),
            value: value.to_string(),
            role: ReplicaRole::Reserved,
        };
        net.send(self.self_addr, target, msg.encode());
    }

    /// Fails every transaction that has been open for the configured number
    /// of heartbeats. A READ that already logged its success is discarded
    /// quietly; everything else logs one coordinator-side failure.
    pub fn expire_transactions(&mut self, now: u64, journal: &mut EventJournal) {
        let expired: Vec<u64> = self
            .transactions
            .iter()
            .filter(|(_, t)| t.started_at + self.config.transaction_timeout <= now)
            .map(|(id, _)| *id)
            .collect();
        for trans_id in expired {
            let trans = self.transactions.remove(&trans_id).unwrap();
            if trans.logged {
                debug!(
                    "{}: #{trans_id} expired awaiting its repair reply",
                    self.self_addr
                );
                continue;
            }
            journal.op_fail(
                trans.request.op,
                true,
                trans_id,
                &trans.request.key,
                trans.request.value.as_deref(),
            );
        }
    }

    /*
     * Stabilization
     */

    /// Re-pushes keys to their current replica set after the ring moved.
    /// The role stored with each key decides who is responsible: the primary
    /// always pushes; a secondary or tertiary only steps up when every
    /// surviving ancestor is gone from the ring.
    pub fn stabilize(
        &mut self,
        ring: &Ring,
        change: &RingChange,
        net: &mut NetEmulator,
        now: u64,
    ) {
        if ring.len() < REPLICA_COUNT {
            return;
        }
        debug!("{}: stabilizing {} keys", self.self_addr, self.store.len());

        let old_pred = &change.old_predecessors;
        let old_succ = &change.old_successors;
        let was = |list: &[NodeAddress], i: usize, addr: NodeAddress| list.get(i) == Some(&addr);
        let alive = |list: &[NodeAddress], i: usize| {
            list.get(i).map_or(false, |addr| ring.contains(*addr))
        };

        let mut pushes: Vec<(String, String, Vec<(NodeAddress, ReplicaRole)>)> = vec![];
        let mut role_moves: Vec<(String, ReplicaRole)> = vec![];
        let mut orphaned: Vec<String> = vec![];

        for (key, entry) in self.store.iter() {
            let replicas = ring
                .replicas_for(key)
                .expect("ring has at least three nodes here");
            let targets: Vec<(NodeAddress, ReplicaRole)> = match entry.role {
                ReplicaRole::Primary => replicas
                    .iter()
                    .enumerate()
                    .filter(|(_, node)| {
                        node.addr != self.self_addr
                            && !was(old_succ, 0, node.addr)
                            && !was(old_succ, 1, node.addr)
                    })
                    .map(|(i, node)| (node.addr, ReplicaRole::of_position(i)))
                    .collect(),
                ReplicaRole::Secondary => {
                    if alive(old_pred, 1) {
                        // The old primary survived; it will re-replicate.
                        vec![]
                    } else {
                        replicas
                            .iter()
                            .enumerate()
                            .filter(|(_, node)| {
                                !was(old_pred, 1, node.addr)
                                    && node.addr != self.self_addr
                                    && !was(old_succ, 0, node.addr)
                            })
                            .map(|(i, node)| (node.addr, ReplicaRole::of_position(i)))
                            .collect()
                    }
                }
                ReplicaRole::Tertiary => {
                    if alive(old_pred, 0) || alive(old_pred, 1) {
                        // Some ancestor survived and outranks us.
                        vec![]
                    } else {
                        replicas
                            .iter()
                            .enumerate()
                            .filter(|(_, node)| {
                                !was(old_pred, 0, node.addr)
                                    && !was(old_pred, 1, node.addr)
                                    && node.addr != self.self_addr
                            })
                            .map(|(i, node)| (node.addr, ReplicaRole::of_position(i)))
                            .collect()
                    }
                }
                ReplicaRole::Reserved => unreachable!("the store never holds a reserved role"),
            };
            if !targets.is_empty() {
                pushes.push((key.clone(), entry.value.clone(), targets));
            }

            match replicas.iter().position(|n| n.addr == self.self_addr) {
                Some(position) => role_moves.push((key.clone(), ReplicaRole::of_position(position))),
                None => orphaned.push(key.clone()),
            }
        }

        for (key, value, targets) in pushes {
            let request = Request {
                op: Operation::Create,
                key: key.clone(),
                value: Some(value.clone()),
            };
            let trans_id = self.begin(request, targets.len(), now);
            for (addr, role) in targets {
                let msg = StorageMessage::Create {
                    trans_id,
                    from: self.self_addr,
                    key: key.clone(),
                    value: value.clone(),
                    role,
                };
                net.send(self.self_addr, addr, msg.encode());
            }
        }
        for (key, role) in role_moves {
            self.store.assign_role(&key, role, now);
        }
        for key in orphaned {
            debug!("{}: no longer a replica of {key:?}", self.self_addr);
            let _ = self.store.delete(&key);
        }
    }
}
