//! Per-node event journal. This is the structured record the protocols
//! report into: node add/remove observations and the per-operation
//! success/fail outcomes on both the coordinator and the replica side.
//! Every record also goes out as a debug log line.

use std::fmt::{self, Display};

use log::debug;

use crate::network::NodeAddress;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

impl Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    NodeAdded {
        peer: NodeAddress,
    },
    NodeRemoved {
        peer: NodeAddress,
    },
    OpOutcome {
        op: Operation,
        coordinator: bool,
        trans_id: u64,
        key: String,
        value: Option<String>,
        success: bool,
    },
}

pub struct EventJournal {
    owner: NodeAddress,
    events: Vec<Event>,
}

impl EventJournal {
    pub fn new(owner: NodeAddress) -> Self {
        Self {
            owner,
            events: vec![],
        }
    }

    pub fn owner(&self) -> NodeAddress {
        self.owner
    }

    pub fn node_added(&mut self, peer: NodeAddress) {
        debug!("{}: added {peer} to member list", self.owner);
        self.events.push(Event::NodeAdded { peer });
    }

    pub fn node_removed(&mut self, peer: NodeAddress) {
        debug!("{}: removed {peer} from member list", self.owner);
        self.events.push(Event::NodeRemoved { peer });
    }

    pub fn op_success(
        &mut self,
        op: Operation,
        coordinator: bool,
        trans_id: u64,
        key: &str,
        value: Option<&str>,
    ) {
        self.outcome(op, coordinator, trans_id, key, value, true);
    }

    pub fn op_fail(
        &mut self,
        op: Operation,
        coordinator: bool,
        trans_id: u64,
        key: &str,
        value: Option<&str>,
    ) {
        self.outcome(op, coordinator, trans_id, key, value, false);
    }

    fn outcome(
        &mut self,
        op: Operation,
        coordinator: bool,
        trans_id: u64,
        key: &str,
        value: Option<&str>,
        success: bool,
    ) {
        let side = if coordinator { "coordinator" } else { "replica" };
        let verdict = if success { "ok" } else { "failed" };
        debug!(
            "{}: {side} {op} #{trans_id} key={key:?} value={value:?} {verdict}",
            self.owner
        );
        self.events.push(Event::OpOutcome {
            op,
            coordinator,
            trans_id,
            key: key.to_string(),
            value: value.map(str::to_string),
            success,
        });
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn additions_of(&self, peer: NodeAddress) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, Event::NodeAdded { peer: p } if *p == peer))
            .count()
    }

    pub fn removals_of(&self, peer: NodeAddress) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, Event::NodeRemoved { peer: p } if *p == peer))
            .count()
    }

    pub fn op_outcomes(&self, op: Operation, coordinator: bool) -> impl Iterator<Item = &Event> {
        self.events.iter().filter(move |e| {
            matches!(e, Event::OpOutcome { op: o, coordinator: c, .. }
                if *o == op && *c == coordinator)
        })
    }

    pub fn count_outcomes(&self, op: Operation, coordinator: bool, success: bool) -> usize {
        self.op_outcomes(op, coordinator)
            .filter(|e| matches!(e, Event::OpOutcome { success: s, .. } if *s == success))
            .count()
    }
}
