use std::fmt::{self, Display};
use std::str::FromStr;

use thiserror::Error;

pub mod emulator;
pub mod membership;

/// A peer in the cluster. `id` doubles as the sort key of the membership
/// list; the pair is the node's identity everywhere, including on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeAddress {
    pub id: u32,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(id: u32, port: u16) -> Self {
        Self { id, port }
    }

    /// Position of this node on the consistent-hash ring. All nodes must
    /// agree on this value for the same address, so it hashes the dotted
    /// string form with a stable hash rather than anything platform-local.
    pub fn ring_position(&self, ring_size: u64) -> u64 {
        ring_position(&self.to_string(), ring_size)
    }
}

impl Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.id.to_le_bytes();
        write!(f, "{}.{}.{}.{}:{}", b[0], b[1], b[2], b[3], self.port)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid node address: {0}")]
pub struct AddressParseError(String);

impl FromStr for NodeAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || AddressParseError(s.to_string());
        let (quad, port) = s.split_once(':').ok_or_else(bad)?;
        let port = port.parse::<u16>().map_err(|_| bad())?;
        let mut bytes = [0u8; 4];
        let mut parts = quad.split('.');
        for byte in bytes.iter_mut() {
            *byte = parts
                .next()
                .and_then(|p| p.parse::<u8>().ok())
                .ok_or_else(bad)?;
        }
        if parts.next().is_some() {
            return Err(bad());
        }
        Ok(NodeAddress {
            id: u32::from_le_bytes(bytes),
            port,
        })
    }
}

/// Stable position of an arbitrary string (a key or an address) on the ring.
pub fn ring_position(s: &str, ring_size: u64) -> u64 {
    (stable_hash::fast_stable_hash(&s.to_string()) % ring_size as u128) as u64
}

/// The two protocol families share one inbox per node, so inbound datagrams
/// are classified by their first byte: membership messages start with a
/// small binary tag, storage messages with the ASCII transaction id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    Membership,
    Storage,
}

pub fn classify(payload: &[u8]) -> Option<Channel> {
    match payload.first().copied() {
        Some(tag) if membership::wire::is_wire_tag(tag) => Some(Channel::Membership),
        Some(b'0'..=b'9') => Some(Channel::Storage),
        _ => None,
    }
}
