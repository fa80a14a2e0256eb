//! Fixed-size binary codec for the membership protocol. Every message is a
//! one-byte type tag followed by a 6-byte little-endian address, one padding
//! byte and a little-endian u64 heartbeat. A membership dump is one message
//! per peer.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use crate::network::NodeAddress;

pub const TAG_JOINREQ: u8 = 1;
pub const TAG_JOINREP: u8 = 2;
pub const TAG_GOSSIPHB: u8 = 3;

pub const WIRE_LEN: usize = 16;

pub(crate) fn is_wire_tag(byte: u8) -> bool {
    (TAG_JOINREQ..=TAG_GOSSIPHB).contains(&byte)
}

/// The (address, heartbeat) pair every membership message carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerHeartbeat {
    pub addr: NodeAddress,
    pub heartbeat: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemberMessage {
    JoinReq(PeerHeartbeat),
    JoinRep(PeerHeartbeat),
    GossipHb(PeerHeartbeat),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("membership message has {0} bytes, expected {WIRE_LEN}")]
    BadLength(usize),
    #[error("unknown membership message tag {0}")]
    UnknownTag(u8),
}

pub type Result<T> = std::result::Result<T, WireError>;

impl MemberMessage {
    pub fn peer(&self) -> PeerHeartbeat {
        match self {
            MemberMessage::JoinReq(p) | MemberMessage::JoinRep(p) | MemberMessage::GossipHb(p) => {
                *p
            }
        }
    }

    fn tag(&self) -> u8 {
        match self {
            MemberMessage::JoinReq(_) => TAG_JOINREQ,
            MemberMessage::JoinRep(_) => TAG_JOINREP,
            MemberMessage::GossipHb(_) => TAG_GOSSIPHB,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let peer = self.peer();
        let mut buf = BytesMut::with_capacity(WIRE_LEN);
        buf.put_u8(self.tag());
        buf.put_u32_le(peer.addr.id);
        buf.put_u16_le(peer.addr.port);
        buf.put_u8(0);
        buf.put_u64_le(peer.heartbeat);
        buf.to_vec()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() != WIRE_LEN {
            return Err(WireError::BadLength(payload.len()));
        }
        let mut buf = payload;
        let tag = buf.get_u8();
        let id = buf.get_u32_le();
        let port = buf.get_u16_le();
        buf.advance(1);
        let peer = PeerHeartbeat {
            addr: NodeAddress::new(id, port),
            heartbeat: buf.get_u64_le(),
        };
        match tag {
            TAG_JOINREQ => Ok(MemberMessage::JoinReq(peer)),
            TAG_JOINREP => Ok(MemberMessage::JoinRep(peer)),
            TAG_GOSSIPHB => Ok(MemberMessage::GossipHb(peer)),
            other => Err(WireError::UnknownTag(other)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    fn sample() -> PeerHeartbeat {
        PeerHeartbeat {
            addr: NodeAddress::new(7, 42),
            heartbeat: 0x0102_0304_0506_0708,
        }
    }

    #[test]
    fn roundtrip_all_tags() {
        for msg in [
            MemberMessage::JoinReq(sample()),
            MemberMessage::JoinRep(sample()),
            MemberMessage::GossipHb(sample()),
        ] {
            let bytes = msg.encode();
            assert_eq!(bytes.len(), WIRE_LEN);
            assert_eq!(MemberMessage::decode(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn layout_is_fixed() {
        let bytes = MemberMessage::GossipHb(PeerHeartbeat {
            addr: NodeAddress::new(1, 0),
            heartbeat: 9,
        })
        .encode();
        assert_eq!(
            bytes,
            vec![TAG_GOSSIPHB, 1, 0, 0, 0, 0, 0, 0, 9, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn rejects_bad_input() {
        let bytes = MemberMessage::JoinReq(sample()).encode();
        assert_matches!(
            MemberMessage::decode(&bytes[..WIRE_LEN - 1]),
            Err(WireError::BadLength(15))
        );

        let mut bytes = bytes;
        bytes[0] = 99;
        assert_matches!(MemberMessage::decode(&bytes), Err(WireError::UnknownTag(99)));
    }
}
