//! Wire format of the SID negotiation.
//!
//! Before a session exists, both peers put the reserved session id `0` into the first four
//!  bytes of a datagram:
//!
//! ```ascii
//! client -> server   probe:  0: sid (u32 LE) = 0
//! server -> client   reply:  0: sid (u32 LE) = 0
//!                            4: newly assigned sid (u32 LE)
//! ```
//!
//! The server does not create a session when it replies. The session comes into existence on
//!  the server when the first datagram carrying the assigned sid arrives, which is the client's
//!  confirmation that it accepted the assignment.
//!
//! Once established, every datagram starts with the (non-zero) sid because KCP writes its
//!  conversation id there. Both ends use little-endian, which is KCP's own encoding.

use bytes::{Buf, BufMut, BytesMut};

use crate::sid::Sid;

pub const PROBE: [u8; Sid::SERIALIZED_LEN] = [0; Sid::SERIALIZED_LEN];

pub const REPLY_LEN: usize = 2 * Sid::SERIALIZED_LEN;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DatagramKind {
    Handshake,
    Session(Sid),
}

/// Decides whether a datagram belongs to the handshake or to an established session. Returns
///  `None` for datagrams too short to carry a session id.
pub fn classify(buf: &[u8]) -> Option<DatagramKind> {
    let sid = Sid::from_datagram(buf)?;
    if sid.is_handshake() {
        Some(DatagramKind::Handshake)
    }
    else {
        Some(DatagramKind::Session(sid))
    }
}

pub fn encode_reply(assigned: Sid) -> BytesMut {
    let mut buf = BytesMut::with_capacity(REPLY_LEN);
    buf.put_u32_le(Sid::HANDSHAKE.to_raw());
    buf.put_u32_le(assigned.to_raw());
    buf
}

/// Extracts the assigned sid from a server reply. A truncated reply or one that assigns the
///  reserved id `0` is a protocol violation and yields `None`.
pub fn parse_reply(mut buf: &[u8]) -> Option<Sid> {
    if buf.len() < REPLY_LEN {
        return None;
    }
    if buf.get_u32_le() != Sid::HANDSHAKE.to_raw() {
        return None;
    }
    let assigned = Sid(buf.get_u32_le());
    if assigned.is_handshake() {
        return None;
    }
    Some(assigned)
}
