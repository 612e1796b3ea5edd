use std::fmt::{Debug, Display, Formatter};

/// A session id. It is negotiated during the handshake and doubles as the KCP conversation id,
///  so every datagram of an established session carries it in its first four bytes.
///
/// `0` is reserved for handshake datagrams and is never assigned to a session.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Sid(pub u32);

impl Sid {
    pub const HANDSHAKE: Sid = Sid(0);

    pub const SERIALIZED_LEN: usize = std::mem::size_of::<u32>();

    pub fn is_handshake(&self) -> bool {
        self.0 == 0
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    /// Reads the session id from the start of a datagram. All peers encode it little-endian,
    ///  which is also how KCP writes its conversation id.
    pub fn from_datagram(buf: &[u8]) -> Option<Sid> {
        let raw: [u8; Self::SERIALIZED_LEN] = buf.get(..Self::SERIALIZED_LEN)?
            .try_into()
            .ok()?;
        Some(Sid(u32::from_le_bytes(raw)))
    }
}

impl Display for Sid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Debug for Sid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
