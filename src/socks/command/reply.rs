//! SOCKS5 reply builder
//!
//! Constructs SOCKS5 reply messages.

use crate::error::Socks5ReplyCode;
use crate::socks::consts::*;
use crate::socks::types::TargetAddr;
use bytes::{BufMut, Bytes, BytesMut};

/// A SOCKS5 reply
///
/// # SOCKS5 Reply Format
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
///
/// The server does not track the upstream socket's local binding, so the
/// bound address is always `0.0.0.0:0`. Clients must not rely on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    code: Socks5ReplyCode,
}

impl Reply {
    /// Reply with the given status code
    pub fn new(code: Socks5ReplyCode) -> Self {
        Reply { code }
    }

    /// Success reply
    pub fn success() -> Self {
        Reply::new(Socks5ReplyCode::Succeeded)
    }

    /// Encode into wire bytes
    pub fn encode(&self) -> Bytes {
        let bound = TargetAddr::default();
        let mut buf = BytesMut::with_capacity(3 + bound.encoded_len());
        buf.put_u8(SOCKS5_VERSION);
        buf.put_u8(self.code.into());
        buf.put_u8(SOCKS5_RESERVED);
        bound.encode(&mut buf);
        buf.freeze()
    }
}
