//! SOCKS5 method negotiation
//!
//! Decodes the client's method-selection message, picks a method from the
//! configured acceptable set and encodes the server's selection reply.
//!
//! ```text
//! +----+----------+----------+        +----+--------+
//! |VER | NMETHODS | METHODS  |        |VER | METHOD |
//! +----+----------+----------+        +----+--------+
//! | 1  |    1     | 1 to 255 |        | 1  |   1    |
//! +----+----------+----------+        +----+--------+
//! ```

use super::consts::*;
use crate::error::Socks5Error;
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Authentication method codes known to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AuthMethod {
    /// No authentication required
    None,
    /// GSSAPI
    Gssapi,
    /// Username/password (RFC 1929)
    Password,
}

impl AuthMethod {
    /// Convert to SOCKS5 method byte
    pub fn to_byte(self) -> u8 {
        match self {
            AuthMethod::None => SOCKS5_AUTH_METHOD_NONE,
            AuthMethod::Gssapi => SOCKS5_AUTH_METHOD_GSSAPI,
            AuthMethod::Password => SOCKS5_AUTH_METHOD_PASSWORD,
        }
    }

    /// Parse from SOCKS5 method byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            SOCKS5_AUTH_METHOD_NONE => Some(AuthMethod::None),
            SOCKS5_AUTH_METHOD_GSSAPI => Some(AuthMethod::Gssapi),
            SOCKS5_AUTH_METHOD_PASSWORD => Some(AuthMethod::Password),
            _ => None,
        }
    }

    /// Whether selecting this method starts a method-specific sub-negotiation
    pub fn requires_subnegotiation(self) -> bool {
        !matches!(self, AuthMethod::None)
    }

    /// Whether the session state machine can complete this method
    pub fn is_implemented(self) -> bool {
        !self.requires_subnegotiation()
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::None => write!(f, "NO AUTH"),
            AuthMethod::Gssapi => write!(f, "GSSAPI"),
            AuthMethod::Password => write!(f, "USERNAME/PASSWORD"),
        }
    }
}

impl TryFrom<u8> for AuthMethod {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        AuthMethod::from_byte(value)
            .ok_or_else(|| format!("unknown authentication method {:#04x}", value))
    }
}

impl From<AuthMethod> for u8 {
    fn from(method: AuthMethod) -> Self {
        method.to_byte()
    }
}

/// The server's acceptable authentication methods
///
/// Injected from configuration and consulted during negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthMethods {
    accepted: Vec<AuthMethod>,
}

impl AuthMethods {
    /// Accept exactly the given methods
    pub fn new(accepted: Vec<AuthMethod>) -> Self {
        AuthMethods { accepted }
    }

    /// Accept only "no authentication required"
    pub fn no_auth() -> Self {
        AuthMethods::new(vec![AuthMethod::None])
    }

    /// Whether `method` is acceptable
    pub fn accepts(&self, method: AuthMethod) -> bool {
        self.accepted.contains(&method)
    }

    /// Pick the first client-offered code that is also acceptable
    pub fn select(&self, offered: &[u8]) -> Option<AuthMethod> {
        offered
            .iter()
            .filter_map(|&code| AuthMethod::from_byte(code))
            .find(|method| self.accepts(*method))
    }
}

impl Default for AuthMethods {
    fn default() -> Self {
        AuthMethods::no_auth()
    }
}

/// A decoded method-selection message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRequest {
    /// Method codes in client-offered order
    pub methods: Vec<u8>,
}

/// Decode a method-selection message from the front of `buf`
///
/// Returns `Ok(None)` while the message is incomplete; the buffer is only
/// advanced once the whole message is available.
pub fn decode_method_request(buf: &mut BytesMut) -> Result<Option<MethodRequest>, Socks5Error> {
    let Some(&version) = buf.first() else {
        return Ok(None);
    };

    if version != SOCKS5_VERSION {
        return Err(Socks5Error::UnsupportedVersion(version));
    }

    let Some(&nmethods) = buf.get(1) else {
        return Ok(None);
    };

    let total = 2 + nmethods as usize;
    if buf.len() < total {
        return Ok(None);
    }

    buf.advance(2);
    let methods = buf.split_to(nmethods as usize).to_vec();

    tracing::trace!("Method request: nmethods={}, methods={:02x?}", nmethods, methods);

    Ok(Some(MethodRequest { methods }))
}

/// Encode the server's selection; `None` encodes "no acceptable methods"
pub fn encode_method_reply(method: Option<AuthMethod>) -> Bytes {
    let code = method
        .map(AuthMethod::to_byte)
        .unwrap_or(SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE);
    Bytes::copy_from_slice(&[SOCKS5_VERSION, code])
}
