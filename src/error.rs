//! Error types for Asocks
//!
//! This module defines the error taxonomy of the SOCKS5 engine and the
//! mapping from upstream connection failures to SOCKS5 reply codes.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Main error type for Asocks operations
#[derive(Error, Debug)]
pub enum AsocksError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// SOCKS5 protocol error
    #[error("SOCKS5 error: {0}")]
    Socks5(#[from] Socks5Error),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),
}

/// SOCKS5 protocol errors
///
/// Each variant fixes what the downstream peer sees: either a reply code
/// followed by a close, or a bare close.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Socks5Error {
    /// Wrong version byte; closed without reply
    #[error("Unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),

    /// Truncated or structurally invalid message; closed without reply
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// No offered method is acceptable; replied with `05 FF`
    #[error("No acceptable authentication method")]
    NoAcceptableMethod,

    /// Selected method needs a sub-negotiation this server does not implement
    #[error("Authentication method not supported: {0:#04x}")]
    AuthMethodNotSupported(u8),

    /// Replied with COMMAND_NOT_SUPPORTED
    #[error("Command not supported: {0}")]
    CommandNotSupported(u8),

    /// Replied with ADDRESS_TYPE_NOT_SUPPORTED
    #[error("Address type not supported: {0}")]
    AddressTypeNotSupported(u8),

    /// Replied with the mapped failure code
    #[error("Upstream connect failed: {0:?}")]
    UpstreamConnect(Socks5ReplyCode),

    /// Input arrived after the session was torn down
    #[error("Session closed")]
    SessionClosed,
}

/// Failures reported by the upstream connector
#[derive(Error, Debug)]
pub enum ConnectError {
    /// DNS lookup failed
    #[error("Failed to resolve {target}: {source}")]
    Resolve {
        /// Requested destination
        target: String,
        /// Underlying resolver error
        source: io::Error,
    },

    /// DNS lookup returned nothing
    #[error("No addresses found for {0}")]
    NoAddresses(String),

    /// TCP connect failed
    #[error("Failed to connect to {target}: {source}")]
    Io {
        /// Requested destination
        target: String,
        /// Underlying socket error
        source: io::Error,
    },

    /// Connect attempt did not finish in time
    #[error("Connection to {target} timed out after {after:?}")]
    Timeout {
        /// Requested destination
        target: String,
        /// Configured connect timeout
        after: Duration,
    },
}

impl ConnectError {
    /// Map this failure to exactly one SOCKS5 reply code
    pub fn reply_code(&self) -> Socks5ReplyCode {
        match self {
            ConnectError::Io { source, .. } => Socks5ReplyCode::from(source),
            ConnectError::Timeout { .. } => Socks5ReplyCode::TtlExpired,
            ConnectError::Resolve { .. } | ConnectError::NoAddresses(_) => {
                Socks5ReplyCode::GeneralFailure
            }
        }
    }
}

/// Reply codes for SOCKS5 protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Socks5ReplyCode {
    /// Command succeeded
    Succeeded = 0x00,
    /// General SOCKS server failure
    GeneralFailure = 0x01,
    /// Connection not allowed by ruleset
    ConnectionNotAllowed = 0x02,
    /// Network unreachable
    NetworkUnreachable = 0x03,
    /// Host unreachable
    HostUnreachable = 0x04,
    /// Connection refused
    ConnectionRefused = 0x05,
    /// TTL expired
    TtlExpired = 0x06,
    /// Command not supported
    CommandNotSupported = 0x07,
    /// Address type not supported
    AddressTypeNotSupported = 0x08,
}

impl From<Socks5ReplyCode> for u8 {
    fn from(code: Socks5ReplyCode) -> Self {
        code as u8
    }
}

impl TryFrom<u8> for Socks5ReplyCode {
    type Error = Socks5Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Socks5ReplyCode::Succeeded),
            0x01 => Ok(Socks5ReplyCode::GeneralFailure),
            0x02 => Ok(Socks5ReplyCode::ConnectionNotAllowed),
            0x03 => Ok(Socks5ReplyCode::NetworkUnreachable),
            0x04 => Ok(Socks5ReplyCode::HostUnreachable),
            0x05 => Ok(Socks5ReplyCode::ConnectionRefused),
            0x06 => Ok(Socks5ReplyCode::TtlExpired),
            0x07 => Ok(Socks5ReplyCode::CommandNotSupported),
            0x08 => Ok(Socks5ReplyCode::AddressTypeNotSupported),
            _ => Err(Socks5Error::MalformedRequest(format!(
                "unknown reply code {:#04x}",
                value
            ))),
        }
    }
}

impl From<&io::Error> for Socks5ReplyCode {
    fn from(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Socks5ReplyCode::ConnectionRefused,
            io::ErrorKind::HostUnreachable => Socks5ReplyCode::HostUnreachable,
            io::ErrorKind::NetworkUnreachable => Socks5ReplyCode::NetworkUnreachable,
            io::ErrorKind::TimedOut => Socks5ReplyCode::TtlExpired,
            _ => Socks5ReplyCode::GeneralFailure,
        }
    }
}
