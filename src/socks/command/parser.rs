//! SOCKS5 command parser
//!
//! Decodes CONNECT requests from the session's receive buffer.

use crate::error::Socks5Error;
use crate::socks::consts::*;
use crate::socks::types::{ConnectRequest, SocksCommand, TargetAddr};
use bytes::{Buf, BytesMut};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Parse a SOCKS5 request from the front of `buf`
///
/// # SOCKS5 Request Format
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
///
/// Returns `Ok(None)` until the whole request is buffered. The command and
/// address type are rejected as soon as the header is available, without
/// waiting for the address bytes. On success the request is consumed from
/// `buf`; anything after it is left for the relay.
///
/// Domain names are returned unresolved.
pub fn parse_command(buf: &mut BytesMut) -> Result<Option<ConnectRequest>, Socks5Error> {
    if buf.len() < REQUEST_HEADER_LEN {
        // Reject a bad version byte early, it is the first thing we see
        if let Some(&version) = buf.first() {
            if version != SOCKS5_VERSION {
                return Err(Socks5Error::UnsupportedVersion(version));
            }
        }
        return Ok(None);
    }

    let version = buf[0];
    let cmd_byte = buf[1];
    let _reserved = buf[2];
    let addr_type = buf[3];

    if version != SOCKS5_VERSION {
        return Err(Socks5Error::UnsupportedVersion(version));
    }

    match SocksCommand::from_byte(cmd_byte) {
        Some(SocksCommand::Connect) => {}
        _ => return Err(Socks5Error::CommandNotSupported(cmd_byte)),
    }

    let body = &buf[REQUEST_HEADER_LEN..];
    let Some((target, addr_len)) = parse_address(addr_type, body)? else {
        return Ok(None);
    };

    buf.advance(REQUEST_HEADER_LEN + addr_len);

    tracing::debug!("Parsed SOCKS5 command: CONNECT to {}", target);

    Ok(Some(ConnectRequest::new(target)))
}

/// Parse `DST.ADDR DST.PORT` for the given address type
///
/// Returns the address and the number of bytes it spans, or `None` if
/// `src` is still too short.
fn parse_address(addr_type: u8, src: &[u8]) -> Result<Option<(TargetAddr, usize)>, Socks5Error> {
    match addr_type {
        SOCKS5_ADDR_TYPE_IPV4 => {
            let Some(raw) = src.first_chunk::<{ 4 + 2 }>() else {
                return Ok(None);
            };
            let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
            let port = u16::from_be_bytes([raw[4], raw[5]]);

            Ok(Some((TargetAddr::ipv4(ip, port), 4 + 2)))
        }

        SOCKS5_ADDR_TYPE_DOMAIN => {
            let Some(&len) = src.first() else {
                return Ok(None);
            };
            let domain_len = len as usize;

            if domain_len == 0 {
                return Err(Socks5Error::MalformedRequest(
                    "empty domain name".to_string(),
                ));
            }

            let total = 1 + domain_len + 2;
            if src.len() < total {
                return Ok(None);
            }

            let domain = std::str::from_utf8(&src[1..1 + domain_len])
                .map_err(|_| {
                    Socks5Error::MalformedRequest("domain name is not valid UTF-8".to_string())
                })?
                .to_owned();
            let port = u16::from_be_bytes([src[1 + domain_len], src[2 + domain_len]]);

            Ok(Some((TargetAddr::domain(domain, port), total)))
        }

        SOCKS5_ADDR_TYPE_IPV6 => {
            let Some(raw) = src.first_chunk::<{ 16 + 2 }>() else {
                return Ok(None);
            };
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&raw[..16]);
            let port = u16::from_be_bytes([raw[16], raw[17]]);

            Ok(Some((TargetAddr::ipv6(Ipv6Addr::from(octets), port), 16 + 2)))
        }

        _ => Err(Socks5Error::AddressTypeNotSupported(addr_type)),
    }
}
