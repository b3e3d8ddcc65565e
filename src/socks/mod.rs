//! SOCKS5 module for Asocks
//!
//! This module implements the per-connection SOCKS5 engine: method
//! negotiation, CONNECT request handling, the upstream connector and the
//! TCP relay. The protocol itself lives in the IO-free [`Session`]; the
//! [`handle_socks5_on_stream`] driver runs it on any async stream.

mod auth;
mod command;
mod connector;
mod consts;
mod handler;
mod session;
mod tcp_relay;
mod types;

pub use auth::{decode_method_request, encode_method_reply, AuthMethod, AuthMethods, MethodRequest};
pub use command::{parse_command, Reply};
pub use connector::{Connector, SocketOpts, TcpConnector};
pub use consts::*;
pub use handler::handle_socks5_on_stream;
pub use session::{Session, SessionState, Step};
pub use tcp_relay::{relay_tcp, RelayStats};
pub use types::{ConnectRequest, SocksCommand, TargetAddr};
