//! # Asocks - SOCKS5 proxy engine
//!
//! Asocks implements the per-connection side of a SOCKS5 server (RFC 1928):
//! method negotiation, CONNECT request handling, upstream dialing with
//! failure-to-reply-code mapping, and a bidirectional byte relay.
//!
//! ## Features
//!
//! - **IO-free session**: the protocol state machine performs no IO and is
//!   driven by readiness events
//! - **Non-blocking connect**: the upstream dial never stalls other sessions
//!   and is abandoned as soon as the client goes away
//! - **Pipelining**: bytes sent by the client ahead of the handshake replies
//!   are kept and delivered to the target
//! - **Half-close aware relay**: each direction is closed independently
//!
//! ## Usage
//!
//! ```rust,ignore
//! use asocks::config::load_config;
//! use asocks::socks::TcpConnector;
//! use asocks::Server;
//! use tokio::sync::broadcast;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("asocks.toml")?;
//!     let connector = TcpConnector::from_config(&config);
//!     let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
//!
//!     Server::bind(config, connector).await?.run(shutdown_rx).await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! SOCKS5 Client -> Server (accept) -> Session driver -> Connector -> Target
//!                                          \______ relay ______/
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod server;
pub mod socks;

// Re-export commonly used items
pub use config::{load_config, Config};
pub use error::{AsocksError, ConnectError, Socks5Error, Socks5ReplyCode};
pub use server::Server;

/// Version of the Asocks library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
