//! Upstream connector
//!
//! Dials the destination of a CONNECT request without blocking the calling
//! session. Failures come back as a typed [`ConnectError`] that maps to a
//! single SOCKS5 reply code.

use crate::config::{Config, TcpConfig};
use crate::error::ConnectError;
use crate::socks::types::TargetAddr;
use async_trait::async_trait;
use std::fmt::Debug;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Dial service used by sessions to reach their destination
#[async_trait]
pub trait Connector: Debug + Send + Sync + 'static {
    /// The upstream channel produced on success
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Connect to `target`, resolving domain names as needed
    async fn connect(&self, target: &TargetAddr) -> Result<Self::Stream, ConnectError>;
}

/// Socket options applied to upstream connections
#[derive(Debug, Clone)]
pub struct SocketOpts {
    /// Enable TCP_NODELAY
    pub nodelay: bool,
    /// TCP keepalive timeout
    pub keepalive_secs: Option<u64>,
    /// TCP keepalive interval
    pub keepalive_interval: Option<u64>,
}

impl Default for SocketOpts {
    fn default() -> Self {
        SocketOpts::from_tcp_config(&TcpConfig::default())
    }
}

impl SocketOpts {
    /// Create socket options from TCP config
    pub fn from_tcp_config(config: &TcpConfig) -> Self {
        SocketOpts {
            nodelay: config.nodelay,
            keepalive_secs: Some(config.keepalive_secs),
            keepalive_interval: Some(config.keepalive_interval),
        }
    }

    /// Apply socket options to a TCP stream
    pub fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;

        if let (Some(timeout), Some(interval)) = (self.keepalive_secs, self.keepalive_interval) {
            let socket = socket2::SockRef::from(stream);
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(Duration::from_secs(timeout))
                .with_interval(Duration::from_secs(interval));
            socket.set_tcp_keepalive(&keepalive)?;
        }

        Ok(())
    }
}

/// Plain TCP connector
#[derive(Debug, Clone)]
pub struct TcpConnector {
    /// Socket options to apply to connections
    socket_opts: SocketOpts,
    /// Bound on resolution plus connect
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Create a connector with default options
    pub fn with_defaults() -> Self {
        TcpConnector {
            socket_opts: SocketOpts::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Create a connector from the server configuration
    pub fn from_config(config: &Config) -> Self {
        TcpConnector {
            socket_opts: SocketOpts::from_tcp_config(&config.tcp),
            connect_timeout: config.socks.connect_timeout(),
        }
    }

    /// Set socket options
    pub fn with_socket_opts(mut self, opts: SocketOpts) -> Self {
        self.socket_opts = opts;
        self
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn resolve(&self, target: &TargetAddr) -> Result<Vec<SocketAddr>, ConnectError> {
        let addrs: Vec<SocketAddr> = match target {
            TargetAddr::Ip(addr) => vec![*addr],
            TargetAddr::Domain(domain, port) => tokio::net::lookup_host((domain.as_str(), *port))
                .await
                .map_err(|source| ConnectError::Resolve {
                    target: target.to_string(),
                    source,
                })?
                .collect(),
        };

        if addrs.is_empty() {
            return Err(ConnectError::NoAddresses(target.to_string()));
        }
        Ok(addrs)
    }

    /// Try each resolved address in order; the last failure is reported
    async fn connect_any(&self, target: &TargetAddr) -> Result<TcpStream, ConnectError> {
        let mut last_err = None;

        for addr in self.resolve(target).await? {
            debug!("Connecting to target: {}", addr);
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }

        Err(ConnectError::Io {
            target: target.to_string(),
            source: last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::NotConnected)),
        })
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, target: &TargetAddr) -> Result<TcpStream, ConnectError> {
        let stream = tokio::time::timeout(self.connect_timeout, self.connect_any(target))
            .await
            .map_err(|_| ConnectError::Timeout {
                target: target.to_string(),
                after: self.connect_timeout,
            })??;

        if let Err(e) = self.socket_opts.apply(&stream) {
            warn!("Failed to apply socket options: {}", e);
        }

        debug!("TCP connection established to {}", target);

        Ok(stream)
    }
}
