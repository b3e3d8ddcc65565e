//! Server configuration types
//!
//! Defines the configuration structures for the Asocks server.

use crate::socks::{AuthMethod, AuthMethods};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Default listen address
fn default_listen_addr() -> String {
    "127.0.0.1".to_string()
}

/// Default listen port
fn default_listen_port() -> u16 {
    1080
}

/// Default maximum number of concurrent sessions
fn default_max_sessions() -> usize {
    1024
}

/// Root configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// SOCKS5 protocol configuration
    #[serde(default)]
    pub socks: SocksConfig,

    /// Upstream socket options
    #[serde(default)]
    pub tcp: TcpConfig,
}

impl Config {
    /// Validate every section
    pub fn validate(&self) -> Result<(), String> {
        self.server.validate()?;
        self.socks.validate()?;
        Ok(())
    }
}

/// Listener configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    /// Address to listen on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Port to listen on
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Maximum number of concurrent sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
            max_sessions: default_max_sessions(),
        }
    }
}

impl ServerConfig {
    /// Socket address to bind
    pub fn socket_addr(&self) -> Result<SocketAddr, String> {
        let ip: IpAddr = self
            .listen_addr
            .parse()
            .map_err(|e| format!("Invalid listen address {:?}: {}", self.listen_addr, e))?;
        Ok(SocketAddr::new(ip, self.listen_port))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        self.socket_addr()?;
        if self.max_sessions == 0 {
            return Err("max_sessions must be greater than zero".to_string());
        }
        if self.max_sessions > Semaphore::MAX_PERMITS {
            return Err(format!(
                "max_sessions must not exceed {}",
                Semaphore::MAX_PERMITS
            ));
        }
        Ok(())
    }
}

/// Default authentication methods
fn default_auth_methods() -> Vec<AuthMethod> {
    vec![AuthMethod::None]
}

/// Default connect timeout in seconds
fn default_connect_timeout() -> u64 {
    10
}

/// Default handshake timeout in seconds
fn default_handshake_timeout() -> u64 {
    30
}

/// SOCKS5 protocol configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SocksConfig {
    /// Acceptable authentication method codes
    #[serde(default = "default_auth_methods")]
    pub auth_methods: Vec<AuthMethod>,

    /// Upstream connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Negotiation and request timeout in seconds (0 disables)
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,
}

impl Default for SocksConfig {
    fn default() -> Self {
        SocksConfig {
            auth_methods: default_auth_methods(),
            connect_timeout: default_connect_timeout(),
            handshake_timeout: default_handshake_timeout(),
        }
    }
}

impl SocksConfig {
    /// Acceptable methods as consulted by the session
    pub fn acceptable_methods(&self) -> AuthMethods {
        AuthMethods::new(self.auth_methods.clone())
    }

    /// Upstream connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Handshake timeout, if enabled
    pub fn handshake_timeout(&self) -> Option<Duration> {
        (self.handshake_timeout > 0).then(|| Duration::from_secs(self.handshake_timeout))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.auth_methods.is_empty() {
            return Err("At least one authentication method must be configured".to_string());
        }
        if let Some(method) = self.auth_methods.iter().find(|m| !m.is_implemented()) {
            return Err(format!("Authentication method {} is not supported", method));
        }
        if self.connect_timeout == 0 {
            return Err("connect_timeout must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Default keepalive seconds
fn default_keepalive_secs() -> u64 {
    20
}

/// Default keepalive interval
fn default_keepalive_interval() -> u64 {
    8
}

/// Default TCP_NODELAY setting
fn default_nodelay() -> bool {
    true
}

/// Upstream TCP socket options
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TcpConfig {
    /// Enable TCP_NODELAY
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,

    /// TCP keepalive timeout in seconds
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// TCP keepalive interval in seconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            nodelay: default_nodelay(),
            keepalive_secs: default_keepalive_secs(),
            keepalive_interval: default_keepalive_interval(),
        }
    }
}
