//! Test utilities for Asocks
//!
//! This module provides common test utilities used across integration tests.

#![allow(dead_code)]

use asocks::config::Config;
use asocks::socks::TcpConnector;
use asocks::Server;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Create a test TCP listener on an available port
pub async fn create_test_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Address on loopback with nothing listening
pub async fn closed_port_addr() -> SocketAddr {
    let (listener, addr) = create_test_listener().await;
    drop(listener);
    addr
}

/// Start a TCP echo server
///
/// Each connection echoes until the peer half-closes, then closes its own
/// write side.
pub async fn spawn_echo_server() -> SocketAddr {
    let (listener, addr) = create_test_listener().await;

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });

    addr
}

/// A running server and the handles needed to stop it
pub struct TestServer {
    /// Bound listener address
    pub addr: SocketAddr,
    /// Shutdown trigger
    pub shutdown_tx: broadcast::Sender<bool>,
    /// Server task
    pub handle: JoinHandle<anyhow::Result<()>>,
}

/// Bind and run a server on an ephemeral loopback port
pub async fn start_server(config: Config) -> TestServer {
    let connector = TcpConnector::from_config(&config);
    let server = Server::bind(config, connector).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(server.run(shutdown_rx));

    TestServer {
        addr,
        shutdown_tx,
        handle,
    }
}

/// Test configuration builder
pub struct TestConfigBuilder {
    max_sessions: usize,
    connect_timeout: u64,
    handshake_timeout: u64,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        TestConfigBuilder {
            max_sessions: 16,
            connect_timeout: 5,
            handshake_timeout: 5,
        }
    }
}

impl TestConfigBuilder {
    /// Create a new test config builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the session limit
    pub fn max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Set the connect timeout in seconds
    pub fn connect_timeout(mut self, secs: u64) -> Self {
        self.connect_timeout = secs;
        self
    }

    /// Set the handshake timeout in seconds
    pub fn handshake_timeout(mut self, secs: u64) -> Self {
        self.handshake_timeout = secs;
        self
    }

    /// Build the configuration, listening on an ephemeral port
    pub fn build(self) -> Config {
        let mut config = Config::default();
        config.server.listen_port = 0;
        config.server.max_sessions = self.max_sessions;
        config.socks.connect_timeout = self.connect_timeout;
        config.socks.handshake_timeout = self.handshake_timeout;
        config
    }
}

/// Perform greeting and CONNECT, returning the stream and the request reply
pub async fn socks5_connect(proxy: SocketAddr, request: &[u8]) -> (TcpStream, [u8; 10]) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(&socks5_mock::create_auth_request_no_auth())
        .await
        .unwrap();

    let mut method_reply = [0u8; 2];
    stream.read_exact(&mut method_reply).await.unwrap();
    assert_eq!(method_reply, [0x05, 0x00]);

    stream.write_all(request).await.unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();

    (stream, reply)
}

/// Mock SOCKS5 handshake data
pub mod socks5_mock {
    use asocks::socks::*;
    use std::net::SocketAddr;

    /// Create a no-auth method selection request
    pub fn create_auth_request_no_auth() -> Vec<u8> {
        vec![SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_NONE]
    }

    /// Create a password auth method selection request
    pub fn create_auth_request_password() -> Vec<u8> {
        vec![SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_PASSWORD]
    }

    /// Create a connect command to a socket address
    pub fn create_connect(addr: SocketAddr) -> Vec<u8> {
        ConnectRequest::new(TargetAddr::from(addr)).to_bytes()
    }

    /// Create a connect command to domain
    pub fn create_connect_domain(domain: &str, port: u16) -> Vec<u8> {
        ConnectRequest::new(TargetAddr::domain(domain, port)).to_bytes()
    }

    /// Create a request with an arbitrary command byte
    pub fn create_command(cmd: u8, addr: SocketAddr) -> Vec<u8> {
        let mut request = create_connect(addr);
        request[1] = cmd;
        request
    }

    /// The success reply every CONNECT gets
    pub const SUCCESS_REPLY: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_test_listener() {
        let (listener, addr) = create_test_listener().await;
        assert!(addr.port() > 0);
        drop(listener);
    }

    #[tokio::test]
    async fn test_echo_server() {
        let addr = spawn_echo_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_config_builder() {
        let config = TestConfigBuilder::new().max_sessions(2).connect_timeout(1).build();

        assert_eq!(config.server.listen_port, 0);
        assert_eq!(config.server.max_sessions, 2);
        assert_eq!(config.socks.connect_timeout, 1);
    }

    #[test]
    fn test_socks5_mock_connect_ipv4() {
        let cmd = socks5_mock::create_connect("192.168.1.1:8080".parse().unwrap());
        assert_eq!(cmd[0], 5); // SOCKS5 version
        assert_eq!(cmd[1], 1); // CONNECT
        assert_eq!(cmd[3], 1); // IPv4
        assert_eq!(&cmd[4..8], &[192, 168, 1, 1]);
        assert_eq!(&cmd[8..], &[0x1F, 0x90]);
    }
}
