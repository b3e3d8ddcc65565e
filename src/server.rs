//! TCP listener
//!
//! Accepts downstream connections and runs one SOCKS5 session per
//! connection on its own task.

use crate::config::Config;
use crate::error::AsocksError;
use crate::socks::{handle_socks5_on_stream, Connector};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// SOCKS5 server bound to a local address
pub struct Server<C: Connector> {
    /// Server configuration
    config: Config,
    /// Bound listener
    listener: TcpListener,
    /// Dial service shared by all sessions
    connector: Arc<C>,
    /// One permit per concurrent session
    sessions: Arc<Semaphore>,
}

impl<C: Connector> Server<C> {
    /// Bind the listener described by `config.server`
    ///
    /// The configuration is validated before anything is bound.
    pub async fn bind(config: Config, connector: C) -> Result<Self> {
        config
            .validate()
            .map_err(AsocksError::Config)
            .context("Invalid configuration")?;
        let addr = config.server.socket_addr().map_err(AsocksError::Config)?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        let sessions = Arc::new(Semaphore::new(config.server.max_sessions));

        Ok(Server {
            config,
            listener,
            connector: Arc::new(connector),
            sessions,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Number of sessions currently running
    pub fn active_sessions(&self) -> usize {
        self.config.server.max_sessions - self.sessions.available_permits()
    }

    /// Accept connections until shutdown
    ///
    /// A permit is taken before each accept, so at most `max_sessions`
    /// connections are held; further clients wait in the kernel backlog.
    /// Sessions already running are left to finish on their own.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<bool>) -> Result<()> {
        info!("Listening on {}", self.local_addr()?);
        info!(
            "Accepting up to {} concurrent sessions",
            self.config.server.max_sessions
        );

        let base_delay = Duration::from_millis(10);
        let max_delay = Duration::from_secs(1);
        let mut failures: u32 = 0;

        loop {
            let permit = tokio::select! {
                permit = self.sessions.clone().acquire_owned() => {
                    permit.context("Session limiter closed")?
                }
                _ = shutdown_rx.recv() => break,
            };

            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown_rx.recv() => break,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => {
                    failures = 0;
                    accepted
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let backoff = base_delay * 2u32.saturating_pow(failures - 1);
                    let delay = std::cmp::min(backoff, max_delay);
                    error!("Accept failed: {}. Retrying in {:?}", e, delay);
                    drop(permit);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            debug!("Accepted connection from {}", peer);
            if let Err(e) = stream.set_nodelay(self.config.tcp.nodelay) {
                warn!("Failed to set TCP_NODELAY on {}: {}", peer, e);
            }

            let connector = self.connector.clone();
            let socks = self.config.socks.clone();
            tokio::spawn(
                async move {
                    let _permit = permit;
                    let result = handle_socks5_on_stream(stream, &socks, connector.as_ref()).await;
                    if let Err(e) = result {
                        warn!("Session error: {:#}", e);
                    }
                    debug!("Session finished");
                }
                .instrument(info_span!("session", %peer)),
            );
        }

        info!("Server stopped, {} sessions still running", self.active_sessions());
        Ok(())
    }
}
