//! SOCKS5 session driver
//!
//! Runs one [`Session`] to completion on a downstream stream: reads client
//! bytes, performs the steps the session asks for and finally hands both
//! channels to the relay.

use crate::config::SocksConfig;
use crate::error::AsocksError;
use crate::socks::connector::Connector;
use crate::socks::consts::MAX_PENDING_BUFFER;
use crate::socks::session::{Session, Step};
use crate::socks::tcp_relay::relay_tcp;
use crate::socks::types::ConnectRequest;
use anyhow::{Context, Result};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info};

/// Handle SOCKS5 protocol on a stream
///
/// # Protocol Flow
///
/// 1. Method negotiation
/// 2. Request parsing
/// 3. Upstream connect through `connector`
/// 4. Relay until both directions are closed
///
/// Reading stops while a connect is outstanding except to detect the
/// client going away, which cancels the attempt. The handshake timeout
/// bounds downstream reads only; the connect wait is bounded by the
/// connector.
///
/// # Returns
///
/// Ok(()) when the session ended normally, including every case where the
/// client received an error reply. Err when the client sent something that
/// earns a bare close, timed out, or the stream failed.
pub async fn handle_socks5_on_stream<S, C>(
    mut stream: S,
    config: &SocksConfig,
    connector: &C,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    C: Connector,
{
    let mut session: Session<C::Stream> = Session::new(config.acceptable_methods());
    let mut buf = BytesMut::with_capacity(512);
    let deadline = config.handshake_timeout().map(|t| Instant::now() + t);
    let mut pending: Option<Step> = None;

    loop {
        let step = match pending.take() {
            Some(step) => step,
            None => session
                .on_bytes(&mut buf)
                .map_err(AsocksError::from)
                .with_context(|| "SOCKS5 handshake failed")?,
        };

        match step {
            Step::NeedMore => {
                let n = read_more(&mut stream, &mut buf, deadline)
                    .await
                    .with_context(|| {
                        format!("Failed to read from client in {}", session.state())
                    })?;
                if n == 0 {
                    debug!("Client closed the connection in {}", session.state());
                    session
                        .on_downstream_closed(buf.len())
                        .map_err(AsocksError::from)
                        .with_context(|| "SOCKS5 handshake failed")?;
                    return Ok(());
                }
            }
            Step::Reply(reply) => {
                if let Err(e) = write_reply(&mut stream, &reply).await {
                    session.close();
                    return Err(e).with_context(|| "Failed to send SOCKS5 reply");
                }
            }
            Step::ReplyAndRelay(reply) => {
                if let Err(e) = write_reply(&mut stream, &reply).await {
                    session.close();
                    return Err(e).with_context(|| "Failed to send SOCKS5 reply");
                }
                session.confirm_connected();
            }
            Step::ReplyAndClose(reply) => {
                if let Some(reason) = session.close_reason() {
                    info!("Rejecting SOCKS5 session: {}", reason);
                }
                write_reply(&mut stream, &reply)
                    .await
                    .with_context(|| "Failed to send SOCKS5 reply")?;
                let _ = stream.shutdown().await;
                return Ok(());
            }
            Step::Connect(request) => {
                let next =
                    connect_upstream(&mut stream, &mut buf, &mut session, connector, &request)
                        .await?;
                pending = Some(next);
            }
            Step::Relay => {
                let Some(upstream) = session.upstream_mut() else {
                    session.close();
                    return Ok(());
                };
                let early = buf.split();
                if !early.is_empty() {
                    debug!(
                        "Forwarding {} bytes received during the handshake",
                        early.len()
                    );
                }

                let result = relay_tcp(&mut stream, upstream, &early).await;
                session.on_upstream_closed();

                let stats = result.with_context(|| "TCP relay failed")?;
                info!(
                    "SOCKS5 tunnel closed ({} bytes up, {} bytes down)",
                    stats.client_to_target, stats.target_to_client
                );
                return Ok(());
            }
            Step::Close => return Ok(()),
        }
    }
}

/// Read more client bytes into `buf`, honoring the handshake deadline
async fn read_more<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    deadline: Option<Instant>,
) -> Result<usize, AsocksError>
where
    S: AsyncRead + Unpin,
{
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, stream.read_buf(buf))
            .await
            .map_err(|_| {
                AsocksError::Timeout("SOCKS5 handshake did not complete in time".to_string())
            })?
            .map_err(AsocksError::from),
        None => Ok(stream.read_buf(buf).await?),
    }
}

/// Write a reply and flush it before anything else is read
async fn write_reply<S>(stream: &mut S, reply: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(reply).await?;
    stream.flush().await
}

/// Dial the destination while watching the client
///
/// Client bytes arriving meanwhile are buffered, up to a bound, for the
/// relay. If the client closes first the connect future is dropped, which
/// abandons the attempt and releases its socket.
async fn connect_upstream<S, C>(
    stream: &mut S,
    buf: &mut BytesMut,
    session: &mut Session<C::Stream>,
    connector: &C,
    request: &ConnectRequest,
) -> Result<Step>
where
    S: AsyncRead + Unpin,
    C: Connector,
{
    let mut connect = connector.connect(request.target());

    loop {
        tokio::select! {
            result = &mut connect => return Ok(session.on_upstream_result(result)),
            read = stream.read_buf(buf), if buf.len() < MAX_PENDING_BUFFER => match read {
                Ok(0) => {
                    debug!(
                        "Client closed the connection while connecting to {}",
                        request.target()
                    );
                    session
                        .on_downstream_closed(buf.len())
                        .map_err(AsocksError::from)?;
                    return Ok(Step::Close);
                }
                Ok(n) => debug!("Buffered {} early bytes while connecting", n),
                Err(e) => {
                    session.close();
                    return Err(e)
                        .with_context(|| "Failed to read from client while connecting");
                }
            },
        }
    }
}
