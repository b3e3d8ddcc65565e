//! TCP relay for established SOCKS5 tunnels
//!
//! Pumps bytes verbatim between the client and the target once the
//! handshake is complete.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Bytes moved by a finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Client to target
    pub client_to_target: u64,
    /// Target to client
    pub target_to_client: u64,
}

/// Relay data bidirectionally between the client and the target
///
/// `pending` holds client bytes that arrived during the handshake; they
/// are written to the target before anything else.
///
/// Each direction copies until its reader hits EOF and then shuts down the
/// opposite writer, so a half-close is propagated only after every byte
/// read before it has been delivered. The relay returns once both
/// directions are finished, or on the first error in either of them.
pub async fn relay_tcp<A, B>(client: A, target: B, pending: &[u8]) -> std::io::Result<RelayStats>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut target_read, mut target_write) = tokio::io::split(target);

    let client_to_target = async {
        if !pending.is_empty() {
            target_write.write_all(pending).await?;
        }
        let copied = pump(&mut client_read, &mut target_write).await?;
        debug!("Client closed its write side after {} bytes", copied);
        Ok::<u64, std::io::Error>(copied + pending.len() as u64)
    };

    let target_to_client = async {
        let copied = pump(&mut target_read, &mut client_write).await?;
        debug!("Target closed its write side after {} bytes", copied);
        Ok::<u64, std::io::Error>(copied)
    };

    let (client_to_target, target_to_client) =
        tokio::try_join!(client_to_target, target_to_client)?;

    Ok(RelayStats {
        client_to_target,
        target_to_client,
    })
}

/// Copy until EOF, then propagate the close to `writer`
async fn pump<R, W>(reader: &mut R, writer: &mut W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let copied = tokio::io::copy(reader, writer).await?;
    writer.shutdown().await?;
    Ok(copied)
}
