//! CONNECT tunnel relay
//!
//! Copies bytes between the upgraded client connection and a TCP stream
//! opened from the chosen uplink. No TLS is terminated here.

use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::{FusionError, Result};

/// Handles CONNECT tunnels
pub struct TunnelHandler;

impl TunnelHandler {
    /// Wait for the client upgrade, then relay until both sides close or the
    /// session is cancelled
    pub async fn relay(
        on_upgrade: OnUpgrade,
        server: TcpStream,
        cancel: CancellationToken,
    ) -> Result<(u64, u64)> {
        let upgraded = tokio::select! {
            _ = cancel.cancelled() => return Err(FusionError::Cancelled),
            upgraded = on_upgrade => upgraded.map_err(|e| {
                FusionError::Http(format!("CONNECT upgrade failed: {}", e))
            })?,
        };

        Self::pipe(TokioIo::new(upgraded), server, &cancel).await
    }

    /// Copy both directions until each side has shut down
    ///
    /// Returns `(client -> server, server -> client)` byte counts.
    #[instrument(skip_all)]
    pub async fn pipe<C, S>(
        mut client: C,
        mut server: S,
        cancel: &CancellationToken,
    ) -> Result<(u64, u64)>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Tunnel cut by shutdown");
                Err(FusionError::Cancelled)
            }
            copied = tokio::io::copy_bidirectional(&mut client, &mut server) => {
                let (sent, received) = copied?;
                debug!(bytes_sent = sent, bytes_received = received, "Tunnel closed");
                Ok((sent, received))
            }
        }
    }
}
