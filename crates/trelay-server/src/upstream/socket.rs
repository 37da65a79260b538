//! Onward TCP connections for generic relays and cross-connect patches.

use super::{Upstream, UpstreamKind};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tracing::{debug, info};
use trelay_core::{RelayError, RelayResult};

/// Opens the onward connection for a relay request.
pub trait Dialer: Send + Sync {
    /// Connect to `dst:port`, bound to local address `src` when non-empty.
    fn dial<'a>(
        &'a self,
        src: &'a str,
        dst: &'a str,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = RelayResult<Upstream>> + Send + 'a>>;
}

/// Dials real TCP sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

impl TcpDialer {
    pub async fn connect(src: &str, dst: &str, port: u16) -> RelayResult<TcpStream> {
        let unavailable =
            |e: std::io::Error| RelayError::UpstreamUnavailable(format!("{dst}:{port}: {e}"));

        let target = lookup_host((dst, port))
            .await
            .map_err(unavailable)?
            .next()
            .ok_or_else(|| {
                RelayError::UpstreamUnavailable(format!("{dst}:{port}: no address found"))
            })?;

        let socket = if target.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(unavailable)?;

        let src = src.trim();
        if !src.is_empty() {
            let local: IpAddr = src.parse().map_err(|_| {
                RelayError::InvalidRequest(format!("relay source address '{src}' is not an IP"))
            })?;
            socket
                .bind(SocketAddr::new(local, 0))
                .map_err(|e| RelayError::UpstreamUnavailable(format!("bind {src}: {e}")))?;
            debug!(%local, "onward socket bound");
        }

        let stream = socket.connect(target).await.map_err(unavailable)?;
        info!(%target, "onward connection established");
        Ok(stream)
    }
}

impl Dialer for TcpDialer {
    fn dial<'a>(
        &'a self,
        src: &'a str,
        dst: &'a str,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = RelayResult<Upstream>> + Send + 'a>> {
        Box::pin(async move {
            let stream = Self::connect(src, dst, port).await?;
            Ok(Upstream::from_stream(UpstreamKind::Socket, stream))
        })
    }
}
