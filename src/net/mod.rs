//! NAT-aware listeners
//!
//! [`NatListener`] and [`NatPacketListener`] map a port on the router before
//! binding it locally, then keep the mapping alive until they are closed.
//! The `listen*` functions are shorthands that use the default selector
//! (UPnP first, NAT-PMP second).

pub mod addr;
mod close;
pub mod packet;
pub mod stream;

pub use addr::{NatAddr, Network};
pub use packet::{NatPacketConn, NatPacketListener};
pub use stream::{NatListener, NatStream};

use crate::connectivity::{MappingError, PortMapperSelector, SharedMapper};
use crate::Result;
use std::net::IpAddr;
use tokio_util::sync::CancellationToken;

/// Listen for TCP on `port` behind a port mapping
pub async fn listen(port: u16) -> Result<NatListener> {
    listen_with_token(port, &CancellationToken::new()).await
}

/// [`listen`] with a cancellation token for the mapping negotiation
pub async fn listen_with_token(port: u16, token: &CancellationToken) -> Result<NatListener> {
    NatListener::bind(&PortMapperSelector::default(), port, token).await
}

/// Listen for TCP on `port`, without a mapping if NAT traversal is unavailable
pub async fn listen_with_fallback(port: u16) -> Result<NatListener> {
    listen_with_fallback_token(port, &CancellationToken::new()).await
}

/// [`listen_with_fallback`] with a cancellation token
pub async fn listen_with_fallback_token(
    port: u16,
    token: &CancellationToken,
) -> Result<NatListener> {
    NatListener::bind_with_fallback(&PortMapperSelector::default(), port, token).await
}

/// Bind UDP on `port` behind a port mapping
pub async fn listen_packet(port: u16) -> Result<NatPacketListener> {
    listen_packet_with_token(port, &CancellationToken::new()).await
}

/// [`listen_packet`] with a cancellation token
pub async fn listen_packet_with_token(
    port: u16,
    token: &CancellationToken,
) -> Result<NatPacketListener> {
    NatPacketListener::bind(&PortMapperSelector::default(), port, token).await
}

/// Bind UDP on `port`, without a mapping if NAT traversal is unavailable
pub async fn listen_packet_with_fallback(port: u16) -> Result<NatPacketListener> {
    listen_packet_with_fallback_token(port, &CancellationToken::new()).await
}

/// [`listen_packet_with_fallback`] with a cancellation token
pub async fn listen_packet_with_fallback_token(
    port: u16,
    token: &CancellationToken,
) -> Result<NatPacketListener> {
    NatPacketListener::bind_with_fallback(&PortMapperSelector::default(), port, token).await
}

pub(crate) fn ensure_not_cancelled(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        return Err(MappingError::Cancelled.into());
    }
    Ok(())
}

/// Ask the router for its external IP on the blocking pool
pub(crate) async fn query_external_ip(mapper: &SharedMapper) -> Result<IpAddr> {
    let mapper = mapper.clone();
    let ip = tokio::task::spawn_blocking(move || mapper.external_ip())
        .await
        .map_err(|e| MappingError::Internal(format!("external IP task failed: {}", e)))??;
    Ok(ip)
}
