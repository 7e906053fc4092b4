//! The port-mapping capability shared by every negotiation protocol

use super::types::{IpProtocol, MappingError, MappingProtocol};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// A negotiated relationship with a NAT device.
///
/// Implementations perform blocking network I/O; async callers drive them
/// through `tokio::task::spawn_blocking`.
pub trait PortMapper: Send + Sync + std::fmt::Debug {
    /// Protocol this mapper speaks
    fn protocol(&self) -> MappingProtocol;

    /// Create or refresh a mapping for `internal_port`, returning the external port
    /// the device assigned.
    fn map_port(
        &self,
        protocol: IpProtocol,
        internal_port: u16,
        lease: Duration,
    ) -> Result<u16, MappingError>;

    /// Remove the mapping that owns `external_port`
    fn unmap_port(&self, protocol: IpProtocol, external_port: u16) -> Result<(), MappingError>;

    /// Public IP address of the NAT device
    fn external_ip(&self) -> Result<IpAddr, MappingError>;
}

/// Shared handle to a mapper, as held by selectors, listeners and renewal managers
pub type SharedMapper = Arc<dyn PortMapper>;

pub(crate) fn validate_port(port: u16) -> Result<u16, MappingError> {
    if port == 0 {
        return Err(MappingError::InvalidPort(port));
    }
    Ok(port)
}

/// Lease as whole seconds for the wire, rounded up and saturating at `u32::MAX`
///
/// Never zero: NAT-PMP reads a zero lifetime as a delete.
pub(crate) fn lease_secs(lease: Duration) -> u32 {
    let secs = lease.as_secs() + u64::from(lease.subsec_nanos() > 0);
    u32::try_from(secs).unwrap_or(u32::MAX).max(1)
}

/// Release a mapping off the async executor, logging instead of failing.
pub(crate) async fn release_mapping(mapper: SharedMapper, protocol: IpProtocol, external_port: u16) {
    let kind = mapper.protocol();
    let joined =
        tokio::task::spawn_blocking(move || mapper.unmap_port(protocol, external_port)).await;

    match joined {
        Ok(Ok(())) => tracing::debug!(
            "Released {} {} mapping for external port {}",
            kind,
            protocol,
            external_port
        ),
        Ok(Err(e)) => tracing::warn!(
            "Failed to release {} {} mapping for external port {}: {}",
            kind,
            protocol,
            external_port,
            e
        ),
        Err(e) => tracing::warn!("Unmap task join error: {}", e),
    }
}
