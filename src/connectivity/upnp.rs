//! UPnP IGD (Internet Gateway Device) port mapping implementation
//!
//! This module provides port mapping through UPnP (Universal Plug and Play),
//! which uses SSDP (Simple Service Discovery Protocol) to discover IGD devices
//! on the local network, then uses SOAP to communicate with the gateway.
//!
//! UPnP finds the router on its own, so it never needs gateway discovery.
//!
//! When the router refuses the same-port request, the port it grants instead is
//! remembered per `(protocol, internal port)`. Renewals re-request that port, so
//! an any-port grant stays stable across renewals instead of leaking a fresh
//! mapping on every tick.

use super::gateway::local_ipv4;
use super::mapper::{lease_secs, validate_port, PortMapper};
use super::types::{IpProtocol, MappingError, MappingProtocol};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Description attached to every mapping we create
const MAPPING_DESCRIPTION: &str = "natlink";

fn to_igd_protocol(protocol: IpProtocol) -> igd_next::PortMappingProtocol {
    match protocol {
        IpProtocol::TCP => igd_next::PortMappingProtocol::TCP,
        IpProtocol::UDP => igd_next::PortMappingProtocol::UDP,
    }
}

/// Why an `AddPortMapping` request failed
#[derive(Debug)]
pub(crate) enum AddPortFailure {
    /// The external port belongs to another mapping
    PortInUse,
    Other(MappingError),
}

/// The IGD control actions the mapper needs
pub(crate) trait IgdClient: Send + Sync {
    /// Control endpoint, for logs
    fn addr(&self) -> SocketAddr;

    fn add_port(
        &self,
        protocol: IpProtocol,
        external_port: u16,
        local_addr: SocketAddr,
        lifetime_secs: u32,
    ) -> Result<(), AddPortFailure>;

    fn add_any_port(
        &self,
        protocol: IpProtocol,
        local_addr: SocketAddr,
        lifetime_secs: u32,
    ) -> Result<u16, MappingError>;

    fn remove_port(&self, protocol: IpProtocol, external_port: u16) -> Result<(), MappingError>;

    fn external_ip(&self) -> Result<IpAddr, MappingError>;
}

impl IgdClient for igd_next::Gateway {
    fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn add_port(
        &self,
        protocol: IpProtocol,
        external_port: u16,
        local_addr: SocketAddr,
        lifetime_secs: u32,
    ) -> Result<(), AddPortFailure> {
        igd_next::Gateway::add_port(
            self,
            to_igd_protocol(protocol),
            external_port,
            local_addr,
            lifetime_secs,
            MAPPING_DESCRIPTION,
        )
        .map_err(|e| match e {
            igd_next::AddPortError::PortInUse => AddPortFailure::PortInUse,
            e => AddPortFailure::Other(MappingError::GatewayError(format!(
                "AddPortMapping failed: {}",
                e
            ))),
        })
    }

    fn add_any_port(
        &self,
        protocol: IpProtocol,
        local_addr: SocketAddr,
        lifetime_secs: u32,
    ) -> Result<u16, MappingError> {
        igd_next::Gateway::add_any_port(
            self,
            to_igd_protocol(protocol),
            local_addr,
            lifetime_secs,
            MAPPING_DESCRIPTION,
        )
        .map_err(|e| MappingError::GatewayError(format!("AddAnyPortMapping failed: {}", e)))
    }

    fn remove_port(&self, protocol: IpProtocol, external_port: u16) -> Result<(), MappingError> {
        igd_next::Gateway::remove_port(self, to_igd_protocol(protocol), external_port)
            .map_err(|e| MappingError::GatewayError(format!("DeletePortMapping failed: {}", e)))
    }

    fn external_ip(&self) -> Result<IpAddr, MappingError> {
        self.get_external_ip()
            .map_err(|e| MappingError::GatewayError(format!("GetExternalIPAddress failed: {}", e)))
    }
}

/// Port mapper backed by a discovered UPnP internet gateway
pub struct UpnpMapper {
    gateway: Box<dyn IgdClient>,
    local_ip: Ipv4Addr,
    /// (protocol, internal port) -> external port granted by the router
    granted: Mutex<HashMap<(IpProtocol, u16), u16>>,
}

impl std::fmt::Debug for UpnpMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpnpMapper")
            .field("gateway", &self.gateway.addr())
            .field("local_ip", &self.local_ip)
            .finish()
    }
}

impl UpnpMapper {
    /// Search the local network for an IGD device
    pub fn discover(timeout: Duration) -> Result<Self, MappingError> {
        debug!("Searching for UPnP IGD gateway...");
        let gateway = igd_next::search_gateway(igd_next::SearchOptions {
            timeout: Some(timeout),
            ..Default::default()
        })
        .map_err(|e| {
            debug!("UPnP gateway search failed: {}", e);
            MappingError::NoGateway
        })?;

        info!("Found UPnP gateway at {}", gateway.addr);
        Ok(Self::with_client(Box::new(gateway), local_ipv4()?))
    }

    pub(crate) fn with_client(gateway: Box<dyn IgdClient>, local_ip: Ipv4Addr) -> Self {
        Self {
            gateway,
            local_ip,
            granted: Mutex::new(HashMap::new()),
        }
    }

    /// External port last granted for `internal_port`, if any
    pub(crate) fn granted_port(&self, protocol: IpProtocol, internal_port: u16) -> Option<u16> {
        self.granted.lock().get(&(protocol, internal_port)).copied()
    }
}

impl PortMapper for UpnpMapper {
    fn protocol(&self) -> MappingProtocol {
        MappingProtocol::UPnP
    }

    fn map_port(
        &self,
        protocol: IpProtocol,
        internal_port: u16,
        lease: Duration,
    ) -> Result<u16, MappingError> {
        validate_port(internal_port)?;
        let lifetime_secs = lease_secs(lease);
        let local_addr = SocketAddr::new(IpAddr::V4(self.local_ip), internal_port);

        // Re-assert the port we hold; the same port on a first request
        let previous = self.granted_port(protocol, internal_port);
        let wanted = previous.unwrap_or(internal_port);

        debug!(
            "Adding UPnP port mapping: {} -> {} ({}s, {})",
            wanted, local_addr, lifetime_secs, protocol
        );

        let added = self
            .gateway
            .add_port(protocol, wanted, local_addr, lifetime_secs);
        let external_port = match added {
            Ok(()) => wanted,
            Err(AddPortFailure::PortInUse) => {
                debug!("UPnP external port {} in use, requesting any free port", wanted);
                self.gateway
                    .add_any_port(protocol, local_addr, lifetime_secs)
                    .inspect_err(|e| warn!("UPnP AddAnyPortMapping failed: {}", e))?
            }
            Err(AddPortFailure::Other(e)) => {
                warn!("UPnP AddPortMapping failed: {}", e);
                return Err(e);
            }
        };

        // Losing the remembered port means another host holds it now; leave it alone
        if let Some(old) = previous.filter(|old| *old != external_port) {
            debug!("UPnP external port moved: {} -> {}", old, external_port);
        }
        self.granted
            .lock()
            .insert((protocol, internal_port), external_port);

        info!(
            "UPnP mapping successful: {} -> {} (lifetime: {}s)",
            external_port, local_addr, lifetime_secs
        );
        Ok(external_port)
    }

    fn unmap_port(&self, protocol: IpProtocol, external_port: u16) -> Result<(), MappingError> {
        validate_port(external_port)?;

        self.gateway.remove_port(protocol, external_port)?;
        self.granted
            .lock()
            .retain(|(p, _), granted| !(*p == protocol && *granted == external_port));

        info!(
            "UPnP mapping deleted for external port {} ({})",
            external_port, protocol
        );
        Ok(())
    }

    fn external_ip(&self) -> Result<IpAddr, MappingError> {
        self.gateway.external_ip()
    }
}
