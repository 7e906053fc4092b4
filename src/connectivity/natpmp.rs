//! NAT-PMP (NAT Port Mapping Protocol) implementation - RFC 6886
//!
//! NAT-PMP is a legacy protocol supported by older routers, particularly Apple AirPort
//! devices and some Cisco routers. It provides a simple mechanism for creating port
//! mappings on NAT gateways.
//!
//! # Protocol Overview
//!
//! NAT-PMP uses UDP on port 5351 to communicate with the gateway. It supports:
//! - External IP address requests
//! - UDP port mappings
//! - TCP port mappings
//!
//! Unlike UPnP there is no discovery broadcast: requests go straight to the default
//! gateway, which is resolved with [`discover_gateway`].

use super::gateway::discover_gateway;
use super::mapper::{lease_secs, validate_port, PortMapper};
use super::types::{IpProtocol, MappingError, MappingProtocol};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;
use tracing::{debug, info};

/// NAT-PMP server port (IANA assigned)
const NATPMP_SERVER_PORT: u16 = 5351;

/// NAT-PMP protocol version
pub(crate) const NATPMP_VERSION: u8 = 0;

/// Opcode bit set on every server response
const RESPONSE_BIT: u8 = 128;

/// NAT-PMP opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum NatPmpOpcode {
    /// External address request
    ExternalAddress = 0,
    /// UDP port mapping
    MapUdp = 1,
    /// TCP port mapping
    MapTcp = 2,
}

impl NatPmpOpcode {
    fn for_protocol(protocol: IpProtocol) -> Self {
        match protocol {
            IpProtocol::UDP => Self::MapUdp,
            IpProtocol::TCP => Self::MapTcp,
        }
    }
}

/// NAT-PMP result codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub(crate) enum NatPmpResultCode {
    Success = 0,
    UnsupportedVersion = 1,
    NotAuthorized = 2,
    NetworkFailure = 3,
    OutOfResources = 4,
    UnsupportedOpcode = 5,
}

impl NatPmpResultCode {
    pub(crate) fn from_u16(code: u16) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::UnsupportedVersion),
            2 => Some(Self::NotAuthorized),
            3 => Some(Self::NetworkFailure),
            4 => Some(Self::OutOfResources),
            5 => Some(Self::UnsupportedOpcode),
            _ => None,
        }
    }

    pub(crate) fn to_error_message(&self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::UnsupportedVersion => "Unsupported NAT-PMP version",
            Self::NotAuthorized => "Not authorized/refused",
            Self::NetworkFailure => "Network failure",
            Self::OutOfResources => "Out of resources",
            Self::UnsupportedOpcode => "Unsupported opcode",
        }
    }
}

/// Decoded MAP response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NatPmpMapResponse {
    pub(crate) epoch_secs: u32,
    pub(crate) internal_port: u16,
    pub(crate) external_port: u16,
    pub(crate) lifetime_secs: u32,
}

/// Port mapper talking NAT-PMP to the default gateway
#[derive(Debug)]
pub struct NatPmpMapper {
    gateway: SocketAddr,
    timeout: Duration,
    /// external port -> internal port, needed to address deletions
    mappings: Mutex<HashMap<(IpProtocol, u16), u16>>,
}

impl NatPmpMapper {
    /// Resolve the gateway and confirm it answers NAT-PMP
    pub fn discover(timeout: Duration) -> Result<Self, MappingError> {
        let gateway = discover_gateway()?;
        debug!("Probing NAT-PMP on gateway {}", gateway);

        let mapper = Self::with_gateway(gateway, timeout);
        let external_ip = mapper.request_external_address()?;
        info!(
            "NAT-PMP gateway {} reachable (external address {})",
            gateway, external_ip
        );

        Ok(mapper)
    }

    /// Build a mapper for a known gateway without probing it
    pub fn with_gateway(gateway: Ipv4Addr, timeout: Duration) -> Self {
        Self::with_server(SocketAddr::new(IpAddr::V4(gateway), NATPMP_SERVER_PORT), timeout)
    }

    /// Mapper for a NAT-PMP server on a non-standard address
    pub(crate) fn with_server(server: SocketAddr, timeout: Duration) -> Self {
        Self {
            gateway: server,
            timeout,
            mappings: Mutex::new(HashMap::new()),
        }
    }

    /// Gateway this mapper sends requests to
    pub fn gateway(&self) -> SocketAddr {
        self.gateway
    }

    /// External port currently held for `internal_port`
    pub(crate) fn tracked_external_port(
        &self,
        protocol: IpProtocol,
        internal_port: u16,
    ) -> Option<u16> {
        self.mappings
            .lock()
            .iter()
            .find(|((p, _), internal)| *p == protocol && **internal == internal_port)
            .map(|((_, external), _)| *external)
    }

    /// Number of mappings this mapper is tracking
    #[cfg(test)]
    pub(crate) fn tracked_mappings(&self) -> usize {
        self.mappings.lock().len()
    }

    /// Send one request and wait for the reply
    fn exchange(&self, request: &[u8], response_buf: &mut [u8]) -> Result<usize, MappingError> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_read_timeout(Some(self.timeout))?;
        socket.set_write_timeout(Some(self.timeout))?;

        socket.send_to(request, self.gateway)?;
        debug!("Sent {} byte NAT-PMP request to {}", request.len(), self.gateway);

        let (bytes_received, _) = socket.recv_from(response_buf).map_err(|e| {
            if matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) {
                MappingError::Timeout
            } else {
                MappingError::Io(e)
            }
        })?;

        debug!("Received {} bytes from NAT-PMP server", bytes_received);
        Ok(bytes_received)
    }

    fn request_external_address(&self) -> Result<Ipv4Addr, MappingError> {
        let request = [NATPMP_VERSION, NatPmpOpcode::ExternalAddress as u8];
        let mut response_buf = [0u8; 12];
        let received = self.exchange(&request, &mut response_buf)?;
        parse_external_address_response(&response_buf[..received])
    }

    fn request_mapping(
        &self,
        protocol: IpProtocol,
        internal_port: u16,
        suggested_external_port: u16,
        lifetime_secs: u32,
    ) -> Result<NatPmpMapResponse, MappingError> {
        let request =
            build_natpmp_map_request(internal_port, suggested_external_port, lifetime_secs, protocol);
        let mut response_buf = [0u8; 16];
        let received = self.exchange(&request, &mut response_buf)?;
        parse_natpmp_map_response(&response_buf[..received], protocol)
    }
}

impl PortMapper for NatPmpMapper {
    fn protocol(&self) -> MappingProtocol {
        MappingProtocol::NATPMP
    }

    fn map_port(
        &self,
        protocol: IpProtocol,
        internal_port: u16,
        lease: Duration,
    ) -> Result<u16, MappingError> {
        validate_port(internal_port)?;
        let lifetime_secs = lease_secs(lease);

        info!(
            "Requesting NAT-PMP mapping for port {} (lifetime: {}s, protocol: {})",
            internal_port, lifetime_secs, protocol
        );

        // Suggest the port we already hold so a renewal keeps it
        let suggested = self
            .tracked_external_port(protocol, internal_port)
            .unwrap_or(internal_port);
        let response = self.request_mapping(protocol, internal_port, suggested, lifetime_secs)?;
        debug!("NAT-PMP server epoch: {}s", response.epoch_secs);
        {
            let mut mappings = self.mappings.lock();
            mappings.retain(|(p, _), internal| !(*p == protocol && *internal == internal_port));
            mappings.insert((protocol, response.external_port), internal_port);
        }

        info!(
            "NAT-PMP mapping successful: {} -> {} (lifetime: {}s)",
            response.internal_port, response.external_port, response.lifetime_secs
        );
        Ok(response.external_port)
    }

    fn unmap_port(&self, protocol: IpProtocol, external_port: u16) -> Result<(), MappingError> {
        validate_port(external_port)?;
        let internal_port = self
            .mappings
            .lock()
            .get(&(protocol, external_port))
            .copied()
            .unwrap_or(external_port);

        // A lifetime of zero with external port zero deletes the mapping
        self.request_mapping(protocol, internal_port, 0, 0)?;
        self.mappings.lock().remove(&(protocol, external_port));

        info!(
            "NAT-PMP mapping deleted for external port {} ({})",
            external_port, protocol
        );
        Ok(())
    }

    fn external_ip(&self) -> Result<IpAddr, MappingError> {
        self.request_external_address().map(IpAddr::V4)
    }
}

/// Build a NAT-PMP MAP request packet
pub(crate) fn build_natpmp_map_request(
    internal_port: u16,
    suggested_external_port: u16,
    lifetime_secs: u32,
    protocol: IpProtocol,
) -> Vec<u8> {
    let mut request = Vec::with_capacity(12); // NAT-PMP MAP request is 12 bytes

    request.push(NATPMP_VERSION);
    request.push(NatPmpOpcode::for_protocol(protocol) as u8);

    // Reserved (2 bytes, must be zero)
    request.extend_from_slice(&[0u8; 2]);

    request.extend_from_slice(&internal_port.to_be_bytes());
    request.extend_from_slice(&suggested_external_port.to_be_bytes());
    request.extend_from_slice(&lifetime_secs.to_be_bytes());

    request
}

/// Validate the common 4-byte response header against the expected opcode
fn check_response_header(response: &[u8], request_opcode: NatPmpOpcode) -> Result<(), MappingError> {
    let version = response[0];
    if version != NATPMP_VERSION {
        return Err(MappingError::InvalidResponse(format!(
            "Invalid version: {} (expected {})",
            version, NATPMP_VERSION
        )));
    }

    let opcode = response[1];
    if opcode != RESPONSE_BIT + request_opcode as u8 {
        return Err(MappingError::InvalidResponse(format!(
            "Unexpected opcode: {} (expected {})",
            opcode,
            RESPONSE_BIT + request_opcode as u8
        )));
    }

    let result_code = u16::from_be_bytes([response[2], response[3]]);
    let result = NatPmpResultCode::from_u16(result_code).ok_or_else(|| {
        MappingError::InvalidResponse(format!("Unknown result code: {}", result_code))
    })?;

    if result != NatPmpResultCode::Success {
        return Err(MappingError::GatewayError(
            result.to_error_message().to_string(),
        ));
    }

    Ok(())
}

/// Parse a NAT-PMP MAP response packet
pub(crate) fn parse_natpmp_map_response(
    response: &[u8],
    protocol: IpProtocol,
) -> Result<NatPmpMapResponse, MappingError> {
    if response.len() < 16 {
        return Err(MappingError::InvalidResponse(format!(
            "Response too short: {} bytes (expected 16)",
            response.len()
        )));
    }

    check_response_header(response, NatPmpOpcode::for_protocol(protocol))?;

    Ok(NatPmpMapResponse {
        epoch_secs: u32::from_be_bytes([response[4], response[5], response[6], response[7]]),
        internal_port: u16::from_be_bytes([response[8], response[9]]),
        external_port: u16::from_be_bytes([response[10], response[11]]),
        lifetime_secs: u32::from_be_bytes([response[12], response[13], response[14], response[15]]),
    })
}

/// Parse a NAT-PMP external address response packet
pub(crate) fn parse_external_address_response(response: &[u8]) -> Result<Ipv4Addr, MappingError> {
    if response.len() < 12 {
        return Err(MappingError::InvalidResponse(format!(
            "External IP response too short: {} bytes",
            response.len()
        )));
    }

    check_response_header(response, NatPmpOpcode::ExternalAddress)?;

    Ok(Ipv4Addr::new(
        response[8],
        response[9],
        response[10],
        response[11],
    ))
}
