//! Gateway discovery for different platforms
//!
//! NAT-PMP has to be pointed at the router explicitly, so before it can run we
//! resolve the default gateway. Each platform exposes its routing table
//! differently:
//!
//! - Linux: `/proc/net/route`, gateway column in little-endian hex
//! - BSD family (including macOS): `netstat -rn`
//! - Windows: `route print 0.0.0.0`
//!
//! The readers return `Ok(None)` whenever the table is unavailable or has no
//! usable default route. [`discover_gateway`] then falls back to assuming the
//! router sits on the `.1` host of the local subnet. That guess is best-effort
//! and can be wrong on networks that number their router differently.

use crate::connectivity::types::MappingError;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use tracing::debug;

/// Public address used to make the OS pick an outbound route. Nothing is sent.
const ROUTE_PROBE_ADDR: &str = "8.8.8.8:80";

/// Find the default gateway IP address
///
/// Reads the platform routing table first. A missing or unparseable table is
/// not fatal: the `.1` heuristic from [`discover_gateway_fallback`] is used instead.
pub fn discover_gateway() -> Result<Ipv4Addr, MappingError> {
    match read_default_gateway() {
        Ok(Some(gateway)) => {
            debug!("Default gateway from routing table: {}", gateway);
            return Ok(gateway);
        }
        Ok(None) => debug!("No default route in routing table, using subnet heuristic"),
        Err(e) => debug!("Routing table unreadable ({}), using subnet heuristic", e),
    }

    discover_gateway_fallback()
}

/// Guess the gateway as the `.1` host of the subnet the OS routes outbound traffic through
pub fn discover_gateway_fallback() -> Result<Ipv4Addr, MappingError> {
    let local = local_ipv4()?;
    let [a, b, c, _] = local.octets();
    let gateway = Ipv4Addr::new(a, b, c, 1);
    debug!("Assuming gateway {} for local address {}", gateway, local);
    Ok(gateway)
}

/// Local IPv4 address the OS would use to reach the public internet
///
/// "Connecting" a UDP socket only resolves the route; no packet leaves the host.
pub fn local_ipv4() -> Result<Ipv4Addr, MappingError> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .map_err(|e| MappingError::Internal(format!("Failed to create socket: {}", e)))?;

    socket
        .connect(ROUTE_PROBE_ADDR)
        .map_err(|e| MappingError::Internal(format!("Failed to determine local IP: {}", e)))?;

    let local_addr = socket
        .local_addr()
        .map_err(|e| MappingError::Internal(format!("Failed to get local address: {}", e)))?;

    match local_addr.ip() {
        IpAddr::V4(ipv4) => Ok(ipv4),
        IpAddr::V6(_) => Err(MappingError::Internal("Not an IPv4 address".to_string())),
    }
}

/// Read the default gateway from the platform routing table
///
/// `Ok(None)` means "not found" (no table, no default route, command missing).
/// `Err` is reserved for a table that exists but is malformed.
#[cfg(target_os = "linux")]
pub fn read_default_gateway() -> Result<Option<Ipv4Addr>, MappingError> {
    match std::fs::read_to_string("/proc/net/route") {
        Ok(table) => parse_linux_route(&table),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(MappingError::Io(e)),
    }
}

/// Read the default gateway from the platform routing table
///
/// `Ok(None)` means "not found" (no table, no default route, command missing).
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
pub fn read_default_gateway() -> Result<Option<Ipv4Addr>, MappingError> {
    use std::process::Command;

    let output = match Command::new("netstat").args(["-rn"]).output() {
        Ok(output) if output.status.success() => output,
        Ok(_) | Err(_) => return Ok(None),
    };

    parse_netstat_output(&String::from_utf8_lossy(&output.stdout))
}

/// Read the default gateway from the platform routing table
///
/// `Ok(None)` means "not found" (no table, no default route, command missing).
#[cfg(target_os = "windows")]
pub fn read_default_gateway() -> Result<Option<Ipv4Addr>, MappingError> {
    use std::process::Command;

    let output = match Command::new("route").args(["print", "0.0.0.0"]).output() {
        Ok(output) if output.status.success() => output,
        Ok(_) | Err(_) => return Ok(None),
    };

    parse_windows_route_output(&String::from_utf8_lossy(&output.stdout))
}

/// No routing-table reader on this platform; always defers to the heuristic
#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly",
    target_os = "windows"
)))]
pub fn read_default_gateway() -> Result<Option<Ipv4Addr>, MappingError> {
    Ok(None)
}

/// Parse the contents of `/proc/net/route`
///
/// ```text
/// Iface   Destination Gateway  Flags RefCnt Use Metric Mask     MTU Window IRTT
/// eth0    00000000    0101A8C0 0003  0      0   100    00000000 0   0      0
/// ```
pub fn parse_linux_route(table: &str) -> Result<Option<Ipv4Addr>, MappingError> {
    let mut lines = table.lines();

    // Header line
    if lines.next().is_none() {
        return Err(MappingError::GatewayParse("empty routing table".to_string()));
    }

    for line in lines {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            continue;
        }

        if fields[1] != "00000000" {
            continue;
        }

        let gateway = parse_hex_ip(fields[2])?;
        // 0.0.0.0 gateway is a directly connected route
        if !gateway.is_unspecified() {
            return Ok(Some(gateway));
        }
    }

    Ok(None)
}

/// Decode a little-endian hex IPv4 address from `/proc/net/route` ("0101A8C0" is 192.168.1.1)
pub fn parse_hex_ip(hex_ip: &str) -> Result<Ipv4Addr, MappingError> {
    if hex_ip.len() != 8 {
        return Err(MappingError::GatewayParse(format!(
            "invalid hex IP length: {}",
            hex_ip.len()
        )));
    }

    let bytes = hex::decode(hex_ip)
        .map_err(|e| MappingError::GatewayParse(format!("invalid hex IP {}: {}", hex_ip, e)))?;

    Ok(Ipv4Addr::new(bytes[3], bytes[2], bytes[1], bytes[0]))
}

/// Interface column in BSD `netstat -rn` rows when no header names it
const NETSTAT_DEFAULT_INTERFACE_COLUMN: usize = 3;

/// Parse `netstat -rn` output from BSD-family systems
///
/// ```text
/// Destination        Gateway            Flags        Netif Expire
/// default            192.168.1.1        UGSc           en0
/// ```
///
/// Gateways that name an interface (`link#5`) are skipped. Such a row still
/// records its interface, and a later host route on that interface whose
/// destination is its own gateway is accepted as the router. Loopback is never
/// a gateway.
///
/// The interface column is located from the header (`Netif` on macOS and
/// FreeBSD, `Iface` on OpenBSD and NetBSD); without a header it is the fourth.
pub fn parse_netstat_output(output: &str) -> Result<Option<Ipv4Addr>, MappingError> {
    let mut interface_column = NETSTAT_DEFAULT_INTERFACE_COLUMN;
    let mut scoped_interface: Option<Option<&str>> = None;

    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 {
            continue;
        }

        if fields[0] == "Destination" {
            if let Some(column) = fields.iter().position(|f| matches!(*f, "Netif" | "Iface")) {
                interface_column = column;
            }
            continue;
        }

        let destination = fields[0];
        let mut gateway = fields[1];
        let netif = fields.get(interface_column).copied();

        if matches!(destination, "default" | "0.0.0.0" | "0.0.0.0/0") {
            if gateway.contains('#') {
                scoped_interface = Some(netif);
                continue;
            }

            if let Some(idx) = gateway.find('%') {
                gateway = &gateway[..idx];
            }

            if let Ok(ip) = gateway.parse::<Ipv4Addr>() {
                if !ip.is_loopback() {
                    return Ok(Some(ip));
                }
            }
            continue;
        }

        if let Some(interface) = scoped_interface {
            let same_interface = match (interface, netif) {
                (Some(wanted), Some(found)) => wanted == found,
                _ => true,
            };
            if same_interface && destination == gateway {
                if let Ok(ip) = gateway.parse::<Ipv4Addr>() {
                    if !ip.is_loopback() {
                        return Ok(Some(ip));
                    }
                }
            }
        }
    }

    Ok(None)
}

/// Parse `route print 0.0.0.0` output on Windows
///
/// Only the "Active Routes" section is read, up to the next `====` delimiter.
/// Rows whose gateway is `On-link` have no router and are skipped.
pub fn parse_windows_route_output(output: &str) -> Result<Option<Ipv4Addr>, MappingError> {
    let mut in_active_routes = false;

    for line in output.lines() {
        if line.contains("Active Routes:") {
            in_active_routes = true;
            continue;
        }

        if !in_active_routes {
            continue;
        }

        if line.trim_start().starts_with("====") {
            break;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[0] == "Network" {
            continue;
        }

        if fields[0] == "0.0.0.0" && fields[1] == "0.0.0.0" {
            if fields[2] == "On-link" {
                continue;
            }
            if let Ok(ip) = fields[2].parse::<Ipv4Addr>() {
                return Ok(Some(ip));
            }
        }
    }

    Ok(None)
}
