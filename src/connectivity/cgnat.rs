//! External address classification
//!
//! A router can grant a mapping and still be unreachable from the internet when
//! it sits behind another NAT. That shows up as a "public" address that is
//! really shared (CGNAT, RFC 6598) or private (double NAT).

use std::net::IpAddr;
use tracing::{debug, warn};

/// CGNAT (RFC 6598) IP range: 100.64.0.0/10
const CGNAT_RANGE_START: u32 = 0x64400000; // 100.64.0.0
const CGNAT_RANGE_END: u32 = 0x647FFFFF; // 100.127.255.255

/// How reachable a router-reported external address is likely to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalAddressKind {
    /// Globally routable as far as we can tell
    Public,
    /// Inside 100.64.0.0/10; the ISP runs another NAT
    Cgnat,
    /// RFC 1918, loopback, link-local or unspecified; the router is itself behind a NAT
    Private,
}

/// Detect if an external IP address is within CGNAT range
///
/// ```
/// use std::net::IpAddr;
/// use natlink::connectivity::detect_cgnat;
///
/// let cgnat_ip: IpAddr = "100.64.0.1".parse().unwrap();
/// assert!(detect_cgnat(cgnat_ip));
///
/// let public_ip: IpAddr = "203.0.113.5".parse().unwrap();
/// assert!(!detect_cgnat(public_ip));
/// ```
pub fn detect_cgnat(external_ip: IpAddr) -> bool {
    match external_ip {
        IpAddr::V4(ipv4) => {
            let ip_u32 = u32::from(ipv4);
            (CGNAT_RANGE_START..=CGNAT_RANGE_END).contains(&ip_u32)
        }
        // IPv6 addresses are never in CGNAT range
        IpAddr::V6(_) => false,
    }
}

/// Check if an IP is a private/local address
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private() || ipv4.is_loopback() || ipv4.is_link_local() || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => {
            ipv6.is_loopback() || ipv6.is_unspecified() || (ipv6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Classify an external address, logging when inbound traffic is unlikely to arrive
pub fn classify_external_ip(external_ip: IpAddr) -> ExternalAddressKind {
    if detect_cgnat(external_ip) {
        warn!(
            "CGNAT detected: external IP {} is in range 100.64.0.0/10. \
             Inbound connections through this mapping are unlikely to arrive.",
            external_ip
        );
        ExternalAddressKind::Cgnat
    } else if is_private_ip(external_ip) {
        warn!(
            "Router reports private external IP {}; it is probably behind another NAT",
            external_ip
        );
        ExternalAddressKind::Private
    } else {
        debug!("External IP {} looks publicly routable", external_ip);
        ExternalAddressKind::Public
    }
}
