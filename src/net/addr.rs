//! NAT-aware network address

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Transport a listener was opened for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Network {
    /// Stream sockets
    Tcp,
    /// Datagram sockets
    Udp,
}

impl Network {
    /// "tcp" or "udp"
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An internal (LAN-facing) endpoint paired with its external (public) one.
///
/// Values are immutable; a port change produces a new `NatAddr`. `Display`
/// renders the external endpoint, which is what peers should dial.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NatAddr {
    network: Network,
    internal_addr: String,
    external_addr: String,
}

impl NatAddr {
    /// Pair two `host:port` endpoints
    pub fn new(
        network: Network,
        internal_addr: impl Into<String>,
        external_addr: impl Into<String>,
    ) -> Self {
        Self {
            network,
            internal_addr: internal_addr.into(),
            external_addr: external_addr.into(),
        }
    }

    /// Address of a listener without a mapping: internal and external are the same
    pub fn direct(network: Network, local_addr: SocketAddr) -> Self {
        let addr = local_addr.to_string();
        Self::new(network, addr.clone(), addr)
    }

    /// Address for a mapping of `local_addr` to `external_ip:external_port`
    pub fn mapped(
        network: Network,
        local_addr: SocketAddr,
        external_ip: IpAddr,
        external_port: u16,
    ) -> Self {
        Self::new(
            network,
            local_addr.to_string(),
            SocketAddr::new(external_ip, external_port).to_string(),
        )
    }

    /// Network type
    pub fn network(&self) -> Network {
        self.network
    }

    /// LAN-facing endpoint
    pub fn internal_addr(&self) -> &str {
        &self.internal_addr
    }

    /// Public endpoint
    pub fn external_addr(&self) -> &str {
        &self.external_addr
    }
}

impl fmt::Display for NatAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.external_addr)
    }
}
