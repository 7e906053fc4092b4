//! Common types for connectivity module

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Port mapping protocols understood by the selector
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MappingProtocol {
    /// Universal Plug and Play Internet Gateway Device
    UPnP,
    /// NAT Port Mapping Protocol (RFC 6886)
    NATPMP,
}

impl fmt::Display for MappingProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UPnP => write!(f, "UPnP"),
            Self::NATPMP => write!(f, "NAT-PMP"),
        }
    }
}

/// IP protocol numbers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IpProtocol {
    /// TCP protocol
    TCP = 6,
    /// UDP protocol
    UDP = 17,
}

impl IpProtocol {
    /// Protocol name as routers expect it ("TCP" / "UDP")
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TCP => "TCP",
            Self::UDP => "UDP",
        }
    }
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during discovery and port mapping
#[derive(Debug, Error)]
pub enum MappingError {
    /// Network timeout waiting for response
    #[error("Mapping request timed out")]
    Timeout,

    /// Invalid response from gateway
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Gateway returned an error
    #[error("Gateway error: {0}")]
    GatewayError(String),

    /// No gateway found on network
    #[error("No gateway found")]
    NoGateway,

    /// IO error during communication
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol not supported by gateway
    #[error("Protocol not supported")]
    NotSupported,

    /// Port outside the mappable range
    #[error("Invalid port number: {0} (must be 1-65535)")]
    InvalidPort(u16),

    /// Routing table exists but could not be parsed
    #[error("Malformed routing table: {0}")]
    GatewayParse(String),

    /// No device answered for the protocol
    #[error("{protocol} discovery failed: {source}")]
    Discovery {
        /// Protocol whose discovery failed
        protocol: MappingProtocol,
        /// Underlying failure
        source: Box<MappingError>,
    },

    /// A device was found but refused the mapping
    #[error("{protocol} port mapping failed: {source}")]
    Negotiation {
        /// Protocol whose negotiation failed
        protocol: MappingProtocol,
        /// Underlying failure
        source: Box<MappingError>,
    },

    /// Neither protocol produced a mapping
    #[error("No NAT traversal available: {primary}; {fallback}")]
    NoNatAvailable {
        /// Failure of the first protocol tried
        primary: Box<MappingError>,
        /// Failure of the fallback protocol
        fallback: Box<MappingError>,
    },

    /// Acquisition aborted by the caller's cancellation token
    #[error("Operation cancelled")]
    Cancelled,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MappingError {
    /// Whether this error (or the error it wraps) is a caller cancellation
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Discovery { source, .. } | Self::Negotiation { source, .. } => {
                source.is_cancelled()
            }
            _ => false,
        }
    }
}
