//! Connectivity module for NAT traversal and port mapping
//!
//! This module provides port mapping through two protocols:
//! - UPnP IGD (Universal Plug and Play), tried first
//! - NAT-PMP (NAT Port Mapping Protocol) - RFC 6886, the fallback
//!
//! [`PortMapperSelector`] picks the protocol, and [`RenewalManager`] keeps the
//! resulting mapping alive until it is stopped.

// Submodules
pub mod cgnat;
pub mod gateway;
pub mod mapper;
pub mod natpmp;
pub mod renewal;
pub mod selector;
pub mod types;
pub mod upnp;

// Re-export commonly used types
pub use types::{IpProtocol, MappingError, MappingProtocol};

pub use cgnat::{classify_external_ip, detect_cgnat, is_private_ip, ExternalAddressKind};
pub use gateway::{discover_gateway, discover_gateway_fallback, read_default_gateway};
pub use mapper::{PortMapper, SharedMapper};
pub use natpmp::NatPmpMapper;
pub use renewal::{PortChangeCallback, RenewalManager};
pub use selector::{AcquiredMapping, Discoverer, PortMapperSelector};
pub use upnp::UpnpMapper;
