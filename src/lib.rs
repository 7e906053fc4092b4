//! natlink - listeners that stay reachable from behind a NAT
//!
//! This library maps a port on the local router (UPnP IGD first, NAT-PMP as the
//! fallback), binds it locally, and renews the mapping in the background until
//! the listener is closed.
//!
//! ```rust,no_run
//! # async fn run() -> natlink::Result<()> {
//! let listener = natlink::listen_with_fallback(9000).await?;
//! println!("reachable at {}", listener.addr());
//!
//! let stream = listener.accept().await?;
//! println!("connection from {}", stream.peer_addr());
//!
//! listener.close().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connectivity;
pub mod net;

pub use config::NatConfig;
pub use connectivity::{MappingError, PortMapperSelector};
pub use net::{
    listen, listen_packet, listen_packet_with_fallback, listen_packet_with_fallback_token,
    listen_packet_with_token, listen_with_fallback, listen_with_fallback_token, listen_with_token,
    NatAddr, NatListener, NatPacketConn, NatPacketListener, NatStream, Network,
};

/// Result type alias for natlink operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for natlink operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Port mapping failed
    #[error("Port mapping error: {0}")]
    Mapping(#[from] MappingError),

    /// General I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation on a closed listener or connection
    #[error("Listener closed")]
    Closed,

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error came from a cancelled token
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Mapping(e) if e.is_cancelled())
    }
}

/// Initialize natlink logging
pub fn init() {
    tracing_subscriber::fmt::init();
}

#[cfg(test)]
mod tests;
