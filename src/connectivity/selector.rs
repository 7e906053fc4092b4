//! Port mapping selector - protocol fallback chain
//!
//! Tries UPnP first and NAT-PMP second. Each attempt is discovery followed by
//! one mapping request. There are no retries here; once a mapping exists the
//! renewal manager owns it.

use super::mapper::{release_mapping, SharedMapper};
use super::natpmp::NatPmpMapper;
use super::types::{IpProtocol, MappingError, MappingProtocol};
use super::upnp::UpnpMapper;
use crate::config::NatConfig;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

type DiscoverFn = dyn Fn() -> Result<SharedMapper, MappingError> + Send + Sync;

/// Blocking constructor for one protocol's mapper
#[derive(Clone)]
pub struct Discoverer {
    protocol: MappingProtocol,
    discover: Arc<DiscoverFn>,
}

impl std::fmt::Debug for Discoverer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discoverer")
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

impl Discoverer {
    /// Wrap a blocking discovery function
    pub fn new<F>(protocol: MappingProtocol, discover: F) -> Self
    where
        F: Fn() -> Result<SharedMapper, MappingError> + Send + Sync + 'static,
    {
        Self {
            protocol,
            discover: Arc::new(discover),
        }
    }

    /// UPnP SSDP search with the configured timeout
    pub fn upnp(config: &NatConfig) -> Self {
        let timeout = config.discovery_timeout();
        Self::new(MappingProtocol::UPnP, move || {
            UpnpMapper::discover(timeout).map(|m| Arc::new(m) as SharedMapper)
        })
    }

    /// NAT-PMP against the discovered default gateway
    pub fn natpmp(config: &NatConfig) -> Self {
        let timeout = config.request_timeout();
        Self::new(MappingProtocol::NATPMP, move || {
            NatPmpMapper::discover(timeout).map(|m| Arc::new(m) as SharedMapper)
        })
    }

    /// Protocol this discoverer produces mappers for
    pub fn protocol(&self) -> MappingProtocol {
        self.protocol
    }
}

/// A mapping obtained by the selector
#[derive(Debug, Clone)]
pub struct AcquiredMapping {
    /// Mapper that negotiated the mapping, kept for renewal and release
    pub mapper: SharedMapper,
    /// Protocol that succeeded
    pub protocol: MappingProtocol,
    /// External port assigned by the device
    pub external_port: u16,
}

/// Chooses a port mapping protocol, falling back from the primary to the secondary
#[derive(Debug, Clone)]
pub struct PortMapperSelector {
    primary: Discoverer,
    fallback: Discoverer,
    config: NatConfig,
}

impl Default for PortMapperSelector {
    fn default() -> Self {
        // The default config is always valid
        Self::standard(NatConfig::default())
    }
}

impl PortMapperSelector {
    /// UPnP first, NAT-PMP second
    ///
    /// Fails with [`crate::Error::Config`] if `config` does not validate.
    pub fn new(config: NatConfig) -> crate::Result<Self> {
        config.validate()?;
        Ok(Self::standard(config))
    }

    /// Selector over arbitrary discoverers, tried in the given order
    pub fn with_discoverers(
        config: NatConfig,
        primary: Discoverer,
        fallback: Discoverer,
    ) -> crate::Result<Self> {
        config.validate()?;
        Ok(Self {
            primary,
            fallback,
            config,
        })
    }

    fn standard(config: NatConfig) -> Self {
        Self {
            primary: Discoverer::upnp(&config),
            fallback: Discoverer::natpmp(&config),
            config,
        }
    }

    /// Configuration handed to listeners and renewal managers built from this selector
    pub fn config(&self) -> &NatConfig {
        &self.config
    }

    /// Map `internal_port`, trying the primary protocol and then the fallback
    ///
    /// A cancelled token always wins: it is checked before the first attempt,
    /// between attempts, and again before reporting that both protocols failed.
    pub async fn acquire(
        &self,
        protocol: IpProtocol,
        internal_port: u16,
        token: &CancellationToken,
    ) -> Result<AcquiredMapping, MappingError> {
        if token.is_cancelled() {
            return Err(MappingError::Cancelled);
        }

        info!(
            "Acquiring {} mapping for port {} (trying {} → {})",
            protocol, internal_port, self.primary.protocol, self.fallback.protocol
        );

        let primary_err = match self.attempt(&self.primary, protocol, internal_port, token).await {
            Ok(acquired) => return Ok(acquired),
            Err(MappingError::Cancelled) => return Err(MappingError::Cancelled),
            Err(e) => {
                debug!("{} failed: {}", self.primary.protocol, e);
                e
            }
        };

        if token.is_cancelled() {
            return Err(MappingError::Cancelled);
        }

        let fallback_err = match self.attempt(&self.fallback, protocol, internal_port, token).await {
            Ok(acquired) => return Ok(acquired),
            Err(MappingError::Cancelled) => return Err(MappingError::Cancelled),
            Err(e) => e,
        };

        if token.is_cancelled() {
            return Err(MappingError::Cancelled);
        }

        error!(
            "All port mapping protocols failed for port {}: {} → {}",
            internal_port, primary_err, fallback_err
        );
        Err(MappingError::NoNatAvailable {
            primary: Box::new(primary_err),
            fallback: Box::new(fallback_err),
        })
    }

    /// Discovery plus one mapping request, on the blocking pool
    async fn attempt(
        &self,
        discoverer: &Discoverer,
        protocol: IpProtocol,
        internal_port: u16,
        token: &CancellationToken,
    ) -> Result<AcquiredMapping, MappingError> {
        info!("Attempting {} mapping...", discoverer.protocol);

        let kind = discoverer.protocol;
        let discover = discoverer.discover.clone();
        let lease = self.config.lease_duration();

        let mut task = tokio::task::spawn_blocking(move || {
            let mapper = discover().map_err(|e| MappingError::Discovery {
                protocol: kind,
                source: Box::new(e),
            })?;
            let external_port = mapper
                .map_port(protocol, internal_port, lease)
                .map_err(|e| MappingError::Negotiation {
                    protocol: kind,
                    source: Box::new(e),
                })?;
            Ok::<_, MappingError>((mapper, external_port))
        });

        let joined = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            joined = &mut task => Some(joined),
        };

        let Some(joined) = joined else {
            // The router may still grant the mapping; give it back if it does
            tokio::spawn(async move {
                if let Ok(Ok((mapper, external_port))) = task.await {
                    debug!("Releasing mapping granted after cancellation");
                    release_mapping(mapper, protocol, external_port).await;
                }
            });
            return Err(MappingError::Cancelled);
        };

        let (mapper, external_port) =
            joined.map_err(|e| MappingError::Internal(format!("Task join error: {}", e)))??;

        info!(
            "{} mapping successful: internal {} → external {}",
            kind, internal_port, external_port
        );

        Ok(AcquiredMapping {
            mapper,
            protocol: kind,
            external_port,
        })
    }
}
