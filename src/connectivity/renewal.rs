//! Port mapping renewal and lifecycle management
//!
//! A [`RenewalManager`] owns a mapping once it exists. It re-asserts the mapping
//! every renewal interval, notices when the router hands back a different
//! external port, and removes the mapping when stopped.
//!
//! Lifecycle: `Idle → Running → Stopped`. `Stopped` is terminal, and repeated
//! `start`/`stop` calls in any state are no-ops.

use super::mapper::{release_mapping, SharedMapper};
use super::types::{IpProtocol, MappingError};
use crate::config::NatConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Invoked with the new external port after a renewal changed it
pub type PortChangeCallback = Arc<dyn Fn(u16) + Send + Sync>;

enum Phase {
    Idle,
    Running {
        shutdown: CancellationToken,
        task: JoinHandle<()>,
    },
    Stopped,
}

struct RenewalState {
    phase: Phase,
    external_port: u16,
    on_port_change: Option<PortChangeCallback>,
}

/// Keeps one port mapping alive with periodic renewal
pub struct RenewalManager {
    mapper: SharedMapper,
    protocol: IpProtocol,
    internal_port: u16,
    renewal_interval: Duration,
    lease_duration: Duration,
    state: Arc<Mutex<RenewalState>>,
}

impl std::fmt::Debug for RenewalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalManager")
            .field("protocol", &self.protocol)
            .field("internal_port", &self.internal_port)
            .field("external_port", &self.external_port())
            .field("running", &self.is_running())
            .finish()
    }
}

impl RenewalManager {
    /// Create a manager for an existing mapping. Nothing runs until [`start`](Self::start).
    ///
    /// Fails with [`crate::Error::Config`] if `config` does not validate.
    pub fn new(
        mapper: SharedMapper,
        protocol: IpProtocol,
        internal_port: u16,
        external_port: u16,
        config: &NatConfig,
    ) -> crate::Result<Self> {
        config.validate()?;
        Ok(Self {
            mapper,
            protocol,
            internal_port,
            renewal_interval: config.renewal_interval(),
            lease_duration: config.lease_duration(),
            state: Arc::new(Mutex::new(RenewalState {
                phase: Phase::Idle,
                external_port,
                on_port_change: None,
            })),
        })
    }

    /// Register the callback fired when a renewal returns a different external port
    pub fn set_port_change_callback<F>(&self, callback: F)
    where
        F: Fn(u16) + Send + Sync + 'static,
    {
        self.state.lock().on_port_change = Some(Arc::new(callback));
    }

    /// Current external port; may change after a renewal
    pub fn external_port(&self) -> u16 {
        self.state.lock().external_port
    }

    /// Whether the renewal loop is active
    pub fn is_running(&self) -> bool {
        matches!(self.state.lock().phase, Phase::Running { .. })
    }

    /// Spawn the renewal loop. Must be called within a Tokio runtime.
    pub fn start(&self) {
        let mut state = self.state.lock();
        if !matches!(state.phase, Phase::Idle) {
            return;
        }

        // Each run gets its own token so an old loop can never act on a newer run's state
        let shutdown = CancellationToken::new();
        let renewer = Renewer {
            mapper: self.mapper.clone(),
            protocol: self.protocol,
            internal_port: self.internal_port,
            lease_duration: self.lease_duration,
            state: self.state.clone(),
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(renewer.run(self.renewal_interval));

        info!(
            "Started {} renewal for port {} every {:?}",
            self.protocol, self.internal_port, self.renewal_interval
        );
        state.phase = Phase::Running { shutdown, task };
    }

    /// Stop the loop and unmap the current external port
    ///
    /// Waits for an in-flight renewal to finish first, so the unmap is the last
    /// request sent. An unmap failure is logged, not returned.
    pub async fn stop(&self) {
        let task = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut state.phase, Phase::Stopped) {
                Phase::Running { shutdown, task } => {
                    shutdown.cancel();
                    task
                }
                other => {
                    state.phase = other;
                    return;
                }
            }
        };

        if let Err(e) = task.await {
            debug!("Renewal task ended abnormally: {}", e);
        }

        let external_port = self.state.lock().external_port;
        info!(
            "Stopping {} renewal for port {} (external {})",
            self.protocol, self.internal_port, external_port
        );
        release_mapping(self.mapper.clone(), self.protocol, external_port).await;
    }
}

impl Drop for RenewalManager {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Phase::Running { shutdown, .. } = std::mem::replace(&mut state.phase, Phase::Stopped)
        {
            shutdown.cancel();

            // Best-effort cleanup; nobody is left to await it
            let mapper = self.mapper.clone();
            let protocol = self.protocol;
            let external_port = state.external_port;
            std::thread::spawn(move || {
                if let Err(e) = mapper.unmap_port(protocol, external_port) {
                    debug!("Unmap on drop failed: {}", e);
                } else {
                    debug!("Mapping for external port {} cleaned up on drop", external_port);
                }
            });
        }
    }
}

/// State moved into one run of the renewal loop
struct Renewer {
    mapper: SharedMapper,
    protocol: IpProtocol,
    internal_port: u16,
    lease_duration: Duration,
    state: Arc<Mutex<RenewalState>>,
    shutdown: CancellationToken,
}

impl Renewer {
    async fn run(self, period: Duration) {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.renew().await,
            }
        }

        debug!("Renewal loop for port {} exited", self.internal_port);
    }

    /// Re-issue the mapping; failures are tolerated until the next tick
    async fn renew(&self) {
        let mapper = self.mapper.clone();
        let (protocol, internal_port, lease) =
            (self.protocol, self.internal_port, self.lease_duration);

        let result = tokio::task::spawn_blocking(move || {
            mapper.map_port(protocol, internal_port, lease)
        })
        .await
        .map_err(|e| MappingError::Internal(format!("Task join error: {}", e)))
        .and_then(|r| r);

        let new_port = match result {
            Ok(port) => port,
            Err(e) => {
                warn!(
                    "Port mapping renewal failed for {} port {}: {}",
                    self.protocol, self.internal_port, e
                );
                return;
            }
        };

        let callback = {
            let mut state = self.state.lock();
            let old_port = state.external_port;
            state.external_port = new_port;

            // Record the port so stop() unmaps the right one, but stay silent once stopping
            if new_port == old_port || self.shutdown.is_cancelled() {
                None
            } else {
                info!(
                    "External port changed during renewal ({}): {} → {}",
                    self.protocol, old_port, new_port
                );
                state.on_port_change.clone()
            }
        };

        // Outside the lock: the callback takes the owning listener's lock
        if let Some(callback) = callback {
            callback(new_port);
        }

        debug!("Port mapping renewed: {} port {}", self.protocol, new_port);
    }
}
