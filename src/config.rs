//! Port mapping configuration
//!
//! Renewal cadence and lease length used to be process-wide constants. They are
//! now carried by [`NatConfig`] and handed to the selector and to every renewal
//! manager when those are built.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default renewal interval (45 minutes)
pub const DEFAULT_RENEWAL_INTERVAL_MS: u64 = 45 * 60 * 1000;

/// Default lease duration, double the renewal interval
pub const DEFAULT_LEASE_DURATION_MS: u64 = 2 * DEFAULT_RENEWAL_INTERVAL_MS;

/// Default UPnP discovery timeout
pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 5_000;

/// Default NAT-PMP request timeout
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 2_000;

/// Shortest lease a router can be asked for; both protocols count in whole seconds
pub const MIN_LEASE_DURATION_MS: u64 = 1_000;

/// Timing configuration for port mapping and renewal
///
/// # Example
/// ```rust,no_run
/// use natlink::NatConfig;
///
/// // Defaults if the file does not exist
/// let config = NatConfig::load("natlink.json").expect("Failed to load");
/// assert!(config.lease_duration() > config.renewal_interval());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatConfig {
    /// Interval between mapping renewals in milliseconds
    pub renewal_interval_ms: u64,
    /// Lease requested from the router in milliseconds
    pub lease_duration_ms: u64,
    /// How long to search for a UPnP gateway, in milliseconds
    pub discovery_timeout_ms: u64,
    /// Per-request NAT-PMP timeout in milliseconds
    pub request_timeout_ms: u64,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            renewal_interval_ms: DEFAULT_RENEWAL_INTERVAL_MS,
            lease_duration_ms: DEFAULT_LEASE_DURATION_MS,
            discovery_timeout_ms: DEFAULT_DISCOVERY_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl NatConfig {
    /// Config with the given renewal interval and a lease of twice that
    ///
    /// The interval is rounded up to 1ms and the lease to [`MIN_LEASE_DURATION_MS`],
    /// so the result always passes [`validate`](Self::validate).
    pub fn with_renewal_interval(interval: Duration) -> Self {
        let renewal_interval_ms = u64::try_from(interval.as_millis())
            .unwrap_or(u64::MAX)
            .max(1);
        let lease_duration_ms = renewal_interval_ms
            .saturating_mul(2)
            .max(MIN_LEASE_DURATION_MS);
        Self {
            renewal_interval_ms,
            lease_duration_ms,
            ..Self::default()
        }
    }

    /// Interval between renewals
    pub fn renewal_interval(&self) -> Duration {
        Duration::from_millis(self.renewal_interval_ms)
    }

    /// Lease requested on every map and renew
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    /// UPnP discovery timeout
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    /// NAT-PMP request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Check that every duration is non-zero and the lease outlives one renewal interval
    ///
    /// The lease must also be at least one second: a zero-second NAT-PMP lifetime
    /// is a delete request.
    pub fn validate(&self) -> Result<()> {
        if self.renewal_interval_ms == 0 {
            return Err(Error::Config("renewal interval must be non-zero".to_string()));
        }
        if self.discovery_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err(Error::Config("timeouts must be non-zero".to_string()));
        }
        if self.lease_duration_ms < MIN_LEASE_DURATION_MS {
            return Err(Error::Config(format!(
                "lease duration ({}ms) must be at least {}ms",
                self.lease_duration_ms, MIN_LEASE_DURATION_MS
            )));
        }
        if self.lease_duration_ms <= self.renewal_interval_ms {
            return Err(Error::Config(format!(
                "lease duration ({}ms) must exceed renewal interval ({}ms)",
                self.lease_duration_ms, self.renewal_interval_ms
            )));
        }
        Ok(())
    }

    /// Load config from a JSON file
    ///
    /// Returns the defaults if the file does not exist.
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a JSON file
    pub fn save<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}
