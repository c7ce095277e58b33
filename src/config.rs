//! Configuration consumed by the distribution core.
//!
//! Values come from whatever configuration layer embeds this crate; here they
//! are only defaulted and validated.

use std::time::Duration;

#[cfg(feature = "derive")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Settings for key distribution and rehashing.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "derive", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "derive", serde(default))]
pub struct DistributionConfig {
    /// Desired number of owners per key.
    pub num_owners: usize,

    /// Name of the hash strategy, see [`crate::hashring::HashStrategy`].
    pub hash_strategy: String,

    /// When false, membership changes swap the mapping without moving state.
    pub rehash_enabled: bool,

    /// Timeout for each rehash RPC.
    pub rehash_rpc_timeout: Duration,

    /// Lower bound of the randomized wait between retries.
    pub rehash_retry_min: Duration,

    /// Upper bound of the randomized wait between retries.
    pub rehash_retry_max: Duration,

    /// Overall deadline for retried steps. Defaults to ten rpc timeouts.
    pub rehash_deadline: Option<Duration>,

    /// Whether to notify members holding copies they no longer own.
    pub invalidate_stale: bool,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            num_owners: 2,
            hash_strategy: "default".to_string(),
            rehash_enabled: true,
            rehash_rpc_timeout: Duration::from_secs(60),
            rehash_retry_min: Duration::from_millis(500),
            rehash_retry_max: Duration::from_millis(2000),
            rehash_deadline: None,
            invalidate_stale: true,
        }
    }
}

impl DistributionConfig {
    pub fn with_num_owners(mut self, num_owners: usize) -> Self {
        self.num_owners = num_owners;
        self
    }

    pub fn with_hash_strategy(mut self, name: impl Into<String>) -> Self {
        self.hash_strategy = name.into();
        self
    }

    pub fn with_rehash_enabled(mut self, enabled: bool) -> Self {
        self.rehash_enabled = enabled;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rehash_rpc_timeout = timeout;
        self
    }

    /// Set the window the retry backoff is drawn from.
    pub fn with_retry_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.rehash_retry_min = min;
        self.rehash_retry_max = max;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.rehash_deadline = Some(deadline);
        self
    }

    pub fn with_invalidate_stale(mut self, invalidate: bool) -> Self {
        self.invalidate_stale = invalidate;
        self
    }

    /// Deadline after which a retried step gives up.
    pub fn deadline(&self) -> Duration {
        self.rehash_deadline
            .unwrap_or_else(|| self.rehash_rpc_timeout.saturating_mul(10))
    }

    /// Check the settings that would otherwise fail at an awkward time.
    pub fn validate(&self) -> Result<()> {
        if self.num_owners == 0 {
            return Err(Error::Config("num_owners must be at least 1".to_string()));
        }

        if self.rehash_rpc_timeout.is_zero() {
            return Err(Error::Config(
                "rehash_rpc_timeout must be greater than zero".to_string(),
            ));
        }

        if self.rehash_retry_min > self.rehash_retry_max {
            return Err(Error::Config(format!(
                "rehash_retry_min ({:?}) exceeds rehash_retry_max ({:?})",
                self.rehash_retry_min, self.rehash_retry_max
            )));
        }

        self.hash_strategy
            .parse::<crate::hashring::HashStrategy>()
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::DistributionConfig;
    use crate::error::Error;

    #[test]
    fn defaults_are_valid() {
        let config = DistributionConfig::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.num_owners, 2);
        assert_eq!(config.deadline(), Duration::from_secs(600));
    }

    #[test]
    fn explicit_deadline_wins() {
        let config = DistributionConfig::default()
            .with_rpc_timeout(Duration::from_millis(50))
            .with_deadline(Duration::from_millis(120));

        assert_eq!(config.deadline(), Duration::from_millis(120));

        let config = config.with_rpc_timeout(Duration::from_millis(30));
        assert_eq!(config.deadline(), Duration::from_millis(120));
    }

    #[test]
    fn invalid_settings_are_config_errors() {
        let cases = [
            DistributionConfig::default().with_num_owners(0),
            DistributionConfig::default().with_rpc_timeout(Duration::ZERO),
            DistributionConfig::default()
                .with_retry_backoff(Duration::from_secs(3), Duration::from_secs(1)),
            DistributionConfig::default().with_hash_strategy("crc32"),
        ];

        for config in cases {
            assert!(
                matches!(config.validate(), Err(Error::Config(_))),
                "{config:?} should be rejected"
            );
        }
    }
}
