//! Configuration management for CareChain anchoring.
//!
//! Durations are stored as milliseconds so the TOML form stays flat:
//!
//! ```toml
//! [batch]
//! max_batch_size = 100
//! min_batch_size = 10
//! batch_timeout_ms = 5000
//!
//! [rate_limit]
//! enabled = true
//! max_ops_per_second = 8
//! ```

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
#[cfg(feature = "toml")]
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorConfig {
    pub batch: BatchConfig,
    pub compression: CompressionConfig,
    pub rate_limit: RateLimitConfig,
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Pending count that forces an immediate flush
    pub max_batch_size: usize,
    /// Below this count a timed flush waits one extra grace period
    pub min_batch_size: usize,
    pub batch_timeout_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            min_batch_size: 10,
            batch_timeout_ms: 5_000,
        }
    }
}

impl BatchConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
    /// Payloads at or above this size are compressed
    pub min_size_bytes: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_size_bytes: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Sustained refill rate; keep below the ledger's hard per-second limit
    pub max_ops_per_second: u32,
    /// Bucket size (burst allowance)
    pub capacity: u32,
    /// Spacing between consecutive releases from the wait queue
    pub release_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_ops_per_second: 8,
            capacity: 8,
            release_interval_ms: 10,
        }
    }
}

impl RateLimitConfig {
    pub fn release_interval(&self) -> Duration {
        Duration::from_millis(self.release_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Upper bound on the drain loop's sleep when nothing is ready
    pub idle_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            idle_interval_ms: 100,
        }
    }
}

impl QueueConfig {
    /// Delay before the retry that follows attempt number `attempts` (1-based):
    /// `min(base * 2^(attempts - 1), max)`
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(63);
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(1u64.checked_shl(exponent).unwrap_or(u64::MAX));
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }
}

impl AnchorConfig {
    #[cfg(feature = "toml")]
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    #[cfg(feature = "toml")]
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| CoreError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime components cannot honor
    pub fn validate(&self) -> Result<()> {
        let b = &self.batch;
        if b.max_batch_size == 0 || b.min_batch_size == 0 {
            return Err(CoreError::InvalidConfig(
                "batch sizes must be at least 1".to_string(),
            ));
        }
        if b.min_batch_size > b.max_batch_size {
            return Err(CoreError::InvalidConfig(format!(
                "min_batch_size {} exceeds max_batch_size {}",
                b.min_batch_size, b.max_batch_size
            )));
        }
        if b.batch_timeout_ms == 0 {
            return Err(CoreError::InvalidConfig(
                "batch_timeout_ms must be positive".to_string(),
            ));
        }

        let r = &self.rate_limit;
        if r.enabled && (r.max_ops_per_second == 0 || r.capacity == 0) {
            return Err(CoreError::InvalidConfig(
                "rate limiter needs a positive rate and capacity".to_string(),
            ));
        }

        let q = &self.queue;
        if q.max_attempts == 0 {
            return Err(CoreError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if q.base_delay_ms > q.max_delay_ms {
            return Err(CoreError::InvalidConfig(format!(
                "base_delay_ms {} exceeds max_delay_ms {}",
                q.base_delay_ms, q.max_delay_ms
            )));
        }

        Ok(())
    }
}
