//! Tunables for the coordinator.
//!
//! Every knob has a default, and sections may be omitted when loaded from a
//! file. Durations are stored as milliseconds so the structs serialize
//! cleanly to TOML and JSON.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::MetaError;

/// Balancer loop settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Time between balancing rounds (default: 10000).
    pub interval_ms: u64,
    /// A collection is balanced once max minus min chunk count is at most this (default: 1).
    pub imbalance_threshold: usize,
    /// Balancer lease lifetime; a holder that does not renew within it is presumed dead (default: 30000).
    pub lease_ttl_ms: u64,
    /// Upper bound on migrations started in one round (default: 64).
    pub max_migrations_per_round: usize,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            imbalance_threshold: 1,
            lease_ttl_ms: 30_000,
            max_migrations_per_round: 64,
        }
    }
}

impl BalancerConfig {
    /// Round interval as a Duration
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Lease lifetime as a Duration
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }
}

/// Auto-split policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    /// Chunks estimated above this size are split (default: 64 MiB).
    pub max_chunk_size_bytes: u64,
    /// Minimum sampled keys needed before an auto-split point is chosen (default: 2).
    pub min_samples: usize,
    /// Initial auto-split setting applied when the cluster is bootstrapped (default: true).
    pub auto_split: bool,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            max_chunk_size_bytes: 64 * 1024 * 1024,
            min_samples: 2,
            auto_split: true,
        }
    }
}

/// Chunk migration settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Documents copied per clone batch (default: 1000).
    pub clone_batch_size: usize,
    /// Catch-up ends once at most this many changes are still queued (default: 16).
    pub max_catch_up_lag: usize,
    /// Catch-up rounds before the migration gives up (default: 32).
    pub max_catch_up_rounds: usize,
    /// Changes forwarded per catch-up round (default: 1000).
    pub transfer_batch_size: usize,
    /// Maximum time writes may stay blocked during the commit (default: 5000).
    pub critical_section_timeout_ms: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            clone_batch_size: 1000,
            max_catch_up_lag: 16,
            max_catch_up_rounds: 32,
            transfer_batch_size: 1000,
            critical_section_timeout_ms: 5_000,
        }
    }
}

impl MigrationConfig {
    /// Critical section bound as a Duration
    pub fn critical_section_timeout(&self) -> Duration {
        Duration::from_millis(self.critical_section_timeout_ms)
    }
}

/// Internal retry policy for version conflicts and unreachable nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first (default: 3).
    pub max_attempts: u32,
    /// Backoff before the first retry (default: 50).
    pub initial_backoff_ms: u64,
    /// Backoff cap (default: 2000).
    pub max_backoff_ms: u64,
    /// Backoff growth factor (default: 2.0).
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Top-level coordinator configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Balancer loop
    pub balancer: BalancerConfig,
    /// Auto-split
    pub split: SplitConfig,
    /// Chunk migration
    pub migration: MigrationConfig,
    /// Internal retries
    pub retry: RetryConfig,
}

impl CoordinatorConfig {
    /// Rejects settings the coordinator cannot run with.
    pub fn validate(&self) -> Result<(), MetaError> {
        if self.balancer.interval_ms == 0 {
            return Err(MetaError::InvalidConfig(
                "balancer.interval_ms must be positive".to_string(),
            ));
        }
        if self.balancer.lease_ttl_ms == 0 {
            return Err(MetaError::InvalidConfig(
                "balancer.lease_ttl_ms must be positive".to_string(),
            ));
        }
        if self.split.max_chunk_size_bytes == 0 {
            return Err(MetaError::InvalidConfig(
                "split.max_chunk_size_bytes must be positive".to_string(),
            ));
        }
        if self.migration.clone_batch_size == 0 || self.migration.transfer_batch_size == 0 {
            return Err(MetaError::InvalidConfig(
                "migration batch sizes must be positive".to_string(),
            ));
        }
        if self.migration.critical_section_timeout_ms == 0 {
            return Err(MetaError::InvalidConfig(
                "migration.critical_section_timeout_ms must be positive".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(MetaError::InvalidConfig(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(MetaError::InvalidConfig(
                "retry.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoordinatorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.balancer.imbalance_threshold, 1);
        assert_eq!(config.split.max_chunk_size_bytes, 64 * 1024 * 1024);
        assert_eq!(
            config.migration.critical_section_timeout(),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: CoordinatorConfig =
            serde_json::from_str(r#"{"balancer": {"interval_ms": 250}}"#).unwrap();
        assert_eq!(config.balancer.interval(), Duration::from_millis(250));
        assert_eq!(config.balancer.lease_ttl_ms, 30_000);
        assert_eq!(config.migration, MigrationConfig::default());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = CoordinatorConfig::default();
        config.migration.critical_section_timeout_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(MetaError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = CoordinatorConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
