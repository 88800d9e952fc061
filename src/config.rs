//! Engine configuration
//!
//! Retry, backoff, timeout, and retention limits are configuration with
//! defaults, not fixed constants. The server binary maps CLI flags onto
//! this struct; embedded users build it directly.

use std::time::Duration;

/// Configuration for the sync engine
#[derive(Clone, Debug)]
pub struct SyncEngineConfig {
    /// How many times a failed apply is retried before the entry is terminal
    pub max_retries: u32,
    /// Base delay for exponential backoff (delay = base * 2^retry_count)
    pub base_retry_delay: Duration,
    /// Upper bound on the backoff delay
    pub max_retry_delay: Duration,
    /// A SYNCING entry older than this is treated as failed and requeued
    pub processing_timeout: Duration,
    /// Cache entries last synced longer ago than this are excluded from
    /// offline-data responses
    pub retention_window: Duration,
    /// Maximum number of audit log rows kept in memory
    pub log_capacity: usize,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_retry_delay: Duration::from_secs(10),
            max_retry_delay: Duration::from_secs(3600),
            processing_timeout: Duration::from_secs(60),
            retention_window: Duration::from_secs(3 * 24 * 60 * 60),
            log_capacity: 10_000,
        }
    }
}

impl SyncEngineConfig {
    /// Config with a custom retention window in days
    pub fn with_retention_days(days: u64) -> Self {
        Self {
            retention_window: Duration::from_secs(days * 24 * 60 * 60),
            ..Default::default()
        }
    }

    /// Backoff delay before the next attempt after `retry_count` failures
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry_count);
        let delay = self
            .base_retry_delay
            .as_secs()
            .saturating_mul(factor);
        Duration::from_secs(delay.min(self.max_retry_delay.as_secs()))
    }
}
