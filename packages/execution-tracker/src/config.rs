use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};

use crate::backoff::Backoff;
use crate::error::TrackerError;

/// Tuning for one execution tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TrackerConfig {
    /// Reconnect attempts after a drop before the channel is reported disconnected.
    pub reconnect_max_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Period of snapshot reconciliation, independent of channel health.
    pub snapshot_interval_ms: u64,
    pub log_retention_count: usize,
    /// How long the channel may stay non-connected before polling takes over.
    pub fallback_after_ms: u64,
    /// Capacity of the serialized input queue.
    pub queue_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            reconnect_max_attempts: 5,
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
            snapshot_interval_ms: 15_000,
            log_retention_count: 1_000,
            fallback_after_ms: 10_000,
            queue_capacity: 1_024,
        }
    }
}

impl TrackerConfig {
    /// Load configuration from `TRACKER_*` environment variables, defaulting unset ones.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = Self::default();
        let config = Self {
            reconnect_max_attempts: env_or(
                "TRACKER_RECONNECT_MAX_ATTEMPTS",
                defaults.reconnect_max_attempts,
            )?,
            reconnect_base_delay_ms: env_or(
                "TRACKER_RECONNECT_BASE_DELAY_MS",
                defaults.reconnect_base_delay_ms,
            )?,
            reconnect_max_delay_ms: env_or(
                "TRACKER_RECONNECT_MAX_DELAY_MS",
                defaults.reconnect_max_delay_ms,
            )?,
            snapshot_interval_ms: env_or("TRACKER_SNAPSHOT_INTERVAL_MS", defaults.snapshot_interval_ms)?,
            log_retention_count: env_or("TRACKER_LOG_RETENTION_COUNT", defaults.log_retention_count)?,
            fallback_after_ms: env_or("TRACKER_FALLBACK_AFTER_MS", defaults.fallback_after_ms)?,
            queue_capacity: env_or("TRACKER_QUEUE_CAPACITY", defaults.queue_capacity)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), TrackerError> {
        if self.reconnect_base_delay_ms == 0 {
            return Err(TrackerError::Config(
                "reconnectBaseDelayMs must be greater than zero".into(),
            ));
        }
        if self.reconnect_max_delay_ms < self.reconnect_base_delay_ms {
            return Err(TrackerError::Config(
                "reconnectMaxDelayMs must not be below reconnectBaseDelayMs".into(),
            ));
        }
        if self.snapshot_interval_ms == 0 {
            return Err(TrackerError::Config(
                "snapshotIntervalMs must be greater than zero".into(),
            ));
        }
        if self.fallback_after_ms == 0 {
            return Err(TrackerError::Config(
                "fallbackAfterMs must be greater than zero".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(TrackerError::Config(
                "queueCapacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn with_reconnect(mut self, max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.reconnect_max_attempts = max_attempts;
        self.reconnect_base_delay_ms = base_delay_ms;
        self.reconnect_max_delay_ms = max_delay_ms;
        self
    }

    pub fn with_snapshot_interval_ms(mut self, interval_ms: u64) -> Self {
        self.snapshot_interval_ms = interval_ms;
        self
    }

    pub fn with_log_retention(mut self, count: usize) -> Self {
        self.log_retention_count = count;
        self
    }

    pub fn with_fallback_after_ms(mut self, after_ms: u64) -> Self {
        self.fallback_after_ms = after_ms;
        self
    }

    pub fn reconnect_backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.reconnect_base_delay_ms),
            Duration::from_millis(self.reconnect_max_delay_ms),
        )
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    pub fn fallback_after(&self) -> Duration {
        Duration::from_millis(self.fallback_after_ms)
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a valid number", key)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TrackerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reconnect_max_attempts, 5);
        assert_eq!(config.snapshot_interval(), Duration::from_secs(15));
    }

    #[test]
    fn test_rejects_inverted_backoff_bounds() {
        let config = TrackerConfig::default().with_reconnect(3, 1_000, 100);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, TrackerError::Config(_)));
    }

    #[test]
    fn test_rejects_zero_interval() {
        let config = TrackerConfig::default().with_snapshot_interval_ms(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserializes_recognized_options() {
        let config: TrackerConfig = serde_json::from_value(serde_json::json!({
            "reconnectMaxAttempts": 2,
            "reconnectBaseDelayMs": 50,
            "reconnectMaxDelayMs": 400,
            "snapshotIntervalMs": 1000,
            "logRetentionCount": 20
        }))
        .unwrap();

        assert_eq!(config.reconnect_max_attempts, 2);
        assert_eq!(config.log_retention_count, 20);
        // Unlisted options keep their defaults
        assert_eq!(config.fallback_after_ms, 10_000);
        assert_eq!(config.reconnect_backoff().delay(4), Duration::from_millis(400));
    }

    #[test]
    fn test_env_or_parses_and_defaults() {
        std::env::set_var("TRACKER_TEST_ENV_OR_VALUE", " 42 ");
        let value: u64 = env_or("TRACKER_TEST_ENV_OR_VALUE", 7).unwrap();
        assert_eq!(value, 42);

        let value: u64 = env_or("TRACKER_TEST_ENV_OR_MISSING", 7).unwrap();
        assert_eq!(value, 7);

        std::env::set_var("TRACKER_TEST_ENV_OR_BAD", "soon");
        assert!(env_or::<u64>("TRACKER_TEST_ENV_OR_BAD", 7).is_err());
    }
}
