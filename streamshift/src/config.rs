//! Configuration for migrations.
//!
//! All settings are plain structs with sensible defaults that can be built in
//! code or deserialized from a config file. Durations are expressed in
//! milliseconds when serialized.

use crate::book_closing::BookClosingConfig;
use crate::errors::ValidationError;
use crate::lock::HeartbeatConfig;
use crate::planner::PlannerConfig;
use crate::verification::VerificationConfig;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Serde helper storing a `Duration` as whole milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serializes a duration as milliseconds.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserializes a duration from milliseconds.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Retry behaviour for out-of-band work such as reconciling failed mirror writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts per pending item before it is reported as stuck.
    pub max_attempts: u32,
    /// Base delay between retry attempts.
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    /// Maximum delay between retry attempts (for exponential backoff).
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before the given attempt (1-based), with up to 10% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = rand::rng().random_range(0.0..=capped * 0.1);
        Duration::from_secs_f64(capped + jitter).min(self.max_delay)
    }
}

/// Settings for one migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// How long to wait for the migration lock.
    #[serde(with = "duration_ms")]
    pub lock_timeout: Duration,
    /// Lease renewal settings.
    pub heartbeat: HeartbeatConfig,
    /// Events copied per backfill batch.
    pub backfill_batch_size: usize,
    /// Catch-up passes allowed before the migration is reported as stalled.
    ///
    /// A pass copies everything the old stream gained since the previous pass.
    /// The DualWrite exit gate is reached when a pass finds the new stream at
    /// exactly the old stream's version.
    pub max_catch_up_passes: u32,
    /// Checks run before cutover.
    pub verification: VerificationConfig,
    /// Finalization of the old stream; `None` leaves it open after cutover.
    pub book_closing: Option<BookClosingConfig>,
    /// Dry-run planner settings.
    pub planner: PlannerConfig,
    /// Retry settings for failed mirror writes.
    pub retry: RetryConfig,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(30),
            heartbeat: HeartbeatConfig::default(),
            backfill_batch_size: 500,
            max_catch_up_passes: 10,
            verification: VerificationConfig::default(),
            book_closing: Some(BookClosingConfig::default()),
            planner: PlannerConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl MigrationConfig {
    /// Rejects unusable settings before any side effect happens.
    pub fn validate(&self, lease: Option<Duration>) -> Result<(), ValidationError> {
        self.heartbeat.validate(lease)?;
        if self.backfill_batch_size == 0 {
            return Err(ValidationError::InvalidConfiguration(
                "backfill_batch_size must be at least 1".to_string(),
            ));
        }
        if self.max_catch_up_passes == 0 {
            return Err(ValidationError::InvalidConfiguration(
                "max_catch_up_passes must be at least 1".to_string(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ValidationError::InvalidConfiguration(
                "retry backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        if let Some(book_closing) = &self.book_closing {
            book_closing.validate()?;
        }
        self.planner.validate()
    }
}
