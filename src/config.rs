use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::{Clock, HybridClock, LogicalClock};
use crate::types::Timestamp;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Per-partition configuration loaded at startup.
///
/// Values can be hydrated from a JSON file with [`MvccConfig::from_json_file`];
/// fields missing from the file fall back to their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MvccConfig {
    /// Identifier used in logs.
    pub partition_id: String,
    /// Timestamp source for the partition.
    pub clock: ClockConfig,
    /// Deadline applied by [`crate::Partition::wait_for_clean_snapshot_at`].
    pub default_wait_timeout_ms: u64,
}

impl MvccConfig {
    pub fn new(partition_id: impl Into<String>, clock: ClockConfig) -> Self {
        Self {
            partition_id: partition_id.into(),
            clock,
            ..Self::default()
        }
    }

    pub fn with_clock(mut self, clock: ClockConfig) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_default_wait_timeout(mut self, timeout: Duration) -> Self {
        self.default_wait_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn default_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.default_wait_timeout_ms)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let bytes = fs::read(path.as_ref())?;
        let config: Self = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.partition_id.is_empty() {
            return Err(ConfigError::Invalid("partition_id must not be empty".into()));
        }
        self.clock.validate()
    }
}

impl Default for MvccConfig {
    fn default() -> Self {
        Self {
            partition_id: "partition-0".into(),
            clock: ClockConfig::logical(),
            default_wait_timeout_ms: 5_000,
        }
    }
}

/// Supported clock implementations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClockKind {
    Logical,
    Hybrid,
}

/// Clock configuration specifying the implementation and its tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClockConfig {
    pub kind: ClockKind,
    /// First value a logical clock hands out.
    pub initial: Timestamp,
    /// Uncertainty window of a hybrid clock, in microseconds.
    pub max_error_us: u64,
    /// Largest backwards update a logical clock tolerates before rejecting it.
    pub max_regression: Option<u64>,
}

impl ClockConfig {
    pub fn logical() -> Self {
        Self {
            kind: ClockKind::Logical,
            initial: Timestamp::INITIAL,
            max_error_us: 0,
            max_regression: None,
        }
    }

    pub fn hybrid(max_error: Duration) -> Self {
        Self {
            kind: ClockKind::Hybrid,
            max_error_us: u64::try_from(max_error.as_micros()).unwrap_or(u64::MAX),
            ..Self::logical()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.kind {
            ClockKind::Logical if self.initial < Timestamp::INITIAL => Err(ConfigError::Invalid(
                format!("logical clock must start at or after {}", Timestamp::INITIAL),
            )),
            ClockKind::Hybrid if self.max_error_us == 0 => Err(ConfigError::Invalid(
                "hybrid clock requires a non-zero max_error_us".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Instantiates the configured clock.
    pub fn build(&self) -> Result<Arc<dyn Clock>, ConfigError> {
        self.validate()?;
        let clock: Arc<dyn Clock> = match self.kind {
            ClockKind::Logical => {
                let mut clock = LogicalClock::starting_at(self.initial);
                if let Some(limit) = self.max_regression {
                    clock = clock.with_max_regression(limit);
                }
                Arc::new(clock)
            }
            ClockKind::Hybrid => Arc::new(HybridClock::new(Duration::from_micros(
                self.max_error_us,
            ))),
        };
        Ok(clock)
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self::logical()
    }
}
