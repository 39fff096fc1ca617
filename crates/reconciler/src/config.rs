//! Reconciler configuration.
//!
//! Every field has a default, so a TOML table only needs the overrides:
//!
//! ```toml
//! workers = 8
//! resync_interval_ms = 60000
//!
//! [action_retry]
//! max_attempts = 5
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::retry::{Backoff, RetryPolicy};

/// Configuration for the reconciler and its loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Worker tasks; bounds parallelism across keys.
    pub workers: usize,
    /// Interval between periodic resyncs of every key.
    #[serde(rename = "resync_interval_ms", with = "duration_ms")]
    pub resync_interval: Duration,
    /// Immediate cycle restarts on a version conflict before giving up.
    pub conflict_retries: u32,
    /// Delay before rechecking a key whose actions succeeded but whose
    /// observed state has not caught up yet.
    #[serde(rename = "requeue_unconverged_ms", with = "duration_ms")]
    pub requeue_unconverged: Duration,
    /// How long shutdown waits for in-flight cycles.
    #[serde(rename = "shutdown_grace_ms", with = "duration_ms")]
    pub shutdown_grace: Duration,
    /// Per-action retries inside one cycle.
    pub action_retry: RetryPolicy,
    /// Per-key requeue backoff after failed cycles; unbounded attempts.
    pub requeue_backoff: Backoff,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_interval: Duration::from_secs(30),
            conflict_retries: 3,
            requeue_unconverged: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(10),
            action_retry: RetryPolicy::default(),
            requeue_backoff: Backoff::default(),
        }
    }
}

impl ReconcilerConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] on malformed TOML or invalid values.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(input).map_err(|e| Error::invalid_config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|e| {
            Error::invalid_config(format!("failed to read '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&input)
    }

    /// Check all values are usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::invalid_config("workers must be at least 1"));
        }
        if self.resync_interval.is_zero() {
            return Err(Error::invalid_config("resync_interval_ms must be positive"));
        }
        self.action_retry
            .validate()
            .map_err(|e| Error::invalid_config(format!("action_retry: {e}")))?;
        self.requeue_backoff
            .validate()
            .map_err(|e| Error::invalid_config(format!("requeue_backoff: {e}")))?;
        Ok(())
    }

    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    #[must_use]
    pub const fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }

    #[must_use]
    pub const fn with_requeue_unconverged(mut self, delay: Duration) -> Self {
        self.requeue_unconverged = delay;
        self
    }

    #[must_use]
    pub const fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    #[must_use]
    pub fn with_action_retry(mut self, policy: RetryPolicy) -> Self {
        self.action_retry = policy;
        self
    }

    #[must_use]
    pub fn with_requeue_backoff(mut self, backoff: impl Into<Backoff>) -> Self {
        self.requeue_backoff = backoff.into();
        self
    }
}

/// Serde adapter storing a [`Duration`] as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
