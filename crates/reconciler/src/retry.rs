//! Exponential backoff with jitter.
//!
//! [`RetryPolicy`] bounds per-action retries inside a cycle; [`Backoff`] is
//! the delay-only curve the work queue applies to failed cycles, which are
//! retried without limit.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per action, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failure.
    #[serde(rename = "initial_delay_ms", with = "crate::config::duration_ms")]
    pub initial_delay: Duration,
    /// Upper bound on any single delay (before jitter).
    #[serde(rename = "max_delay_ms", with = "crate::config::duration_ms")]
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with jitter enabled.
    #[must_use]
    pub const fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            multiplier: 2.0,
            jitter: true,
        }
    }

    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Whether another attempt is allowed after `attempt` attempts.
    #[must_use]
    pub const fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay after the `failures`-th consecutive failure (1-based).
    ///
    /// Zero failures means no delay.
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        exponential_delay(
            self.initial_delay,
            self.max_delay,
            self.multiplier,
            self.jitter,
            failures,
        )
    }

    /// Check the policy is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] on zero attempts, a multiplier below
    /// one, or an initial delay above the maximum.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::invalid_config("max_attempts must be at least 1"));
        }
        validate_curve(self.initial_delay, self.max_delay, self.multiplier)
    }
}

/// Per-key requeue delay after failed cycles.
///
/// Unlike [`RetryPolicy`] there is no attempt limit: a key keeps backing
/// off until it converges or fails fatally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Backoff {
    #[serde(rename = "initial_delay_ms", with = "crate::config::duration_ms")]
    pub initial_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "crate::config::duration_ms")]
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(60))
    }
}

impl Backoff {
    /// Create a doubling backoff with jitter enabled.
    #[must_use]
    pub const fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 2.0,
            jitter: true,
        }
    }

    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay after the `failures`-th consecutive failed cycle (1-based).
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        exponential_delay(
            self.initial_delay,
            self.max_delay,
            self.multiplier,
            self.jitter,
            failures,
        )
    }

    /// Check the curve is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] on a multiplier below one or an
    /// initial delay above the maximum.
    pub fn validate(&self) -> Result<()> {
        validate_curve(self.initial_delay, self.max_delay, self.multiplier)
    }
}

/// Reuse an action policy's curve; its attempt limit does not apply.
impl From<RetryPolicy> for Backoff {
    fn from(policy: RetryPolicy) -> Self {
        Self {
            initial_delay: policy.initial_delay,
            max_delay: policy.max_delay,
            multiplier: policy.multiplier,
            jitter: policy.jitter,
        }
    }
}

fn exponential_delay(
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: bool,
    failures: u32,
) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }

    let exponent = i32::try_from(failures.saturating_sub(1)).unwrap_or(i32::MAX);
    let base_ms = initial.as_millis() as f64 * multiplier.powi(exponent);
    let capped_ms = base_ms.min(max.as_millis() as f64);

    let final_ms = if jitter {
        // Add up to 25% jitter
        capped_ms * (1.0 + rand::random::<f64>() * 0.25)
    } else {
        capped_ms
    };

    Duration::from_millis(final_ms as u64)
}

fn validate_curve(initial: Duration, max: Duration, multiplier: f64) -> Result<()> {
    if !multiplier.is_finite() || multiplier < 1.0 {
        return Err(Error::invalid_config("multiplier must be >= 1.0"));
    }
    if initial > max {
        return Err(Error::invalid_config(
            "initial_delay_ms must not exceed max_delay_ms",
        ));
    }
    Ok(())
}
