//! Retry policy shared by the mutation executor and the readiness waiter
//!
//! A policy bounds a retry loop by overall timeout, by attempt count, or both
//! (whichever is hit first). Between attempts the caller pauses for
//! [`RetryPolicy::delay_for`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{CoreError, Result};

/// Shape of the pause between attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Always wait one interval
    #[default]
    Fixed,
    /// Double the interval after every failed attempt, up to `max_interval`
    Exponential,
}

/// Retry configuration
///
/// Deserializes from YAML/JSON with human-readable durations:
///
/// ```yaml
/// interval: 100ms
/// timeout: 5s
/// maxAttempts: 10
/// backoff: exponential
/// maxInterval: 2s
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Backoff unit
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Overall deadline for the whole loop, measured from the first attempt
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// Maximum number of attempts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    /// Backoff shape
    #[serde(default)]
    pub backoff: BackoffKind,

    /// Upper bound for exponential backoff
    #[serde(default = "default_max_interval", with = "humantime_serde")]
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            timeout: default_timeout(),
            max_attempts: None,
            backoff: BackoffKind::Fixed,
            max_interval: default_max_interval(),
        }
    }
}

fn default_interval() -> Duration {
    Duration::from_millis(50)
}

fn default_timeout() -> Option<Duration> {
    Some(Duration::from_secs(2))
}

fn default_max_interval() -> Duration {
    Duration::from_secs(30)
}

impl RetryPolicy {
    /// Bounded by attempt count only, 10ms apart
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            interval: Duration::from_millis(10),
            timeout: None,
            max_attempts: Some(max_attempts),
            ..Self::default()
        }
    }

    /// Polling policy for readiness checks: every 2s for up to 10 minutes
    pub fn readiness() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Some(Duration::from_secs(600)),
            ..Self::default()
        }
    }

    /// Zero-delay policy bounded by attempt count
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            interval: Duration::ZERO,
            timeout: None,
            max_attempts: Some(max_attempts),
            ..Self::default()
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn without_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn exponential(mut self, max_interval: Duration) -> Self {
        self.backoff = BackoffKind::Exponential;
        self.max_interval = max_interval;
        self
    }

    /// Parse and validate a policy from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let policy: Self = serde_yaml::from_str(yaml)?;
        policy.validate()?;
        Ok(policy)
    }

    /// Reject policies that could retry forever or never attempt at all
    pub fn validate(&self) -> Result<()> {
        if !self.is_bounded() {
            return Err(CoreError::InvalidPolicy(
                "policy needs a timeout, maxAttempts, or both".to_string(),
            ));
        }
        if self.max_attempts == Some(0) {
            return Err(CoreError::InvalidPolicy(
                "maxAttempts must be at least 1".to_string(),
            ));
        }
        if self.backoff == BackoffKind::Exponential && self.max_interval < self.interval {
            return Err(CoreError::InvalidPolicy(format!(
                "maxInterval ({:?}) is shorter than interval ({:?})",
                self.max_interval, self.interval
            )));
        }
        Ok(())
    }

    /// Whether the loop has any bound at all
    pub fn is_bounded(&self) -> bool {
        self.timeout.is_some() || self.max_attempts.is_some()
    }

    /// True once `attempts` attempts have used up the attempt budget
    pub fn attempts_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }

    /// Pause after the `attempt`-th failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            BackoffKind::Fixed => self.interval,
            BackoffKind::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.interval.saturating_mul(factor).min(self.max_interval)
            }
        }
    }
}
