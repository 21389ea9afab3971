//! Capped exponential backoff for consumer retries

use std::time::Duration;

use backoff::backoff::Backoff;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Retry configuration: how many times to retry and how long to wait between
/// attempts.
///
/// The delay after attempt `n` (zero-based) is
/// `min(initial_backoff * factor^n, max_backoff)`. There is no jitter, so the
/// schedule is fully determined by the policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Create a validated retry policy
    pub fn new(
        max_retries: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        factor: f64,
    ) -> Result<Self> {
        if initial_backoff.is_zero() {
            return Err(Error::config("initial backoff must be positive"));
        }
        if max_backoff < initial_backoff {
            return Err(Error::config(format!(
                "max backoff {:?} is shorter than initial backoff {:?}",
                max_backoff, initial_backoff
            )));
        }
        if !factor.is_finite() || factor < 1.0 {
            return Err(Error::config(format!(
                "backoff factor must be at least 1.0, got {}",
                factor
            )));
        }

        Ok(Self {
            max_retries,
            initial_backoff,
            max_backoff,
            factor,
        })
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    /// Delay to wait after the given zero-based attempt failed
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let cap = self.max_backoff.as_secs_f64();
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.initial_backoff.as_secs_f64() * self.factor.powi(exponent);

        // Clamp before converting so huge exponents never overflow Duration
        if !scaled.is_finite() || scaled >= cap {
            self.max_backoff
        } else {
            Duration::from_secs_f64(scaled)
        }
    }

    /// A fresh backoff schedule yielding one delay per allowed retry
    pub fn backoff(&self) -> PolicyBackoff {
        PolicyBackoff {
            policy: *self,
            attempt: 0,
        }
    }
}

/// Iterator-like view over a [`RetryPolicy`], usable wherever the `backoff`
/// crate's [`Backoff`] trait is expected.
///
/// Yields `next_delay(0)`, `next_delay(1)`, ... and then `None` once
/// `max_retries` delays were handed out.
#[derive(Debug, Clone)]
pub struct PolicyBackoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl PolicyBackoff {
    /// Number of delays handed out since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

impl Backoff for PolicyBackoff {
    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_retries {
            return None;
        }
        let delay = self.policy.next_delay(self.attempt);
        self.attempt += 1;
        Some(delay)
    }
}
