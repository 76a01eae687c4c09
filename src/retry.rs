//! Retry eligibility and backoff computation.
//!
//! A [`RetryPolicy`] is an immutable value: attach one to the client as the
//! default, or to a single request as an override. Eligibility is gated on
//! both the attempt index and the error's retryable category.

use std::time::Duration;

use rand::Rng;

use crate::error::Error;

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(200);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);
const DEFAULT_LINEAR_BASE_DELAY: Duration = Duration::from_millis(500);

/// Fixed-size flag set of retryable error categories.
///
/// Membership tests and set operations are single integer ops; the presets
/// cover the common configurations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RetryConditions(u8);

impl RetryConditions {
    pub const TIMEOUT: Self = Self(1);
    pub const CONNECTION_LOST: Self = Self(1 << 1);
    pub const NETWORK: Self = Self(1 << 2);
    pub const SERVER_ERROR: Self = Self(1 << 3);
    pub const RATE_LIMITED: Self = Self(1 << 4);
    pub const DNS: Self = Self(1 << 5);

    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self(0b0011_1111);
    /// Everything except generic network failures, whose causes (refused
    /// connections, malformed responses) are usually not transient.
    pub const DEFAULT: Self = Self(
        Self::TIMEOUT.0
            | Self::CONNECTION_LOST.0
            | Self::SERVER_ERROR.0
            | Self::RATE_LIMITED.0
            | Self::DNS.0,
    );

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for RetryConditions {
    type Output = Self;

    fn bitor(self, other: Self) -> Self {
        self.union(other)
    }
}

impl Default for RetryConditions {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Delay strategy between attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backoff {
    /// `min(base * 2^attempt, max)`, with optional symmetric jitter of up to
    /// half the capped delay in either direction.
    Exponential {
        base: Duration,
        max: Duration,
        jitter: bool,
    },
    /// `base * (attempt + 1)`.
    Linear { base: Duration },
    /// Zero delay.
    Immediate,
    /// Never retries, regardless of conditions.
    None,
}

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    max_retries: usize,
    conditions: RetryConditions,
    backoff: Backoff,
}

impl RetryPolicy {
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            conditions: RetryConditions::NONE,
            backoff: Backoff::None,
        }
    }

    pub const fn exponential(max_retries: usize) -> Self {
        Self {
            max_retries,
            conditions: RetryConditions::DEFAULT,
            backoff: Backoff::Exponential {
                base: DEFAULT_BASE_DELAY,
                max: DEFAULT_MAX_DELAY,
                jitter: true,
            },
        }
    }

    pub const fn linear(max_retries: usize) -> Self {
        Self {
            max_retries,
            conditions: RetryConditions::DEFAULT,
            backoff: Backoff::Linear {
                base: DEFAULT_LINEAR_BASE_DELAY,
            },
        }
    }

    pub const fn immediate(max_retries: usize) -> Self {
        Self {
            max_retries,
            conditions: RetryConditions::DEFAULT,
            backoff: Backoff::Immediate,
        }
    }

    pub fn conditions(mut self, conditions: RetryConditions) -> Self {
        self.conditions = conditions;
        self
    }

    /// Adjusts the base delay of the exponential and linear strategies; a
    /// no-op for the immediate and none strategies.
    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        match &mut self.backoff {
            Backoff::Exponential { base, max, .. } => {
                *base = base_delay;
                if *max < base_delay {
                    *max = base_delay;
                }
            }
            Backoff::Linear { base } => *base = base_delay,
            Backoff::Immediate | Backoff::None => {}
        }
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        if let Backoff::Exponential { base, max, .. } = &mut self.backoff {
            *max = max_delay.max(*base);
        }
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        if let Backoff::Exponential { jitter, .. } = &mut self.backoff {
            *jitter = enabled;
        }
        self
    }

    pub const fn max_retries(&self) -> usize {
        self.max_retries
    }

    pub const fn retry_conditions(&self) -> RetryConditions {
        self.conditions
    }

    pub const fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Attempt-index-gated and error-class-gated eligibility. `attempt` is
    /// the 0-based index of the attempt that just failed.
    pub fn should_retry(&self, error: &Error, attempt: usize) -> bool {
        if matches!(self.backoff, Backoff::None) {
            return false;
        }
        if attempt >= self.max_retries {
            return false;
        }
        error
            .retry_condition()
            .is_some_and(|condition| self.conditions.contains(condition))
    }

    /// Delay before re-attempting after the failure at `attempt`. A
    /// server-provided Retry-After always takes precedence over the
    /// computed backoff.
    pub fn delay_for(&self, attempt: usize, error: &Error) -> Duration {
        if let Some(retry_after) = error.retry_after() {
            return retry_after;
        }
        match self.backoff {
            Backoff::Exponential { base, max, jitter } => {
                let multiplier = 1_u128 << attempt.min(31);
                let capped_ms = base
                    .as_millis()
                    .saturating_mul(multiplier)
                    .min(max.as_millis())
                    .min(u64::MAX as u128) as u64;
                let delay = Duration::from_millis(capped_ms);
                if jitter { apply_jitter(delay) } else { delay }
            }
            Backoff::Linear { base } => {
                base.saturating_mul(attempt.saturating_add(1).min(u32::MAX as usize) as u32)
            }
            Backoff::Immediate | Backoff::None => Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3)
    }
}

/// Symmetric perturbation of up to ±50% of the delay, floored at zero.
fn apply_jitter(delay: Duration) -> Duration {
    let delay_ms = delay.as_millis().min(u64::MAX as u128) as u64;
    if delay_ms == 0 {
        return delay;
    }
    let span = (delay_ms as f64) * 0.5;
    let mut rng = rand::rng();
    let offset = rng.random_range(-span..=span);
    let jittered_ms = ((delay_ms as f64) + offset).max(0.0) as u64;
    Duration::from_millis(jittered_ms)
}
