//! Backoff for transient failures.
//!
//! Rate-limited responses are paced by the destination's [`DelayController`](crate::DelayController);
//! transient failures (5xx, resets, timeouts) use this capped exponential schedule instead, with
//! optional jitter so retries from many concurrent requests do not line up.
//!
//! Attempt semantics: attempt `1` is the first retry. Attempt `0` has no delay.
//!
//! ```rust
//! use std::time::Duration;
//! use crawlguard::{Backoff, Jitter};
//!
//! let backoff = Backoff::exponential(Duration::from_millis(500), Duration::from_secs(4))
//!     .unwrap()
//!     .with_jitter(Jitter::None);
//! assert_eq!(backoff.delay(1), Duration::from_millis(500));
//! assert_eq!(backoff.delay(3), Duration::from_secs(2));
//! assert_eq!(backoff.delay(9), Duration::from_secs(4));
//! ```

use rand::{rng, Rng};
use std::time::Duration;

/// Hard ceiling for any computed delay (1 hour).
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Invalid backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackoffError {
    #[error("backoff max must be greater than zero")]
    MaxMustBePositive,
    #[error("backoff max ({max:?}) must be >= base ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
}

/// How a computed delay is randomized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// Use the exact delay.
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// Uniform in `[delay / 2, delay]`.
    #[default]
    Equal,
}

impl Jitter {
    /// Randomize `delay` with the thread-local RNG.
    pub fn apply(self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rng())
    }

    /// Randomize `delay` with a caller-supplied RNG.
    pub fn apply_with_rng<R: Rng>(self, delay: Duration, rng: &mut R) -> Duration {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        if millis == 0 {
            return Duration::ZERO;
        }
        match self {
            Jitter::None => delay,
            Jitter::Full => Duration::from_millis(rng.random_range(0..=millis)),
            Jitter::Equal => Duration::from_millis(rng.random_range(millis / 2..=millis)),
        }
    }
}

/// Capped exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: Jitter,
}

impl Backoff {
    /// Exponential schedule `base * 2^(attempt - 1)`, capped at `max`.
    pub fn exponential(base: Duration, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        if max < base {
            return Err(BackoffError::MaxLessThanBase { base, max });
        }
        Ok(Self { base, max: max.min(MAX_BACKOFF), jitter: Jitter::default() })
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn jitter(&self) -> Jitter {
        self.jitter
    }

    /// Deterministic delay for `attempt`, before jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(63);
        let multiplier = 1u128 << exponent;
        let nanos = self.base.as_nanos().saturating_mul(multiplier);
        let capped = nanos.min(self.max.as_nanos());
        Duration::from_nanos(u64::try_from(capped).unwrap_or(u64::MAX))
    }

    /// Delay for `attempt` with jitter applied.
    pub fn jittered(&self, attempt: u32) -> Duration {
        self.jitter.apply(self.delay(attempt))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self { base: Duration::from_secs(1), max: Duration::from_secs(60), jitter: Jitter::default() }
    }
}
