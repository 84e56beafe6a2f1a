//! Time sources for the error-rate window and the delay controller.
//!
//! All throttling math works in fractional seconds, so clocks report `f64` seconds from an
//! arbitrary origin. Only differences between readings are meaningful.

use std::sync::Mutex;
use std::time::Instant;

/// Clock abstraction so timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Seconds elapsed since this clock's origin.
    fn now_secs(&self) -> f64;
}

/// Monotonic clock backed by `Instant::now()`.
///
/// The origin is the moment the clock was created, so readings restart at zero with the process.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

/// Manually driven clock for deterministic tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    /// Start the clock at `secs`.
    pub fn starting_at(secs: f64) -> Self {
        Self { now: Mutex::new(secs) }
    }

    /// Jump to an absolute reading.
    pub fn set(&self, secs: f64) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = secs;
    }

    /// Move the clock forward by `secs`.
    pub fn advance(&self, secs: f64) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += secs;
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> f64 {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now_secs(&self) -> f64 {
        (**self).now_secs()
    }
}
