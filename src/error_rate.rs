//! Sliding-window error rate.
//!
//! The tracker keeps the timestamps of the last `W` errors, oldest first. Once the window is
//! full, the rate is `W` divided by the span between the oldest and the newest entry, i.e. the
//! average number of errors per second over the last `W` errors. Before the window fills the
//! rate is reported as zero.
//!
//! ```rust
//! use crawlguard::ErrorRateTracker;
//!
//! let mut tracker = ErrorRateTracker::new(10);
//! for t in 0..10 {
//!     tracker.record_error(t as f64);
//! }
//! assert!((tracker.current_rate() - 10.0 / 9.0).abs() < 1e-12);
//! ```

use std::collections::VecDeque;

/// Default number of errors kept in the window.
pub const DEFAULT_WINDOW: usize = 10;

/// Smallest span (seconds) used when computing a rate, so a burst of errors recorded within the
/// same clock tick yields a large finite rate instead of dividing by zero.
pub const MIN_SPAN_SECS: f64 = 1e-3;

/// Bounded, oldest-eviction-first window of error timestamps.
#[derive(Debug, Clone)]
pub struct ErrorRateTracker {
    window: usize,
    errors: VecDeque<f64>,
}

impl ErrorRateTracker {
    /// Create a tracker holding at most `window` timestamps (at least one).
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self { window, errors: VecDeque::with_capacity(window) }
    }

    /// Window capacity `W`.
    pub fn window(&self) -> usize {
        self.window
    }

    /// Append an error observed at `now` (seconds), evicting the oldest when full.
    pub fn record_error(&mut self, now: f64) {
        while self.errors.len() >= self.window {
            self.errors.pop_front();
        }
        self.errors.push_back(now);
    }

    /// Errors per second over the last `W` errors; zero until `W` errors were seen.
    pub fn current_rate(&self) -> f64 {
        if self.errors.len() < self.window {
            return 0.0;
        }
        match (self.errors.front(), self.errors.back()) {
            (Some(oldest), Some(newest)) => {
                let span = (newest - oldest).max(MIN_SPAN_SECS);
                self.window as f64 / span
            }
            _ => 0.0,
        }
    }

    /// Timestamp of the most recent error, if any.
    pub fn last_error_at(&self) -> Option<f64> {
        self.errors.back().copied()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Forget every recorded error.
    pub fn clear(&mut self) {
        self.errors.clear();
    }
}

impl Default for ErrorRateTracker {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_is_zero_until_window_fills() {
        let mut tracker = ErrorRateTracker::new(10);
        for t in 0..9 {
            tracker.record_error(t as f64);
            assert_eq!(tracker.current_rate(), 0.0, "after {} errors", t + 1);
        }
    }

    #[test]
    fn full_window_rate_spans_oldest_to_newest() {
        let mut tracker = ErrorRateTracker::new(10);
        for t in 0..10 {
            tracker.record_error(t as f64);
        }
        assert!((tracker.current_rate() - 10.0 / 9.0).abs() < 1e-12);
    }

    #[test]
    fn appending_when_full_evicts_oldest() {
        let mut tracker = ErrorRateTracker::new(3);
        for t in [0.0, 1.0, 2.0, 10.0] {
            tracker.record_error(t);
        }
        assert_eq!(tracker.len(), 3);
        // Window now holds 1, 2, 10.
        assert!((tracker.current_rate() - 3.0 / 9.0).abs() < 1e-12);
        assert_eq!(tracker.last_error_at(), Some(10.0));
    }

    #[test]
    fn length_never_exceeds_window() {
        let mut tracker = ErrorRateTracker::new(4);
        for t in 0..100 {
            tracker.record_error(t as f64 * 0.5);
            assert!(tracker.len() <= 4);
        }
    }

    #[test]
    fn identical_timestamps_give_finite_rate() {
        let mut tracker = ErrorRateTracker::new(2);
        tracker.record_error(3.0);
        tracker.record_error(3.0);
        let rate = tracker.current_rate();
        assert!(rate.is_finite());
        assert!(rate > 0.0);
    }

    #[test]
    fn zero_window_is_clamped_to_one() {
        let mut tracker = ErrorRateTracker::new(0);
        assert_eq!(tracker.window(), 1);
        tracker.record_error(1.0);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn clear_resets_window() {
        let mut tracker = ErrorRateTracker::default();
        tracker.record_error(1.0);
        tracker.clear();
        assert!(tracker.is_empty());
        assert_eq!(tracker.last_error_at(), None);
    }
}
