//! Damped, asymmetric delay controller.
//!
//! Each destination owns one controller. On every error the caller feeds the current error rate
//! and the controller nudges its delay by a step of at most `base_increment`:
//!
//! - `rate_diff = rate - last_rate`
//! - `step = min(base_increment * max(|rate_diff|, 0.1), base_increment)`
//! - the delay shrinks by `step` only when the rate is not rising, is below
//!   [`HEALTHY_RATE`] and the delay is still larger than `step`; otherwise it grows by `step`.
//!
//! Because a decrease only happens while `delay > step`, the delay can never go negative.
//!
//! ```rust
//! use crawlguard::DelayController;
//!
//! let mut ctl = DelayController::with_state(0.05, 0.5, 0.5);
//! let delay = ctl.compute_delay(0.02);
//! assert!((delay - 0.45).abs() < 1e-12);
//! ```

/// Error rate (errors/second) below which the destination counts as healthy.
pub const HEALTHY_RATE: f64 = 0.05;

/// Default maximum per-call delay change, in seconds.
pub const DEFAULT_INCREMENT: f64 = 0.05;

/// Lower bound on the rate change used to scale the step.
const MIN_RATE_DIFF: f64 = 0.1;

/// Direction of the last adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Increased,
    Decreased,
}

/// Per-destination delay state.
#[derive(Debug, Clone)]
pub struct DelayController {
    delay: f64,
    base_increment: f64,
    last_rate: f64,
    last_decrease_at: Option<f64>,
    last_adjustment: Option<Adjustment>,
}

impl DelayController {
    /// Controller starting at zero delay.
    pub fn new(base_increment: f64) -> Self {
        Self::with_state(base_increment, 0.0, 0.0)
    }

    /// Controller starting from an explicit delay and last observed rate.
    pub fn with_state(base_increment: f64, delay: f64, last_rate: f64) -> Self {
        Self {
            delay: delay.max(0.0),
            base_increment: sanitize_increment(base_increment),
            last_rate,
            last_decrease_at: None,
            last_adjustment: None,
        }
    }

    /// Current delay in seconds.
    pub fn delay(&self) -> f64 {
        self.delay
    }

    pub fn last_rate(&self) -> f64 {
        self.last_rate
    }

    pub fn base_increment(&self) -> f64 {
        self.base_increment
    }

    /// Change the maximum step; takes effect on the next adjustment.
    pub fn set_base_increment(&mut self, base_increment: f64) {
        self.base_increment = sanitize_increment(base_increment);
    }

    pub fn last_decrease_at(&self) -> Option<f64> {
        self.last_decrease_at
    }

    pub fn last_adjustment(&self) -> Option<Adjustment> {
        self.last_adjustment
    }

    /// Feed the latest error rate and return the adjusted delay.
    pub fn compute_delay(&mut self, rate: f64) -> f64 {
        // NaN carries no signal; treat it as "unchanged".
        let rate = if rate.is_nan() { self.last_rate } else { rate };
        let rate_diff = rate - self.last_rate;
        let step = self.step_for(rate_diff);

        if rate_diff <= 0.0 && rate < HEALTHY_RATE && self.delay > step {
            self.delay -= step;
            self.last_adjustment = Some(Adjustment::Decreased);
        } else {
            self.delay += step;
            self.last_adjustment = Some(Adjustment::Increased);
        }
        self.last_rate = rate;
        self.delay
    }

    /// Run an adjustment after a quiet period.
    ///
    /// Fires only if an error was ever seen and both the last error and the last relaxation are
    /// older than `quiet_secs`. Returns the new delay when it fired.
    pub fn relax(
        &mut self,
        now: f64,
        last_error_at: Option<f64>,
        rate: f64,
        quiet_secs: f64,
    ) -> Option<f64> {
        let last_error_at = last_error_at?;
        let since_decrease = now - self.last_decrease_at.unwrap_or(f64::NEG_INFINITY);
        if now - last_error_at > quiet_secs && since_decrease > quiet_secs {
            let delay = self.compute_delay(rate);
            self.last_decrease_at = Some(now);
            Some(delay)
        } else {
            None
        }
    }

    fn step_for(&self, rate_diff: f64) -> f64 {
        (self.base_increment * rate_diff.abs().max(MIN_RATE_DIFF)).min(self.base_increment)
    }
}

impl Default for DelayController {
    fn default() -> Self {
        Self::new(DEFAULT_INCREMENT)
    }
}

fn sanitize_increment(inc: f64) -> f64 {
    if inc.is_finite() && inc > 0.0 {
        inc
    } else {
        DEFAULT_INCREMENT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-12;

    #[test]
    fn healthy_falling_rate_decreases_by_full_step() {
        let mut ctl = DelayController::with_state(0.05, 0.5, 0.5);
        let delay = ctl.compute_delay(0.02);
        assert!((delay - 0.45).abs() < EPS);
        assert_eq!(ctl.last_rate(), 0.02);
        assert_eq!(ctl.last_adjustment(), Some(Adjustment::Decreased));
    }

    #[test]
    fn rising_rate_increases_bounded_by_increment() {
        let mut ctl = DelayController::new(0.05);
        let mut prev = ctl.delay();
        for rate in [0.1, 0.5, 2.0, 10.0, 1000.0] {
            let next = ctl.compute_delay(rate);
            assert!(next > prev);
            assert!(next - prev <= 0.05 + EPS);
            prev = next;
        }
    }

    #[test]
    fn small_rate_change_dampens_step() {
        let mut ctl = DelayController::with_state(0.05, 1.0, 1.0);
        // |diff| = 0.02 < 0.1, so step = 0.05 * 0.1.
        let delay = ctl.compute_delay(1.02);
        assert!((delay - 1.005).abs() < EPS);
    }

    #[test]
    fn stable_low_rate_decreases_until_step_then_stops() {
        let mut ctl = DelayController::with_state(0.05, 0.1, 0.0);
        let step = 0.05 * 0.1;
        let mut prev = ctl.delay();
        loop {
            let next = ctl.compute_delay(0.0);
            if prev > step {
                assert!(next < prev, "should keep decreasing while above step");
            } else {
                assert!(next > prev, "clamped: no further decrease at or below step");
                break;
            }
            prev = next;
        }
        assert!(ctl.delay() > 0.0);
    }

    #[test]
    fn never_negative_for_any_rate_sequence() {
        let mut ctl = DelayController::new(0.05);
        let rates = [
            0.0, 5.0, 0.0, 0.0, 0.01, 3.0, 0.0, 0.0, 0.0, 0.0, f64::INFINITY, 0.0, f64::NAN, 0.0,
        ];
        for _ in 0..50 {
            for rate in rates {
                assert!(ctl.compute_delay(rate) >= 0.0);
            }
        }
    }

    #[test]
    fn high_but_falling_rate_still_increases() {
        let mut ctl = DelayController::with_state(0.05, 1.0, 5.0);
        let delay = ctl.compute_delay(1.0);
        assert!(delay > 1.0);
    }

    #[test]
    fn relax_requires_quiet_period() {
        let mut ctl = DelayController::with_state(0.05, 1.0, 0.0);
        assert_eq!(ctl.relax(100.0, None, 0.0, 30.0), None, "no errors ever seen");
        assert_eq!(ctl.relax(100.0, Some(80.0), 0.0, 30.0), None, "error too recent");

        let relaxed = ctl.relax(100.0, Some(50.0), 0.0, 30.0).expect("quiet long enough");
        assert!(relaxed < 1.0);
        assert_eq!(ctl.last_decrease_at(), Some(100.0));

        assert_eq!(ctl.relax(110.0, Some(50.0), 0.0, 30.0), None, "relaxed too recently");
        assert!(ctl.relax(131.0, Some(50.0), 0.0, 30.0).is_some());
    }

    #[test]
    fn invalid_increment_falls_back_to_default() {
        let mut ctl = DelayController::new(-1.0);
        assert_eq!(ctl.base_increment(), DEFAULT_INCREMENT);
        ctl.set_base_increment(f64::NAN);
        assert_eq!(ctl.base_increment(), DEFAULT_INCREMENT);
        ctl.set_base_increment(0.2);
        assert_eq!(ctl.base_increment(), 0.2);
    }
}
