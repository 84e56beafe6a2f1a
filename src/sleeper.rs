//! Sleeping abstraction used for retry backoff and the identity probe loop.
//!
//! Production code sleeps on the tokio timer; tests inject [`InstantSleeper`] or
//! [`TrackingSleeper`] so rotation loops and backoff schedules run without wall-clock delays.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Abstraction for sleeping/waiting.
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Sleeper backed by `tokio::time::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Sleeper that returns immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async {})
    }
}

/// Sleeper that records every requested pause and returns immediately.
///
/// Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    pauses: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// All pauses requested so far, in order.
    pub fn pauses(&self) -> Vec<Duration> {
        self.pauses.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Number of pauses requested so far.
    pub fn count(&self) -> usize {
        self.pauses.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Sum of all requested pauses.
    pub fn total(&self) -> Duration {
        self.pauses.lock().unwrap_or_else(|p| p.into_inner()).iter().sum()
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.pauses.lock().unwrap_or_else(|p| p.into_inner()).push(duration);
        Box::pin(async {})
    }
}

impl<S: Sleeper + ?Sized> Sleeper for Arc<S> {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        (**self).sleep(duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::Backoff;

    #[tokio::test]
    async fn records_capped_backoff_schedule() {
        let sleeper = TrackingSleeper::new();
        let backoff = Backoff::exponential(Duration::from_secs(1), Duration::from_secs(4)).unwrap();
        let shared: Arc<dyn Sleeper> = Arc::new(sleeper.clone());
        for attempt in 1..=4 {
            shared.sleep(backoff.delay(attempt)).await;
        }

        let secs = |s| Duration::from_secs(s);
        assert_eq!(sleeper.pauses(), vec![secs(1), secs(2), secs(4), secs(4)]);
        assert_eq!(sleeper.count(), 4);
        assert_eq!(sleeper.total(), secs(11));
    }

    #[tokio::test]
    async fn instant_sleeper_skips_probe_intervals() {
        let start = std::time::Instant::now();
        for _ in 0..50 {
            InstantSleeper.sleep(Duration::from_millis(100)).await;
        }
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_sleeper_honours_fractional_destination_delay() {
        let delay = Duration::from_secs_f64(0.65);
        let start = tokio::time::Instant::now();
        TokioSleeper.sleep(delay).await;
        assert!(start.elapsed() >= delay);
    }
}
