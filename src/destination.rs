//! Per-destination throttling state.
//!
//! A destination owns one [`ErrorRateTracker`] and one [`DelayController`] behind a single mutex,
//! so recording an error and recomputing the delay happen in one critical section. It also owns
//! the rotation gate: senders pass through a read guard, identity rotation holds the write guard.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use tokio::sync::RwLockWriteGuard;
use tracing::debug;

use crate::delay::{Adjustment, DelayController};
use crate::error_rate::ErrorRateTracker;
use crate::request::DestinationKey;

/// Result of feeding one error into a destination.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayUpdate {
    pub rate: f64,
    pub delay: Duration,
    pub adjustment: Adjustment,
}

/// Point-in-time view of one destination.
#[derive(Debug, Clone, PartialEq)]
pub struct DestinationSnapshot {
    pub key: DestinationKey,
    pub delay: Duration,
    pub rate: f64,
    pub errors: usize,
}

#[derive(Debug)]
struct State {
    tracker: ErrorRateTracker,
    controller: DelayController,
}

/// Throttling scope shared by a group of requests.
#[derive(Debug)]
pub struct Destination {
    key: DestinationKey,
    state: Mutex<State>,
    gate: tokio::sync::RwLock<()>,
}

impl Destination {
    pub fn new(key: DestinationKey, window: usize, base_increment: f64) -> Self {
        Self {
            key,
            state: Mutex::new(State {
                tracker: ErrorRateTracker::new(window),
                controller: DelayController::new(base_increment),
            }),
            gate: tokio::sync::RwLock::new(()),
        }
    }

    pub fn key(&self) -> &DestinationKey {
        &self.key
    }

    /// Record an error at `now` and recompute the delay from the new rate.
    pub fn record_error(&self, now: f64, base_increment: f64) -> DelayUpdate {
        let mut state = self.lock();
        state.controller.set_base_increment(base_increment);
        state.tracker.record_error(now);
        let rate = state.tracker.current_rate();
        let delay = state.controller.compute_delay(rate);
        let adjustment = state.controller.last_adjustment().unwrap_or(Adjustment::Increased);
        debug!(target: "crawlguard::destination", destination = %self.key, rate, delay, "delay recomputed");
        DelayUpdate { rate, delay: secs_to_duration(delay), adjustment }
    }

    /// Run the stabilization check; returns the update when the delay was adjusted.
    pub fn relax(&self, now: f64, quiet: Duration, base_increment: f64) -> Option<DelayUpdate> {
        let mut state = self.lock();
        let State { tracker, controller } = &mut *state;
        controller.set_base_increment(base_increment);
        let rate = tracker.current_rate();
        let delay = controller.relax(now, tracker.last_error_at(), rate, quiet.as_secs_f64())?;
        let adjustment = controller.last_adjustment().unwrap_or(Adjustment::Decreased);
        Some(DelayUpdate { rate, delay: secs_to_duration(delay), adjustment })
    }

    /// Current delay to wait before sending.
    pub fn delay(&self) -> Duration {
        secs_to_duration(self.lock().controller.delay())
    }

    pub fn snapshot(&self) -> DestinationSnapshot {
        let state = self.lock();
        DestinationSnapshot {
            key: self.key.clone(),
            delay: secs_to_duration(state.controller.delay()),
            rate: state.tracker.current_rate(),
            errors: state.tracker.len(),
        }
    }

    /// Wait until no rotation holds the gate.
    pub async fn pass_gate(&self) {
        drop(self.gate.read().await);
    }

    /// Close the gate; senders wait in [`pass_gate`](Self::pass_gate) until the guard drops.
    pub async fn close_gate(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write().await
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

pub(crate) fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
}

/// Lazily populated map from key to destination.
#[derive(Debug, Default)]
pub struct DestinationRegistry {
    inner: RwLock<HashMap<DestinationKey, Arc<Destination>>>,
}

impl DestinationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &DestinationKey) -> Option<Arc<Destination>> {
        self.inner.read().unwrap_or_else(|p| p.into_inner()).get(key).cloned()
    }

    /// Fetch `key`, creating it with the given window and increment on first use.
    pub fn get_or_create(
        &self,
        key: &DestinationKey,
        window: usize,
        base_increment: f64,
    ) -> Arc<Destination> {
        if let Some(existing) = self.get(key) {
            return existing;
        }
        let mut map = self.inner.write().unwrap_or_else(|p| p.into_inner());
        map.entry(key.clone())
            .or_insert_with(|| {
                debug!(target: "crawlguard::destination", destination = %key, window, "destination created");
                Arc::new(Destination::new(key.clone(), window, base_increment))
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshots sorted by key.
    pub fn snapshot(&self) -> Vec<DestinationSnapshot> {
        let map = self.inner.read().unwrap_or_else(|p| p.into_inner());
        let mut entries: Vec<DestinationSnapshot> = map.values().map(|d| d.snapshot()).collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_raise_delay_under_one_lock() {
        let dest = Destination::new(DestinationKey::global(), 3, 0.05);
        let first = dest.record_error(0.0, 0.05);
        assert_eq!(first.rate, 0.0);
        assert_eq!(first.adjustment, Adjustment::Increased);
        dest.record_error(0.5, 0.05);
        let third = dest.record_error(1.0, 0.05);
        assert!((third.rate - 3.0).abs() < 1e-9);
        assert!(third.delay > first.delay);
        assert_eq!(dest.snapshot().errors, 3);
    }

    #[test]
    fn relax_needs_a_quiet_period() {
        let dest = Destination::new(DestinationKey::global(), 10, 0.05);
        let quiet = Duration::from_secs(30);
        assert!(dest.relax(100.0, quiet, 0.05).is_none(), "no error seen yet");
        dest.record_error(0.0, 0.05);
        assert!(dest.relax(10.0, quiet, 0.05).is_none());
        assert!(dest.relax(31.0, quiet, 0.05).is_some());
        assert!(dest.relax(40.0, quiet, 0.05).is_none(), "relaxed too recently");
    }

    #[test]
    fn registry_creates_once_and_snapshots_sorted() {
        let registry = DestinationRegistry::new();
        let a = registry.get_or_create(&DestinationKey::new("b"), 10, 0.05);
        let b = registry.get_or_create(&DestinationKey::new("b"), 10, 0.05);
        assert!(Arc::ptr_eq(&a, &b));
        registry.get_or_create(&DestinationKey::new("a"), 10, 0.05);
        let keys: Vec<_> = registry.snapshot().into_iter().map(|s| s.key).collect();
        assert_eq!(keys, vec![DestinationKey::new("a"), DestinationKey::new("b")]);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn closed_gate_blocks_senders() {
        let dest = Arc::new(Destination::new(DestinationKey::global(), 10, 0.05));
        let guard = dest.close_gate().await;
        let waiter = {
            let dest = dest.clone();
            tokio::spawn(async move { dest.pass_gate().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }
}
