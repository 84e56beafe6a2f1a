//! Retry policy for crawl responses.
//!
//! [`RetryPolicy`] sees every response (or transport failure) and decides whether the request is
//! reissued. Classification drives everything:
//!
//! - `dont_retry` requests always pass through.
//! - 429 records an error for the destination, recomputes its delay and retries after that
//!   delay. The request's ceiling is raised to `rate_limited_max_retries`.
//! - Retryable statuses and transport failures retry after `max(destination delay, backoff)`,
//!   up to `max_retries` unless the request was escalated earlier.
//! - 403 escalates to `blocked_max_retries` and rotates the exit identity while the destination
//!   is paused. Without a working rotator it degrades to a backoff retry.
//! - Everything else passes through and gives the destination a chance to relax its delay.
//!
//! Semantics:
//! - `retry_count` on the returned request is incremented once per scheduled retry.
//! - A request's ceiling is the highest ceiling of any reason it was retried for; escalation is
//!   never lowered.
//! - Once the ceiling is reached the response passes through and `RetryExhausted` is emitted.
//! - Concurrent 403s for requests sent before a completed rotation do not rotate again.
//!
//! ```rust
//! use crawlguard::{CrawlRequest, Jitter, RetryDecision, RetryPolicy, RetryReason};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let policy = RetryPolicy::builder().with_jitter(Jitter::None).build().unwrap();
//! let mut request = CrawlRequest::new("https://www.drive2.ru/cars/?sort=Date").with_retry_count(2);
//! policy.prepare(&mut request).await;
//!
//! match policy.handle_response(request, &429u16).await {
//!     RetryDecision::RetryWithBackoff { request, reason, ceiling, .. } => {
//!         assert_eq!(reason, RetryReason::RateLimited);
//!         assert_eq!(ceiling, 1000);
//!         assert_eq!(request.retry_count, 3);
//!     }
//!     other => panic!("unexpected decision {other:?}"),
//! }
//! # });
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::backoff::{Backoff, Jitter};
use crate::classify::{Classifier, ResponseClass};
use crate::clock::{Clock, MonotonicClock};
use crate::config::{DynamicConfig, ThrottleConfig};
use crate::destination::{DelayUpdate, Destination, DestinationRegistry, DestinationSnapshot};
use crate::engine::{EngineControl, NoopEngine};
use crate::error::{ConfigError, ControlError};
use crate::identity::{Identity, IdentityRotator};
use crate::request::{CrawlRequest, DestinationKey, ResponseStatus, RetryReason, TransportFailure};
use crate::telemetry::{Emitter, TelemetrySink, ThrottleEvent};

/// What to do with a request after its response was classified.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Reissue `request` after `delay`.
    RetryWithBackoff { request: CrawlRequest, delay: Duration, reason: RetryReason, ceiling: u32 },
    /// The identity was rotated (or already had been); reissue `request` right away.
    RetryWithIdentityRotation { request: CrawlRequest, identity: Option<Identity>, ceiling: u32 },
    /// Hand the response back to the caller.
    PassThrough,
}

impl RetryDecision {
    pub fn is_retry(&self) -> bool {
        !matches!(self, RetryDecision::PassThrough)
    }

    /// Request to reissue, if any.
    pub fn request(&self) -> Option<&CrawlRequest> {
        match self {
            RetryDecision::RetryWithBackoff { request, .. }
            | RetryDecision::RetryWithIdentityRotation { request, .. } => Some(request),
            RetryDecision::PassThrough => None,
        }
    }

    /// Pause before the reissue.
    pub fn delay(&self) -> Duration {
        match self {
            RetryDecision::RetryWithBackoff { delay, .. } => *delay,
            _ => Duration::ZERO,
        }
    }

    /// Split into the request to reissue and its delay.
    pub fn into_retry(self) -> Option<(CrawlRequest, Duration)> {
        match self {
            RetryDecision::RetryWithBackoff { request, delay, .. } => Some((request, delay)),
            RetryDecision::RetryWithIdentityRotation { request, .. } => Some((request, Duration::ZERO)),
            RetryDecision::PassThrough => None,
        }
    }
}

/// Orchestrates error tracking, delay control and identity rotation.
pub struct RetryPolicy {
    config: DynamicConfig<ThrottleConfig>,
    registry: DestinationRegistry,
    clock: Arc<dyn Clock>,
    jitter: Jitter,
    emitter: Emitter,
    engine: Arc<dyn EngineControl>,
    rotator: tokio::sync::Mutex<Option<IdentityRotator>>,
    has_rotator: AtomicBool,
    epoch: AtomicU64,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config.get())
            .field("destinations", &self.registry.len())
            .field("jitter", &self.jitter)
            .field("has_rotator", &self.has_rotator())
            .field("epoch", &self.identity_epoch())
            .finish()
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Live configuration handle.
    ///
    /// Updates apply to the next classified response, except `window_size`, which only sizes
    /// destinations first seen after the change. `control` and `probe` are read once by
    /// [`IdentityRotator::connect`]. Prefer [`DynamicConfig::try_update`] so invalid values
    /// are rejected.
    pub fn config(&self) -> &DynamicConfig<ThrottleConfig> {
        &self.config
    }

    /// Number of identity rotations completed by this policy.
    pub fn identity_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn has_rotator(&self) -> bool {
        self.has_rotator.load(Ordering::Acquire)
    }

    /// Current delay for `key`; zero for destinations never seen.
    pub fn destination_delay(&self, key: &DestinationKey) -> Duration {
        self.registry.get(key).map(|d| d.delay()).unwrap_or(Duration::ZERO)
    }

    /// Per-destination state, sorted by key.
    pub fn snapshot(&self) -> Vec<DestinationSnapshot> {
        self.registry.snapshot()
    }

    /// Install a fresh rotator, replacing a failed or closed one.
    pub async fn replace_rotator(&self, rotator: IdentityRotator) {
        let mut slot = self.rotator.lock().await;
        *slot = Some(rotator);
        self.has_rotator.store(true, Ordering::Release);
        info!(target: "crawlguard::retry", "identity rotator installed");
    }

    /// Get a request ready to send and return the delay to wait first.
    ///
    /// Fills in the forwarding proxy when the request has none, waits while the destination is
    /// rotating and stamps the identity epoch.
    pub async fn prepare(&self, request: &mut CrawlRequest) -> Duration {
        let cfg = self.config.get();
        if request.proxy.is_none() {
            request.proxy = cfg.proxy.clone();
        }
        let destination = self.destination(&request.destination, &cfg);
        destination.pass_gate().await;
        request.identity_epoch = Some(self.identity_epoch());
        destination.delay()
    }

    /// Classify `response` to `request` and decide what happens next.
    pub async fn handle_response<R>(&self, request: CrawlRequest, response: &R) -> RetryDecision
    where
        R: ResponseStatus + ?Sized,
    {
        let cfg = self.config.get();
        let status = response.status();
        let class = Classifier::new(cfg.retry_http_codes.clone())
            .classify_status(status, request.dont_retry);
        match class {
            ResponseClass::DontRetry => RetryDecision::PassThrough,
            ResponseClass::Pass => {
                self.stabilize(&request.destination, &cfg).await;
                RetryDecision::PassThrough
            }
            ResponseClass::RateLimited => self.on_rate_limited(request, &cfg).await,
            ResponseClass::Transient => {
                debug!(target: "crawlguard::retry", url = %request.url, status, "retryable status");
                self.on_transient(request, &cfg, RetryReason::Transient).await
            }
            ResponseClass::Blocked => self.on_blocked(request, &cfg).await,
        }
    }

    /// Decide what happens after a transport failure.
    pub async fn handle_failure(
        &self,
        request: CrawlRequest,
        failure: &TransportFailure,
    ) -> RetryDecision {
        let cfg = self.config.get();
        match Classifier::default().classify_failure(request.dont_retry) {
            ResponseClass::DontRetry => RetryDecision::PassThrough,
            _ => {
                debug!(target: "crawlguard::retry", url = %request.url, error = %failure, "transport failure");
                self.on_transient(request, &cfg, RetryReason::Transient).await
            }
        }
    }

    /// Release the rotator and emit `Shutdown`. Only the first call does anything.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut slot = self.rotator.lock().await;
        self.has_rotator.store(false, Ordering::Release);
        if let Some(mut rotator) = slot.take() {
            if let Err(err) = rotator.close().await {
                warn!(target: "crawlguard::retry", error = %err, "closing identity rotator failed");
            }
        }
        drop(slot);
        info!(target: "crawlguard::retry", destinations = self.registry.len(), "retry policy shut down");
        self.emitter.emit(ThrottleEvent::Shutdown).await;
    }

    fn destination(&self, key: &DestinationKey, cfg: &ThrottleConfig) -> Arc<Destination> {
        self.registry.get_or_create(key, cfg.window_size, cfg.base_increment)
    }

    fn backoff(&self, cfg: &ThrottleConfig) -> Backoff {
        Backoff::exponential(cfg.backoff_base, cfg.backoff_max)
            .unwrap_or_default()
            .with_jitter(self.jitter)
    }

    async fn on_rate_limited(&self, mut request: CrawlRequest, cfg: &ThrottleConfig) -> RetryDecision {
        let destination = self.destination(&request.destination, cfg);
        let update = destination.record_error(self.clock.now_secs(), cfg.base_increment);
        info!(
            target: "crawlguard::retry",
            destination = %request.destination,
            rate = update.rate,
            delay_ms = update.delay.as_millis() as u64,
            "got 429"
        );
        self.emit_update(&request.destination, RetryReason::RateLimited, update).await;
        let ceiling = escalate(&mut request, RetryReason::RateLimited, cfg);
        self.schedule(request, RetryReason::RateLimited, ceiling, update.delay).await
    }

    async fn on_transient(
        &self,
        mut request: CrawlRequest,
        cfg: &ThrottleConfig,
        reason: RetryReason,
    ) -> RetryDecision {
        let ceiling = escalate(&mut request, reason, cfg);
        let destination_delay = self.destination(&request.destination, cfg).delay();
        let backoff = self.backoff(cfg).jittered(request.retry_count.saturating_add(1));
        self.schedule(request, reason, ceiling, destination_delay.max(backoff)).await
    }

    async fn on_blocked(&self, mut request: CrawlRequest, cfg: &ThrottleConfig) -> RetryDecision {
        info!(target: "crawlguard::retry", destination = %request.destination, url = %request.url, "got 403");
        let ceiling = escalate(&mut request, RetryReason::Blocked, cfg);
        if request.retry_count >= ceiling {
            return self.exhausted(request, RetryReason::Blocked).await;
        }
        if !self.has_rotator() {
            return self.on_transient(request, cfg, RetryReason::Blocked).await;
        }

        let destination = self.destination(&request.destination, cfg);
        match self.rotate_for(&destination, request.identity_epoch, cfg).await {
            Ok(identity) => {
                request.retry_count += 1;
                // Restamp so a 403 to the reissued request is judged against the new identity.
                request.identity_epoch = Some(self.identity_epoch());
                self.emitter
                    .emit(ThrottleEvent::RetryScheduled {
                        destination: request.destination.clone(),
                        reason: RetryReason::Blocked,
                        attempt: request.retry_count,
                        ceiling,
                        delay: Duration::ZERO,
                    })
                    .await;
                RetryDecision::RetryWithIdentityRotation { request, identity, ceiling }
            }
            Err(_) => self.on_transient(request, cfg, RetryReason::Blocked).await,
        }
    }

    /// Rotate with the destination's gate closed and the engine paused.
    async fn rotate_for(
        &self,
        destination: &Destination,
        stamped_epoch: Option<u64>,
        cfg: &ThrottleConfig,
    ) -> Result<Option<Identity>, ControlError> {
        let key = destination.key().clone();
        let _gate = destination.close_gate().await;
        self.engine.pause(&key);
        self.emitter.emit(ThrottleEvent::DestinationPaused { destination: key.clone() }).await;

        let result = self.rotate_locked(&key, stamped_epoch, cfg).await;

        self.engine.resume(&key);
        self.emitter.emit(ThrottleEvent::DestinationResumed { destination: key }).await;
        result
    }

    async fn rotate_locked(
        &self,
        key: &DestinationKey,
        stamped_epoch: Option<u64>,
        cfg: &ThrottleConfig,
    ) -> Result<Option<Identity>, ControlError> {
        let mut slot = self.rotator.lock().await;
        let Some(rotator) = slot.as_mut() else {
            return Err(ControlError::Closed);
        };

        let epoch = self.identity_epoch();
        if stamped_epoch.is_some_and(|stamp| epoch > stamp) {
            debug!(target: "crawlguard::retry", destination = %key, epoch, "identity already rotated since request was sent");
            return Ok(rotator.current_identity().cloned());
        }

        self.emitter.emit(ThrottleEvent::RotationStarted { destination: key.clone() }).await;
        let outcome = match cfg.rotation_deadline {
            Some(deadline) => tokio::time::timeout(deadline, rotator.rotate())
                .await
                .unwrap_or(Err(ControlError::Timeout(deadline))),
            None => rotator.rotate().await,
        };

        match outcome {
            Ok(rotation) => {
                let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
                self.emitter
                    .emit(ThrottleEvent::IdentityRotated {
                        identity: rotation.identity.to_string(),
                        epoch,
                        iterations: rotation.iterations,
                        elapsed: rotation.elapsed,
                    })
                    .await;
                Ok(Some(rotation.identity))
            }
            Err(err) => {
                // A rotator that failed once is not trusted again; replace_rotator installs a new one.
                *slot = None;
                self.has_rotator.store(false, Ordering::Release);
                error!(target: "crawlguard::retry", destination = %key, error = %err, "identity rotation failed; falling back to backoff");
                self.emitter
                    .emit(ThrottleEvent::RotationFailed {
                        destination: key.clone(),
                        error: err.to_string(),
                    })
                    .await;
                Err(err)
            }
        }
    }

    async fn schedule(
        &self,
        mut request: CrawlRequest,
        reason: RetryReason,
        ceiling: u32,
        delay: Duration,
    ) -> RetryDecision {
        if request.retry_count >= ceiling {
            return self.exhausted(request, reason).await;
        }
        request.retry_count += 1;
        debug!(
            target: "crawlguard::retry",
            url = %request.url,
            %reason,
            attempt = request.retry_count,
            ceiling,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );
        self.emitter
            .emit(ThrottleEvent::RetryScheduled {
                destination: request.destination.clone(),
                reason,
                attempt: request.retry_count,
                ceiling,
                delay,
            })
            .await;
        RetryDecision::RetryWithBackoff { request, delay, reason, ceiling }
    }

    async fn exhausted(&self, request: CrawlRequest, reason: RetryReason) -> RetryDecision {
        error!(
            target: "crawlguard::retry",
            url = %request.url,
            %reason,
            retries = request.retry_count,
            "gave up retrying"
        );
        self.emitter
            .emit(ThrottleEvent::RetryExhausted {
                destination: request.destination,
                reason,
                attempts: request.retry_count,
            })
            .await;
        RetryDecision::PassThrough
    }

    async fn stabilize(&self, key: &DestinationKey, cfg: &ThrottleConfig) {
        let Some(destination) = self.registry.get(key) else {
            return;
        };
        let now = self.clock.now_secs();
        if let Some(update) = destination.relax(now, cfg.without_error_threshold, cfg.base_increment) {
            debug!(
                target: "crawlguard::retry",
                destination = %key,
                delay_ms = update.delay.as_millis() as u64,
                "delay relaxed after quiet period"
            );
            self.emitter
                .emit(ThrottleEvent::DelayAdjusted {
                    destination: key.clone(),
                    delay: update.delay,
                    adjustment: update.adjustment,
                })
                .await;
        }
    }

    async fn emit_update(&self, key: &DestinationKey, reason: RetryReason, update: DelayUpdate) {
        self.emitter
            .emit(ThrottleEvent::ErrorRecorded { destination: key.clone(), reason, rate: update.rate })
            .await;
        self.emitter
            .emit(ThrottleEvent::DelayAdjusted {
                destination: key.clone(),
                delay: update.delay,
                adjustment: update.adjustment,
            })
            .await;
    }
}

/// Retry ceiling configured for `reason`.
pub fn ceiling_for(cfg: &ThrottleConfig, reason: RetryReason) -> u32 {
    match reason {
        RetryReason::RateLimited => cfg.rate_limited_max_retries,
        RetryReason::Transient => cfg.max_retries,
        RetryReason::Blocked => cfg.blocked_max_retries,
    }
}

/// Record `reason` on the request unless it already carries a higher ceiling; return the ceiling.
fn escalate(request: &mut CrawlRequest, reason: RetryReason, cfg: &ThrottleConfig) -> u32 {
    let reason = match request.escalation {
        Some(previous) if ceiling_for(cfg, previous) > ceiling_for(cfg, reason) => previous,
        _ => reason,
    };
    request.escalation = Some(reason);
    ceiling_for(cfg, reason)
}

/// Builder for [`RetryPolicy`].
pub struct RetryPolicyBuilder {
    config: DynamicConfig<ThrottleConfig>,
    clock: Arc<dyn Clock>,
    jitter: Jitter,
    emitter: Emitter,
    engine: Arc<dyn EngineControl>,
    rotator: Option<IdentityRotator>,
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self {
            config: DynamicConfig::new(ThrottleConfig::default()),
            clock: Arc::new(MonotonicClock::default()),
            jitter: Jitter::default(),
            emitter: Emitter::default(),
            engine: Arc::new(NoopEngine),
            rotator: None,
        }
    }

    pub fn config(mut self, config: ThrottleConfig) -> Self {
        self.config = DynamicConfig::new(config);
        self
    }

    /// Share an existing live configuration handle.
    pub fn dynamic_config(mut self, config: DynamicConfig<ThrottleConfig>) -> Self {
        self.config = config;
        self
    }

    pub fn clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Jitter applied to transient backoff.
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn sink<S>(mut self, sink: S) -> Self
    where
        S: TelemetrySink + Sync,
        S::Future: Send + 'static,
    {
        self.emitter = Emitter::new(sink);
        self
    }

    pub fn engine<E>(mut self, engine: E) -> Self
    where
        E: EngineControl + 'static,
    {
        self.engine = Arc::new(engine);
        self
    }

    pub fn rotator(mut self, rotator: IdentityRotator) -> Self {
        self.rotator = Some(rotator);
        self
    }

    /// Validate the configuration and build the policy.
    pub fn build(self) -> Result<RetryPolicy, ConfigError> {
        self.config.get().validate()?;
        let has_rotator = self.rotator.is_some();
        Ok(RetryPolicy {
            config: self.config,
            registry: DestinationRegistry::new(),
            clock: self.clock,
            jitter: self.jitter,
            emitter: self.emitter,
            engine: self.engine,
            rotator: tokio::sync::Mutex::new(self.rotator),
            has_rotator: AtomicBool::new(has_rotator),
            epoch: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        })
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}
