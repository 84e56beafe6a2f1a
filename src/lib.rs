#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # crawlguard
//!
//! Adaptive retry and rate control for crawlers that hit rate limits and blocks.
//!
//! ## Features
//!
//! - **Sliding-window error rate** per destination
//! - **Damped delay control** that backs off fast and relaxes slowly
//! - **Tagged retry ceilings** (rate limited, transient, blocked) with sticky escalation
//! - **Identity rotation** over the Tor control port, confirmed by an identity probe
//! - **Tower integration** via [`ThrottleLayer`]
//! - **Telemetry** as a stream of [`ThrottleEvent`]s into any `tower::Service` sink
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use crawlguard::{CrawlRequest, CrawlResponse, RetryPolicy, ThrottleConfig, ThrottleLayer, TransportFailure};
//! use tower::{service_fn, Layer, ServiceExt};
//!
//! #[tokio::main]
//! async fn main() {
//!     let policy = Arc::new(
//!         RetryPolicy::builder().config(ThrottleConfig::default()).build().unwrap(),
//!     );
//!     let transport = service_fn(|req: CrawlRequest| async move {
//!         // Your HTTP client here
//!         Ok::<_, TransportFailure>(CrawlResponse::new(req.url, 200))
//!     });
//!
//!     let svc = ThrottleLayer::new(policy.clone()).layer(transport);
//!     let _ = svc.oneshot(CrawlRequest::new("https://www.drive2.ru/cars/")).await;
//!     policy.shutdown().await;
//! }
//! ```

pub mod backoff;
pub mod classify;
pub mod clock;
pub mod config;
pub mod delay;
pub mod destination;
pub mod engine;
pub mod error;
pub mod error_rate;
pub mod identity;
pub mod layer;
pub mod prelude;
pub mod request;
pub mod retry;
pub mod sleeper;
pub mod telemetry;

// Re-exports
pub use backoff::{Backoff, BackoffError, Jitter};
pub use classify::{Classifier, ResponseClass};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{ControlConfig, DynamicConfig, ProbeConfig, ThrottleConfig};
pub use delay::{Adjustment, DelayController};
pub use destination::{DestinationRegistry, DestinationSnapshot};
pub use engine::{EngineCall, EngineControl, NoopEngine, RecordingEngine};
pub use error::{ConfigError, ControlError, ProbeError, ThrottleError};
pub use error_rate::ErrorRateTracker;
pub use identity::{
    ControlChannel, HttpIdentityProbe, Identity, IdentityProbe, IdentityRotator, Rotation,
    TorControlChannel,
};
pub use layer::{ThrottleLayer, ThrottleService};
pub use request::{
    AsTransportFailure, CrawlRequest, CrawlResponse, DestinationKey, ResponseStatus, RetryReason,
    TransportFailure,
};
pub use retry::{RetryDecision, RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use telemetry::{LogSink, MemorySink, NullSink, TelemetrySink, ThrottleEvent};
