//! Convenient re-exports for wiring a crawler through crawlguard.
pub use crate::{
    backoff::{Backoff, Jitter},
    config::{DynamicConfig, ThrottleConfig},
    engine::EngineControl,
    identity::IdentityRotator,
    layer::ThrottleLayer,
    request::{CrawlRequest, CrawlResponse, DestinationKey, ResponseStatus, TransportFailure},
    retry::{RetryDecision, RetryPolicy},
    telemetry::{LogSink, MemorySink, ThrottleEvent},
    ThrottleError,
};
