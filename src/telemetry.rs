//! Telemetry for the throttling core.
//!
//! The retry policy and identity rotator describe what they do as [`ThrottleEvent`]s. Events are
//! handed to a [`TelemetrySink`], which is just a `tower::Service<ThrottleEvent>`, so sinks
//! compose with ordinary tower combinators.
//!
//! ```rust
//! use crawlguard::telemetry::{MemorySink, ThrottleEvent};
//! use tower::ServiceExt;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let sink = MemorySink::new();
//! sink.clone().oneshot(ThrottleEvent::Shutdown).await.unwrap();
//! assert_eq!(sink.events(), vec![ThrottleEvent::Shutdown]);
//! # });
//! ```

use std::sync::Arc;

use futures::future::BoxFuture;

mod events;
mod sinks;

#[cfg(feature = "telemetry-json")]
pub use events::event_to_json;
pub use events::ThrottleEvent;
pub use sinks::{LogSink, MemorySink, NullSink};

/// A telemetry sink consuming throttle events.
pub trait TelemetrySink:
    tower::Service<ThrottleEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit that honors `poll_ready` and drops the event on any sink error.
pub async fn emit_best_effort<S>(sink: S, event: ThrottleEvent)
where
    S: tower::Service<ThrottleEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::{Service, ServiceExt};

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Type-erased handle to a sink, shareable across tasks.
#[derive(Clone)]
pub(crate) struct Emitter {
    emit: Arc<dyn Fn(ThrottleEvent) -> BoxFuture<'static, ()> + Send + Sync>,
}

impl Emitter {
    pub(crate) fn new<S>(sink: S) -> Self
    where
        S: TelemetrySink + Sync,
        S::Future: Send + 'static,
    {
        let emit = move |event: ThrottleEvent| -> BoxFuture<'static, ()> {
            Box::pin(emit_best_effort(sink.clone(), event))
        };
        Self { emit: Arc::new(emit) }
    }

    pub(crate) async fn emit(&self, event: ThrottleEvent) {
        (self.emit)(event).await
    }
}

impl Default for Emitter {
    fn default() -> Self {
        Self::new(NullSink)
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Emitter")
    }
}
