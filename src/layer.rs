//! Tower integration: drive any transport service through a [`RetryPolicy`].
//!
//! Each call waits the destination delay, sends, classifies the outcome and keeps reissuing
//! until the policy passes the result through. Responses are returned as-is (including an
//! exhausted 503); a transport error that is passed through surfaces as
//! [`ThrottleError::Transport`].
//!
//! ```rust
//! use std::sync::Arc;
//! use crawlguard::{CrawlRequest, CrawlResponse, InstantSleeper, RetryPolicy, ThrottleLayer, TransportFailure};
//! use tower::{service_fn, Layer, ServiceExt};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let policy = Arc::new(RetryPolicy::builder().build().unwrap());
//! let transport = service_fn(|req: CrawlRequest| async move {
//!     Ok::<_, TransportFailure>(CrawlResponse::new(req.url, 200))
//! });
//! let svc = ThrottleLayer::new(policy).with_sleeper(InstantSleeper).layer(transport);
//! let response = svc.oneshot(CrawlRequest::new("https://example.test/")).await.unwrap();
//! assert_eq!(response.status, 200);
//! # });
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tower::ServiceExt;
use tower_layer::Layer;
use tower_service::Service;

use crate::error::ThrottleError;
use crate::request::{AsTransportFailure, CrawlRequest, ResponseStatus};
use crate::retry::RetryPolicy;
use crate::sleeper::{Sleeper, TokioSleeper};

/// Layer applying a shared [`RetryPolicy`].
#[derive(Clone)]
pub struct ThrottleLayer {
    policy: Arc<RetryPolicy>,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for ThrottleLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottleLayer").field("policy", &self.policy).finish()
    }
}

impl ThrottleLayer {
    pub fn new(policy: Arc<RetryPolicy>) -> Self {
        Self { policy, sleeper: Arc::new(TokioSleeper) }
    }

    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn policy(&self) -> &Arc<RetryPolicy> {
        &self.policy
    }
}

impl<S> Layer<S> for ThrottleLayer {
    type Service = ThrottleService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ThrottleService { inner, policy: self.policy.clone(), sleeper: self.sleeper.clone() }
    }
}

/// Service produced by [`ThrottleLayer`].
#[derive(Clone)]
pub struct ThrottleService<S> {
    inner: S,
    policy: Arc<RetryPolicy>,
    sleeper: Arc<dyn Sleeper>,
}

impl<S> Service<CrawlRequest> for ThrottleService<S>
where
    S: Service<CrawlRequest> + Clone + Send + 'static,
    S::Response: ResponseStatus + Send + 'static,
    S::Error: AsTransportFailure + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = ThrottleError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ThrottleError::Transport)
    }

    fn call(&mut self, request: CrawlRequest) -> Self::Future {
        // Keep the service that was driven to readiness for the first send.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let policy = self.policy.clone();
        let sleeper = self.sleeper.clone();

        Box::pin(async move {
            let mut request = request;
            let mut pending = Duration::ZERO;
            let mut first = true;
            loop {
                let delay = policy.prepare(&mut request).await.max(pending);
                if !delay.is_zero() {
                    sleeper.sleep(delay).await;
                }
                if !first {
                    inner.ready().await.map_err(ThrottleError::Transport)?;
                }
                first = false;

                let outcome = inner.call(request.clone()).await;
                let decision = match &outcome {
                    Ok(response) => {
                        let status = response.status();
                        policy.handle_response(request, &status).await
                    }
                    Err(err) => {
                        let failure = err.as_transport_failure();
                        policy.handle_failure(request, &failure).await
                    }
                };
                match decision.into_retry() {
                    Some((next, delay)) => {
                        request = next;
                        pending = delay;
                    }
                    None => return outcome.map_err(ThrottleError::Transport),
                }
            }
        })
    }
}
