//! Request and response shapes exchanged with the crawl engine.

use std::fmt;
use std::sync::Arc;

/// Throttling scope shared by a group of requests (a site, a shard, a brand listing...).
///
/// Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DestinationKey(Arc<str>);

impl DestinationKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    /// Single shared scope used when callers do not partition.
    pub fn global() -> Self {
        Self::new("*")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DestinationKey {
    fn default() -> Self {
        Self::global()
    }
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DestinationKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DestinationKey {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Why a request is being retried. Each reason carries its own retry ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryReason {
    /// HTTP 429.
    RateLimited,
    /// Retryable status or transport failure.
    Transient,
    /// HTTP 403.
    Blocked,
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryReason::RateLimited => write!(f, "rate_limited"),
            RetryReason::Transient => write!(f, "transient"),
            RetryReason::Blocked => write!(f, "blocked"),
        }
    }
}

/// Outbound request as seen by the throttling core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlRequest {
    pub url: String,
    pub destination: DestinationKey,
    /// Bypass every retry rule for this request.
    pub dont_retry: bool,
    /// Retries already issued for this request.
    pub retry_count: u32,
    /// Forwarding proxy; filled from configuration by `prepare` when unset.
    pub proxy: Option<String>,
    /// Strongest retry reason seen so far; decides the retry ceiling.
    pub escalation: Option<RetryReason>,
    /// Identity epoch current when the request was sent.
    pub identity_epoch: Option<u64>,
}

impl CrawlRequest {
    /// Request to `url` in the global destination.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            destination: DestinationKey::global(),
            dont_retry: false,
            retry_count: 0,
            proxy: None,
            escalation: None,
            identity_epoch: None,
        }
    }

    pub fn with_destination(mut self, destination: impl Into<DestinationKey>) -> Self {
        self.destination = destination.into();
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn dont_retry(mut self) -> Self {
        self.dont_retry = true;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// Anything that carries an HTTP status code.
pub trait ResponseStatus {
    fn status(&self) -> u16;
}

/// Minimal response: status plus the URL it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlResponse {
    pub url: String,
    pub status: u16,
}

impl CrawlResponse {
    pub fn new(url: impl Into<String>, status: u16) -> Self {
        Self { url: url.into(), status }
    }
}

impl ResponseStatus for CrawlResponse {
    fn status(&self) -> u16 {
        self.status
    }
}

impl ResponseStatus for u16 {
    fn status(&self) -> u16 {
        *self
    }
}

/// Transport-level failure reported instead of a response. All kinds are retryable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportFailure {
    #[error("request timed out")]
    Timeout,
    #[error("connection reset")]
    ConnectionReset,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("dns lookup failed")]
    Dns,
    #[error("transport error: {0}")]
    Other(String),
}

/// Transport errors that can be read as a [`TransportFailure`] without being consumed.
pub trait AsTransportFailure {
    fn as_transport_failure(&self) -> TransportFailure;
}

impl AsTransportFailure for TransportFailure {
    fn as_transport_failure(&self) -> TransportFailure {
        self.clone()
    }
}

impl AsTransportFailure for std::io::Error {
    fn as_transport_failure(&self) -> TransportFailure {
        use std::io::ErrorKind;
        match self.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => TransportFailure::Timeout,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                TransportFailure::ConnectionReset
            }
            ErrorKind::ConnectionRefused => TransportFailure::ConnectionRefused,
            _ => TransportFailure::Other(self.to_string()),
        }
    }
}

impl AsTransportFailure for reqwest::Error {
    fn as_transport_failure(&self) -> TransportFailure {
        if self.is_timeout() {
            TransportFailure::Timeout
        } else if self.is_connect() {
            TransportFailure::ConnectionRefused
        } else {
            TransportFailure::Other(self.to_string())
        }
    }
}

impl From<std::io::Error> for TransportFailure {
    fn from(err: std::io::Error) -> Self {
        err.as_transport_failure()
    }
}

impl From<reqwest::Error> for TransportFailure {
    fn from(err: reqwest::Error) -> Self {
        err.as_transport_failure()
    }
}
