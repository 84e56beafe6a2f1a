//! Classify responses and transport failures for retry decisions.

use crate::request::RetryReason;

/// Statuses retried as transient failures by default.
///
/// 429 is not listed; it has its own rate-limited path.
pub const DEFAULT_RETRY_HTTP_CODES: &[u16] = &[500, 502, 503, 504, 522, 524, 408];

pub const STATUS_FORBIDDEN: u16 = 403;
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// Outcome of classifying one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// Request opted out of retries.
    DontRetry,
    /// HTTP 429.
    RateLimited,
    /// Retryable status or transport failure.
    Transient,
    /// HTTP 403.
    Blocked,
    /// Anything else; handed back untouched.
    Pass,
}

impl ResponseClass {
    /// Retry reason for classes that retry.
    pub fn reason(self) -> Option<RetryReason> {
        match self {
            ResponseClass::RateLimited => Some(RetryReason::RateLimited),
            ResponseClass::Transient => Some(RetryReason::Transient),
            ResponseClass::Blocked => Some(RetryReason::Blocked),
            ResponseClass::DontRetry | ResponseClass::Pass => None,
        }
    }
}

/// Status classifier with a configurable transient set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classifier {
    retry_http_codes: Vec<u16>,
}

impl Classifier {
    pub fn new(retry_http_codes: impl Into<Vec<u16>>) -> Self {
        let mut retry_http_codes = retry_http_codes.into();
        retry_http_codes.sort_unstable();
        retry_http_codes.dedup();
        Self { retry_http_codes }
    }

    pub fn retry_http_codes(&self) -> &[u16] {
        &self.retry_http_codes
    }

    /// Classify a status. `dont_retry` wins over every status.
    pub fn classify_status(&self, status: u16, dont_retry: bool) -> ResponseClass {
        if dont_retry {
            return ResponseClass::DontRetry;
        }
        match status {
            STATUS_TOO_MANY_REQUESTS => ResponseClass::RateLimited,
            STATUS_FORBIDDEN => ResponseClass::Blocked,
            s if self.retry_http_codes.binary_search(&s).is_ok() => ResponseClass::Transient,
            _ => ResponseClass::Pass,
        }
    }

    /// Transport failures are always transient unless the request opted out.
    pub fn classify_failure(&self, dont_retry: bool) -> ResponseClass {
        if dont_retry {
            ResponseClass::DontRetry
        } else {
            ResponseClass::Transient
        }
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_HTTP_CODES)
    }
}
