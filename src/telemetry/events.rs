//! Events emitted by the retry policy.

use std::fmt;
use std::time::Duration;

#[cfg(feature = "telemetry-json")]
use serde_json::json;

use crate::delay::Adjustment;
use crate::request::{DestinationKey, RetryReason};

/// Structured events emitted by the retry policy and the identity rotator.
#[derive(Debug, Clone, PartialEq)]
pub enum ThrottleEvent {
    /// An error response was added to a destination's window.
    ErrorRecorded { destination: DestinationKey, reason: RetryReason, rate: f64 },
    /// A destination's delay changed.
    DelayAdjusted { destination: DestinationKey, delay: Duration, adjustment: Adjustment },
    /// A request will be reissued.
    RetryScheduled {
        destination: DestinationKey,
        reason: RetryReason,
        /// Retry number about to be issued (1-indexed).
        attempt: u32,
        ceiling: u32,
        delay: Duration,
    },
    /// A request reached its ceiling and is handed back as-is.
    RetryExhausted { destination: DestinationKey, reason: RetryReason, attempts: u32 },
    /// Sending on a destination stopped for an identity rotation.
    DestinationPaused { destination: DestinationKey },
    /// Sending on a destination resumed.
    DestinationResumed { destination: DestinationKey },
    /// An identity rotation began because `destination` was blocked.
    RotationStarted { destination: DestinationKey },
    /// A new identity was confirmed.
    IdentityRotated { identity: String, epoch: u64, iterations: u32, elapsed: Duration },
    /// Rotation could not complete.
    RotationFailed { destination: DestinationKey, error: String },
    /// The policy released its resources.
    Shutdown,
}

impl fmt::Display for ThrottleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThrottleEvent::ErrorRecorded { destination, reason, rate } => {
                write!(f, "ErrorRecorded({destination}, {reason}, rate={rate:.3}/s)")
            }
            ThrottleEvent::DelayAdjusted { destination, delay, adjustment } => {
                write!(f, "DelayAdjusted({destination}, {adjustment:?}, delay={delay:?})")
            }
            ThrottleEvent::RetryScheduled { destination, reason, attempt, ceiling, delay } => {
                write!(
                    f,
                    "RetryScheduled({destination}, {reason}, #{attempt}/{ceiling}, delay={delay:?})"
                )
            }
            ThrottleEvent::RetryExhausted { destination, reason, attempts } => {
                write!(f, "RetryExhausted({destination}, {reason}, attempts={attempts})")
            }
            ThrottleEvent::DestinationPaused { destination } => write!(f, "Paused({destination})"),
            ThrottleEvent::DestinationResumed { destination } => {
                write!(f, "Resumed({destination})")
            }
            ThrottleEvent::RotationStarted { destination } => {
                write!(f, "RotationStarted({destination})")
            }
            ThrottleEvent::IdentityRotated { identity, epoch, iterations, elapsed } => write!(
                f,
                "IdentityRotated({identity}, epoch={epoch}, iterations={iterations}, elapsed={elapsed:?})"
            ),
            ThrottleEvent::RotationFailed { destination, error } => {
                write!(f, "RotationFailed({destination}: {error})")
            }
            ThrottleEvent::Shutdown => write!(f, "Shutdown"),
        }
    }
}

#[cfg_attr(not(feature = "telemetry-json"), allow(dead_code))]
#[inline]
fn clamp_u64(val: u128) -> u64 {
    val.min(u128::from(u64::MAX)) as u64
}

/// Convert an event into a JSON value for line-oriented sinks.
#[cfg(feature = "telemetry-json")]
pub fn event_to_json(event: &ThrottleEvent) -> serde_json::Value {
    match event {
        ThrottleEvent::ErrorRecorded { destination, reason, rate } => json!({
            "kind": "error_recorded",
            "destination": destination.as_str(),
            "reason": reason.to_string(),
            "rate": rate,
        }),
        ThrottleEvent::DelayAdjusted { destination, delay, adjustment } => json!({
            "kind": "delay_adjusted",
            "destination": destination.as_str(),
            "delay_ms": clamp_u64(delay.as_millis()),
            "direction": format!("{adjustment:?}").to_lowercase(),
        }),
        ThrottleEvent::RetryScheduled { destination, reason, attempt, ceiling, delay } => json!({
            "kind": "retry_scheduled",
            "destination": destination.as_str(),
            "reason": reason.to_string(),
            "attempt": attempt,
            "ceiling": ceiling,
            "delay_ms": clamp_u64(delay.as_millis()),
        }),
        ThrottleEvent::RetryExhausted { destination, reason, attempts } => json!({
            "kind": "retry_exhausted",
            "destination": destination.as_str(),
            "reason": reason.to_string(),
            "attempts": attempts,
        }),
        ThrottleEvent::DestinationPaused { destination } => {
            json!({ "kind": "destination_paused", "destination": destination.as_str() })
        }
        ThrottleEvent::DestinationResumed { destination } => {
            json!({ "kind": "destination_resumed", "destination": destination.as_str() })
        }
        ThrottleEvent::RotationStarted { destination } => {
            json!({ "kind": "rotation_started", "destination": destination.as_str() })
        }
        ThrottleEvent::IdentityRotated { identity, epoch, iterations, elapsed } => json!({
            "kind": "identity_rotated",
            "identity": identity,
            "epoch": epoch,
            "iterations": iterations,
            "elapsed_ms": clamp_u64(elapsed.as_millis()),
        }),
        ThrottleEvent::RotationFailed { destination, error } => json!({
            "kind": "rotation_failed",
            "destination": destination.as_str(),
            "error": error,
        }),
        ThrottleEvent::Shutdown => json!({ "kind": "shutdown" }),
    }
}
