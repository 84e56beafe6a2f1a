//! Error types.
//!
//! Retry classifications (rate limited, transient, blocked) are not errors; they are decisions.
//! What remains are failures of the surrounding machinery: the anonymity-network control port,
//! the identity probe, configuration, and transport errors surfaced through the tower layer.

use std::time::Duration;

/// Control-port failures. Failing to connect or authenticate is fatal for the rotator.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("could not connect to control port {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("control port rejected authentication: {0}")]
    Authentication(String),
    #[error("unexpected control port reply: {0}")]
    Protocol(String),
    #[error("control port i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("control channel already closed")]
    Closed,
    #[error("identity rotation did not finish within {0:?}")]
    Timeout(Duration),
    #[error("identity probe could not be set up: {0}")]
    ProbeSetup(#[source] ProbeError),
}

/// Identity probe failures. Swallowed by the rotation loop.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("identity probe request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("identity probe returned HTTP {0}")]
    Status(u16),
    #[error("identity probe body had no identity element")]
    MissingIdentity,
}

/// Invalid configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable {key} has invalid value {value:?}")]
    InvalidEnv { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Error returned by the throttling tower service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ThrottleError<E> {
    /// Transport failure that was not (or no longer) retried.
    #[error("transport failed: {0}")]
    Transport(#[source] E),
}

impl<E> ThrottleError<E> {
    pub fn into_inner(self) -> E {
        match self {
            ThrottleError::Transport(e) => e,
        }
    }
}
