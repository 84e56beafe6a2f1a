//! Anonymity-network identity rotation.
//!
//! An [`IdentityRotator`] owns one authenticated [`ControlChannel`] and one [`IdentityProbe`].
//! Rotating means asking the network for a new circuit and probing until the exit identity seen
//! from outside actually differs from the last recorded one.

use std::fmt;

mod control;
mod probe;
mod rotator;

pub use control::{ControlChannel, ControlReply, TorControlChannel};
pub use probe::{extract_identity, HttpIdentityProbe, IdentityProbe};
pub use rotator::{IdentityRotator, Rotation};

/// Exit identity as reported by the probe endpoint (usually an IP address).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
