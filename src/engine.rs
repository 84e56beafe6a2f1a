//! Capability handed to the retry policy for stopping and restarting a destination's traffic.

use std::sync::{Arc, Mutex};

use crate::request::DestinationKey;

/// Pause/resume hooks of the surrounding crawl engine.
///
/// The policy calls `pause` before an identity rotation and `resume` once it finishes, whether
/// or not the rotation succeeded.
pub trait EngineControl: Send + Sync + std::fmt::Debug {
    fn pause(&self, destination: &DestinationKey);
    fn resume(&self, destination: &DestinationKey);
}

/// Engine without pause support; the destination gate alone holds requests back.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEngine;

impl EngineControl for NoopEngine {
    fn pause(&self, _destination: &DestinationKey) {}
    fn resume(&self, _destination: &DestinationKey) {}
}

/// Engine call recorded by [`RecordingEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Pause(DestinationKey),
    Resume(DestinationKey),
}

/// Records every call; clones share the log.
#[derive(Debug, Default, Clone)]
pub struct RecordingEngine {
    calls: Arc<Mutex<Vec<EngineCall>>>,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn push(&self, call: EngineCall) {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).push(call);
    }
}

impl EngineControl for RecordingEngine {
    fn pause(&self, destination: &DestinationKey) {
        self.push(EngineCall::Pause(destination.clone()));
    }

    fn resume(&self, destination: &DestinationKey) {
        self.push(EngineCall::Resume(destination.clone()));
    }
}

impl<E: EngineControl + ?Sized> EngineControl for Arc<E> {
    fn pause(&self, destination: &DestinationKey) {
        (**self).pause(destination)
    }

    fn resume(&self, destination: &DestinationKey) {
        (**self).resume(destination)
    }
}
