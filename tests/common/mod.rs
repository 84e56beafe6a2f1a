#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use crawlguard::{ControlChannel, ControlError, Identity, IdentityProbe, ProbeError};
use tokio::sync::Notify;

/// Control channel that counts signals and closes.
#[derive(Debug, Default, Clone)]
pub struct FakeControl {
    pub signals: Arc<AtomicU32>,
    pub closes: Arc<AtomicU32>,
}

impl FakeControl {
    pub fn signals(&self) -> u32 {
        self.signals.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ControlChannel for FakeControl {
    async fn signal_new_identity(&mut self) -> Result<(), ControlError> {
        self.signals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ControlError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Probe returning a fresh identity on every call.
#[derive(Debug, Default)]
pub struct CountingProbe {
    next: AtomicU32,
}

#[async_trait]
impl IdentityProbe for CountingProbe {
    async fn current_identity(&self) -> Result<Identity, ProbeError> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        Ok(Identity::new(format!("10.0.0.{n}")))
    }
}

/// Probe that waits for `release` before answering from its script.
#[derive(Debug, Default, Clone)]
pub struct GatedProbe {
    pub release: Arc<Notify>,
    pub entered: Arc<Notify>,
    script: Arc<Mutex<VecDeque<Identity>>>,
}

impl GatedProbe {
    pub fn new(identities: &[&str]) -> Self {
        Self {
            script: Arc::new(Mutex::new(identities.iter().map(|s| Identity::new(*s)).collect())),
            ..Default::default()
        }
    }
}

#[async_trait]
impl IdentityProbe for GatedProbe {
    async fn current_identity(&self) -> Result<Identity, ProbeError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.script.lock().unwrap().pop_front().ok_or(ProbeError::MissingIdentity)
    }
}

/// Probe that never finds an identity.
#[derive(Debug, Default)]
pub struct DeadProbe;

#[async_trait]
impl IdentityProbe for DeadProbe {
    async fn current_identity(&self) -> Result<Identity, ProbeError> {
        Err(ProbeError::Status(502))
    }
}
