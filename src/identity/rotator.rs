//! Identity rotation loop.
//!
//! A rotation signals the control channel for a new circuit and probes until the reported exit
//! identity differs from the one recorded before the rotation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::control::{ControlChannel, TorControlChannel};
use super::probe::{HttpIdentityProbe, IdentityProbe};
use super::Identity;
use crate::config::ThrottleConfig;
use crate::error::{ControlError, ProbeError};
use crate::sleeper::{Sleeper, TokioSleeper};

const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

/// Outcome of one successful rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rotation {
    pub identity: Identity,
    /// Signal/probe rounds it took.
    pub iterations: u32,
    pub elapsed: Duration,
    /// Rotation count after this one.
    pub epoch: u64,
}

/// Requests new circuits until the probe confirms a changed identity.
#[derive(Debug)]
pub struct IdentityRotator {
    control: Box<dyn ControlChannel>,
    probe: Box<dyn IdentityProbe>,
    sleeper: Arc<dyn Sleeper>,
    interval: Duration,
    current: Option<Identity>,
    epoch: u64,
    closed: bool,
}

impl IdentityRotator {
    pub fn new(control: impl ControlChannel + 'static, probe: impl IdentityProbe + 'static) -> Self {
        Self {
            control: Box::new(control),
            probe: Box::new(probe),
            sleeper: Arc::new(TokioSleeper),
            interval: DEFAULT_INTERVAL,
            current: None,
            epoch: 0,
            closed: false,
        }
    }

    /// Connect and authenticate to `cfg.control`, probing through `cfg.proxy`.
    ///
    /// The identity in use at connect time is recorded, so the first rotation has to move away
    /// from it. Fails with [`ControlError::ProbeSetup`] when that identity cannot be read.
    pub async fn connect(cfg: &ThrottleConfig) -> Result<Self, ControlError> {
        let control_cfg = cfg.control.clone().unwrap_or_default();
        let probe = HttpIdentityProbe::from_config(cfg).map_err(ControlError::ProbeSetup)?;
        let control = TorControlChannel::connect(&control_cfg.addr(), &control_cfg.password).await?;
        let mut rotator = Self::new(control, probe).with_interval(cfg.probe.interval);
        let identity = rotator.refresh_identity().await.map_err(ControlError::ProbeSetup)?;
        info!(target: "crawlguard::identity", %identity, "identity rotator connected");
        Ok(rotator)
    }

    pub fn with_sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Pause between signal/probe rounds.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Seed the identity the next rotation must move away from.
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.current = Some(identity);
        self
    }

    pub fn current_identity(&self) -> Option<&Identity> {
        self.current.as_ref()
    }

    /// Probe once without signalling and record the result as the current identity.
    pub async fn refresh_identity(&mut self) -> Result<Identity, ProbeError> {
        let identity = self.probe.current_identity().await?;
        self.current = Some(identity.clone());
        Ok(identity)
    }

    /// Number of successful rotations.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Signal and probe until the identity changes.
    ///
    /// Probe failures count as "not changed yet". Control failures abort the rotation.
    pub async fn rotate(&mut self) -> Result<Rotation, ControlError> {
        if self.closed {
            return Err(ControlError::Closed);
        }
        info!(target: "crawlguard::identity", "requesting new identity");
        let start = Instant::now();
        let mut iterations: u32 = 0;
        let identity = loop {
            iterations = iterations.saturating_add(1);
            self.control.signal_new_identity().await?;
            match self.probe.current_identity().await {
                Ok(identity) if self.current.as_ref() != Some(&identity) => break identity,
                Ok(identity) => {
                    debug!(target: "crawlguard::identity", %identity, iterations, "identity unchanged")
                }
                Err(err) => {
                    debug!(target: "crawlguard::identity", error = %err, iterations, "identity probe failed")
                }
            }
            self.sleeper.sleep(self.interval).await;
        };

        let elapsed = start.elapsed();
        self.current = Some(identity.clone());
        self.epoch += 1;
        info!(
            target: "crawlguard::identity",
            %identity,
            iterations,
            elapsed_ms = elapsed.as_millis() as u64,
            "got new identity"
        );
        Ok(Rotation { identity, iterations, elapsed, epoch: self.epoch })
    }

    /// Release the control channel. Idempotent.
    pub async fn close(&mut self) -> Result<(), ControlError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        info!(target: "crawlguard::identity", "closing identity rotator");
        self.control.close().await
    }
}
