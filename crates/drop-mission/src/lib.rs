pub mod controller;
pub mod doctor;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use drop_fc::FcError;
use drop_proto::TargetMessage;

/// Mission lifecycle states. Forward-only except Failed, which is
/// reachable from any active state; every terminal path passes through
/// ReturningToLaunch before Complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissionState {
    Idle,
    Connecting,
    ArmingTakeoff,
    AwaitingTarget,
    EnRoute,
    Descending,
    Delivering,
    ReturningToLaunch,
    Failed,
    Complete,
}

#[derive(Debug, thiserror::Error)]
pub enum MissionError {
    #[error("transport connection failed: {0}")]
    Connection(String),
    #[error("takeoff did not complete within {0}s")]
    TakeoffTimeout(u64),
    #[error("no target received within {0}s")]
    TargetTimeout(u64),
    #[error("vehicle did not arrive within {0}s")]
    TransitTimeout(u64),
    #[error("sensor unavailable: {0}")]
    Sensor(String),
    #[error("payload actuator: {0}")]
    Actuator(String),
    #[error("mission cancelled by operator")]
    Cancelled,
}

impl From<FcError> for MissionError {
    fn from(e: FcError) -> Self {
        match e {
            FcError::Connection(s) => Self::Connection(s),
            FcError::SensorUnavailable => Self::Sensor("position fix".into()),
            FcError::Actuator(s) => Self::Actuator(s),
            FcError::Command(s) => Self::Connection(s),
        }
    }
}

/// Flight-side view of the detection session: connect once, block for one
/// target, close. The TCP implementation lives in drop-link; tests use a
/// scripted fake.
pub trait TargetSource: Send {
    fn connect(&mut self) -> Result<(), MissionError>;
    fn recv_target(&mut self, timeout: Duration) -> Result<TargetMessage, MissionError>;
    fn close(&mut self);
}

/// Operator abort flag, checked at every poll iteration and sleep slice.
/// Cancelling never stops the vehicle in place; the controller routes
/// through ReturningToLaunch.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
