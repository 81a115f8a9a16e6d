pub mod framing;

use serde::{Deserialize, Serialize};

/// The one message a detection session carries: a computed ground target,
/// vision side to flight side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetMessage {
    pub latitude: f64,
    pub longitude: f64,
    /// Vehicle relative altitude at detection time, meters.
    pub altitude: f64,
    /// Radial ground distance from the vehicle to the target, meters.
    pub distance: f64,
    /// Detector confidence, 0-1.
    pub confidence: f32,
}
