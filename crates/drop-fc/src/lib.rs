pub mod mav;
pub mod state;

use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum FcError {
    #[error("telemetry link unreachable: {0}")]
    Connection(String),
    #[error("no position fix available")]
    SensorUnavailable,
    #[error("actuator command failed: {0}")]
    Actuator(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// Capability interface over the autopilot. The mission controller only
/// sees this, so it runs against a fake in tests and against MAVLink in
/// the air.
pub trait FlightController: Send {
    /// Vehicle ready to arm (link alive, position fix, standing by).
    fn armable(&self) -> bool;
    fn armed(&self) -> bool;
    fn set_mode(&mut self, mode: &str) -> Result<(), FcError>;
    fn arm(&mut self, arm: bool) -> Result<(), FcError>;
    fn takeoff(&mut self, alt_m: f32) -> Result<(), FcError>;
    /// (lat, lon, relative altitude m) from the position stream.
    fn global_position(&self) -> Result<(f64, f64, f64), FcError>;
    /// Range-finder altitude. Preferred over GPS/baro during low-altitude
    /// takeoff confirmation.
    fn sensor_altitude(&self) -> Option<f32>;
    fn goto_location(&mut self, lat: f64, lon: f64, alt_m: f32) -> Result<(), FcError>;
    fn set_channel_override(&mut self, channel: u8, pwm: u16) -> Result<(), FcError>;
    fn close(&mut self);
}

#[derive(Debug, Clone, Deserialize)]
pub struct FcConfig {
    /// MAVLink connection string: "serial:/dev/ttyUSB0:57600",
    /// "udpin:0.0.0.0:14550", "tcpout:host:5760", ...
    pub link: String,

    /// MAVLink ids we use (companion side)
    pub sys_id: u8,
    pub comp_id: u8,

    /// target system/component (FC side). 1/1 is common for ArduPilot.
    pub target_sys: u8,
    pub target_comp: u8,

    /// Mode name -> ArduPilot custom mode number. Defaults cover
    /// GUIDED/RTL for copter firmware.
    #[serde(default)]
    pub modes: HashMap<String, u32>,

    /// Companion heartbeat rate. Default 1 Hz.
    pub send_heartbeat_hz: Option<f32>,
}

impl FcConfig {
    pub fn mode_number(&self, name: &str) -> Option<u32> {
        if let Some(n) = self.modes.get(name) {
            return Some(*n);
        }
        match name {
            "GUIDED" => Some(4),
            "RTL" => Some(6),
            _ => None,
        }
    }
}
