use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Meters per degree of latitude (treated as constant everywhere on Earth).
pub const METERS_PER_DEGREE_LAT: f64 = 111_320.0;

/// WGS-84 equatorial circumference. Base for the cos(lat)-scaled
/// meters-per-degree-of-longitude conversion.
pub const EQUATOR_CIRCUMFERENCE_M: f64 = 40_075_000.0;

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CameraModel {
    /// Horizontal field of view, degrees.
    #[serde(default = "default_fov_deg")]
    pub fov_deg: f64,
    pub frame_w: u32,
    pub frame_h: u32,
}

fn default_fov_deg() -> f64 {
    45.0
}

impl CameraModel {
    pub fn new(fov_deg: f64, frame_w: u32, frame_h: u32) -> Self {
        Self { fov_deg, frame_w, frame_h }
    }

    /// Ground meters covered by one pixel at the given altitude.
    /// Flat-earth, nadir-pointing camera.
    pub fn meters_per_pixel(&self, alt_m: f64) -> Result<f64, GeoError> {
        if alt_m <= 0.0 {
            return Err(GeoError::InvalidTelemetry(format!(
                "altitude must be positive, got {alt_m}"
            )));
        }
        if self.frame_w == 0 || self.frame_h == 0 {
            return Err(GeoError::InvalidTelemetry(format!(
                "degenerate frame {}x{}",
                self.frame_w, self.frame_h
            )));
        }
        let ground_width_m = 2.0 * alt_m * (self.fov_deg.to_radians() / 2.0).tan();
        Ok(ground_width_m / self.frame_w as f64)
    }
}

/// Vehicle position sampled at frame-capture time. Pairing the sample with
/// the frame it belongs to is the caller's job; mixing a stale position
/// with a fresh frame skews the estimate.
#[derive(Debug, Clone, Copy)]
pub struct TelemetrySnapshot {
    pub lat: f64,
    pub lon: f64,
    /// Relative altitude, meters.
    pub alt_m: f64,
    pub ts: OffsetDateTime,
}

/// Absolute ground coordinate estimate for one detection.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GeoTarget {
    pub lat: f64,
    pub lon: f64,
    pub alt_m: f64,
    pub distance_m: f64,
    pub confidence: f32,
    pub computed_at: OffsetDateTime,
}

#[derive(Debug, thiserror::Error)]
pub enum GeoError {
    #[error("invalid telemetry: {0}")]
    InvalidTelemetry(String),
}

/// Project a pixel detection onto the ground and offset the vehicle
/// position by it.
///
/// `(cx, cy)` is the bounding-box center in pixels. The camera is assumed
/// nadir-pointing with the frame axes aligned to the compass: +x maps to
/// +longitude, +y to +latitude. Valid only for short final-approach
/// distances; not geodesically exact.
pub fn locate(
    cam: &CameraModel,
    snap: &TelemetrySnapshot,
    cx: f64,
    cy: f64,
    confidence: f32,
) -> Result<GeoTarget, GeoError> {
    let m_per_px = cam.meters_per_pixel(snap.alt_m)?;

    let dx = cx - cam.frame_w as f64 / 2.0;
    let dy = cy - cam.frame_h as f64 / 2.0;
    let distance_m = (dx * dx + dy * dy).sqrt() * m_per_px;
    let bearing = dy.atan2(dx);

    let m_per_deg_lon = EQUATOR_CIRCUMFERENCE_M / 360.0 * snap.lat.to_radians().cos();
    let d_lat = distance_m * bearing.sin() / METERS_PER_DEGREE_LAT;
    let d_lon = distance_m * bearing.cos() / m_per_deg_lon;

    Ok(GeoTarget {
        lat: snap.lat + d_lat,
        lon: snap.lon + d_lon,
        alt_m: snap.alt_m,
        distance_m,
        confidence,
        computed_at: snap.ts,
    })
}
