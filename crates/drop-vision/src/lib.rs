pub mod camera;
pub mod exec;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// One detected object in pixel coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: i32,
    pub confidence: f32,
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl Detection {
    /// Bounding-box center, pixels.
    pub fn center(&self) -> (f64, f64) {
        (
            (self.xmin + self.xmax) as f64 / 2.0,
            (self.ymin + self.ymax) as f64 / 2.0,
        )
    }
}

/// Opaque detection backend. The model itself is an external collaborator;
/// anything that turns a JPEG frame into boxes can sit behind this.
pub trait Detector: Send {
    fn detect_jpeg(&mut self, jpeg: &[u8]) -> Result<Vec<Detection>>;
}

/// Which detection a session forwards when a frame yields several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionPolicy {
    /// Detector output order (original server behavior).
    First,
    HighestConfidence,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self::First
    }
}

impl SelectionPolicy {
    pub fn select<'a>(&self, dets: &'a [Detection]) -> Option<&'a Detection> {
        match self {
            Self::First => dets.first(),
            Self::HighestConfidence => dets
                .iter()
                .max_by(|a, b| {
                    a.confidence
                        .partial_cmp(&b.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VisionConfig {
    /// Detector command, fed a JPEG on stdin, expected to print a JSON
    /// array of detections on stdout.
    pub detector_cmd: String,
    #[serde(default)]
    pub detector_args: Vec<String>,
    pub conf_threshold: f32,
    #[serde(default)]
    pub selection: SelectionPolicy,
}
