use anyhow::{Context, Result};
use std::io::Write;
use std::process::{Command, Stdio};
use tracing::debug;

use crate::{Detection, Detector, VisionConfig};

/// Runs the detection model as a child process: JPEG on stdin, JSON array
/// of detections on stdout. Keeps the model runtime (and its Python/GPU
/// stack) out of this binary entirely.
pub struct ExecDetector {
    cmd: String,
    args: Vec<String>,
    conf_threshold: f32,
}

impl ExecDetector {
    pub fn new(cfg: &VisionConfig) -> Self {
        Self {
            cmd: cfg.detector_cmd.clone(),
            args: cfg.detector_args.clone(),
            conf_threshold: cfg.conf_threshold,
        }
    }
}

impl Detector for ExecDetector {
    fn detect_jpeg(&mut self, jpeg: &[u8]) -> Result<Vec<Detection>> {
        let mut child = Command::new(&self.cmd)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawn detector {}", self.cmd))?;

        child
            .stdin
            .take()
            .context("detector stdin unavailable")?
            .write_all(jpeg)
            .context("write frame to detector")?;

        let out = child.wait_with_output().context("wait for detector")?;
        anyhow::ensure!(out.status.success(), "detector exited with {}", out.status);

        let dets: Vec<Detection> =
            serde_json::from_slice(&out.stdout).context("parse detector output")?;
        let n_raw = dets.len();
        let dets: Vec<Detection> = dets
            .into_iter()
            .filter(|d| d.confidence >= self.conf_threshold)
            .collect();
        debug!("detector: {} raw, {} above threshold", n_raw, dets.len());
        Ok(dets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SelectionPolicy;

    fn cfg(cmd: &str, args: &[&str], conf: f32) -> VisionConfig {
        VisionConfig {
            detector_cmd: cmd.to_string(),
            detector_args: args.iter().map(|s| s.to_string()).collect(),
            conf_threshold: conf,
            selection: SelectionPolicy::First,
        }
    }

    #[test]
    fn parses_detections_and_applies_threshold() {
        // `cat` is a fine stand-in detector: stdin JSON straight to stdout.
        let mut det = ExecDetector::new(&cfg("cat", &[], 0.5));
        let payload = br#"[
            {"class_id":0,"confidence":0.9,"xmin":1.0,"ymin":2.0,"xmax":3.0,"ymax":4.0},
            {"class_id":1,"confidence":0.2,"xmin":0.0,"ymin":0.0,"xmax":1.0,"ymax":1.0}
        ]"#;
        let out = det.detect_jpeg(payload).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].class_id, 0);
    }

    #[test]
    fn failing_detector_is_an_error() {
        let mut det = ExecDetector::new(&cfg("false", &[], 0.5));
        assert!(det.detect_jpeg(b"x").is_err());
    }

    #[test]
    fn garbage_output_is_an_error() {
        let mut det = ExecDetector::new(&cfg("echo", &["not-json"], 0.5));
        assert!(det.detect_jpeg(b"").is_err());
    }
}
