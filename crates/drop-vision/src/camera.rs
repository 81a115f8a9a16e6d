use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CameraConfig {
    pub mode: String,   // "libcamera-jpeg" | "v4l2-mjpeg" | "file"
    pub device: String, // /dev/video0 (v4l2), or the path in file mode
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// One captured frame. Dimensions come from the decoded JPEG, not the
/// config, so the geolocation math always sees what the sensor produced.
#[derive(Debug, Clone)]
pub struct Frame {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Pragmatic capture:
/// - libcamera-jpeg: `libcamera-still -n -t 1 ... -o -` returns a JPEG on
///   stdout (simple, robust on Pi)
/// - v4l2-mjpeg: single MJPEG frame through `ffmpeg`
/// - file: read a JPEG from disk (bench runs without a camera attached)
pub async fn capture_frame(cfg: &CameraConfig) -> Result<Frame> {
    let jpeg = match cfg.mode.as_str() {
        "libcamera-jpeg" => capture_libcamera(cfg).await?,
        "v4l2-mjpeg" => capture_v4l2_ffmpeg(cfg).await?,
        "file" => tokio::fs::read(&cfg.device)
            .await
            .with_context(|| format!("read frame file {}", cfg.device))?,
        other => anyhow::bail!("unknown camera.mode: {}", other),
    };

    let decoded = image::load_from_memory(&jpeg).context("decode captured frame")?;
    let (width, height) = (decoded.width(), decoded.height());
    Ok(Frame { jpeg, width, height })
}

async fn capture_libcamera(cfg: &CameraConfig) -> Result<Vec<u8>> {
    let mut cmd = Command::new("libcamera-still");
    cmd.args([
        "-n",
        "-t", "1",
        "--width", &cfg.width.to_string(),
        "--height", &cfg.height.to_string(),
        "-o", "-",
    ]);

    debug!("capture: libcamera-still");
    let out = cmd.output().await.context("run libcamera-still")?;
    anyhow::ensure!(out.status.success(), "libcamera-still failed");
    Ok(out.stdout)
}

async fn capture_v4l2_ffmpeg(cfg: &CameraConfig) -> Result<Vec<u8>> {
    let mut cmd = Command::new("ffmpeg");
    cmd.args([
        "-loglevel", "error",
        "-f", "v4l2",
        "-input_format", "mjpeg",
        "-video_size", &format!("{}x{}", cfg.width, cfg.height),
        "-framerate", &cfg.fps.to_string(),
        "-i", &cfg.device,
        "-frames:v", "1",
        "-f", "mjpeg",
        "-",
    ]);

    debug!("capture: ffmpeg v4l2 {}", cfg.device);
    let out = cmd.output().await.context("run ffmpeg")?;
    anyhow::ensure!(out.status.success(), "ffmpeg capture failed");
    Ok(out.stdout)
}
