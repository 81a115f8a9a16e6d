use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::ToSocketAddrs;
use std::time::Duration;
use tracing::{info, warn};

use drop_fc::mav::MavFlightController;
use drop_fc::{FcConfig, FlightController};
use drop_geo::{CameraModel, TelemetrySnapshot};
use drop_link::{TargetServer, TargetSession, TcpTargetClient};
use drop_mission::controller::{MissionConfig, MissionController};
use drop_mission::{doctor as mission_doctor, CancelToken};
use drop_proto::TargetMessage;
use drop_vision::camera;
use drop_vision::exec::ExecDetector;
use drop_vision::{Detector, VisionConfig};

#[derive(Debug, Parser)]
#[command(name = "skydrop", version, about = "SkyDrop - Vision-Guided Payload Delivery")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the config before anything leaves the ground.
    Doctor,
    /// Vision side: detect, geolocate, hand targets to ground stations.
    Serve,
    /// Flight side: run one delivery mission.
    Fly,
}

#[derive(Debug, serde::Deserialize)]
struct Config {
    server: ServerCfg,
    camera: camera::CameraConfig,
    vision: VisionConfig,
    geo: CameraModel,
    fc: FcConfig,
    mission: MissionSection,
}

#[derive(Debug, serde::Deserialize)]
struct ServerCfg {
    #[serde(default = "default_bind")]
    bind: String,
    /// When set, the frame that triggered a delivery is kept here.
    captures_dir: Option<String>,
}

fn default_bind() -> String {
    "0.0.0.0:5000".into()
}

#[derive(Debug, serde::Deserialize)]
struct MissionSection {
    /// Detection server endpoint, flight side.
    server_addr: String,
    #[serde(default = "default_connect_timeout")]
    connect_timeout_s: u64,
    #[serde(flatten)]
    mission: MissionConfig,
}

fn default_connect_timeout() -> u64 {
    10
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).context("read config")?;
    Ok(toml::from_str(&s).context("parse config toml")?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg)?,
        Command::Serve => serve(&cfg).await?,
        Command::Fly => fly(&cfg).await?,
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    anyhow::ensure!(
        cfg.geo.fov_deg > 0.0 && cfg.geo.fov_deg < 180.0,
        "geo.fov_deg out of range"
    );
    anyhow::ensure!(
        cfg.geo.frame_w > 0 && cfg.geo.frame_h > 0,
        "geo frame dimensions invalid"
    );
    anyhow::ensure!(
        matches!(cfg.camera.mode.as_str(), "libcamera-jpeg" | "v4l2-mjpeg" | "file"),
        "unknown camera.mode: {}",
        cfg.camera.mode
    );
    anyhow::ensure!(!cfg.vision.detector_cmd.is_empty(), "vision.detector_cmd missing");
    anyhow::ensure!(
        cfg.vision.conf_threshold > 0.0 && cfg.vision.conf_threshold <= 1.0,
        "vision.conf_threshold must be in (0, 1]"
    );
    cfg.server
        .bind
        .parse::<std::net::SocketAddr>()
        .context("server.bind invalid")?;
    cfg.mission
        .server_addr
        .to_socket_addrs()
        .context("mission.server_addr unresolvable")?;
    anyhow::ensure!(!cfg.fc.link.is_empty(), "fc.link missing");
    anyhow::ensure!(cfg.mission.connect_timeout_s > 0, "mission.connect_timeout_s must be positive");
    mission_doctor::check_mission(&cfg.mission.mission)?;

    info!("doctor: OK");
    Ok(())
}

async fn serve(cfg: &Config) -> Result<()> {
    info!("serve: starting");

    let mut detector: Box<dyn Detector> = Box::new(ExecDetector::new(&cfg.vision));
    let mut fc = MavFlightController::connect(&cfg.fc).context("FC open")?;
    let server = TargetServer::bind(&cfg.server.bind).await?;

    loop {
        info!("waiting for ground station connection...");
        let session = tokio::select! {
            s = server.accept() => s?,
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down detection server");
                break;
            }
        };
        if let Err(e) = serve_client(cfg, session, detector.as_mut(), &fc).await {
            warn!("session ended with error: {:#}", e);
        }
    }

    fc.close();
    Ok(())
}

/// One detection session: frames until something is worth delivering,
/// then exactly one target message and the session is done.
async fn serve_client(
    cfg: &Config,
    session: TargetSession,
    detector: &mut dyn Detector,
    fc: &MavFlightController,
) -> Result<()> {
    loop {
        let frame = camera::capture_frame(&cfg.camera).await?;
        // position sampled at capture time, paired with this frame
        let (lat, lon, alt_m) = fc.global_position()?;
        let snap = TelemetrySnapshot {
            lat,
            lon,
            alt_m,
            ts: time::OffsetDateTime::now_utc(),
        };

        let dets = detector.detect_jpeg(&frame.jpeg)?;
        let Some(det) = cfg.vision.selection.select(&dets) else {
            continue;
        };

        let cam = CameraModel::new(cfg.geo.fov_deg, frame.width, frame.height);
        let (cx, cy) = det.center();
        let target = match drop_geo::locate(&cam, &snap, cx, cy, det.confidence) {
            Ok(t) => t,
            Err(e) => {
                warn!("geolocation failed, skipping frame: {e}");
                continue;
            }
        };

        let msg = TargetMessage {
            latitude: target.lat,
            longitude: target.lon,
            altitude: target.alt_m,
            distance: target.distance_m,
            confidence: target.confidence,
        };
        let peer = session.peer();
        session.send_target(&msg).await?;
        info!(
            "session {} complete: target {:.7},{:.7} ({:.1} m out, conf {:.2})",
            peer, msg.latitude, msg.longitude, msg.distance, msg.confidence
        );

        if let Some(dir) = &cfg.server.captures_dir {
            save_capture(dir, &frame.jpeg).await;
        }
        return Ok(());
    }
}

async fn save_capture(dir: &str, jpeg: &[u8]) {
    let res: Result<()> = async {
        tokio::fs::create_dir_all(dir).await?;
        let name = format!(
            "{}/detection_{}.jpg",
            dir,
            time::OffsetDateTime::now_utc().unix_timestamp_nanos()
        );
        tokio::fs::write(&name, jpeg).await?;
        info!("detection saved: {}", name);
        Ok(())
    }
    .await;
    if let Err(e) = res {
        warn!("capture save failed: {:#}", e);
    }
}

async fn fly(cfg: &Config) -> Result<()> {
    info!("fly: starting mission");

    let fc = MavFlightController::connect(&cfg.fc).context("FC open")?;
    let client = TcpTargetClient::new(
        cfg.mission.server_addr.clone(),
        Duration::from_secs(cfg.mission.connect_timeout_s),
    );

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("abort requested; routing through return-to-launch");
                cancel.cancel();
            }
        });
    }

    let mission_cfg = cfg.mission.mission.clone();
    let report = tokio::task::spawn_blocking(move || {
        MissionController::new(fc, client, mission_cfg, cancel).run()
    })
    .await
    .context("mission thread")?;

    println!("mission states:");
    for s in &report.visited {
        println!("  {:?}", s);
    }
    match report.error {
        None => {
            info!("mission complete");
            Ok(())
        }
        Some(e) => Err(anyhow::Error::new(e).context("mission failed")),
    }
}
