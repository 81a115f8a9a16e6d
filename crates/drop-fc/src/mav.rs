use anyhow::{Context, Result};
use mavlink::{
    common::{
        MavMessage, HEARTBEAT_DATA, MavAutopilot, MavCmd, MavDataStream, MavFrame, MavModeFlag,
        MavState, MavType, PositionTargetTypemask, COMMAND_LONG_DATA, RC_CHANNELS_OVERRIDE_DATA,
        REQUEST_DATA_STREAM_DATA, SET_POSITION_TARGET_GLOBAL_INT_DATA,
    },
    MavConnection, MavHeader,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_serial::SerialPortBuilderExt;
use tracing::{info, warn};

use crate::state::StateCell;
use crate::{FcConfig, FcError, FlightController};

// DroneKit's simple_goto mask: position fields only, everything else ignored.
const TYPE_MASK_POSITION_ONLY: u16 = 0b0000_1111_1111_1000;

type SharedConn = Arc<Box<dyn MavConnection<MavMessage> + Send + Sync>>;

pub struct MavFlightController {
    conn: SharedConn,
    hdr: MavHeader,
    target_sys: u8,
    target_comp: u8,
    cfg: FcConfig,
    state: StateCell,
    stop: Arc<AtomicBool>,
}

impl MavFlightController {
    pub fn connect(cfg: &FcConfig) -> Result<Self> {
        // quick validate serial device before handing it to mavlink
        if let Some(rest) = cfg.link.strip_prefix("serial:") {
            let (dev, baud) = rest
                .rsplit_once(':')
                .with_context(|| format!("malformed serial link {}", cfg.link))?;
            let baud: u32 = baud.parse().context("serial baud")?;
            let _ = tokio_serial::new(dev, baud)
                .open_native_async()
                .with_context(|| format!("open fc serial device {}", dev))?;
        }

        let conn: SharedConn = Arc::new(
            mavlink::connect::<MavMessage>(&cfg.link)
                .with_context(|| format!("mavlink connect {}", cfg.link))?,
        );

        let state = StateCell::new();
        let stop = Arc::new(AtomicBool::new(false));

        let fc = Self {
            conn: conn.clone(),
            hdr: MavHeader { system_id: cfg.sys_id, component_id: cfg.comp_id, sequence: 0 },
            target_sys: cfg.target_sys,
            target_comp: cfg.target_comp,
            cfg: cfg.clone(),
            state: state.clone(),
            stop: stop.clone(),
        };

        spawn_reader(cfg, conn, state, stop);
        Ok(fc)
    }

    pub fn state(&self) -> StateCell {
        self.state.clone()
    }

    fn send(&mut self, msg: MavMessage) -> Result<(), FcError> {
        self.hdr.sequence = self.hdr.sequence.wrapping_add(1);
        self.conn
            .send(&self.hdr, &msg)
            .map(|_| ())
            .map_err(|e| FcError::Command(e.to_string()))
    }

    fn command_long(&mut self, command: MavCmd, params: [f32; 7]) -> Result<(), FcError> {
        let cmd = COMMAND_LONG_DATA {
            target_system: self.target_sys,
            target_component: self.target_comp,
            command: command.into(),
            confirmation: 0,
            param1: params[0],
            param2: params[1],
            param3: params[2],
            param4: params[3],
            param5: params[4],
            param6: params[5],
            param7: params[6],
        };
        self.send(MavMessage::COMMAND_LONG(cmd))
    }
}

/// Reader thread: consumes the telemetry stream into the shared state
/// cell. This is the only writer of [`StateCell`]. `recv` blocks with no
/// timeout, so after `stop` is set the thread lingers until the next
/// frame (or read error) arrives; the heartbeat runs on its own timer
/// thread and is never held up by a silent link.
fn spawn_reader(cfg: &FcConfig, conn: SharedConn, state: StateCell, stop: Arc<AtomicBool>) {
    let mut hdr = MavHeader { system_id: cfg.sys_id, component_id: cfg.comp_id, sequence: 0 };
    let target_sys = cfg.target_sys;
    let target_comp = cfg.target_comp;

    spawn_heartbeat(cfg, conn.clone(), stop.clone());

    std::thread::spawn(move || {
        // ask the FC for the position stream at 1 Hz up front
        let req = REQUEST_DATA_STREAM_DATA {
            req_message_rate: 1,
            target_system: target_sys,
            target_component: target_comp,
            req_stream_id: MavDataStream::MAV_DATA_STREAM_POSITION as u8,
            start_stop: 1,
        };
        hdr.sequence = hdr.sequence.wrapping_add(1);
        if let Err(e) = conn.send(&hdr, &MavMessage::REQUEST_DATA_STREAM(req)) {
            warn!("fc: data stream request failed: {}", e);
        }

        while !stop.load(Ordering::Relaxed) {
            match conn.recv() {
                Ok((header, msg)) => {
                    if header.system_id == target_sys {
                        apply_message(&state, &msg);
                    }
                }
                Err(_) => std::thread::sleep(Duration::from_millis(10)),
            }
        }
    });
}

/// Companion heartbeat on its own clock, so the FC keeps seeing us even
/// when the telemetry stream goes quiet. Stops promptly on `stop`.
fn spawn_heartbeat(cfg: &FcConfig, conn: SharedConn, stop: Arc<AtomicBool>) {
    let hb_hz = cfg.send_heartbeat_hz.unwrap_or(1.0).max(0.2);
    let hb_interval = Duration::from_secs_f32(1.0 / hb_hz);
    let mut hdr = MavHeader { system_id: cfg.sys_id, component_id: cfg.comp_id, sequence: 0 };

    std::thread::spawn(move || {
        let mut last_send: Option<Instant> = None;
        while !stop.load(Ordering::Relaxed) {
            if last_send.map_or(true, |t| t.elapsed() >= hb_interval) {
                let hb = HEARTBEAT_DATA {
                    custom_mode: 0,
                    mavtype: MavType::MAV_TYPE_ONBOARD_CONTROLLER,
                    autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
                    base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
                    system_status: MavState::MAV_STATE_ACTIVE,
                    mavlink_version: 3,
                };
                hdr.sequence = hdr.sequence.wrapping_add(1);
                let _ = conn.send(&hdr, &MavMessage::HEARTBEAT(hb));
                last_send = Some(Instant::now());
            }
            std::thread::sleep(hb_interval.min(Duration::from_millis(50)));
        }
    });
}

fn apply_message(state: &StateCell, msg: &MavMessage) {
    match msg {
        MavMessage::HEARTBEAT(hb) => state.update(|s| {
            s.last_heartbeat = Some(Instant::now());
            s.armed = hb.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED);
            s.standby = hb.system_status == MavState::MAV_STATE_STANDBY;
        }),
        MavMessage::GLOBAL_POSITION_INT(p) => state.update(|s| {
            s.position = Some((
                p.lat as f64 / 1e7,
                p.lon as f64 / 1e7,
                p.relative_alt as f64 / 1000.0,
            ));
        }),
        MavMessage::DISTANCE_SENSOR(d) => state.update(|s| {
            // cm to meters
            s.sensor_alt_m = Some(d.current_distance as f32 / 100.0);
        }),
        _ => {}
    }
}

impl FlightController for MavFlightController {
    fn armable(&self) -> bool {
        let s = self.state.snapshot();
        s.last_heartbeat.is_some() && s.position.is_some() && s.standby
    }

    fn armed(&self) -> bool {
        self.state.armed()
    }

    fn set_mode(&mut self, mode: &str) -> Result<(), FcError> {
        let n = self
            .cfg
            .mode_number(mode)
            .ok_or_else(|| FcError::Command(format!("unknown mode {mode}")))?;
        info!("fc: set mode {} ({})", mode, n);
        self.command_long(
            MavCmd::MAV_CMD_DO_SET_MODE,
            [1.0, n as f32, 0.0, 0.0, 0.0, 0.0, 0.0],
        )
    }

    fn arm(&mut self, arm: bool) -> Result<(), FcError> {
        info!("fc: {}", if arm { "arm" } else { "disarm" });
        self.command_long(
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            [if arm { 1.0 } else { 0.0 }, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        )
    }

    fn takeoff(&mut self, alt_m: f32) -> Result<(), FcError> {
        info!("fc: takeoff to {:.1} m", alt_m);
        self.command_long(
            MavCmd::MAV_CMD_NAV_TAKEOFF,
            [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, alt_m],
        )
    }

    fn global_position(&self) -> Result<(f64, f64, f64), FcError> {
        self.state.position().ok_or(FcError::SensorUnavailable)
    }

    fn sensor_altitude(&self) -> Option<f32> {
        self.state.sensor_altitude()
    }

    fn goto_location(&mut self, lat: f64, lon: f64, alt_m: f32) -> Result<(), FcError> {
        info!("fc: goto {:.7},{:.7} alt {:.1} m", lat, lon, alt_m);
        let target = SET_POSITION_TARGET_GLOBAL_INT_DATA {
            lat_int: (lat * 1e7) as i32,
            lon_int: (lon * 1e7) as i32,
            alt: alt_m,
            type_mask: PositionTargetTypemask::from_bits_truncate(TYPE_MASK_POSITION_ONLY),
            coordinate_frame: MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT_INT,
            target_system: self.target_sys,
            target_component: self.target_comp,
            ..Default::default()
        };
        self.send(MavMessage::SET_POSITION_TARGET_GLOBAL_INT(target))
    }

    fn set_channel_override(&mut self, channel: u8, pwm: u16) -> Result<(), FcError> {
        // 0 leaves a channel untouched on the FC side
        let mut ov = RC_CHANNELS_OVERRIDE_DATA {
            target_system: self.target_sys,
            target_component: self.target_comp,
            ..Default::default()
        };
        match channel {
            1 => ov.chan1_raw = pwm,
            2 => ov.chan2_raw = pwm,
            3 => ov.chan3_raw = pwm,
            4 => ov.chan4_raw = pwm,
            5 => ov.chan5_raw = pwm,
            6 => ov.chan6_raw = pwm,
            7 => ov.chan7_raw = pwm,
            8 => ov.chan8_raw = pwm,
            other => {
                return Err(FcError::Actuator(format!("unsupported override channel {other}")))
            }
        }
        info!("fc: channel {} override -> {}", channel, pwm);
        self.send(MavMessage::RC_CHANNELS_OVERRIDE(ov))
            .map_err(|e| FcError::Actuator(e.to_string()))
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        info!("fc: link closed");
    }
}
