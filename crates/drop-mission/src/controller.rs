use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use drop_fc::FlightController;

use crate::{CancelToken, MissionError, MissionState, TargetSource};

/// Scale for the degrees-as-meters planar distance (original controller
/// constant, ~meters per degree). Short final-approach ranges only; not
/// geodesically correct.
const PLANAR_METERS_PER_DEGREE: f64 = 1.113195e5;

pub fn planar_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    (dlat * dlat + dlon * dlon).sqrt() * PLANAR_METERS_PER_DEGREE
}

#[derive(Debug, Clone, Deserialize)]
pub struct MissionConfig {
    #[serde(default = "d_takeoff_alt")]
    pub takeoff_alt_m: f32,
    #[serde(default = "d_takeoff_timeout")]
    pub takeoff_timeout_s: u64,
    #[serde(default = "d_target_timeout")]
    pub target_wait_timeout_s: u64,
    #[serde(default = "d_transit_timeout")]
    pub transit_timeout_s: u64,
    #[serde(default = "d_arrival")]
    pub arrival_threshold_m: f64,
    #[serde(default = "d_descend_alt")]
    pub descend_alt_m: f32,
    /// Fixed wait after commanding the descend waypoint; there is no
    /// sensor confirmation of arrival at drop altitude.
    #[serde(default = "d_settle")]
    pub settle_ms: u64,
    #[serde(default = "d_channel")]
    pub drop_channel: u8,
    #[serde(default = "d_open_pwm")]
    pub drop_open_pwm: u16,
    #[serde(default = "d_closed_pwm")]
    pub drop_closed_pwm: u16,
    #[serde(default = "d_hold")]
    pub drop_hold_ms: u64,
    #[serde(default = "d_poll")]
    pub poll_interval_ms: u64,
    #[serde(default = "d_guided")]
    pub guided_mode: String,
    #[serde(default = "d_rtl")]
    pub rtl_mode: String,
}

fn d_takeoff_alt() -> f32 { 10.0 }
fn d_takeoff_timeout() -> u64 { 60 }
fn d_target_timeout() -> u64 { 120 }
fn d_transit_timeout() -> u64 { 180 }
fn d_arrival() -> f64 { 2.0 }
fn d_descend_alt() -> f32 { 5.0 }
fn d_settle() -> u64 { 5_000 }
fn d_channel() -> u8 { 8 }
fn d_open_pwm() -> u16 { 2100 }
fn d_closed_pwm() -> u16 { 1000 }
fn d_hold() -> u64 { 10_000 }
fn d_poll() -> u64 { 1_000 }
fn d_guided() -> String { "GUIDED".into() }
fn d_rtl() -> String { "RTL".into() }

impl Default for MissionConfig {
    fn default() -> Self {
        Self {
            takeoff_alt_m: d_takeoff_alt(),
            takeoff_timeout_s: d_takeoff_timeout(),
            target_wait_timeout_s: d_target_timeout(),
            transit_timeout_s: d_transit_timeout(),
            arrival_threshold_m: d_arrival(),
            descend_alt_m: d_descend_alt(),
            settle_ms: d_settle(),
            drop_channel: d_channel(),
            drop_open_pwm: d_open_pwm(),
            drop_closed_pwm: d_closed_pwm(),
            drop_hold_ms: d_hold(),
            poll_interval_ms: d_poll(),
            guided_mode: d_guided(),
            rtl_mode: d_rtl(),
        }
    }
}

/// What a finished mission looked like: every state entered, in order,
/// plus the terminal error if the run failed.
#[derive(Debug)]
pub struct MissionReport {
    pub visited: Vec<MissionState>,
    pub error: Option<MissionError>,
}

impl MissionReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Executes one mission lifecycle. One instance, one flight; it never
/// resets to Idle.
pub struct MissionController<F: FlightController, S: TargetSource> {
    fc: F,
    source: S,
    cfg: MissionConfig,
    cancel: CancelToken,
    state: MissionState,
    visited: Vec<MissionState>,
}

impl<F: FlightController, S: TargetSource> MissionController<F, S> {
    pub fn new(fc: F, source: S, cfg: MissionConfig, cancel: CancelToken) -> Self {
        Self {
            fc,
            source,
            cfg,
            cancel,
            state: MissionState::Idle,
            visited: vec![MissionState::Idle],
        }
    }

    /// Run the mission to completion on the calling thread. Blocks through
    /// every poll loop; every wait carries a bounded deadline.
    pub fn run(mut self) -> MissionReport {
        let error = match self.fly() {
            Ok(()) => None,
            Err(e) => {
                error!("mission failed: {e}");
                self.enter(MissionState::Failed);
                // never leave the vehicle parked in guided mode
                if let Err(rtl) = self.fc.set_mode(&self.cfg.rtl_mode) {
                    error!("rtl fallback failed: {rtl}");
                }
                self.enter(MissionState::ReturningToLaunch);
                Some(e)
            }
        };
        self.source.close();
        self.fc.close();
        self.enter(MissionState::Complete);
        MissionReport { visited: self.visited, error }
    }

    fn fly(&mut self) -> Result<(), MissionError> {
        self.enter(MissionState::Connecting);
        self.source.connect()?;

        self.enter(MissionState::ArmingTakeoff);
        self.arm_and_takeoff()?;

        self.enter(MissionState::AwaitingTarget);
        let timeout = Duration::from_secs(self.cfg.target_wait_timeout_s);
        let target = self.source.recv_target(timeout)?;
        info!(
            "target received: {:.7},{:.7} distance {:.1} m confidence {:.2}",
            target.latitude, target.longitude, target.distance, target.confidence
        );

        self.enter(MissionState::EnRoute);
        let nav_alt = self
            .fc
            .sensor_altitude()
            .ok_or_else(|| MissionError::Sensor("range-finder altitude".into()))?;
        self.fc.goto_location(target.latitude, target.longitude, nav_alt)?;
        self.await_arrival(target.latitude, target.longitude)?;

        self.enter(MissionState::Descending);
        self.fc
            .goto_location(target.latitude, target.longitude, self.cfg.descend_alt_m)?;
        // settle on a timer; arrival at drop altitude is not confirmed
        self.sleep_cancellable(Duration::from_millis(self.cfg.settle_ms))?;

        self.enter(MissionState::Delivering);
        self.deliver()?;

        self.fc.set_mode(&self.cfg.rtl_mode)?;
        self.enter(MissionState::ReturningToLaunch);
        Ok(())
    }

    fn arm_and_takeoff(&mut self) -> Result<(), MissionError> {
        let secs = self.cfg.takeoff_timeout_s;
        let deadline = Instant::now() + Duration::from_secs(secs);

        info!("waiting for vehicle to become armable");
        if !self.poll_until(deadline, |fc| fc.armable())? {
            return Err(MissionError::TakeoffTimeout(secs));
        }

        self.fc.set_mode(&self.cfg.guided_mode)?;
        self.fc.arm(true)?;
        if !self.poll_until(deadline, |fc| fc.armed())? {
            return Err(MissionError::TakeoffTimeout(secs));
        }

        info!("taking off to {:.1} m", self.cfg.takeoff_alt_m);
        self.fc.takeoff(self.cfg.takeoff_alt_m)?;

        // range finder, not GPS/baro: low-altitude confirmation
        let gate = self.cfg.takeoff_alt_m * 0.95;
        if !self.poll_until(deadline, |fc| {
            fc.sensor_altitude().map_or(false, |a| a >= gate)
        })? {
            return Err(MissionError::TakeoffTimeout(secs));
        }
        info!("reached takeoff altitude");
        Ok(())
    }

    fn await_arrival(&mut self, lat: f64, lon: f64) -> Result<(), MissionError> {
        let secs = self.cfg.transit_timeout_s;
        let deadline = Instant::now() + Duration::from_secs(secs);
        loop {
            if self.cancel.is_cancelled() {
                return Err(MissionError::Cancelled);
            }
            let (cur_lat, cur_lon, _) = self.fc.global_position()?;
            let d = planar_distance_m(cur_lat, cur_lon, lat, lon);
            debug!("distance to target: {:.2} m", d);
            if d < self.cfg.arrival_threshold_m {
                info!("arrived at target ({:.2} m)", d);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(MissionError::TransitTimeout(secs));
            }
            std::thread::sleep(Duration::from_millis(self.cfg.poll_interval_ms));
        }
    }

    /// Best-effort payload release. Actuator failures are logged, never
    /// fatal; the vehicle still returns home.
    fn deliver(&mut self) -> Result<(), MissionError> {
        let ch = self.cfg.drop_channel;
        if let Err(e) = self.fc.set_channel_override(ch, self.cfg.drop_open_pwm) {
            warn!("payload release failed, continuing to return: {e}");
            return Ok(());
        }
        info!("payload servos open (pwm {})", self.cfg.drop_open_pwm);

        let held = self.sleep_cancellable(Duration::from_millis(self.cfg.drop_hold_ms));

        match self.fc.set_channel_override(ch, self.cfg.drop_closed_pwm) {
            Ok(()) => info!("payload servos closed (pwm {})", self.cfg.drop_closed_pwm),
            Err(e) => warn!("payload servo close failed: {e}"),
        }
        held
    }

    fn poll_until(
        &mut self,
        deadline: Instant,
        mut pred: impl FnMut(&F) -> bool,
    ) -> Result<bool, MissionError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(MissionError::Cancelled);
            }
            if pred(&self.fc) {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(self.cfg.poll_interval_ms));
        }
    }

    fn sleep_cancellable(&self, dur: Duration) -> Result<(), MissionError> {
        let deadline = Instant::now() + dur;
        loop {
            if self.cancel.is_cancelled() {
                return Err(MissionError::Cancelled);
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(());
            }
            std::thread::sleep(left.min(Duration::from_millis(50)));
        }
    }

    fn enter(&mut self, next: MissionState) {
        info!("mission state: {:?} -> {:?}", self.state, next);
        self.state = next;
        self.visited.push(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drop_fc::FcError;
    use drop_proto::TargetMessage;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeFcInner {
        armable: bool,
        armed: bool,
        takeoff_alt: Option<f32>,
        home: (f64, f64, f64),
        goto_target: Option<(f64, f64, f32)>,
        modes: Vec<String>,
        overrides: Vec<(u8, u16)>,
        fail_actuator: bool,
        hold_position: bool,
        sensor_drops_after_takeoff: bool,
        sensor_polls: u32,
        closed: bool,
    }

    #[derive(Clone)]
    struct FakeFc(Arc<Mutex<FakeFcInner>>);

    impl FakeFc {
        fn new() -> Self {
            let inner = FakeFcInner {
                armable: true,
                home: (12.9716, 77.5946, 0.0),
                ..Default::default()
            };
            Self(Arc::new(Mutex::new(inner)))
        }
    }

    impl FlightController for FakeFc {
        fn armable(&self) -> bool {
            self.0.lock().unwrap().armable
        }

        fn armed(&self) -> bool {
            self.0.lock().unwrap().armed
        }

        fn set_mode(&mut self, mode: &str) -> Result<(), FcError> {
            self.0.lock().unwrap().modes.push(mode.to_string());
            Ok(())
        }

        fn arm(&mut self, arm: bool) -> Result<(), FcError> {
            self.0.lock().unwrap().armed = arm;
            Ok(())
        }

        fn takeoff(&mut self, alt_m: f32) -> Result<(), FcError> {
            self.0.lock().unwrap().takeoff_alt = Some(alt_m);
            Ok(())
        }

        fn global_position(&self) -> Result<(f64, f64, f64), FcError> {
            let inner = self.0.lock().unwrap();
            match inner.goto_target {
                // teleport: the fake arrives instantly unless told to stall
                Some((lat, lon, alt)) if !inner.hold_position => Ok((lat, lon, alt as f64)),
                _ => Ok(inner.home),
            }
        }

        fn sensor_altitude(&self) -> Option<f32> {
            let mut inner = self.0.lock().unwrap();
            if inner.sensor_drops_after_takeoff && inner.sensor_polls > 0 {
                return None;
            }
            if inner.takeoff_alt.is_some() {
                inner.sensor_polls += 1;
            }
            inner.takeoff_alt
        }

        fn goto_location(&mut self, lat: f64, lon: f64, alt_m: f32) -> Result<(), FcError> {
            self.0.lock().unwrap().goto_target = Some((lat, lon, alt_m));
            Ok(())
        }

        fn set_channel_override(&mut self, channel: u8, pwm: u16) -> Result<(), FcError> {
            let mut inner = self.0.lock().unwrap();
            if inner.fail_actuator {
                return Err(FcError::Actuator("servo rail offline".into()));
            }
            inner.overrides.push((channel, pwm));
            Ok(())
        }

        fn close(&mut self) {
            self.0.lock().unwrap().closed = true;
        }
    }

    enum SourcePlan {
        Deliver(TargetMessage),
        NeverDelivers,
        RefusesConnection,
    }

    struct FakeSource {
        plan: SourcePlan,
        closed: bool,
    }

    impl FakeSource {
        fn new(plan: SourcePlan) -> Self {
            Self { plan, closed: false }
        }
    }

    impl TargetSource for FakeSource {
        fn connect(&mut self) -> Result<(), MissionError> {
            match self.plan {
                SourcePlan::RefusesConnection => {
                    Err(MissionError::Connection("refused".into()))
                }
                _ => Ok(()),
            }
        }

        fn recv_target(&mut self, timeout: Duration) -> Result<TargetMessage, MissionError> {
            match &self.plan {
                SourcePlan::Deliver(msg) => Ok(msg.clone()),
                SourcePlan::NeverDelivers => {
                    Err(MissionError::TargetTimeout(timeout.as_secs()))
                }
                SourcePlan::RefusesConnection => unreachable!("connect already failed"),
            }
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    fn fast_cfg() -> MissionConfig {
        MissionConfig {
            settle_ms: 5,
            drop_hold_ms: 5,
            poll_interval_ms: 1,
            ..Default::default()
        }
    }

    fn target() -> TargetMessage {
        TargetMessage {
            latitude: 12.9717,
            longitude: 77.5947,
            altitude: 10.0,
            distance: 14.9,
            confidence: 0.91,
        }
    }

    use MissionState::*;

    #[test]
    fn success_visits_each_state_once_in_order() {
        let fc = FakeFc::new();
        let source = FakeSource::new(SourcePlan::Deliver(target()));
        let report = MissionController::new(
            fc.clone(),
            source,
            fast_cfg(),
            CancelToken::new(),
        )
        .run();

        assert!(report.succeeded(), "unexpected error: {:?}", report.error);
        assert_eq!(
            report.visited,
            vec![
                Idle,
                Connecting,
                ArmingTakeoff,
                AwaitingTarget,
                EnRoute,
                Descending,
                Delivering,
                ReturningToLaunch,
                Complete,
            ]
        );

        let inner = fc.0.lock().unwrap();
        assert_eq!(inner.modes, vec!["GUIDED", "RTL"]);
        assert_eq!(inner.overrides, vec![(8, 2100), (8, 1000)]);
        assert!(inner.closed);
    }

    #[test]
    fn target_timeout_routes_through_rtl() {
        let fc = FakeFc::new();
        let source = FakeSource::new(SourcePlan::NeverDelivers);
        let report = MissionController::new(
            fc.clone(),
            source,
            fast_cfg(),
            CancelToken::new(),
        )
        .run();

        assert!(matches!(report.error, Some(MissionError::TargetTimeout(_))));
        assert_eq!(
            report.visited,
            vec![
                Idle,
                Connecting,
                ArmingTakeoff,
                AwaitingTarget,
                Failed,
                ReturningToLaunch,
                Complete,
            ]
        );
        // safety fallback still commanded RTL
        assert!(fc.0.lock().unwrap().modes.contains(&"RTL".to_string()));
    }

    #[test]
    fn connection_refused_fails_before_arming() {
        let fc = FakeFc::new();
        let source = FakeSource::new(SourcePlan::RefusesConnection);
        let report = MissionController::new(
            fc.clone(),
            source,
            fast_cfg(),
            CancelToken::new(),
        )
        .run();

        assert!(matches!(report.error, Some(MissionError::Connection(_))));
        assert_eq!(
            report.visited,
            vec![Idle, Connecting, Failed, ReturningToLaunch, Complete]
        );
        assert!(!fc.0.lock().unwrap().armed, "must not arm after connect failure");
    }

    #[test]
    fn stuck_takeoff_times_out_with_named_error() {
        let fc = FakeFc::new();
        fc.0.lock().unwrap().armable = false; // vehicle never initializes
        let source = FakeSource::new(SourcePlan::Deliver(target()));
        let cfg = MissionConfig { takeoff_timeout_s: 0, ..fast_cfg() };
        let report =
            MissionController::new(fc.clone(), source, cfg, CancelToken::new()).run();

        assert!(matches!(report.error, Some(MissionError::TakeoffTimeout(0))));
        assert_eq!(*report.visited.last().unwrap(), Complete);
        let rtl_pos = report.visited.iter().position(|s| *s == ReturningToLaunch);
        let complete_pos = report.visited.iter().position(|s| *s == Complete);
        assert!(rtl_pos.unwrap() < complete_pos.unwrap());
    }

    #[test]
    fn stalled_transit_times_out_en_route() {
        let fc = FakeFc::new();
        fc.0.lock().unwrap().hold_position = true; // vehicle never closes the distance
        let source = FakeSource::new(SourcePlan::Deliver(target()));
        let cfg = MissionConfig { transit_timeout_s: 0, ..fast_cfg() };
        let report =
            MissionController::new(fc.clone(), source, cfg, CancelToken::new()).run();

        assert!(matches!(report.error, Some(MissionError::TransitTimeout(0))));
        assert_eq!(
            report.visited,
            vec![
                Idle,
                Connecting,
                ArmingTakeoff,
                AwaitingTarget,
                EnRoute,
                Failed,
                ReturningToLaunch,
                Complete,
            ]
        );
        assert!(fc.0.lock().unwrap().modes.contains(&"RTL".to_string()));
    }

    #[test]
    fn lost_range_finder_fails_before_transit() {
        let fc = FakeFc::new();
        fc.0.lock().unwrap().sensor_drops_after_takeoff = true;
        let source = FakeSource::new(SourcePlan::Deliver(target()));
        let report = MissionController::new(
            fc.clone(),
            source,
            fast_cfg(),
            CancelToken::new(),
        )
        .run();

        assert!(matches!(report.error, Some(MissionError::Sensor(_))));
        assert_eq!(
            report.visited,
            vec![
                Idle,
                Connecting,
                ArmingTakeoff,
                AwaitingTarget,
                EnRoute,
                Failed,
                ReturningToLaunch,
                Complete,
            ]
        );
        let inner = fc.0.lock().unwrap();
        assert!(inner.goto_target.is_none(), "no waypoint without a navigation altitude");
        assert!(inner.modes.contains(&"RTL".to_string()));
    }

    #[test]
    fn actuator_failure_is_best_effort_not_fatal() {
        let fc = FakeFc::new();
        fc.0.lock().unwrap().fail_actuator = true;
        let source = FakeSource::new(SourcePlan::Deliver(target()));
        let report = MissionController::new(
            fc.clone(),
            source,
            fast_cfg(),
            CancelToken::new(),
        )
        .run();

        assert!(report.succeeded(), "actuator errors must not abort the mission");
        assert!(report.visited.contains(&Delivering));
        assert!(report.visited.contains(&ReturningToLaunch));
        assert!(fc.0.lock().unwrap().overrides.is_empty());
    }

    #[test]
    fn operator_cancel_still_returns_to_launch() {
        let fc = FakeFc::new();
        let source = FakeSource::new(SourcePlan::Deliver(target()));
        let cancel = CancelToken::new();
        cancel.cancel();
        let report = MissionController::new(fc.clone(), source, fast_cfg(), cancel).run();

        assert!(matches!(report.error, Some(MissionError::Cancelled)));
        assert_eq!(
            report.visited[report.visited.len() - 3..],
            [Failed, ReturningToLaunch, Complete]
        );
        assert!(fc.0.lock().unwrap().modes.contains(&"RTL".to_string()));
    }

    #[test]
    fn planar_distance_matches_scale_constant() {
        let d = planar_distance_m(0.0, 0.0, 0.0, 2.0 / PLANAR_METERS_PER_DEGREE);
        assert!((d - 2.0).abs() < 1e-9);
        assert_eq!(planar_distance_m(12.9716, 77.5946, 12.9716, 77.5946), 0.0);
    }
}
