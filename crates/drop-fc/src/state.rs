use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Live vehicle state, written by the MAVLink reader thread and read by
/// the mission thread's polling loops.
#[derive(Debug, Clone, Default)]
pub struct VehicleState {
    /// (lat, lon, relative alt m) from GLOBAL_POSITION_INT.
    pub position: Option<(f64, f64, f64)>,
    /// Range-finder altitude from DISTANCE_SENSOR, meters.
    pub sensor_alt_m: Option<f32>,
    pub armed: bool,
    pub standby: bool,
    pub last_heartbeat: Option<Instant>,
}

/// Guarded cell around [`VehicleState`]. The only way the two threads
/// share vehicle state; readers always get a consistent copy.
#[derive(Clone, Default)]
pub struct StateCell(Arc<Mutex<VehicleState>>);

impl StateCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> VehicleState {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self) -> Option<(f64, f64, f64)> {
        self.0.lock().unwrap().position
    }

    pub fn sensor_altitude(&self) -> Option<f32> {
        self.0.lock().unwrap().sensor_alt_m
    }

    pub fn armed(&self) -> bool {
        self.0.lock().unwrap().armed
    }

    pub fn heartbeat_age(&self) -> Option<Duration> {
        self.0.lock().unwrap().last_heartbeat.map(|t| t.elapsed())
    }

    pub fn update(&self, f: impl FnOnce(&mut VehicleState)) {
        f(&mut self.0.lock().unwrap());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updates_are_visible_to_readers() {
        let cell = StateCell::new();
        assert!(cell.position().is_none());
        cell.update(|s| {
            s.position = Some((12.9716, 77.5946, 9.8));
            s.sensor_alt_m = Some(9.7);
            s.armed = true;
        });
        assert_eq!(cell.position(), Some((12.9716, 77.5946, 9.8)));
        assert_eq!(cell.sensor_altitude(), Some(9.7));
        assert!(cell.armed());
    }

    #[test]
    fn cross_thread_writes_land_without_tearing() {
        let cell = StateCell::new();
        let writer = {
            let cell = cell.clone();
            std::thread::spawn(move || {
                for i in 0..1000u32 {
                    let alt = i as f32 / 100.0;
                    cell.update(|s| s.sensor_alt_m = Some(alt));
                }
            })
        };
        // reads must only ever observe values the writer actually stored
        for _ in 0..1000 {
            if let Some(alt) = cell.sensor_altitude() {
                assert!((0.0..10.0).contains(&alt));
            }
        }
        writer.join().unwrap();
        assert!(cell.sensor_altitude().is_some());
    }
}
