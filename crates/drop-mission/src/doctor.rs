use anyhow::Result;

use crate::controller::MissionConfig;

pub fn check_mission(cfg: &MissionConfig) -> Result<()> {
    anyhow::ensure!(cfg.takeoff_alt_m > 0.0, "mission.takeoff_alt_m must be positive");
    anyhow::ensure!(
        cfg.descend_alt_m > 0.0 && cfg.descend_alt_m < cfg.takeoff_alt_m,
        "mission.descend_alt_m must sit below takeoff altitude"
    );
    anyhow::ensure!(cfg.arrival_threshold_m > 0.0, "mission.arrival_threshold_m must be positive");
    anyhow::ensure!(
        (1..=8).contains(&cfg.drop_channel),
        "mission.drop_channel must be an RC channel 1..8"
    );
    anyhow::ensure!(
        (800..=2200).contains(&cfg.drop_open_pwm) && (800..=2200).contains(&cfg.drop_closed_pwm),
        "mission drop PWM values out of servo range"
    );
    anyhow::ensure!(cfg.takeoff_timeout_s > 0, "mission.takeoff_timeout_s must be bounded and positive");
    anyhow::ensure!(cfg.target_wait_timeout_s > 0, "mission.target_wait_timeout_s must be positive");
    anyhow::ensure!(cfg.transit_timeout_s > 0, "mission.transit_timeout_s must be positive");
    anyhow::ensure!(cfg.poll_interval_ms >= 10, "mission.poll_interval_ms too small");
    Ok(())
}
