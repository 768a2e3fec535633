//! Fly-scan motion planning.
//!
//! Derives a [`FlyPlan`] from a validated scan configuration: taxi and
//! fly-end positions (the omega range padded by acceleration run-up),
//! a slew speed that cannot outrun the detector's frame period, the
//! position increment between hardware trigger pulses, and the detector
//! setup headroom per frame. The plan is computed once up front so the
//! sequencer can reject infeasible motion before touching hardware.

use tracing::warn;

use crate::config::{
    projection_count, ConfigError, ScanConfig, ROT_STAGE_FAST_SPEED, ROT_STAGE_SLOW_SPEED,
};
use tokio::time::Duration;

/// Precomputed motion and trigger parameters for one fly run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlyPlan {
    /// Rotation position to pre-stage at, before the sweep start.
    pub taxi_position: f64,
    /// Rotation position the sweep motion ends at, past the sweep end.
    pub fly_end: f64,
    /// Actual slew speed the sweep runs at, degrees per second.
    pub slew_speed: f64,
    /// Position increment between trigger pulses, degrees.
    pub scan_delta: f64,
    /// Number of trigger pulses the sweep emits.
    pub trigger_count: u32,
    /// Idle time per frame available for detector readout, seconds.
    pub detector_setup_time: f64,
}

impl FlyPlan {
    /// Plan the fly motion for `config`.
    ///
    /// The requested slew speed is clamped to what the detector frame
    /// period allows (one trigger per `scan_delta` degrees must not arrive
    /// faster than `acquire_period`), and to the rotation stage's physical
    /// speed range. Clamping is logged but not an error; an omega range
    /// that yields no triggers at all is.
    pub fn compute(config: &ScanConfig) -> Result<FlyPlan, ConfigError> {
        let params = config.fly.ok_or(ConfigError::MissingFlyParams)?;
        let scan_delta = config.omega_step.abs();

        let (trigger_count, truncated) =
            projection_count(config.omega_start, config.omega_end, config.omega_step);
        if trigger_count == 0 {
            return Err(ConfigError::EmptyOmegaRange);
        }
        if truncated {
            warn!(
                omega_start = config.omega_start,
                omega_end = config.omega_end,
                omega_step = config.omega_step,
                trigger_count,
                "omega range is not a whole number of steps, trailing partial frame dropped"
            );
        }

        // One trigger fires every scan_delta degrees; the detector needs
        // acquire_period seconds between triggers.
        let max_slew = scan_delta / config.acquire_period;
        let mut slew_speed = params.slew_speed;
        if slew_speed > max_slew {
            warn!(
                requested = params.slew_speed,
                capped = max_slew,
                "slew speed outruns detector frame period, capping"
            );
            slew_speed = max_slew;
        }
        if slew_speed > ROT_STAGE_FAST_SPEED {
            slew_speed = ROT_STAGE_FAST_SPEED;
        }
        slew_speed = slew_speed.max(ROT_STAGE_SLOW_SPEED);

        // Run-up distance: half the acceleration ramp plus the configured
        // extra margin, applied on both ends in the sweep direction.
        let direction = config.omega_step.signum();
        let margin = slew_speed * params.accl / 2.0 + params.taxi_margin;
        let taxi_position = config.omega_start - direction * margin;
        let fly_end = config.omega_end + direction * margin;

        let detector_setup_time = scan_delta / slew_speed - config.acquire_time;

        Ok(FlyPlan {
            taxi_position,
            fly_end,
            slew_speed,
            scan_delta,
            trigger_count,
            detector_setup_time,
        })
    }

    /// Wall-clock time the sweep motion takes, taxi to fly end. Used to
    /// budget the wait on motion completion.
    pub fn travel_time(&self) -> Duration {
        Duration::from_secs_f64((self.fly_end - self.taxi_position).abs() / self.slew_speed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OutputSection, RawFlyParams, RawScanDoc, ScanType, TomoSection};
    use std::path::PathBuf;

    fn fly_config(
        omega_start: f64,
        omega_end: f64,
        omega_step: f64,
        acquire_time: f64,
        acquire_period: f64,
        fly: RawFlyParams,
    ) -> ScanConfig {
        RawScanDoc {
            tomo: TomoSection {
                scan_type: ScanType::Fly,
                n_white: 0,
                n_dark: 0,
                n_frames: 1,
                acquire_time,
                acquire_period,
                omega_start,
                omega_end,
                omega_step,
                sample_out_position: Default::default(),
                fly: Some(fly),
            },
            output: OutputSection {
                filepath: PathBuf::from("/tmp/out"),
                fileprefix: "scan".into(),
                format: "hdf".into(),
            },
        }
        .validate()
        .unwrap()
    }

    #[tracing_test::traced_test]
    #[test]
    fn test_slew_speed_capped_by_frame_period() {
        let config = fly_config(
            0.0,
            180.0,
            0.25,
            0.1,
            0.11,
            RawFlyParams { slew_speed: Some(4.0), ..Default::default() },
        );
        let plan = FlyPlan::compute(&config).unwrap();

        // 0.25 deg per trigger at one frame per 0.11 s.
        assert!((plan.slew_speed - 0.25 / 0.11).abs() < 1e-12);
        assert_eq!(plan.trigger_count, 720);
        assert!((plan.scan_delta - 0.25).abs() < 1e-12);
        // Headroom per frame: delta / slew - exposure = 0.11 - 0.1.
        assert!((plan.detector_setup_time - 0.01).abs() < 1e-12);
        assert!(logs_contain("capping"));
    }

    #[test]
    fn test_requested_slew_kept_when_feasible() {
        let config = fly_config(
            0.0,
            180.0,
            0.5,
            0.05,
            0.06,
            RawFlyParams { slew_speed: Some(2.0), ..Default::default() },
        );
        let plan = FlyPlan::compute(&config).unwrap();
        assert_eq!(plan.slew_speed, 2.0);
        assert_eq!(plan.trigger_count, 360);
    }

    #[test]
    fn test_taxi_margin_follows_sweep_direction() {
        let fly = RawFlyParams {
            slew_speed: Some(2.0),
            accl: Some(1.0),
            taxi_margin: Some(0.5),
        };

        let forward = FlyPlan::compute(&fly_config(0.0, 180.0, 0.5, 0.05, 0.06, fly)).unwrap();
        // margin = 2.0 * 1.0 / 2 + 0.5 = 1.5
        assert!((forward.taxi_position - (-1.5)).abs() < 1e-12);
        assert!((forward.fly_end - 181.5).abs() < 1e-12);

        let reverse = FlyPlan::compute(&fly_config(180.0, 0.0, -0.5, 0.05, 0.06, fly)).unwrap();
        assert!((reverse.taxi_position - 181.5).abs() < 1e-12);
        assert!((reverse.fly_end - (-1.5)).abs() < 1e-12);
        assert_eq!(reverse.trigger_count, 360);
        assert!(reverse.scan_delta > 0.0);
    }

    #[test]
    fn test_slew_clamped_to_stage_limits() {
        let config = fly_config(
            0.0,
            180.0,
            20.0,
            0.01,
            0.02,
            RawFlyParams { slew_speed: Some(500.0), ..Default::default() },
        );
        let plan = FlyPlan::compute(&config).unwrap();
        // Period allows 20/0.02 = 1000 deg/s; the stage does not.
        assert_eq!(plan.slew_speed, ROT_STAGE_FAST_SPEED);
    }

    #[test]
    fn test_travel_time_covers_whole_sweep() {
        let config = fly_config(
            0.0,
            180.0,
            0.5,
            0.05,
            0.06,
            RawFlyParams { slew_speed: Some(2.0), ..Default::default() },
        );
        let plan = FlyPlan::compute(&config).unwrap();
        let expected = (plan.fly_end - plan.taxi_position).abs() / plan.slew_speed;
        assert!((plan.travel_time().as_secs_f64() - expected).abs() < 1e-9);
    }
}
