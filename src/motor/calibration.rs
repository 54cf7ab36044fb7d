// Unsupervised servo calibration
//
// The sequence measures feedback noise, PWM deadband and feedback latency around
// neutral, then drives the servo slowly toward each end of its travel while a
// line fit of (PWM, mV) predicts the feedback. Once the reading stops following
// the line the servo has hit its mechanical stop. A slow second pass then refines
// each bound. Every phase is a separate transition so it can be run and tested on
// its own; any failure aborts to the previously stored calibration.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};

use crate::config::NEUTRAL_PWM;
use crate::error::{Error, Result};
use crate::estimation::{FastRegression, LineFit};

use super::controller::{CalibrationState, Shared};
use super::driver::Hardware;
use super::store::{load_calibration, save_calibration, CalibrationData, DEFAULT_CALIBRATION};

// Absolute PWM limits, never exceeded while searching for the stops
const SAFEGUARD_MIN_PWM: i32 = 60;
const SAFEGUARD_MAX_PWM: i32 = 570;

const SETTLE_MS: u64 = 1000;
const RECENTER_MS: u64 = 500;

// Feedback noise
const NOISE_SAMPLES: usize = 20;
const NOISE_SAMPLE_DELAY_MS: u64 = 50;
const NOISE_MAX_MV: i32 = 20;
const NOISE_MIN_MV: i32 = 4;

// PWM deadband
const DEADBAND_STEP_DELAY_MS: u64 = 200;
const DEADBAND_MAX_TEST_RANGE: i32 = 50;
const DEADBAND_SAMPLES: usize = 10;
const DEADBAND_MAX_PWM: i32 = 20;
const DEADBAND_MIN_PWM: i32 = 2;

// Feedback latency
const LATENCY_SAMPLES: u32 = 10;
const LATENCY_PWM_OFFSET: i32 = 20;
const LATENCY_POLL_MS: u64 = 5;
const LATENCY_TIMEOUT: Duration = Duration::from_millis(2000);

// Stall search
const STALL_LOOP_MS: u64 = 20;
const STALL_BASELINE_STEPS: i32 = 60;
const STALL_STD_MULTIPLIER: f32 = 4.5;
const STALL_CONFIRMATIONS: i32 = 3;

// Refinement
const REFINE_STEP_PWM: i32 = 2;
const REFINE_SAMPLES: i32 = 5;
const REFINE_SAMPLE_DELAY_MS: u64 = 200;
const REFINE_NOISE_MULTIPLIER: f32 = 0.5;
const REFINE_ROUGH_WEIGHT: f32 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CalibrationPhase {
    MoveToCenter,
    FeedbackNoise,
    PwmDeadband,
    FeedbackLatency,
    StallSearchMax,
    StallSearchMin,
    RefineMin,
    RefineMax,
    Finish,
    Done,
}

impl CalibrationPhase {
    /// Fraction of the sequence completed when this phase starts
    pub fn progress(&self) -> f32 {
        let index = match self {
            Self::MoveToCenter => 0,
            Self::FeedbackNoise => 1,
            Self::PwmDeadband => 2,
            Self::FeedbackLatency => 3,
            Self::StallSearchMax => 4,
            Self::StallSearchMin => 5,
            Self::RefineMin => 6,
            Self::RefineMax => 7,
            Self::Finish => 8,
            Self::Done => 9,
        };
        index as f32 / 9.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    TowardMax,
    TowardMin,
}

impl Direction {
    fn step(self) -> i32 {
        match self {
            Self::TowardMax => 1,
            Self::TowardMin => -1,
        }
    }
}

/// One calibration of one motor, advanced phase by phase
pub struct CalibrationRun {
    motor_channel: u8,
    analog_channel: u8,
    hw: Hardware,
    shared: Arc<Mutex<Shared>>,
    phase: CalibrationPhase,
    data: CalibrationData,
}

impl CalibrationRun {
    pub(crate) fn new(
        motor_channel: u8,
        analog_channel: u8,
        hw: Hardware,
        shared: Arc<Mutex<Shared>>,
    ) -> Self {
        let data = shared.lock().data;
        Self {
            motor_channel,
            analog_channel,
            hw,
            shared,
            phase: CalibrationPhase::MoveToCenter,
            data,
        }
    }

    pub fn phase(&self) -> CalibrationPhase {
        self.phase
    }

    /// Working copy of the calibration being measured
    pub fn data(&self) -> &CalibrationData {
        &self.data
    }

    /// Run every remaining phase, aborting on the first failure
    pub fn run(&mut self) -> Result<()> {
        let span = info_span!("calibration", motor = self.motor_channel);
        let _enter = span.enter();
        info!("Calibration sequence started");

        while self.phase != CalibrationPhase::Done {
            if let Err(e) = self.advance() {
                self.abort(&e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Run the current phase and move to the next one
    pub fn advance(&mut self) -> Result<CalibrationPhase> {
        let next = match self.phase {
            CalibrationPhase::MoveToCenter => self.move_to_center()?,
            CalibrationPhase::FeedbackNoise => self.measure_noise()?,
            CalibrationPhase::PwmDeadband => self.measure_deadband()?,
            CalibrationPhase::FeedbackLatency => self.measure_latency()?,
            CalibrationPhase::StallSearchMax => {
                let (pwm, voltage) = self.search_stall(Direction::TowardMax)?;
                self.data.max_pwm = pwm;
                self.data.max_voltage = voltage;
                CalibrationPhase::StallSearchMin
            }
            CalibrationPhase::StallSearchMin => {
                let (pwm, voltage) = self.search_stall(Direction::TowardMin)?;
                self.data.min_pwm = pwm;
                self.data.min_voltage = voltage;
                info!("First pass complete, refining bounds");
                CalibrationPhase::RefineMin
            }
            CalibrationPhase::RefineMin => {
                let (pwm, voltage) = self.refine(Direction::TowardMin)?;
                self.data.min_pwm = pwm;
                self.data.min_voltage = voltage;
                CalibrationPhase::RefineMax
            }
            CalibrationPhase::RefineMax => {
                let (pwm, voltage) = self.refine(Direction::TowardMax)?;
                self.data.max_pwm = pwm;
                self.data.max_voltage = voltage;
                CalibrationPhase::Finish
            }
            CalibrationPhase::Finish => self.finish()?,
            CalibrationPhase::Done => CalibrationPhase::Done,
        };
        self.phase = next;
        self.shared.lock().progress = next.progress();
        Ok(next)
    }

    fn move_to_center(&mut self) -> Result<CalibrationPhase> {
        info!("Moving motor to center position");
        self.write_pwm(NEUTRAL_PWM as i32)?;
        self.sleep_ms(SETTLE_MS);
        Ok(CalibrationPhase::FeedbackNoise)
    }

    fn measure_noise(&mut self) -> Result<CalibrationPhase> {
        info!("Detecting feedback noise level");
        let mut min = i32::MAX;
        let mut max = i32::MIN;
        for _ in 0..NOISE_SAMPLES {
            let v = self.read_voltage()?;
            min = min.min(v);
            max = max.max(v);
            self.sleep_ms(NOISE_SAMPLE_DELAY_MS);
        }

        let mut noise = max - min;
        if noise > NOISE_MAX_MV {
            error!("Feedback noise too high ({} mV)", noise);
            return Err(Error::HardwareFailure(format!(
                "feedback noise {} mV above {} mV",
                noise, NOISE_MAX_MV
            )));
        }
        if noise < NOISE_MIN_MV {
            warn!("Feedback noise seems too low ({} mV), using {} mV", noise, NOISE_MIN_MV);
            noise = NOISE_MIN_MV;
        }
        info!("Feedback noise: {} mV", noise);
        self.data.feedback_noise = noise;
        Ok(CalibrationPhase::PwmDeadband)
    }

    fn measure_deadband(&mut self) -> Result<CalibrationPhase> {
        info!("Detecting PWM deadband");
        let noise = self.data.feedback_noise;

        let mut pwm = NEUTRAL_PWM as i32;
        self.write_pwm(pwm)?;
        self.sleep_ms(SETTLE_MS);
        let mut voltage = self.read_voltage()?;

        let mut deadband = 0;
        for _ in 0..DEADBAND_SAMPLES {
            let base_pwm = pwm;
            let base_voltage = voltage;
            while (voltage - base_voltage).abs() < noise {
                pwm += 1;
                self.write_pwm(pwm)?;
                self.sleep_ms(DEADBAND_STEP_DELAY_MS);
                voltage = self.read_voltage()?;
                if pwm - base_pwm > DEADBAND_MAX_TEST_RANGE {
                    warn!("No movement within {} PWM of {}", DEADBAND_MAX_TEST_RANGE, base_pwm);
                    return Err(Error::HardwareFailure(
                        "deadband not found within test range".to_string(),
                    ));
                }
            }
            deadband = deadband.max(pwm - base_pwm);
        }

        if deadband > DEADBAND_MAX_PWM {
            error!("PWM deadband too large ({})", deadband);
            return Err(Error::HardwareFailure(format!(
                "deadband {} above {}",
                deadband, DEADBAND_MAX_PWM
            )));
        }
        if deadband < DEADBAND_MIN_PWM {
            warn!("PWM deadband seems too small ({}), using {}", deadband, DEADBAND_MIN_PWM);
            deadband = DEADBAND_MIN_PWM;
        }
        info!("PWM deadband: {}", deadband);
        self.data.pwm_deadband = deadband as u16;
        Ok(CalibrationPhase::FeedbackLatency)
    }

    fn measure_latency(&mut self) -> Result<CalibrationPhase> {
        info!("Detecting feedback latency");
        let noise = self.data.feedback_noise;
        let center = NEUTRAL_PWM as i32;

        let mut total = Duration::ZERO;
        for _ in 0..LATENCY_SAMPLES {
            self.write_pwm(center)?;
            self.sleep_ms(RECENTER_MS);
            let base_voltage = self.read_voltage()?;

            self.write_pwm(center + LATENCY_PWM_OFFSET)?;
            let start = self.hw.clock.now();
            loop {
                let moved = (self.read_voltage()? - base_voltage).abs() > noise;
                self.sleep_ms(LATENCY_POLL_MS);
                let elapsed = self.hw.clock.now().saturating_sub(start);
                if moved {
                    total += elapsed;
                    break;
                }
                if elapsed > LATENCY_TIMEOUT {
                    error!("Timeout waiting for feedback to move");
                    return Err(Error::HardwareFailure(
                        "feedback did not move within latency timeout".to_string(),
                    ));
                }
            }
        }

        let latency_ms = (total / LATENCY_SAMPLES).as_millis() as u16;
        info!("Feedback latency: {} ms", latency_ms);
        self.data.feedback_latency_ms = latency_ms;

        self.write_pwm(center)?;
        self.sleep_ms(RECENTER_MS);
        Ok(CalibrationPhase::StallSearchMax)
    }

    /// Step toward one end until the feedback stops following the baseline line.
    /// Returns the (PWM, mV) where the stall started.
    fn search_stall(&mut self, direction: Direction) -> Result<(u16, i32)> {
        info!("Searching stall {:?}", direction);
        let step = direction.step();
        // readings lag the command by this many loop iterations
        let shift = (self.data.feedback_latency_ms as f32 / STALL_LOOP_MS as f32).round() as i32;
        debug!("Feedback shift: {} samples", shift);

        let mut regression = FastRegression::new();
        let mut fit: Option<LineFit> = None;
        let mut pwm = NEUTRAL_PWM as i32;
        let mut iteration = 0;
        let mut confirmations = 0;

        let period = Duration::from_millis(STALL_LOOP_MS);
        let mut next_wake = self.hw.clock.now();

        let (expected_pwm, voltage, slope) = loop {
            pwm += step;
            if !(SAFEGUARD_MIN_PWM..=SAFEGUARD_MAX_PWM).contains(&pwm) {
                warn!("Reached safeguard PWM {} without a stall", pwm);
                return Err(Error::HardwareFailure(format!(
                    "no stall found before safeguard PWM {}",
                    pwm
                )));
            }
            self.write_pwm(pwm)?;
            let voltage = self.read_voltage()?;
            let lagged_pwm = pwm - shift * step;

            if iteration < STALL_BASELINE_STEPS {
                if iteration >= shift {
                    regression.add_point(lagged_pwm as u16, voltage);
                }
            } else {
                let line = match fit {
                    Some(line) => line,
                    None => {
                        let mut line = regression.compute().ok_or_else(|| {
                            error!("Baseline regression is degenerate");
                            Error::SoftwareFailure("baseline regression failed".to_string())
                        })?;
                        let noise = self.data.feedback_noise as f32;
                        if line.error_std < noise {
                            debug!("Baseline error std {:.2} below noise, using {}", line.error_std, noise);
                            line.error_std = noise;
                        }
                        info!(
                            "Baseline: slope={:.4} offset={:.2} error_std={:.2}",
                            line.slope, line.offset, line.error_std
                        );
                        fit = Some(line);
                        line
                    }
                };

                let expected = line.predict(lagged_pwm as f32);
                let residual = (voltage as f32 - expected).abs();
                let threshold = STALL_STD_MULTIPLIER * line.error_std;
                if residual > threshold {
                    confirmations += 1;
                    debug!("Stall detection {}/{}", confirmations, STALL_CONFIRMATIONS);
                    if confirmations >= STALL_CONFIRMATIONS {
                        info!(
                            "Stall at PWM={} V={} mV (expected {:.1} mV, error {:.1} > {:.1})",
                            lagged_pwm, voltage, expected, residual, threshold
                        );
                        break (lagged_pwm, voltage, line.slope);
                    }
                } else {
                    confirmations = 0;
                }
            }

            iteration += 1;
            next_wake += period;
            self.hw.clock.sleep_until(next_wake);
        };

        // wind back to where the detection started
        let windback = (STALL_CONFIRMATIONS - 1) * step;
        let bound_pwm = expected_pwm - windback;
        let bound_voltage = voltage - (windback as f32 * slope) as i32;
        info!("Stall bound PWM={} V={} mV", bound_pwm, bound_voltage);

        self.write_pwm(NEUTRAL_PWM as i32)?;
        self.sleep_ms(RECENTER_MS);
        Ok((bound_pwm as u16, bound_voltage))
    }

    /// From a rough bound, step back toward center until the feedback leaves the
    /// bound voltage, then blend rough and refined bounds.
    fn refine(&mut self, bound: Direction) -> Result<(u16, i32)> {
        info!("Refining {:?} bound", bound);
        let (rough_pwm, rough_voltage) = match bound {
            Direction::TowardMin => (self.data.min_pwm as i32, self.data.min_voltage),
            Direction::TowardMax => (self.data.max_pwm as i32, self.data.max_voltage),
        };
        let inward = -bound.step() * REFINE_STEP_PWM;
        let margin = REFINE_NOISE_MULTIPLIER * self.data.feedback_noise as f32;

        self.write_pwm(rough_pwm)?;
        self.sleep_ms(SETTLE_MS);

        let mut pwm = rough_pwm;
        let mut voltage = rough_voltage;
        while !left_bound(bound, voltage, rough_voltage, margin) {
            pwm += inward;
            if (pwm - NEUTRAL_PWM as i32) * bound.step() <= 0 {
                return Err(Error::HardwareFailure(format!(
                    "feedback never left the {:?} bound",
                    bound
                )));
            }
            self.write_pwm(pwm)?;
            self.sleep_ms(SETTLE_MS);

            let mut sum = 0;
            for _ in 0..REFINE_SAMPLES {
                self.sleep_ms(REFINE_SAMPLE_DELAY_MS);
                sum += self.read_voltage()?;
            }
            voltage = sum / REFINE_SAMPLES;
            debug!("Refinement PWM={} V={} mV bound={} mV", pwm, voltage, rough_voltage);
        }

        let blend = |rough: f32, refined: f32| {
            rough * REFINE_ROUGH_WEIGHT + refined * (1.0 - REFINE_ROUGH_WEIGHT)
        };
        let refined_pwm = blend(rough_pwm as f32, pwm as f32) as u16;
        let refined_voltage = blend(rough_voltage as f32, voltage as f32) as i32;
        info!(
            "Refined bound PWM={} V={} mV (rough PWM={} V={} mV)",
            refined_pwm, refined_voltage, rough_pwm, rough_voltage
        );
        Ok((refined_pwm, refined_voltage))
    }

    fn finish(&mut self) -> Result<CalibrationPhase> {
        info!("Moving motor back to center position");
        self.write_pwm(NEUTRAL_PWM as i32)?;
        self.sleep_ms(RECENTER_MS);
        self.write_pwm(0)?;

        if !self.data.is_consistent() {
            error!("Measured calibration is inconsistent: {:?}", self.data);
            return Err(Error::HardwareFailure("inconsistent calibration bounds".to_string()));
        }

        info!("Saving calibration data");
        save_calibration(self.hw.store.as_ref(), self.motor_channel, &self.data)?;

        let mut shared = self.shared.lock();
        shared.data = self.data;
        shared.calibration_state = CalibrationState::Calibrated;
        info!("Calibration saved: {:?}", self.data);
        Ok(CalibrationPhase::Done)
    }

    /// Restore the stored (or default) calibration and release the motor
    fn abort(&mut self, cause: &Error) {
        warn!("Aborting calibration in {:?}: {}", self.phase, cause);
        let restored = match load_calibration(self.hw.store.as_ref(), self.motor_channel) {
            Ok(data) if data.is_consistent() => data,
            _ => DEFAULT_CALIBRATION,
        };
        if let Err(e) = self.write_pwm(0) {
            error!("Failed to release motor during abort: {}", e);
        }

        let mut shared = self.shared.lock();
        shared.data = restored;
        shared.calibration_state = CalibrationState::Uncalibrated;
        shared.last_failure = Some((self.phase, cause.clone()));
    }

    fn write_pwm(&self, pwm: i32) -> Result<()> {
        let value = u16::try_from(pwm)
            .map_err(|_| Error::OutOfBounds(format!("PWM {} out of range", pwm)))?;
        self.hw.motors.set_pwm(self.motor_channel, value)?;
        self.hw.motors.flush()
    }

    fn read_voltage(&self) -> Result<i32> {
        self.hw.analog.voltage(self.analog_channel)
    }

    fn sleep_ms(&self, ms: u64) {
        self.hw.clock.sleep(Duration::from_millis(ms));
    }
}

/// Whether the feedback moved away from a stall bound by more than `margin`
fn left_bound(bound: Direction, voltage: i32, bound_voltage: i32, margin: f32) -> bool {
    match bound {
        Direction::TowardMin => voltage as f32 >= bound_voltage as f32 + margin,
        Direction::TowardMax => voltage as f32 <= bound_voltage as f32 - margin,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::controller::MotorController;
    use crate::motor::sim::SimRig;

    fn run_for(rig: &SimRig) -> (MotorController, CalibrationRun) {
        let mut ctrl = MotorController::new(7, 9, rig.hw.clone());
        ctrl.init().unwrap();
        ctrl.shared().lock().calibration_state = CalibrationState::Calibrating;
        let run = CalibrationRun::new(7, 9, rig.hw.clone(), ctrl.shared());
        (ctrl, run)
    }

    #[test]
    fn test_phases_advance_in_order() {
        let rig = SimRig::new(2);
        let (_ctrl, mut run) = run_for(&rig);
        let mut seen = vec![run.phase()];
        while run.phase() != CalibrationPhase::Done {
            seen.push(run.advance().unwrap());
        }
        assert_eq!(
            seen,
            vec![
                CalibrationPhase::MoveToCenter,
                CalibrationPhase::FeedbackNoise,
                CalibrationPhase::PwmDeadband,
                CalibrationPhase::FeedbackLatency,
                CalibrationPhase::StallSearchMax,
                CalibrationPhase::StallSearchMin,
                CalibrationPhase::RefineMin,
                CalibrationPhase::RefineMax,
                CalibrationPhase::Finish,
                CalibrationPhase::Done,
            ]
        );
        assert_eq!(CalibrationPhase::Done.progress(), 1.0);
    }

    #[test]
    fn test_noise_phase_floors_quiet_feedback() {
        let rig = SimRig::new(2);
        rig.board.set_noise(7, 0);
        let (_ctrl, mut run) = run_for(&rig);
        run.advance().unwrap();
        assert_eq!(run.advance().unwrap(), CalibrationPhase::PwmDeadband);
        assert_eq!(run.data().feedback_noise, NOISE_MIN_MV);
    }

    #[test]
    fn test_noise_phase_rejects_noisy_feedback() {
        let rig = SimRig::new(2);
        rig.board.set_noise(7, 40);
        let (_ctrl, mut run) = run_for(&rig);
        run.advance().unwrap();
        assert!(matches!(run.advance(), Err(Error::HardwareFailure(_))));
        assert_eq!(run.phase(), CalibrationPhase::FeedbackNoise);
    }

    #[test]
    fn test_deadband_phase_measures_servo_deadband() {
        let rig = SimRig::new(4);
        rig.board.set_noise(7, 0);
        rig.board.set_deadband(7, 5.0);
        let (_ctrl, mut run) = run_for(&rig);
        run.advance().unwrap();
        run.advance().unwrap();
        assert_eq!(run.advance().unwrap(), CalibrationPhase::FeedbackLatency);
        assert_eq!(run.data().pwm_deadband, 6);
    }

    #[test]
    fn test_stuck_servo_fails_deadband() {
        let rig = SimRig::new(4);
        rig.board.set_noise(7, 0);
        rig.board.set_stuck(7, true);
        let (_ctrl, mut run) = run_for(&rig);
        run.advance().unwrap();
        run.advance().unwrap();
        assert!(matches!(run.advance(), Err(Error::HardwareFailure(_))));
    }

    #[test]
    fn test_latency_phase_measures_delay() {
        let rig = SimRig::new(4);
        rig.board.set_noise(7, 0);
        rig.board.set_latency(7, Duration::from_millis(100));
        let (_ctrl, mut run) = run_for(&rig);
        for _ in 0..3 {
            run.advance().unwrap();
        }
        assert_eq!(run.advance().unwrap(), CalibrationPhase::StallSearchMax);
        let latency = run.data().feedback_latency_ms;
        assert!((100..=115).contains(&latency), "latency {}", latency);
    }

    #[test]
    fn test_abort_releases_motor() {
        let rig = SimRig::new(4);
        let (ctrl, mut run) = run_for(&rig);
        run.advance().unwrap();
        assert_eq!(rig.hw.motors.pwm(7).unwrap(), NEUTRAL_PWM);
        run.abort(&Error::HardwareFailure("test".to_string()));
        assert_eq!(rig.hw.motors.pwm(7).unwrap(), 0);
        assert_eq!(ctrl.calibration_state(), CalibrationState::Uncalibrated);
        assert_eq!(
            ctrl.last_calibration_failure().map(|(phase, _)| phase),
            Some(CalibrationPhase::FeedbackNoise)
        );
    }
}
