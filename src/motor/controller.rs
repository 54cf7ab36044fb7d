// One physical actuator: PWM output, analog position feedback and calibration
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

use super::calibration::{CalibrationPhase, CalibrationRun};
use super::driver::Hardware;
use super::store::{load_calibration, CalibrationData, DEFAULT_CALIBRATION};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Enabled,
    Disabled,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationState {
    Uncalibrated,
    Calibrating,
    Calibrated,
}

/// State shared between the control tick and the calibration thread
#[derive(Debug)]
pub(crate) struct Shared {
    pub data: CalibrationData,
    pub state: State,
    pub calibration_state: CalibrationState,
    pub target_position: f32,
    pub progress: f32,
    pub last_failure: Option<(CalibrationPhase, Error)>,
}

impl Shared {
    fn new() -> Self {
        Self {
            data: DEFAULT_CALIBRATION,
            state: State::Disabled,
            calibration_state: CalibrationState::Uncalibrated,
            target_position: 0.0,
            progress: 0.0,
            last_failure: None,
        }
    }

    /// PWM for the current target, 0 unless enabled
    fn output_pwm(&self) -> u16 {
        match self.state {
            State::Enabled => self.data.pwm_for_ratio(self.target_position),
            State::Disabled | State::Error => 0,
        }
    }
}

/// Write the output PWM unless a calibration owns the channel
pub(crate) fn push_target(shared: &Shared, hw: &Hardware, motor_channel: u8) -> Result<()> {
    if shared.calibration_state == CalibrationState::Calibrating {
        return Ok(());
    }
    hw.motors.set_pwm(motor_channel, shared.output_pwm())
}

pub struct MotorController {
    motor_channel: u8,
    analog_channel: u8,
    hw: Hardware,
    shared: Arc<Mutex<Shared>>,
    calibration_task: Option<JoinHandle<()>>,
}

impl MotorController {
    pub fn new(motor_channel: u8, analog_channel: u8, hw: Hardware) -> Self {
        Self {
            motor_channel,
            analog_channel,
            hw,
            shared: Arc::new(Mutex::new(Shared::new())),
            calibration_task: None,
        }
    }

    /// Load the stored calibration (defaults when absent) and start disabled
    pub fn init(&mut self) -> Result<()> {
        let mut shared = self.shared.lock();
        match load_calibration(self.hw.store.as_ref(), self.motor_channel) {
            Ok(data) if data.is_consistent() => {
                debug!("Motor {}: loaded calibration {:?}", self.motor_channel, data);
                shared.data = data;
                shared.calibration_state = CalibrationState::Calibrated;
            }
            Ok(data) => {
                warn!(
                    "Motor {}: stored calibration {:?} is inconsistent, using defaults",
                    self.motor_channel, data
                );
                shared.data = DEFAULT_CALIBRATION;
                shared.calibration_state = CalibrationState::Uncalibrated;
            }
            Err(Error::NotFound(_)) => {
                info!("Motor {}: no calibration stored, using defaults", self.motor_channel);
                shared.data = DEFAULT_CALIBRATION;
                shared.calibration_state = CalibrationState::Uncalibrated;
            }
            Err(e) => {
                error!("Motor {}: failed to load calibration: {}", self.motor_channel, e);
                shared.state = State::Error;
                return Err(e);
            }
        }

        shared.state = State::Disabled;
        push_target(&shared, &self.hw, self.motor_channel)
    }

    /// Release the output and wait for a running calibration to finish
    pub fn deinit(&mut self) -> Result<()> {
        if self.calibration_task.is_some() {
            warn!("Motor {}: waiting for calibration to finish", self.motor_channel);
            let _ = self.wait_calibration();
        }
        self.disable()
    }

    pub fn enable(&mut self) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.state = State::Enabled;
        push_target(&shared, &self.hw, self.motor_channel)
    }

    pub fn disable(&mut self) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.state = State::Disabled;
        push_target(&shared, &self.hw, self.motor_channel)
    }

    /// Set the normalized target, clamped to [0, 1]
    pub fn set_target_position(&mut self, ratio: f32) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.target_position = ratio.clamp(0.0, 1.0);
        push_target(&shared, &self.hw, self.motor_channel)
    }

    pub fn target_position(&self) -> f32 {
        self.shared.lock().target_position
    }

    /// Normalized position from feedback. Not clamped to [0, 1].
    pub fn current_position(&self) -> Result<f32> {
        let millivolts = self.hw.analog.voltage(self.analog_channel)?;
        Ok(self.shared.lock().data.ratio_for_voltage(millivolts))
    }

    pub fn state(&self) -> State {
        self.shared.lock().state
    }

    pub fn calibration_state(&self) -> CalibrationState {
        self.shared.lock().calibration_state
    }

    /// Progress of the running (or last) calibration, in [0, 1]
    pub fn calibration_progress(&self) -> f32 {
        self.shared.lock().progress
    }

    pub fn calibration_data(&self) -> CalibrationData {
        self.shared.lock().data
    }

    /// Phase and error of the last failed calibration
    pub fn last_calibration_failure(&self) -> Option<(CalibrationPhase, Error)> {
        self.shared.lock().last_failure.clone()
    }

    pub fn motor_channel(&self) -> u8 {
        self.motor_channel
    }

    pub fn analog_channel(&self) -> u8 {
        self.analog_channel
    }

    /// True while a calibration thread owns the motor
    pub fn is_calibrating(&self) -> bool {
        self.calibration_state() == CalibrationState::Calibrating
            || self
                .calibration_task
                .as_ref()
                .is_some_and(|task| !task.is_finished())
    }

    /// Spawn the calibration sequence on its own thread.
    ///
    /// The caller must disable the motor first: calibration writes raw PWM values.
    pub fn start_calibration(&mut self) -> Result<()> {
        info!("Motor {}: starting calibration", self.motor_channel);
        if self.is_calibrating() {
            warn!("Motor {}: already calibrating", self.motor_channel);
            return Err(Error::InvalidState(format!(
                "motor {} is already calibrating",
                self.motor_channel
            )));
        }
        // reap the previous run
        if let Some(task) = self.calibration_task.take() {
            let _ = task.join();
        }

        {
            let mut shared = self.shared.lock();
            shared.calibration_state = CalibrationState::Calibrating;
            shared.progress = 0.0;
            shared.last_failure = None;
        }

        let motor_channel = self.motor_channel;
        let hw = self.hw.clone();
        let shared = self.shared.clone();
        let mut run =
            CalibrationRun::new(motor_channel, self.analog_channel, hw.clone(), shared.clone());

        let spawned = std::thread::Builder::new()
            .name(format!("motor-calib-{}", motor_channel))
            .spawn(move || {
                match run.run() {
                    Ok(()) => info!("Motor {}: calibration completed", motor_channel),
                    Err(e) => error!("Motor {}: calibration failed: {}", motor_channel, e),
                }
                // leave the motor released whatever the outcome
                let mut shared = shared.lock();
                shared.state = State::Disabled;
                if let Err(e) = push_target(&shared, &hw, motor_channel) {
                    error!("Motor {}: failed to disable after calibration: {}", motor_channel, e);
                }
            });

        match spawned {
            Ok(task) => {
                self.calibration_task = Some(task);
                Ok(())
            }
            Err(e) => {
                self.shared.lock().calibration_state = CalibrationState::Uncalibrated;
                Err(Error::SoftwareFailure(format!(
                    "failed to spawn calibration thread: {}",
                    e
                )))
            }
        }
    }

    /// Only checks the state: a running calibration is not interrupted
    pub fn stop_calibration(&mut self) -> Result<()> {
        info!("Motor {}: stop calibration requested", self.motor_channel);
        if self.calibration_state() != CalibrationState::Calibrating {
            warn!("Motor {}: not calibrating", self.motor_channel);
            return Err(Error::InvalidState(format!(
                "motor {} is not calibrating",
                self.motor_channel
            )));
        }
        Ok(())
    }

    /// Block until the calibration thread exits, returning its outcome
    pub fn wait_calibration(&mut self) -> Result<()> {
        let Some(task) = self.calibration_task.take() else {
            return Err(Error::InvalidState(format!(
                "motor {} has no calibration running",
                self.motor_channel
            )));
        };
        task.join().map_err(|_| {
            Error::SoftwareFailure(format!("motor {} calibration thread panicked", self.motor_channel))
        })?;

        let shared = self.shared.lock();
        match (&shared.calibration_state, &shared.last_failure) {
            (CalibrationState::Calibrated, _) => Ok(()),
            (_, Some((_, e))) => Err(e.clone()),
            (state, None) => Err(Error::InvalidState(format!(
                "calibration ended in state {:?}",
                state
            ))),
        }
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> Arc<Mutex<Shared>> {
        self.shared.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::sim::{SimBoard, SimRig};
    use crate::motor::store::{save_calibration, CalibrationStore};

    fn stored() -> CalibrationData {
        CalibrationData {
            min_pwm: 140,
            max_pwm: 470,
            min_voltage: 460,
            max_voltage: 2710,
            feedback_noise: 5,
            pwm_deadband: 3,
            feedback_latency_ms: 35,
        }
    }

    #[test]
    fn test_init_without_record_is_uncalibrated_and_disabled() {
        let rig = SimRig::new(1);
        let mut ctrl = MotorController::new(7, 9, rig.hw.clone());
        ctrl.init().unwrap();
        assert_eq!(ctrl.calibration_state(), CalibrationState::Uncalibrated);
        assert_eq!(ctrl.state(), State::Disabled);
        assert_eq!(ctrl.calibration_data(), DEFAULT_CALIBRATION);
        assert_eq!(rig.hw.motors.pwm(7).unwrap(), 0);
    }

    #[test]
    fn test_init_loads_stored_record() {
        let rig = SimRig::new(1);
        save_calibration(rig.store.as_ref(), 7, &stored()).unwrap();
        let mut ctrl = MotorController::new(7, 9, rig.hw.clone());
        ctrl.init().unwrap();
        assert_eq!(ctrl.calibration_state(), CalibrationState::Calibrated);
        assert_eq!(ctrl.calibration_data(), stored());
    }

    #[test]
    fn test_init_rejects_inconsistent_record() {
        let rig = SimRig::new(1);
        let flat = CalibrationData {
            min_pwm: 300,
            max_pwm: 300,
            min_voltage: 1500,
            max_voltage: 1500,
            ..stored()
        };
        save_calibration(rig.store.as_ref(), 7, &flat).unwrap();
        let mut ctrl = MotorController::new(7, 9, rig.hw.clone());
        ctrl.init().unwrap();
        assert_eq!(ctrl.calibration_state(), CalibrationState::Uncalibrated);
        assert_eq!(ctrl.calibration_data(), DEFAULT_CALIBRATION);
        assert!(ctrl.current_position().unwrap().is_finite());
    }

    #[test]
    fn test_abort_ignores_inconsistent_record() {
        let rig = SimRig::new(5);
        let mut ctrl = MotorController::new(7, 9, rig.hw.clone());
        ctrl.init().unwrap();
        let inverted = CalibrationData {
            min_voltage: 2700,
            max_voltage: 400,
            ..stored()
        };
        save_calibration(rig.store.as_ref(), 7, &inverted).unwrap();
        rig.board.fail_pwm_write_at(7, 40);
        ctrl.start_calibration().unwrap();
        assert!(ctrl.wait_calibration().is_err());
        assert_eq!(ctrl.calibration_state(), CalibrationState::Uncalibrated);
        assert_eq!(ctrl.calibration_data(), DEFAULT_CALIBRATION);
    }

    #[test]
    fn test_pwm_only_when_enabled() {
        let rig = SimRig::new(1);
        save_calibration(rig.store.as_ref(), 7, &stored()).unwrap();
        let mut ctrl = MotorController::new(7, 9, rig.hw.clone());
        ctrl.init().unwrap();

        ctrl.set_target_position(0.5).unwrap();
        assert_eq!(rig.hw.motors.pwm(7).unwrap(), 0);

        ctrl.enable().unwrap();
        assert_eq!(rig.hw.motors.pwm(7).unwrap(), 305);

        ctrl.set_target_position(1.7).unwrap();
        assert_eq!(ctrl.target_position(), 1.0);
        assert_eq!(rig.hw.motors.pwm(7).unwrap(), 470);

        ctrl.set_target_position(-3.0).unwrap();
        assert_eq!(rig.hw.motors.pwm(7).unwrap(), 140);

        ctrl.disable().unwrap();
        assert_eq!(rig.hw.motors.pwm(7).unwrap(), 0);
    }

    #[test]
    fn test_current_position_is_not_clamped() {
        let rig = SimRig::new(1);
        let mut ctrl = MotorController::new(7, 9, rig.hw.clone());
        ctrl.init().unwrap();
        rig.board.set_noise(7, 0);
        // default calibration spans 102..512, mechanical stop is at 130
        rig.board.set_position(7, 102.0);
        let ratio = ctrl.current_position().unwrap();
        assert!(ratio.abs() < 0.01, "ratio {}", ratio);
        rig.board.set_position(7, 307.0);
        let ratio = ctrl.current_position().unwrap();
        assert!((ratio - 0.5).abs() < 0.01, "ratio {}", ratio);

        // a narrow calibration maps the same reading past 1.0
        save_calibration(rig.store.as_ref(), 7, &stored()).unwrap();
        ctrl.init().unwrap();
        rig.board.set_position(7, 480.0);
        assert!(ctrl.current_position().unwrap() > 1.0);
    }

    #[test]
    fn test_stop_calibration_requires_running_calibration() {
        let rig = SimRig::new(1);
        let mut ctrl = MotorController::new(7, 9, rig.hw.clone());
        ctrl.init().unwrap();
        assert!(matches!(ctrl.stop_calibration(), Err(Error::InvalidState(_))));
        assert!(matches!(ctrl.wait_calibration(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_calibration_finds_mechanical_range() {
        let rig = SimRig::new(7);
        let mut ctrl = MotorController::new(7, 9, rig.hw.clone());
        ctrl.init().unwrap();

        ctrl.start_calibration().unwrap();
        assert!(ctrl.is_calibrating());
        ctrl.wait_calibration().unwrap();

        assert_eq!(ctrl.calibration_state(), CalibrationState::Calibrated);
        assert_eq!(ctrl.state(), State::Disabled);
        assert_eq!(ctrl.calibration_progress(), 1.0);
        assert_eq!(rig.hw.motors.pwm(7).unwrap(), 0);

        let data = ctrl.calibration_data();
        assert!(data.is_consistent(), "{:?}", data);
        let (mech_min, mech_max) = SimBoard::default_travel();
        assert!((data.min_pwm as f32 - mech_min).abs() <= 8.0, "{:?}", data);
        assert!((data.max_pwm as f32 - mech_max).abs() <= 8.0, "{:?}", data);
        assert!(data.feedback_noise >= 4 && data.feedback_noise <= 20);
        assert!(data.pwm_deadband >= 2 && data.pwm_deadband <= 20);
        assert!(data.feedback_latency_ms >= 25 && data.feedback_latency_ms <= 60);

        let persisted = load_calibration(rig.store.as_ref(), 7).unwrap();
        assert_eq!(persisted, data);
    }

    #[test]
    fn test_second_start_while_running_is_rejected() {
        let rig = SimRig::new(3);
        let mut ctrl = MotorController::new(7, 9, rig.hw.clone());
        ctrl.init().unwrap();
        ctrl.start_calibration().unwrap();
        assert!(matches!(ctrl.start_calibration(), Err(Error::InvalidState(_))));
        ctrl.wait_calibration().unwrap();
        assert!(!ctrl.is_calibrating());
    }

    #[test]
    fn test_abort_restores_stored_record_at_every_phase() {
        let mut failed_phases = Vec::new();
        for reads in [3u32, 30, 80, 250, 420] {
            let rig = SimRig::new(11);
            save_calibration(rig.store.as_ref(), 7, &stored()).unwrap();
            let mut ctrl = MotorController::new(7, 9, rig.hw.clone());
            ctrl.init().unwrap();

            rig.board.fail_analog_after(7, reads);
            ctrl.start_calibration().unwrap();
            let result = ctrl.wait_calibration();

            assert!(matches!(result, Err(Error::HardwareFailure(_))), "{:?}", result);
            assert_eq!(ctrl.calibration_state(), CalibrationState::Uncalibrated);
            assert_eq!(rig.hw.motors.pwm(7).unwrap(), 0);
            assert_eq!(ctrl.calibration_data(), stored());
            assert_eq!(load_calibration(rig.store.as_ref(), 7).unwrap(), stored());

            let (phase, _) = ctrl.last_calibration_failure().expect("failure recorded");
            failed_phases.push(phase);
        }
        failed_phases.dedup();
        assert!(failed_phases.len() >= 4, "phases hit: {:?}", failed_phases);
    }

    #[test]
    fn test_abort_without_record_falls_back_to_defaults() {
        let rig = SimRig::new(5);
        let mut ctrl = MotorController::new(7, 9, rig.hw.clone());
        ctrl.init().unwrap();
        rig.board.fail_pwm_write_at(7, 40);
        ctrl.start_calibration().unwrap();
        assert!(ctrl.wait_calibration().is_err());
        assert_eq!(ctrl.calibration_state(), CalibrationState::Uncalibrated);
        assert_eq!(ctrl.calibration_data(), DEFAULT_CALIBRATION);
        assert_eq!(rig.hw.motors.pwm(7).unwrap(), 0);
        assert!(rig.store.get("MtrCtrl-7", "calib_data").is_err());
    }

    #[test]
    fn test_store_write_failure_aborts() {
        let rig = SimRig::new(9);
        let mut ctrl = MotorController::new(7, 9, rig.hw.clone());
        ctrl.init().unwrap();
        rig.store.set_read_only(true);
        ctrl.start_calibration().unwrap();
        assert!(matches!(ctrl.wait_calibration(), Err(Error::HardwareFailure(_))));
        assert_eq!(ctrl.calibration_state(), CalibrationState::Uncalibrated);
        assert_eq!(
            ctrl.last_calibration_failure().map(|(phase, _)| phase),
            Some(CalibrationPhase::Finish)
        );
    }

    #[test]
    fn test_target_writes_suppressed_while_calibrating() {
        let rig = SimRig::new(1);
        save_calibration(rig.store.as_ref(), 7, &stored()).unwrap();
        let mut ctrl = MotorController::new(7, 9, rig.hw.clone());
        ctrl.init().unwrap();
        ctrl.shared.lock().calibration_state = CalibrationState::Calibrating;
        rig.hw.motors.set_pwm(7, 333).unwrap();
        ctrl.enable().unwrap();
        ctrl.set_target_position(1.0).unwrap();
        assert_eq!(rig.hw.motors.pwm(7).unwrap(), 333);
    }
}
