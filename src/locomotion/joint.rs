// Joint: a bounded angle driven through a MotorController
//
// The joint keeps three views of its angle:
// - model: open-loop trajectory advanced toward the target at a bounded velocity,
//   this is what gets sent to the motor
// - feedback: raw angle read back from the potentiometer
// - estimate: Kalman fusion of the model displacement and the feedback, for reporting

use tracing::{error, warn};

use crate::config::{JointWiring, CONTROL_LOOP_DT_S};
use crate::error::{Error, Result};
use crate::estimation::KalmanFilter1D;
use crate::motor::{Hardware, MotorController, State};

/// Nominal joint speed, used for time estimates and untimed targets
pub const MAX_VELOCITY_RAD_S: f32 = 5.0;

const SENSOR_NOISE_VARIANCE: f32 = 1.0;
const PROCESS_NOISE_VARIANCE: f32 = 0.1;

pub struct Joint {
    controller: MotorController,
    min_angle: f32,
    max_angle: f32,
    inverted: bool,

    target_angle: f32,
    model_angle: f32,
    feedback_angle: f32,
    estimate_angle: f32,
    velocity: f32,
    // 0 = no cap
    velocity_cap: f32,

    filter: KalmanFilter1D,
}

impl Joint {
    /// Angles in radians
    pub fn new(controller: MotorController, min_angle: f32, max_angle: f32, inverted: bool) -> Self {
        Self {
            controller,
            min_angle,
            max_angle,
            inverted,
            target_angle: 0.0,
            model_angle: 0.0,
            feedback_angle: 0.0,
            estimate_angle: 0.0,
            velocity: MAX_VELOCITY_RAD_S,
            velocity_cap: 0.0,
            filter: KalmanFilter1D::new(),
        }
    }

    pub fn from_wiring(wiring: &JointWiring, hw: Hardware) -> Self {
        let controller = MotorController::new(wiring.motor_channel, wiring.analog_channel, hw);
        Self::new(
            controller,
            wiring.min_angle_deg.to_radians(),
            wiring.max_angle_deg.to_radians(),
            wiring.inverted,
        )
    }

    /// Initialize the controller and seed every angle from the current feedback
    pub fn init(&mut self) -> Result<()> {
        self.controller.init()?;

        let angle = self.read_feedback_angle()?;
        self.model_angle = angle.clamp(self.min_angle, self.max_angle);
        self.feedback_angle = self.model_angle;
        self.estimate_angle = self.model_angle;
        self.set_target(self.model_angle)?;
        self.disable()?;

        self.filter
            .init(SENSOR_NOISE_VARIANCE, PROCESS_NOISE_VARIANCE, self.model_angle);
        Ok(())
    }

    pub fn deinit(&mut self) -> Result<()> {
        self.controller.deinit()
    }

    /// One control tick. Skipped while the motor is being calibrated.
    pub fn update(&mut self) -> Result<()> {
        if self.controller.is_calibrating() {
            return Ok(());
        }

        let last_model = self.model_angle;
        let step = self.effective_velocity() * CONTROL_LOOP_DT_S;
        if self.target_angle > self.model_angle {
            self.model_angle = (self.model_angle + step).min(self.target_angle);
        } else if self.target_angle < self.model_angle {
            self.model_angle = (self.model_angle - step).max(self.target_angle);
        }

        self.feedback_angle = self.read_feedback_angle()?;
        self.filter.predict(self.model_angle - last_model);
        self.estimate_angle = self.filter.update(self.feedback_angle);

        // open loop on the model, the estimate is for reporting only
        self.send_angle(self.model_angle)
    }

    /// Resynchronize model, estimate and target on the feedback, then enable
    pub fn enable(&mut self) -> Result<()> {
        self.feedback_angle = self.read_feedback_angle()?;
        self.model_angle = self.feedback_angle;
        self.estimate_angle = self.feedback_angle;
        self.target_angle = self.feedback_angle;
        self.filter.reset_state(self.feedback_angle);

        self.send_angle(self.model_angle)?;
        self.controller.enable()
    }

    pub fn disable(&mut self) -> Result<()> {
        self.controller.disable()
    }

    pub fn is_enabled(&self) -> bool {
        self.controller.state() == State::Enabled
    }

    pub fn set_velocity(&mut self, velocity: f32) -> Result<()> {
        if !(0.0..=MAX_VELOCITY_RAD_S).contains(&velocity) {
            error!(
                "Joint {}: velocity {:.2} rad/s outside [0, {:.2}]",
                self.channel(),
                velocity,
                MAX_VELOCITY_RAD_S
            );
            return Err(Error::InvalidParameters(format!(
                "velocity {} rad/s out of range",
                velocity
            )));
        }
        self.velocity = velocity;
        Ok(())
    }

    pub fn velocity(&self) -> f32 {
        self.velocity
    }

    /// Cap the velocity of every move, 0 removes the cap
    pub fn clamp_velocity(&mut self, max: f32) -> Result<()> {
        if !max.is_finite() || max < 0.0 {
            return Err(Error::InvalidParameters(format!(
                "velocity cap {} must be >= 0",
                max
            )));
        }
        self.velocity_cap = max;
        Ok(())
    }

    fn effective_velocity(&self) -> f32 {
        if self.velocity_cap > 0.0 {
            self.velocity.min(self.velocity_cap)
        } else {
            self.velocity
        }
    }

    /// Reject angles outside the joint travel
    pub fn check_target(&self, angle: f32) -> Result<()> {
        if angle.is_nan() || angle < self.min_angle || angle > self.max_angle {
            error!(
                "Joint {}: target {:.3} rad outside [{:.3}, {:.3}]",
                self.channel(),
                angle,
                self.min_angle,
                self.max_angle
            );
            return Err(Error::InvalidParameters(format!(
                "angle {:.3} rad out of bounds",
                angle
            )));
        }
        Ok(())
    }

    /// Move at full velocity
    pub fn set_target(&mut self, angle: f32) -> Result<()> {
        self.check_target(angle)?;
        self.velocity = MAX_VELOCITY_RAD_S;
        self.target_angle = angle;
        Ok(())
    }

    /// Arrive in `time_s` seconds. The resulting velocity is not capped at
    /// MAX_VELOCITY_RAD_S; a zero time means "as fast as nominal".
    pub fn set_target_timed(&mut self, angle: f32, time_s: f32) -> Result<()> {
        self.check_target(angle)?;
        check_time(time_s)?;

        self.velocity = if time_s == 0.0 {
            MAX_VELOCITY_RAD_S
        } else {
            (angle - self.model_angle).abs() / time_s
        };
        if self.velocity > MAX_VELOCITY_RAD_S {
            warn!(
                "Joint {}: timed move at {:.2} rad/s exceeds nominal velocity",
                self.channel(),
                self.velocity
            );
        }
        self.target_angle = angle;
        Ok(())
    }

    pub fn target(&self) -> f32 {
        self.target_angle
    }

    /// Kalman estimate
    pub fn position(&self) -> f32 {
        self.estimate_angle
    }

    pub fn feedback(&self) -> f32 {
        self.feedback_angle
    }

    /// Model angle
    pub fn prediction(&self) -> f32 {
        self.model_angle
    }

    pub fn uncertainty(&self) -> f32 {
        self.filter.uncertainty()
    }

    /// Seconds to reach `angle` from the model angle at nominal velocity
    pub fn time_estimate(&self, angle: f32) -> f32 {
        (angle - self.model_angle).abs() / MAX_VELOCITY_RAD_S
    }

    pub fn min_angle(&self) -> f32 {
        self.min_angle
    }

    pub fn max_angle(&self) -> f32 {
        self.max_angle
    }

    pub fn channel(&self) -> u8 {
        self.controller.motor_channel()
    }

    pub fn controller(&self) -> &MotorController {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut MotorController {
        &mut self.controller
    }

    fn send_angle(&mut self, angle: f32) -> Result<()> {
        let mut ratio = (angle - self.min_angle) / (self.max_angle - self.min_angle);
        if self.inverted {
            ratio = 1.0 - ratio;
        }
        self.controller.set_target_position(ratio)
    }

    fn read_feedback_angle(&self) -> Result<f32> {
        let mut ratio = self.controller.current_position()?;
        if self.inverted {
            ratio = 1.0 - ratio;
        }
        Ok(self.min_angle + ratio * (self.max_angle - self.min_angle))
    }
}

/// Arrival times must be finite and non-negative
pub fn check_time(time_s: f32) -> Result<()> {
    if !time_s.is_finite() || time_s < 0.0 {
        return Err(Error::InvalidParameters(format!(
            "time {} s must be finite and >= 0",
            time_s
        )));
    }
    Ok(())
}
