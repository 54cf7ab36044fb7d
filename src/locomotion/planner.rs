// Trot gait generator
//
// Turns a body velocity command into foot targets. Diagonal legs share a phase:
// front-left with back-right, front-right with back-left. Each cycle a leg
// swings through the air from liftoff to touchdown, then slides back on the
// ground while the body moves over it.

use std::f32::consts::PI;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::CONTROL_LOOP_DT_S;
use crate::error::{Error, Result};
use crate::geometry::{Vec2, Vec3};

use super::body::{Body, LegIndex};

// Phase offset per leg, in LegIndex order
pub const LEG_PHASE_OFFSETS: [f32; 4] = [0.0, 0.5, 0.5, 0.0];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GaitConfig {
    /// Full gait cycles per second
    pub step_freq_hz: f32,
    /// Fraction of the cycle a foot is on the ground
    pub duty_factor: f32,
    /// Swing apex above the ground, mm
    pub step_height_mm: f32,
    /// How far stance feet press below the ground plane, mm
    pub stance_depth_mm: f32,
}

impl Default for GaitConfig {
    fn default() -> Self {
        Self {
            step_freq_hz: 2.0,
            duty_factor: 0.6,
            step_height_mm: 20.0,
            stance_depth_mm: 0.0,
        }
    }
}

impl GaitConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.step_freq_hz.is_finite() || self.step_freq_hz <= 0.0 {
            return Err(Error::InvalidParameters(format!(
                "step frequency {} Hz must be > 0",
                self.step_freq_hz
            )));
        }
        if !(self.duty_factor > 0.0 && self.duty_factor < 1.0) {
            return Err(Error::InvalidParameters(format!(
                "duty factor {} must be in (0, 1)",
                self.duty_factor
            )));
        }
        if !self.step_height_mm.is_finite() || !self.stance_depth_mm.is_finite() {
            return Err(Error::InvalidParameters(
                "step height and stance depth must be finite".to_string(),
            ));
        }
        Ok(())
    }

    fn stance_time_s(&self) -> f32 {
        self.duty_factor / self.step_freq_hz
    }
}

pub struct MovementPlanner {
    gait_config: GaitConfig,
    is_moving: bool,
    main_gait_phase: f32,
    cmd_vel_linear: Vec2,
    cmd_vel_angular: f32,
    leg_default_pos: [Vec3; 4],
}

impl MovementPlanner {
    pub fn new() -> Self {
        Self {
            gait_config: GaitConfig::default(),
            is_moving: false,
            main_gait_phase: 0.0,
            cmd_vel_linear: Vec2::zeros(),
            cmd_vel_angular: 0.0,
            leg_default_pos: LegIndex::ALL.map(LegIndex::default_foot_position),
        }
    }

    /// Body velocity: `v_x`, `v_y` in mm/s, `omega` in rad/s. Applied on the next update.
    pub fn set_velocity_command(&mut self, v_x: f32, v_y: f32, omega: f32) {
        self.cmd_vel_linear = Vec2::new(v_x, v_y);
        self.cmd_vel_angular = omega;
    }

    pub fn velocity_command(&self) -> (Vec2, f32) {
        (self.cmd_vel_linear, self.cmd_vel_angular)
    }

    pub fn set_gait_config(&mut self, config: GaitConfig) -> Result<()> {
        config.validate()?;
        info!("Gait config: {:?}", config);
        self.gait_config = config;
        Ok(())
    }

    pub fn gait_config(&self) -> &GaitConfig {
        &self.gait_config
    }

    /// Phase of the front-left leg, in [0, 1)
    pub fn gait_phase(&self) -> f32 {
        self.main_gait_phase
    }

    pub fn is_moving(&self) -> bool {
        self.is_moving
    }

    pub fn default_foot_position(&self, leg: LegIndex) -> Vec3 {
        self.leg_default_pos[leg.index()]
    }

    /// One control tick: advance the gait and push the four foot targets to the body
    pub fn update(&mut self, body: &mut Body) -> Result<()> {
        let stopped = self.cmd_vel_linear == Vec2::zeros() && self.cmd_vel_angular == 0.0;
        if stopped {
            if !self.is_moving {
                return Ok(());
            }
            debug!("Gait stopped, back to neutral stance");
            // every leg gets its reset, the first failure is reported
            let mut result = Ok(());
            for leg in LegIndex::ALL {
                if let Err(e) = body.set_feet_position(leg, self.leg_default_pos[leg.index()]) {
                    warn!("{:?}: neutral stance rejected: {}", leg, e);
                    result = result.and(Err(e));
                }
            }
            self.is_moving = false;
            return result;
        }

        if !self.is_moving {
            debug!("Gait started");
            self.main_gait_phase = 0.0;
            self.is_moving = true;
        }

        self.main_gait_phase += CONTROL_LOOP_DT_S * self.gait_config.step_freq_hz;
        if self.main_gait_phase >= 1.0 {
            self.main_gait_phase -= 1.0;
        }

        for leg in LegIndex::ALL {
            let mut leg_phase = self.main_gait_phase + LEG_PHASE_OFFSETS[leg.index()];
            if leg_phase >= 1.0 {
                leg_phase -= 1.0;
            }
            body.set_feet_position(leg, self.foot_target(leg, leg_phase))?;
        }
        Ok(())
    }

    /// Foot target (world frame, mm) of `leg` at `leg_phase` for the current command.
    ///
    /// The first `1 - duty_factor` of the cycle is swing, the rest is stance.
    pub fn foot_target(&self, leg: LegIndex, leg_phase: f32) -> Vec3 {
        let default = self.leg_default_pos[leg.index()];

        // small-angle approximation of the rotation about the body center
        let leg_vel = Vec2::new(
            self.cmd_vel_linear.x - self.cmd_vel_angular * default.y,
            self.cmd_vel_linear.y + self.cmd_vel_angular * default.x,
        );
        let stance_dist = leg_vel * self.gait_config.stance_time_s();
        let swing_ratio = 1.0 - self.gait_config.duty_factor;

        if leg_phase < swing_ratio {
            let t_swing = leg_phase / swing_ratio;
            let smooth_t = (1.0 - (PI * t_swing).cos()) * 0.5;
            // liftoff at -half, touchdown at +half the stance displacement
            let offset = stance_dist * (smooth_t - 0.5);
            Vec3::new(
                default.x + offset.x,
                default.y + offset.y,
                self.gait_config.step_height_mm * (PI * t_swing).sin(),
            )
        } else {
            let t_stance = (leg_phase - swing_ratio) / self.gait_config.duty_factor;
            let offset = stance_dist * (0.5 - t_stance);
            Vec3::new(
                default.x + offset.x,
                default.y + offset.y,
                -self.gait_config.stance_depth_mm,
            )
        }
    }
}

impl Default for MovementPlanner {
    fn default() -> Self {
        Self::new()
    }
}
