// Message types exchanged with teleop and tooling over zenoh (JSON payloads)

use serde::{Deserialize, Serialize};

use crate::geometry::{Transform, Vec3};
use crate::locomotion::{BodyCalibrationStatus, GaitConfig, JointId, LegIndex};
use crate::motor::CalibrationState;

// Gait velocity: mm/s and rad/s, body frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VelocityCommand {
    pub x_vel: f32,
    pub y_vel: f32,
    pub theta_vel: f32,
}

/// Body frame relative to the ground: position in mm, angles in radians
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PostureCommand {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    #[serde(default)]
    pub roll: f32,
    #[serde(default)]
    pub pitch: f32,
    #[serde(default)]
    pub yaw: f32,
}

impl From<&PostureCommand> for Transform {
    fn from(cmd: &PostureCommand) -> Self {
        Transform::from_euler(Vec3::new(cmd.x, cmd.y, cmd.z), cmd.roll, cmd.pitch, cmd.yaw)
    }
}

/// One foot, world frame, mm
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeetCommand {
    pub leg: LegIndex,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Direct joint target by motor channel. Without `time_s` the joint moves at nominal velocity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointCommand {
    pub channel: u8,
    pub angle: f32,
    #[serde(default)]
    pub time_s: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum SystemCommand {
    Enable,
    Disable,
    /// Whole-body calibration
    Calibrate,
    /// Single motor calibration, the joint is released first
    CalibrateJoint { channel: u8 },
    ClampVelocity { max: f32 },
    Gait { config: GaitConfig },
}

/// Telemetry of one joint
#[derive(Debug, Clone, Serialize)]
pub struct JointState {
    pub channel: u8,
    pub joint: JointId,
    pub enabled: bool,
    pub target: f32,
    pub position: f32,
    pub feedback: f32,
    pub prediction: f32,
    pub calibration: CalibrationState,
    pub calibration_progress: f32,
}

/// Published every few control ticks
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub joints: Vec<JointState>,
    pub gait_phase: f32,
    pub moving: bool,
    pub calibration: BodyCalibrationStatus,
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    CmdStale,
    Calibrating,
    Fault,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_command_wire_format() {
        let cmd: SystemCommand = serde_json::from_str(r#"{"command":"enable"}"#).unwrap();
        assert_eq!(cmd, SystemCommand::Enable);
        let cmd: SystemCommand =
            serde_json::from_str(r#"{"command":"clamp_velocity","max":2.5}"#).unwrap();
        assert_eq!(cmd, SystemCommand::ClampVelocity { max: 2.5 });
        let cmd: SystemCommand =
            serde_json::from_str(r#"{"command":"calibrate_joint","channel":7}"#).unwrap();
        assert_eq!(cmd, SystemCommand::CalibrateJoint { channel: 7 });
    }

    #[test]
    fn test_optional_fields_default() {
        let cmd: JointCommand = serde_json::from_str(r#"{"channel":3,"angle":0.5}"#).unwrap();
        assert_eq!(cmd.time_s, None);
        let posture: PostureCommand = serde_json::from_str(r#"{"x":0,"y":0,"z":80}"#).unwrap();
        assert_eq!(posture.roll, 0.0);
        let feet: FeetCommand =
            serde_json::from_str(r#"{"leg":"back_left","x":-75,"y":80,"z":10}"#).unwrap();
        assert_eq!(feet.leg, LegIndex::BackLeft);
    }

    #[test]
    fn test_health_is_snake_case() {
        assert_eq!(serde_json::to_string(&RuntimeHealth::CmdStale).unwrap(), r#""cmd_stale""#);
    }
}
