// Quadruped locomotion runtime
//
// Motor control with unsupervised servo calibration, joint state estimation,
// leg kinematics, body posture and a trot gait planner, driven by a fixed-rate
// control loop that takes commands over zenoh.

pub mod clock;
pub mod config;
pub mod error;
pub mod estimation;
pub mod geometry;
pub mod locomotion;
pub mod messages;
pub mod motor;
pub mod runtime;

pub use error::{Error, Result};
