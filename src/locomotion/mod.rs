// Locomotion layer: joints, leg kinematics, body posture and gait

pub mod body;
pub mod joint;
pub mod kinematics;
pub mod leg;
pub mod planner;

pub use body::{Body, BodyCalibrationStatus, EarIndex, JointId, JointTable, LegIndex};
pub use joint::{Joint, MAX_VELOCITY_RAD_S};
pub use kinematics::{compute_fk, compute_ik, LegAngles, LegGeometry};
pub use leg::{Leg, LegJoint};
pub use planner::{GaitConfig, MovementPlanner};
