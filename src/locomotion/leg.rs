use serde::Serialize;

use crate::config::LegWiring;
use crate::error::Result;
use crate::geometry::Vec3;
use crate::motor::Hardware;

use super::joint::{check_time, Joint};
use super::kinematics::{compute_ik, LegAngles, LegGeometry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LegJoint {
    HipRoll,
    HipPitch,
    KneePitch,
}

impl LegJoint {
    pub const ALL: [LegJoint; 3] = [LegJoint::HipRoll, LegJoint::HipPitch, LegJoint::KneePitch];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Three joints solved together through the leg IK.
///
/// Targets are given in the leg frame. Legs on the left side of the robot are
/// mirrored in Y so all four legs share one kinematic model.
pub struct Leg {
    joints: [Joint; 3],
    y_inverted: bool,
    geometry: LegGeometry,
    commanded_time: f32,
}

impl Leg {
    pub fn new(joints: [Joint; 3], y_inverted: bool, geometry: LegGeometry) -> Self {
        Self {
            joints,
            y_inverted,
            geometry,
            commanded_time: 0.0,
        }
    }

    pub fn from_wiring(wiring: &LegWiring, hw: &Hardware) -> Self {
        let joints = wiring.joints.map(|joint| Joint::from_wiring(&joint, hw.clone()));
        Self::new(joints, wiring.y_inverted, LegGeometry::default())
    }

    pub fn init(&mut self) -> Result<()> {
        self.joints.iter_mut().try_for_each(Joint::init)
    }

    pub fn deinit(&mut self) -> Result<()> {
        self.joints.iter_mut().try_for_each(Joint::deinit)
    }

    pub fn update(&mut self) -> Result<()> {
        self.joints.iter_mut().try_for_each(Joint::update)
    }

    pub fn enable(&mut self) -> Result<()> {
        self.joints.iter_mut().try_for_each(Joint::enable)
    }

    pub fn disable(&mut self) -> Result<()> {
        self.joints.iter_mut().try_for_each(Joint::disable)
    }

    /// IK for `target`, checked against every joint's travel
    pub fn solve(&self, target: &Vec3) -> Result<LegAngles> {
        let mut local = *target;
        if self.y_inverted {
            local.y = -local.y;
        }
        let angles = compute_ik(&local, &self.geometry)?;
        for (joint, angle) in self.joints.iter().zip(angle_array(&angles)) {
            joint.check_target(angle)?;
        }
        Ok(angles)
    }

    /// Move to `target`, the slowest joint at nominal velocity and the others
    /// timed to arrive with it. No joint moves if any angle is rejected.
    pub fn set_target(&mut self, target: &Vec3) -> Result<()> {
        let angles = self.solve(target)?;
        let time_s = self.angles_time_estimate(&angles);
        self.apply_timed(&angles, time_s)
    }

    /// Move to `target` so that every joint arrives in `time_s`
    pub fn set_target_timed(&mut self, target: &Vec3, time_s: f32) -> Result<()> {
        check_time(time_s)?;
        let angles = self.solve(target)?;
        self.apply_timed(&angles, time_s)
    }

    /// Apply pre-solved angles, see `solve`
    pub(crate) fn apply_timed(&mut self, angles: &LegAngles, time_s: f32) -> Result<()> {
        for (joint, angle) in self.joints.iter_mut().zip(angle_array(angles)) {
            joint.set_target_timed(angle, time_s)?;
        }
        self.commanded_time = time_s;
        Ok(())
    }

    /// Seconds for the slowest joint to reach `target` at nominal velocity
    pub fn time_estimate(&self, target: &Vec3) -> Result<f32> {
        let angles = self.solve(target)?;
        Ok(self.angles_time_estimate(&angles))
    }

    pub(crate) fn angles_time_estimate(&self, angles: &LegAngles) -> f32 {
        self.joints
            .iter()
            .zip(angle_array(angles))
            .map(|(joint, angle)| joint.time_estimate(angle))
            .fold(0.0, f32::max)
    }

    /// Arrival time of the last target command
    pub fn commanded_time(&self) -> f32 {
        self.commanded_time
    }

    pub fn is_y_inverted(&self) -> bool {
        self.y_inverted
    }

    pub fn geometry(&self) -> &LegGeometry {
        &self.geometry
    }

    pub fn joint(&self, which: LegJoint) -> &Joint {
        &self.joints[which.index()]
    }

    pub fn joint_mut(&mut self, which: LegJoint) -> &mut Joint {
        &mut self.joints[which.index()]
    }

    pub fn joints(&self) -> &[Joint; 3] {
        &self.joints
    }

    pub fn joints_mut(&mut self) -> &mut [Joint; 3] {
        &mut self.joints
    }
}

fn angle_array(angles: &LegAngles) -> [f32; 3] {
    [angles.hip_roll, angles.hip_pitch, angles.knee_pitch]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LEG_WIRING;
    use crate::error::Error;
    use crate::motor::SimRig;
    use approx::assert_abs_diff_eq;

    fn leg(rig: &SimRig, index: usize) -> Leg {
        let mut leg = Leg::from_wiring(&LEG_WIRING[index], &rig.hw);
        leg.init().unwrap();
        leg
    }

    #[test]
    fn test_mirrored_legs_share_angles() {
        let rig = SimRig::new(3);
        let left = leg(&rig, 0);
        let right = leg(&rig, 1);
        let a = left.solve(&Vec3::new(10.0, 35.0, -90.0)).unwrap();
        let b = right.solve(&Vec3::new(10.0, -35.0, -90.0)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_set_target_moves_every_joint() {
        let rig = SimRig::new(3);
        let mut leg = leg(&rig, 1);
        leg.set_target(&Vec3::new(0.0, -35.0, -90.0)).unwrap();
        assert_abs_diff_eq!(leg.joint(LegJoint::HipRoll).target(), 0.0, epsilon = 1e-5);
        assert_abs_diff_eq!(
            leg.joint(LegJoint::HipPitch).target(),
            -0.75f32.acos(),
            epsilon = 1e-5
        );
        assert_abs_diff_eq!(
            leg.joint(LegJoint::KneePitch).target(),
            2.0 * 0.75f32.acos(),
            epsilon = 1e-5
        );
    }

    #[test]
    fn test_rejected_target_leaves_joints_unchanged() {
        let rig = SimRig::new(3);
        let mut leg = leg(&rig, 1);
        let before: Vec<f32> = leg.joints().iter().map(Joint::target).collect();

        let far = Vec3::new(0.0, -35.0, -200.0);
        assert!(matches!(leg.set_target(&far), Err(Error::Unreachable { .. })));

        // reachable, but the knee would have to bend backwards past its stop
        let behind = Vec3::new(-20.0, -35.0, -40.0);
        assert!(leg.set_target_timed(&behind, 0.5).is_err());
        assert!(leg.set_target_timed(&Vec3::new(0.0, -35.0, -90.0), -1.0).is_err());

        let after: Vec<f32> = leg.joints().iter().map(Joint::target).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_timed_target_syncs_joint_arrival() {
        let rig = SimRig::new(3);
        let mut leg = leg(&rig, 1);
        let target = Vec3::new(20.0, -35.0, -80.0);
        let estimate = leg.time_estimate(&target).unwrap();
        assert!(estimate > 0.0);

        leg.set_target_timed(&target, 0.4).unwrap();
        assert_eq!(leg.commanded_time(), 0.4);
        for joint in leg.joints() {
            let distance = (joint.target() - joint.prediction()).abs();
            assert_abs_diff_eq!(joint.velocity() * 0.4, distance, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_time_estimate_fails_on_unreachable() {
        let rig = SimRig::new(3);
        let leg = leg(&rig, 0);
        assert!(leg.time_estimate(&Vec3::new(200.0, 0.0, 0.0)).is_err());
    }
}
