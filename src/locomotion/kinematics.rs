// Closed-form inverse and forward kinematics of a 3-DOF leg
//
// Leg frame: origin at the hip roll axis, X forward, Y toward the robot's left,
// Z up. The hip roll rotates the leg plane about X; the thigh is offset from the
// roll axis by `hip_offset` along -Y. Pitch angles are measured from straight
// down, knee 0 is a fully extended leg.

use std::f32::consts::PI;

use serde::{Deserialize, Serialize};

use crate::config::{HIP_OFFSET_MM, LEG_CALF_LENGTH_MM, LEG_THIGH_LENGTH_MM};
use crate::error::{Error, Result};
use crate::geometry::Vec3;

// Below this leg length the law-of-cosines triangle degenerates
const MIN_LEG_DISTANCE_MM: f32 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LegGeometry {
    pub hip_offset: f32,
    pub length_thigh: f32,
    pub length_calf: f32,
}

impl LegGeometry {
    pub fn reach(&self) -> f32 {
        self.length_thigh + self.length_calf
    }
}

impl Default for LegGeometry {
    fn default() -> Self {
        Self {
            hip_offset: HIP_OFFSET_MM,
            length_thigh: LEG_THIGH_LENGTH_MM,
            length_calf: LEG_CALF_LENGTH_MM,
        }
    }
}

/// Joint angles of one leg, radians
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LegAngles {
    pub hip_roll: f32,
    pub hip_pitch: f32,
    pub knee_pitch: f32,
}

/// Angles placing the foot at `target` (leg frame, mm)
pub fn compute_ik(target: &Vec3, geometry: &LegGeometry) -> Result<LegAngles> {
    let reach = geometry.reach();

    // distance in the roll plane, then remove the hip offset
    let dist_zy_raw = (target.y * target.y + target.z * target.z).sqrt();
    let dist_zy_sq = dist_zy_raw * dist_zy_raw - geometry.hip_offset * geometry.hip_offset;
    if dist_zy_sq < 0.0 {
        return Err(Error::Unreachable {
            distance_mm: dist_zy_raw,
            reach_mm: geometry.hip_offset,
        });
    }
    let dist_zy = dist_zy_sq.sqrt();
    if dist_zy > reach {
        return Err(Error::Unreachable {
            distance_mm: dist_zy,
            reach_mm: reach,
        });
    }

    let hip_roll_base = (-target.y).atan2(-target.z);
    let hip_roll_offset = geometry.hip_offset.atan2(dist_zy);
    let hip_roll = hip_roll_base - hip_roll_offset;

    let dist_leg = (dist_zy * dist_zy + target.x * target.x).sqrt();
    if dist_leg > reach || dist_leg < MIN_LEG_DISTANCE_MM {
        return Err(Error::Unreachable {
            distance_mm: dist_leg,
            reach_mm: reach,
        });
    }

    let thigh = geometry.length_thigh;
    let calf = geometry.length_calf;

    let cos_thigh = (thigh * thigh + dist_leg * dist_leg - calf * calf) / (2.0 * thigh * dist_leg);
    let hip_pitch = target.x.atan2(dist_zy) - cos_thigh.clamp(-1.0, 1.0).acos();

    let cos_knee = (thigh * thigh + calf * calf - dist_leg * dist_leg) / (2.0 * thigh * calf);
    let knee_pitch = PI - cos_knee.clamp(-1.0, 1.0).acos();

    Ok(LegAngles {
        hip_roll,
        hip_pitch,
        knee_pitch,
    })
}

/// Foot position (leg frame, mm) for the given angles
pub fn compute_fk(angles: &LegAngles, geometry: &LegGeometry) -> Vec3 {
    let knee_x = geometry.length_thigh * angles.hip_pitch.sin();
    let knee_z = -geometry.length_thigh * angles.hip_pitch.cos();

    let calf_angle = angles.hip_pitch + angles.knee_pitch;
    let foot_x = knee_x + geometry.length_calf * calf_angle.sin();
    let foot_z = knee_z - geometry.length_calf * calf_angle.cos();
    let foot_y = -geometry.hip_offset;

    let (sin_roll, cos_roll) = angles.hip_roll.sin_cos();
    Vec3::new(
        foot_x,
        foot_y * cos_roll + foot_z * sin_roll,
        -foot_y * sin_roll + foot_z * cos_roll,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn geometry() -> LegGeometry {
        LegGeometry::default()
    }

    #[test]
    fn test_neutral_stance_angles() {
        let angles = compute_ik(&Vec3::new(0.0, -35.0, -90.0), &geometry()).unwrap();
        assert_abs_diff_eq!(angles.hip_roll, 0.0, epsilon = 1e-5);
        assert_abs_diff_eq!(angles.hip_pitch, -0.75f32.acos(), epsilon = 1e-5);
        assert_abs_diff_eq!(angles.knee_pitch, 2.0 * 0.75f32.acos(), epsilon = 1e-5);
    }

    #[test]
    fn test_foot_under_hip_rolls_inward() {
        let geo = geometry();
        let angles = compute_ik(&Vec3::new(0.0, 0.0, -90.0), &geo).unwrap();
        assert!(angles.hip_roll < 0.0);
        let foot = compute_fk(&angles, &geo);
        assert_abs_diff_eq!(foot.x, 0.0, epsilon = 1e-3);
        assert_abs_diff_eq!(foot.y, 0.0, epsilon = 1e-3);
        assert_abs_diff_eq!(foot.z, -90.0, epsilon = 1e-3);
    }

    #[test]
    fn test_round_trip_over_workspace() {
        let geo = geometry();
        let mut rng = StdRng::seed_from_u64(7);
        let mut checked = 0;
        while checked < 200 {
            let target = Vec3::new(
                rng.random_range(-60.0..60.0),
                rng.random_range(-80.0..20.0),
                rng.random_range(-110.0..-40.0),
            );
            let Ok(angles) = compute_ik(&target, &geo) else {
                continue;
            };
            let foot = compute_fk(&angles, &geo);
            assert_abs_diff_eq!(foot.x, target.x, epsilon = 0.05);
            assert_abs_diff_eq!(foot.y, target.y, epsilon = 0.05);
            assert_abs_diff_eq!(foot.z, target.z, epsilon = 0.05);
            checked += 1;
        }
    }

    #[test]
    fn test_beyond_reach_is_unreachable() {
        let geo = geometry();
        assert!(matches!(
            compute_ik(&Vec3::new(0.0, -35.0, -130.0), &geo),
            Err(Error::Unreachable { .. })
        ));
        // in reach vertically, too far once X is added
        assert!(matches!(
            compute_ik(&Vec3::new(80.0, -35.0, -100.0), &geo),
            Err(Error::Unreachable { .. })
        ));
    }

    #[test]
    fn test_inside_hip_offset_is_unreachable() {
        assert!(matches!(
            compute_ik(&Vec3::new(0.0, -10.0, -20.0), &geometry()),
            Err(Error::Unreachable { .. })
        ));
        // foot on the thigh axis: no triangle
        assert!(matches!(
            compute_ik(&Vec3::new(0.0, -35.0, 0.0), &geometry()),
            Err(Error::Unreachable { .. })
        ));
    }

    #[test]
    fn test_full_extension_has_finite_angles() {
        let geo = geometry();
        let angles = compute_ik(&Vec3::new(0.0, -35.0, -120.0), &geo).unwrap();
        assert!(angles.hip_pitch.is_finite());
        assert_abs_diff_eq!(angles.hip_pitch, 0.0, epsilon = 1e-2);
        assert_abs_diff_eq!(angles.knee_pitch, 0.0, epsilon = 2e-2);
    }
}
