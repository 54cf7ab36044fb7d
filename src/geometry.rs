// Geometry types shared by kinematics, body posture and gait planning.
// Positions are in millimeters, angles in radians.

use nalgebra::{UnitQuaternion, Vector2, Vector3};

pub type Vec2 = Vector2<f32>;
pub type Vec3 = Vector3<f32>;
pub type Quat = UnitQuaternion<f32>;

/// Rigid transform (position + orientation) of a frame expressed in the world frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Transform {
    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self { position, rotation }
    }

    pub fn identity() -> Self {
        Self::new(Vec3::zeros(), Quat::identity())
    }

    /// Build from a position and roll/pitch/yaw angles (radians)
    pub fn from_euler(position: Vec3, roll: f32, pitch: f32, yaw: f32) -> Self {
        Self::new(position, Quat::from_euler_angles(roll, pitch, yaw))
    }

    /// Express a world-frame point in this frame
    pub fn world_to_local(&self, point: &Vec3) -> Vec3 {
        self.rotation.inverse_transform_vector(&(point - self.position))
    }

    /// Express a point of this frame in the world frame
    pub fn local_to_world(&self, point: &Vec3) -> Vec3 {
        self.rotation.transform_vector(point) + self.position
    }

    /// Roll/pitch/yaw of the rotation (radians)
    pub fn euler_angles(&self) -> (f32, f32, f32) {
        self.rotation.euler_angles()
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f32::consts::FRAC_PI_2;

    #[test]
    fn test_world_to_local_translation_only() {
        let t = Transform::new(Vec3::new(10.0, 0.0, 90.0), Quat::identity());
        let local = t.world_to_local(&Vec3::new(60.0, 80.0, 0.0));
        assert_relative_eq!(local, Vec3::new(50.0, 80.0, -90.0), epsilon = 1e-4);
    }

    #[test]
    fn test_world_local_roundtrip_with_yaw() {
        let t = Transform::from_euler(Vec3::new(5.0, -3.0, 90.0), 0.1, -0.05, FRAC_PI_2);
        let p = Vec3::new(75.0, 80.0, 0.0);
        let back = t.local_to_world(&t.world_to_local(&p));
        assert_relative_eq!(back, p, epsilon = 1e-3);
    }

    #[test]
    fn test_yaw_rotates_world_x_into_local_minus_y() {
        let t = Transform::from_euler(Vec3::zeros(), 0.0, 0.0, FRAC_PI_2);
        let local = t.world_to_local(&Vec3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(local, Vec3::new(0.0, -1.0, 0.0), epsilon = 1e-5);
    }
}
