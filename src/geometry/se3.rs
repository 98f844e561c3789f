//! SE(3) rigid transform used for camera poses.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

/// A rigid transform: rotation followed by translation.
///
/// Poses are stored in double precision; the per-pixel tracing code works in
/// `f32` and downcasts once when the relative-pose cache is built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// The identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Create a transform from a rotation and a translation.
    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// A pure translation.
    pub fn from_translation(translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation,
        }
    }

    /// Compose two transforms: `self * other` applies `other` first.
    pub fn compose(&self, other: &SE3) -> SE3 {
        SE3 {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// The inverse transform.
    pub fn inverse(&self) -> SE3 {
        let rot_inv = self.rotation.inverse();
        SE3 {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Apply the transform to a point.
    pub fn transform(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Rotation as a 3×3 matrix.
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }
}
