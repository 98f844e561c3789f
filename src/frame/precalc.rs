//! Precomputed relative-pose cache for a (host, target) frame pair.
//!
//! Tracing and linearization run per point but share the same host→target
//! transform, so the rotation/translation products with the intrinsics are
//! computed once per frame pair and handed to every point as read-only data.

use nalgebra::{Matrix3, Vector2, Vector3};

use crate::frame::{Camera, Frame};
use crate::geometry::SE3;

/// Per-frame affine brightness parameters (a, b): a pixel of irradiance I is
/// recorded as `exp(a)·I + b` relative to the global model.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AffineLight {
    pub a: f32,
    pub b: f32,
}

impl AffineLight {
    pub fn new(a: f32, b: f32) -> Self {
        Self { a, b }
    }

    /// The (scale, offset) mapping host intensities into the target frame:
    /// `I_target ≈ scale · I_host + offset`.
    ///
    /// Combines both frames' affine parameters with their exposure times:
    /// scale = e^(a_t − a_h) · exposure_t / exposure_h,
    /// offset = b_t − scale · b_h.
    pub fn relative(
        host_exposure: f32,
        host: AffineLight,
        target_exposure: f32,
        target: AffineLight,
    ) -> Vector2<f32> {
        let scale = (target.a - host.a).exp() * (target_exposure / host_exposure);
        Vector2::new(scale, target.b - scale * host.b)
    }
}

/// Precomputed host→target transform products.
///
/// Built once per (host, target) pair and treated as immutable for the
/// duration of a tracing pass.
#[derive(Debug, Clone)]
pub struct FramePrecalc {
    /// Relative rotation R (host to target).
    pub rot: Matrix3<f32>,
    /// Relative translation t (host to target).
    pub trans: Vector3<f32>,
    /// K · R · K⁻¹, mapping host pixels directly to target homogeneous
    /// pixel space.
    pub krki: Matrix3<f32>,
    /// K · t.
    pub kt: Vector3<f32>,
    /// Brightness transfer (scale, offset) from host to target.
    pub affine: Vector2<f32>,
}

impl FramePrecalc {
    /// Build the cache from world poses (camera-from-world, T_cw) of host
    /// and target plus the shared calibration.
    pub fn new(host: &Frame, host_pose_cw: &SE3, target: &Frame, target_pose_cw: &SE3, camera: &Camera) -> Self {
        let relative = target_pose_cw.compose(&host_pose_cw.inverse());
        let rot = relative.rotation_matrix().cast::<f32>();
        let trans = relative.translation.cast::<f32>();

        let k = camera.k();
        let krki = k * rot * camera.k_inv();
        let kt = k * trans;

        let affine = AffineLight::relative(
            host.exposure,
            host.aff_light,
            target.exposure,
            target.aff_light,
        );

        Self {
            rot,
            trans,
            krki,
            kt,
            affine,
        }
    }

    /// Cache for a host paired with itself (identity transform). Useful in
    /// tests and as the degenerate no-motion case.
    pub fn identity() -> Self {
        Self {
            rot: Matrix3::identity(),
            trans: Vector3::zeros(),
            krki: Matrix3::identity(),
            kt: Vector3::zeros(),
            affine: Vector2::new(1.0, 0.0),
        }
    }
}
