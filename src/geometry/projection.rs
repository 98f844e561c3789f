//! Pure projection functions mapping a host pixel + inverse depth into a
//! target frame.
//!
//! Two variants exist because the two consumers need different
//! intermediates. The epipolar search works entirely in pixel space and only
//! needs the target pixel, so it uses the precomposed K·R·K⁻¹ / K·t products
//! ([`project_simple`]). Depth linearization additionally needs the
//! projected direction on the normalized plane and the depth-rescale factor
//! for the chain rule, so it projects through the normalized plane
//! ([`project_full`]).
//!
//! Both reject projections closer than a few pixels to the image border;
//! interpolation support and the residual pattern both need room around the
//! hit.

use nalgebra::{Matrix3, Vector3};

use crate::frame::Camera;

/// Margin checks shared by both projection variants: x, y must lie in
/// (1.1, dim − 3).
#[inline]
fn inside_inner_border(x: f32, y: f32, width: usize, height: usize) -> bool {
    x > 1.1 && y > 1.1 && x < (width - 3) as f32 && y < (height - 3) as f32
}

/// Project a host pixel at a hypothesized inverse depth using the
/// precomposed pixel-space products.
///
/// Returns the target pixel, or `None` if the projection leaves the valid
/// inner region (or lands behind the camera).
#[inline]
pub fn project_simple(
    u: f32,
    v: f32,
    idepth: f32,
    krki: &Matrix3<f32>,
    kt: &Vector3<f32>,
    width: usize,
    height: usize,
) -> Option<(f32, f32)> {
    let ptp = krki * Vector3::new(u, v, 1.0) + kt * idepth;
    if ptp.z <= 0.0 {
        return None;
    }
    let ku = ptp.x / ptp.z;
    let kv = ptp.y / ptp.z;
    if inside_inner_border(ku, kv, width, height) {
        Some((ku, kv))
    } else {
        None
    }
}

/// Everything the linearization needs from one projection.
#[derive(Debug, Clone, Copy)]
pub struct Projection {
    /// Target pixel.
    pub ku: f32,
    pub kv: f32,
    /// Projected direction on the target normalized plane.
    pub xn: f32,
    pub yn: f32,
    /// Depth rescale factor 1/z′: how the point's depth changed between
    /// frames.
    pub drescale: f32,
    /// Inverse depth expressed in the target frame.
    pub new_idepth: f32,
}

/// Project a host pixel (plus an integer pattern offset) through the
/// normalized image plane.
///
/// Fails when the point ends up at non-positive depth in the target frame or
/// outside the inner border.
#[inline]
pub fn project_full(
    u: f32,
    v: f32,
    idepth: f32,
    dx: i32,
    dy: i32,
    camera: &Camera,
    rot: &Matrix3<f32>,
    trans: &Vector3<f32>,
    width: usize,
    height: usize,
) -> Option<Projection> {
    let klip = Vector3::new(
        (u + dx as f32 - camera.cx) / camera.fx,
        (v + dy as f32 - camera.cy) / camera.fy,
        1.0,
    );
    let ptp = rot * klip + trans * idepth;
    let drescale = 1.0 / ptp.z;
    if !(drescale > 0.0) {
        return None;
    }

    let xn = ptp.x * drescale;
    let yn = ptp.y * drescale;
    let ku = xn * camera.fx + camera.cx;
    let kv = yn * camera.fy + camera.cy;

    if !inside_inner_border(ku, kv, width, height) {
        return None;
    }

    Some(Projection {
        ku,
        kv,
        xn,
        yn,
        drescale,
        new_idepth: idepth * drescale,
    })
}

/// Derivative of a photometric residual w.r.t. the host inverse depth.
///
/// `gx_scaled`/`gy_scaled` are the sampled target-image gradients already
/// multiplied by fx/fy; `xn`, `yn` and `drescale` come from
/// [`project_full`].
#[inline]
pub fn d_res_d_idepth(
    trans: &Vector3<f32>,
    xn: f32,
    yn: f32,
    gx_scaled: f32,
    gy_scaled: f32,
    drescale: f32,
) -> f32 {
    gx_scaled * drescale * (trans.x - trans.z * xn)
        + gy_scaled * drescale * (trans.y - trans.z * yn)
}
