//! Single-variable depth refinement for an immature point.
//!
//! Consumes the linearized terms from
//! [`ImmaturePoint::linearize_residual`] across every candidate target
//! frame and runs a Levenberg-damped Gauss-Newton on the one inverse-depth
//! unknown. This is the step between tracing (which only maintains an
//! interval) and promotion into the windowed optimizer (which needs a point
//! estimate); whether to actually promote remains the caller's decision.

use tracing::debug;

use crate::depth::immature_point::ImmaturePoint;
use crate::depth::residual::{CandidateResidual, ResState};
use crate::depth::settings::TraceSettings;
use crate::frame::{Camera, FrameId, FramePrecalc, FrameStore};

/// Outcome of a successful depth refinement.
#[derive(Debug)]
pub struct DepthRefinement {
    /// Refined inverse depth.
    pub idepth: f32,
    /// Total photometric energy at the refined depth.
    pub energy: f32,
    /// Residuals that ended as inliers.
    pub num_good_residuals: usize,
    /// Final per-target residual states, in `targets` order.
    pub residuals: Vec<CandidateResidual>,
}

/// Refine a point's inverse depth against a set of target frames.
///
/// Seeds at the midpoint of the point's interval. Returns `None` when the
/// initial energy is non-finite or the accumulated idepth Hessian never
/// clears `min_idepth_hessian`; the point is too weakly constrained to
/// refine and should stay immature (or be dropped).
pub fn refine_idepth(
    point: &ImmaturePoint,
    frames: &FrameStore,
    camera: &Camera,
    targets: &[(FrameId, FramePrecalc)],
    settings: &TraceSettings,
) -> Option<DepthRefinement> {
    let mut residuals: Vec<CandidateResidual> = targets
        .iter()
        .map(|(id, _)| CandidateResidual::new(*id))
        .collect();

    let mut current_idepth = 0.5 * (point.idepth_min + point.idepth_max);

    // first pass with a very loose outlier budget: establish the system
    let mut last_energy = 0.0f32;
    let mut last_h_dd = 0.0f32;
    let mut last_b_d = 0.0f32;
    for (res, (_, precalc)) in residuals.iter_mut().zip(targets) {
        last_energy += point.linearize_residual(
            frames,
            camera,
            precalc,
            res,
            current_idepth,
            1000.0,
            settings,
            &mut last_h_dd,
            &mut last_b_d,
        );
        res.commit();
    }

    if !last_energy.is_finite() || last_h_dd < settings.min_idepth_hessian {
        debug!(
            h_dd = last_h_dd,
            energy = last_energy,
            "depth refinement rejected: underconstrained"
        );
        return None;
    }

    let mut lambda = 0.1f32;
    for iteration in 0..settings.activation_iterations {
        let hessian = last_h_dd * (1.0 + lambda);
        let step = last_b_d / hessian;
        let new_idepth = current_idepth - step;

        let mut new_energy = 0.0f32;
        let mut new_h_dd = 0.0f32;
        let mut new_b_d = 0.0f32;
        for (res, (_, precalc)) in residuals.iter_mut().zip(targets) {
            new_energy += point.linearize_residual(
                frames,
                camera,
                precalc,
                res,
                new_idepth,
                1.0,
                settings,
                &mut new_h_dd,
                &mut new_b_d,
            );
        }

        if new_h_dd < settings.min_idepth_hessian {
            return None;
        }

        if new_energy < last_energy {
            // accept: commit pending residual states and relax the damping
            current_idepth = new_idepth;
            last_energy = new_energy;
            last_h_dd = new_h_dd;
            last_b_d = new_b_d;
            for res in &mut residuals {
                res.commit();
            }
            lambda *= 0.5;
        } else {
            lambda *= 4.0;
            if lambda > 1e4 {
                lambda = 1e4;
            }
        }

        debug!(
            iteration,
            idepth = current_idepth,
            energy = last_energy,
            lambda,
            "depth refinement step"
        );

        if step.abs() < 1e-4 * current_idepth.abs() {
            break;
        }
    }

    if !current_idepth.is_finite() {
        return None;
    }

    let num_good_residuals = residuals
        .iter()
        .filter(|r| r.state == ResState::In)
        .count();

    Some(DepthRefinement {
        idepth: current_idepth,
        energy: last_energy,
        num_good_residuals,
        residuals,
    })
}
