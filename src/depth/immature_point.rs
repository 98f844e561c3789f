//! Immature points: candidate scene points whose inverse depth is still an
//! interval, not a value.
//!
//! An immature point is created at a selected pixel of its host frame with a
//! photometric fingerprint (the residual pattern sampled at full
//! resolution). Each subsequent target frame narrows the inverse-depth
//! interval via [`ImmaturePoint::trace_on`]: the interval endpoints project
//! to a segment of the epipolar line, a discrete energy search locates the
//! best match, a short 1-D Gauss-Newton polishes it, and the refined pixel
//! is inverted back into a tighter interval. Once the interval is tight and
//! unambiguous, [`ImmaturePoint::linearize_residual`] supplies the
//! energy/Hessian/gradient terms the windowed depth optimizer consumes.

use nalgebra::{Matrix2, Vector2, Vector3};
use tracing::trace;

use crate::depth::pattern::{PATTERN, PATTERN_SIZE};
use crate::depth::residual::{CandidateResidual, ResState};
use crate::depth::settings::TraceSettings;
use crate::depth::status::TraceStatus;
use crate::frame::{Camera, Frame, FrameId, FramePrecalc, FrameStore};
use crate::geometry::{d_res_d_idepth, project_full, project_simple};

/// Hard cap on discrete samples along the epipolar segment.
const MAX_TRACE_STEPS: usize = 100;

/// Energy charged for a sample that fell outside the interpolable region.
const BAD_SAMPLE_ENERGY: f32 = 1e5;

/// Energy returned when a residual evaluation cannot project at all.
const PROJECTION_FAILED_ENERGY: f32 = 1e10;

/// Quality ratio sentinel for a point that has never been searched.
const QUALITY_SENTINEL: f32 = 1e4;

/// A not-yet-triangulated candidate point in a host frame.
///
/// The host frame must outlive the point's use; it is referenced by handle
/// and every operation resolves it through the [`FrameStore`], failing as
/// out-of-bounds when the frame has been dropped.
#[derive(Debug, Clone)]
pub struct ImmaturePoint {
    /// Pixel location in the host frame (full resolution).
    pub u: f32,
    pub v: f32,
    pub host: FrameId,
    /// Selection class this point came from (which potential level picked
    /// it); carried through for the activation heuristics downstream.
    pub point_type: u8,

    /// Fingerprint intensities, one per pattern offset.
    colors: [f32; PATTERN_SIZE],
    /// Per-offset robust weights from local gradient magnitude.
    weights: [f32; PATTERN_SIZE],
    /// Accumulated gradient outer products over the fingerprint.
    grad_h: Matrix2<f32>,

    /// Photometric energy budget, fixed at construction. NaN marks a point
    /// whose fingerprint touched the image border; such a point is never
    /// traceable.
    pub energy_th: f32,

    /// Inverse-depth interval. `idepth_max` is NaN while the upper bound is
    /// still unknown.
    pub idepth_min: f32,
    pub idepth_max: f32,

    /// Worst-case second-best/best energy ratio observed by the search;
    /// large means unambiguous.
    pub quality: f32,
    /// Ground-truth inverse depth when a simulator provides one. Diagnostic
    /// only.
    pub idepth_gt: Option<f32>,

    pub last_trace_status: TraceStatus,
    /// Target pixel of the last successful trace, (-1, -1) when invalid.
    pub last_trace_uv: Vector2<f32>,
    /// Length of the pixel interval implied by the last trace.
    pub last_trace_pixel_interval: f32,
}

impl ImmaturePoint {
    /// Sample the fingerprint of a new point at (u, v) in `host`.
    ///
    /// If any pattern sample falls outside the interpolable image region the
    /// point is marked permanently invalid (`energy_th = NaN`); it will
    /// refuse to trace and should be discarded by the selector.
    pub fn new(u: f32, v: f32, host: &Frame, point_type: u8, settings: &TraceSettings) -> Self {
        let mut point = Self {
            u,
            v,
            host: host.id,
            point_type,
            colors: [0.0; PATTERN_SIZE],
            weights: [0.0; PATTERN_SIZE],
            grad_h: Matrix2::zeros(),
            energy_th: f32::NAN,
            idepth_min: 0.0,
            idepth_max: f32::NAN,
            quality: QUALITY_SENTINEL,
            idepth_gt: None,
            last_trace_status: TraceStatus::Uninitialized,
            last_trace_uv: Vector2::new(-1.0, -1.0),
            last_trace_pixel_interval: 0.0,
        };

        let level = host.full_level();
        for (idx, &[dx, dy]) in PATTERN.iter().enumerate() {
            let sample = level.sample_with_gradient(u + dx as f32, v + dy as f32);
            point.colors[idx] = sample.x;
            if !sample.x.is_finite() {
                // fingerprint touches the border; leave energy_th = NaN
                return point;
            }
            let grad = Vector2::new(sample.y, sample.z);
            point.grad_h += grad * grad.transpose();
            point.weights[idx] = (settings.outlier_sum_component
                / (settings.outlier_sum_component + grad.norm_squared()))
            .sqrt();
        }

        point.energy_th = PATTERN_SIZE as f32
            * settings.outlier_energy
            * settings.energy_weight
            * settings.energy_weight;
        point
    }

    /// Fingerprint intensity at one pattern offset.
    pub fn color(&self, idx: usize) -> f32 {
        self.colors[idx]
    }

    /// Robust weight at one pattern offset.
    pub fn weight(&self, idx: usize) -> f32 {
        self.weights[idx]
    }

    /// Whether construction sampled a complete, finite fingerprint.
    pub fn has_valid_fingerprint(&self) -> bool {
        self.energy_th.is_finite()
    }

    fn fail_trace(&mut self, status: TraceStatus) -> TraceStatus {
        self.last_trace_uv = Vector2::new(-1.0, -1.0);
        self.last_trace_pixel_interval = 0.0;
        self.last_trace_status = status;
        status
    }

    /// Search the epipolar segment of this point in a target frame and
    /// narrow the inverse-depth interval.
    ///
    /// `precalc` must be the host→target cache. Returns (and records) the
    /// trace outcome; see [`TraceStatus`] for the taxonomy. Calls on a point
    /// already out of bounds return immediately without touching any state.
    pub fn trace_on(
        &mut self,
        frames: &FrameStore,
        target: FrameId,
        precalc: &FramePrecalc,
        settings: &TraceSettings,
    ) -> TraceStatus {
        if self.last_trace_status == TraceStatus::Oob {
            return TraceStatus::Oob;
        }
        if !self.energy_th.is_finite() {
            // degenerate fingerprint; never traceable
            return self.fail_trace(TraceStatus::Oob);
        }
        let Some(target_frame) = frames.get(target) else {
            trace!(point_u = self.u, point_v = self.v, frame = %target, "trace target dropped");
            return self.fail_trace(TraceStatus::Oob);
        };

        let level = target_frame.full_level();
        let width = target_frame.width();
        let height = target_frame.height();
        let max_pix_search = (width + height) as f32 * settings.max_pix_search;

        let kt = &precalc.kt;
        let affine = precalc.affine;

        // project both interval endpoints; reject near the 5px border
        let pr = precalc.krki * Vector3::new(self.u, self.v, 1.0);
        let ptp_min = pr + kt * self.idepth_min;
        let u_min = ptp_min.x / ptp_min.z;
        let v_min = ptp_min.y / ptp_min.z;

        let inside = |x: f32, y: f32| {
            x > 4.0 && y > 4.0 && x < (width - 5) as f32 && y < (height - 5) as f32
        };
        if !inside(u_min, v_min) {
            trace!(u_min, v_min, "trace oob at near endpoint");
            return self.fail_trace(TraceStatus::Oob);
        }

        let mut dist;
        let mut u_max;
        let mut v_max;
        if self.idepth_max.is_finite() {
            let ptp_max = pr + kt * self.idepth_max;
            u_max = ptp_max.x / ptp_max.z;
            v_max = ptp_max.y / ptp_max.z;
            if !inside(u_max, v_max) {
                trace!(u_max, v_max, "trace oob at far endpoint");
                return self.fail_trace(TraceStatus::Oob);
            }

            // interval already tight: nothing worth refining
            dist = ((u_min - u_max).powi(2) + (v_min - v_max).powi(2)).sqrt();
            if dist < settings.slack_interval {
                self.last_trace_uv = Vector2::new(u_max + u_min, v_max + v_min) * 0.5;
                self.last_trace_pixel_interval = dist;
                self.last_trace_status = TraceStatus::Skipped;
                return TraceStatus::Skipped;
            }
        } else {
            // no upper bound yet: search a capped segment in the direction
            // implied by a small nominal inverse depth
            dist = max_pix_search;
            let ptp_far = pr + kt * 0.01;
            u_max = ptp_far.x / ptp_far.z;
            v_max = ptp_far.y / ptp_far.z;

            let dir_x = u_max - u_min;
            let dir_y = v_max - v_min;
            let inv_norm = 1.0 / (dir_x * dir_x + dir_y * dir_y).sqrt();
            u_max = u_min + dist * dir_x * inv_norm;
            v_max = v_min + dist * dir_y * inv_norm;

            if !inside(u_max, v_max) {
                trace!(u_max, v_max, "trace oob at capped endpoint");
                return self.fail_trace(TraceStatus::Oob);
            }
        }

        // implausible scale change between frames
        if !(self.idepth_min < 0.0 || (ptp_min.z > 0.75 && ptp_min.z < 1.5)) {
            trace!(scale = ptp_min.z, "trace oob from scale change");
            return self.fail_trace(TraceStatus::Oob);
        }

        // pixel error bound from the fingerprint's gradient structure,
        // projected onto the search direction and its perpendicular
        let mut dx = settings.step_size * (u_max - u_min);
        let mut dy = settings.step_size * (v_max - v_min);
        let along = Vector2::new(dx, dy);
        let perp = Vector2::new(dy, -dx);
        let a = along.dot(&(self.grad_h * along));
        let b = perp.dot(&(self.grad_h * perp));
        let mut error_in_pixel = 0.2 + 0.2 * (a + b) / a;

        if error_in_pixel * settings.min_improvement_factor > dist && self.idepth_max.is_finite() {
            trace!(error_in_pixel, dist, "trace not worth refining");
            self.last_trace_uv = Vector2::new(u_max + u_min, v_max + v_min) * 0.5;
            self.last_trace_pixel_interval = dist;
            self.last_trace_status = TraceStatus::BadCondition;
            return TraceStatus::BadCondition;
        }
        if error_in_pixel > 10.0 {
            error_in_pixel = 10.0;
        }

        // ---- discrete search along the segment ----
        dx /= dist;
        dy /= dist;
        if !dx.is_finite() || !dy.is_finite() {
            return self.fail_trace(TraceStatus::Oob);
        }

        if dist > max_pix_search {
            dist = max_pix_search;
        }

        let mut num_steps = (1.9999 + dist / settings.step_size) as usize;
        let rot_plane: Matrix2<f32> = precalc.krki.fixed_view::<2, 2>(0, 0).into_owned();
        let mut rotated_pattern = [Vector2::zeros(); PATTERN_SIZE];
        for (idx, &[pdx, pdy]) in PATTERN.iter().enumerate() {
            rotated_pattern[idx] = rot_plane * Vector2::new(pdx as f32, pdy as f32);
        }

        // deterministic sub-pixel start shift to decorrelate step phase
        // between points
        let rand_shift = self.u * 1000.0 - (self.u * 1000.0).floor();
        let mut ptx = u_min - rand_shift * dx;
        let mut pty = v_min - rand_shift * dy;

        let mut errors = [0.0f32; MAX_TRACE_STEPS];
        let mut best_u = 0.0;
        let mut best_v = 0.0;
        let mut best_energy = 1e10f32;
        let mut best_idx: i32 = -1;
        if num_steps >= MAX_TRACE_STEPS {
            num_steps = MAX_TRACE_STEPS - 1;
        }

        for (i, slot) in errors.iter_mut().enumerate().take(num_steps) {
            let mut energy = 0.0;
            for idx in 0..PATTERN_SIZE {
                let hit = level.sample_intensity(
                    ptx + rotated_pattern[idx].x,
                    pty + rotated_pattern[idx].y,
                );
                if !hit.is_finite() {
                    energy += BAD_SAMPLE_ENERGY;
                    continue;
                }
                let residual = hit - (affine.x * self.colors[idx] + affine.y);
                let hw = if residual.abs() < settings.huber_th {
                    1.0
                } else {
                    settings.huber_th / residual.abs()
                };
                energy += hw * residual * residual * (2.0 - hw);
            }

            *slot = energy;
            if energy < best_energy {
                best_u = ptx;
                best_v = pty;
                best_energy = energy;
                best_idx = i as i32;
            }
            ptx += dx;
            pty += dy;
        }

        // second-best energy outside an exclusion radius around the best
        let mut second_best = 1e10f32;
        for (i, &e) in errors.iter().enumerate().take(num_steps) {
            let i = i as i32;
            if (i < best_idx - settings.min_test_radius || i > best_idx + settings.min_test_radius)
                && e < second_best
            {
                second_best = e;
            }
        }

        // quality records the worst discriminability ever seen; it only
        // improves when a long search re-measures it
        let new_quality = second_best / best_energy;
        if new_quality < self.quality || num_steps > 10 {
            self.quality = new_quality;
        }

        // ---- Gauss-Newton refinement along the search direction ----
        let mut u_bak = best_u;
        let mut v_bak = best_v;
        let mut step_back = 0.0f32;
        if settings.gn_iterations > 0 {
            best_energy = 1e5;
        }
        for _ in 0..settings.gn_iterations {
            let mut hessian = 1.0f32;
            let mut b_acc = 0.0f32;
            let mut energy = 0.0f32;
            for idx in 0..PATTERN_SIZE {
                let hit = level.sample_with_gradient(
                    best_u + rotated_pattern[idx].x,
                    best_v + rotated_pattern[idx].y,
                );
                if !hit.x.is_finite() {
                    energy += BAD_SAMPLE_ENERGY;
                    continue;
                }
                let residual = hit.x - (affine.x * self.colors[idx] + affine.y);
                let d_res_d_dist = dx * hit.y + dy * hit.z;
                let hw = if residual.abs() < settings.huber_th {
                    1.0
                } else {
                    settings.huber_th / residual.abs()
                };

                hessian += hw * d_res_d_dist * d_res_d_dist;
                b_acc += hw * residual * d_res_d_dist;
                energy += self.weights[idx]
                    * self.weights[idx]
                    * hw
                    * residual
                    * residual
                    * (2.0 - hw);
            }

            if energy > best_energy {
                // worse than the accepted point: retry half the previous
                // step from there
                step_back *= 0.5;
                best_u = u_bak + step_back * dx;
                best_v = v_bak + step_back * dy;
            } else {
                let mut step = -b_acc / hessian;
                step = step.clamp(-0.5, 0.5);
                if !step.is_finite() {
                    step = 0.0;
                }
                u_bak = best_u;
                v_bak = best_v;
                step_back = step;

                best_u += step * dx;
                best_v += step * dy;
                best_energy = energy;
            }

            if step_back.abs() < settings.gn_threshold {
                break;
            }
        }

        // photometric outlier; a second consecutive verdict is terminal
        if !(best_energy < self.energy_th * settings.extra_slack) {
            trace!(best_energy, threshold = self.energy_th * settings.extra_slack, "trace outlier");
            let escalated = self.last_trace_status.after_outlier();
            return self.fail_trace(escalated);
        }

        // invert the refined pixel (± error bound) back into an
        // inverse-depth interval along the dominant search axis
        if dx * dx > dy * dy {
            let near = best_u - error_in_pixel * dx;
            let far = best_u + error_in_pixel * dx;
            self.idepth_min = (pr.z * near - pr.x) / (kt.x - kt.z * near);
            self.idepth_max = (pr.z * far - pr.x) / (kt.x - kt.z * far);
        } else {
            let near = best_v - error_in_pixel * dy;
            let far = best_v + error_in_pixel * dy;
            self.idepth_min = (pr.z * near - pr.y) / (kt.y - kt.z * near);
            self.idepth_max = (pr.z * far - pr.y) / (kt.y - kt.z * far);
        }
        if self.idepth_min > self.idepth_max {
            std::mem::swap(&mut self.idepth_min, &mut self.idepth_max);
        }

        if !self.idepth_min.is_finite() || !self.idepth_max.is_finite() || self.idepth_max < 0.0 {
            return self.fail_trace(TraceStatus::Outlier);
        }

        self.last_trace_pixel_interval = 2.0 * error_in_pixel;
        self.last_trace_uv = Vector2::new(best_u, best_v);
        self.last_trace_status = TraceStatus::Good;
        TraceStatus::Good
    }

    /// Photometric energy of this point against one target frame at a
    /// hypothesized inverse depth. Pure; no state is touched.
    ///
    /// Any pattern offset that fails to project (or samples a non-finite
    /// value) yields the full fixed penalty, with no partial credit.
    pub fn calc_residual(
        &self,
        frames: &FrameStore,
        precalc: &FramePrecalc,
        res: &CandidateResidual,
        idepth: f32,
        outlier_slack: f32,
        settings: &TraceSettings,
    ) -> f32 {
        let Some(target_frame) = frames.get(res.target) else {
            return PROJECTION_FAILED_ENERGY;
        };
        let level = target_frame.full_level();
        let width = target_frame.width();
        let height = target_frame.height();

        let mut energy = 0.0f32;
        for idx in 0..PATTERN_SIZE {
            let [dx, dy] = PATTERN[idx];
            let Some((ku, kv)) = project_simple(
                self.u + dx as f32,
                self.v + dy as f32,
                idepth,
                &precalc.krki,
                &precalc.kt,
                width,
                height,
            ) else {
                return PROJECTION_FAILED_ENERGY;
            };

            let hit = level.sample_intensity(ku, kv);
            if !hit.is_finite() {
                return PROJECTION_FAILED_ENERGY;
            }

            let residual = hit - (precalc.affine.x * self.colors[idx] + precalc.affine.y);
            let hw = if residual.abs() < settings.huber_th {
                1.0
            } else {
                settings.huber_th / residual.abs()
            };
            energy +=
                self.weights[idx] * self.weights[idx] * hw * residual * residual * (2.0 - hw);
        }

        energy.min(self.energy_th * outlier_slack)
    }

    /// Linearize this point's photometric residual against one target frame
    /// around a hypothesized inverse depth.
    ///
    /// Accumulates the 1-D depth system into `h_dd` and `b_d` and writes the
    /// pending state/energy on `res`; the caller commits or discards them.
    /// A residual already out of bounds short-circuits and keeps its stored
    /// energy.
    pub fn linearize_residual(
        &self,
        frames: &FrameStore,
        camera: &Camera,
        precalc: &FramePrecalc,
        res: &mut CandidateResidual,
        idepth: f32,
        outlier_slack: f32,
        settings: &TraceSettings,
        h_dd: &mut f32,
        b_d: &mut f32,
    ) -> f32 {
        if res.state == ResState::Oob {
            res.new_state = ResState::Oob;
            return res.energy;
        }
        let Some(target_frame) = frames.get(res.target) else {
            res.new_state = ResState::Oob;
            return res.energy;
        };
        let level = target_frame.full_level();
        let width = target_frame.width();
        let height = target_frame.height();

        let mut energy = 0.0f32;
        for idx in 0..PATTERN_SIZE {
            let [dx, dy] = PATTERN[idx];
            let Some(proj) = project_full(
                self.u,
                self.v,
                idepth,
                dx,
                dy,
                camera,
                &precalc.rot,
                &precalc.trans,
                width,
                height,
            ) else {
                res.new_state = ResState::Oob;
                return res.energy;
            };

            let hit = level.sample_with_gradient(proj.ku, proj.kv);
            if !hit.x.is_finite() {
                res.new_state = ResState::Oob;
                return res.energy;
            }

            let residual = hit.x - (precalc.affine.x * self.colors[idx] + precalc.affine.y);
            let mut hw = if residual.abs() < settings.huber_th {
                1.0
            } else {
                settings.huber_th / residual.abs()
            };
            energy +=
                self.weights[idx] * self.weights[idx] * hw * residual * residual * (2.0 - hw);

            // chain rule: image gradient, focal scaling, then projection
            // sensitivity to inverse depth
            let gx = hit.y * camera.fx;
            let gy = hit.z * camera.fy;
            let d_idepth =
                d_res_d_idepth(&precalc.trans, proj.xn, proj.yn, gx, gy, proj.drescale);

            hw *= self.weights[idx] * self.weights[idx];
            *h_dd += (hw * d_idepth) * d_idepth;
            *b_d += (hw * residual) * d_idepth;
        }

        let cutoff = self.energy_th * outlier_slack;
        if energy > cutoff {
            energy = cutoff;
            res.new_state = ResState::Outlier;
        } else {
            res.new_state = ResState::In;
        }
        res.new_energy = energy;
        energy
    }

    /// Magnitude of target-pixel motion per unit inverse depth, used to
    /// scale initial steps of the depth optimization. `None` when the point
    /// does not project.
    pub fn d_pix_d_idepth(
        &self,
        frames: &FrameStore,
        camera: &Camera,
        precalc: &FramePrecalc,
        target: FrameId,
        idepth: f32,
    ) -> Option<f32> {
        let target_frame = frames.get(target)?;
        let proj = project_full(
            self.u,
            self.v,
            idepth,
            0,
            0,
            camera,
            &precalc.rot,
            &precalc.trans,
            target_frame.width(),
            target_frame.height(),
        )?;

        let dxdd = (precalc.trans.x - precalc.trans.z * proj.xn) * camera.fx;
        let dydd = (precalc.trans.y - precalc.trans.z * proj.yn) * camera.fy;
        Some(proj.drescale * (dxdd * dxdd + dydd * dydd).sqrt())
    }

    /// Whether the point's trace history qualifies it for depth refinement
    /// and promotion. The promotion decision itself belongs to the window
    /// management outside this crate.
    pub fn ready_for_activation(&self, settings: &TraceSettings) -> bool {
        matches!(
            self.last_trace_status,
            TraceStatus::Good | TraceStatus::Skipped | TraceStatus::BadCondition | TraceStatus::Oob
        ) && self.last_trace_pixel_interval < 8.0
            && self.quality > settings.min_trace_quality
            && self.idepth_min + self.idepth_max > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depth::testutil::{
        scene_disparity, static_scene, translation_scene, scene_with_target, texture,
        IDEPTH_TRUE,
    };
    use approx::assert_relative_eq;

    fn new_point(scene: &crate::depth::testutil::Scene, u: f32, v: f32) -> ImmaturePoint {
        let host = scene.store.get(scene.host).unwrap();
        ImmaturePoint::new(u, v, host, 1, &scene.settings)
    }

    // ---- construction ----

    #[test]
    fn test_construction_samples_fingerprint() {
        let scene = translation_scene();
        let point = new_point(&scene, 60.0, 90.0);

        assert!(point.has_valid_fingerprint());
        assert_eq!(point.idepth_min, 0.0);
        assert!(point.idepth_max.is_nan());
        assert_eq!(point.last_trace_status, TraceStatus::Uninitialized);
        for (idx, &[dx, dy]) in PATTERN.iter().enumerate() {
            assert_relative_eq!(
                point.color(idx),
                texture(60.0 + dx as f32, 90.0 + dy as f32),
                epsilon = 1e-3
            );
            assert!(point.weight(idx) > 0.0 && point.weight(idx) <= 1.0);
        }
        assert_relative_eq!(
            point.energy_th,
            PATTERN_SIZE as f32 * scene.settings.outlier_energy,
            epsilon = 1e-3
        );
    }

    #[test]
    fn test_border_fingerprint_is_invalid_and_never_traced() {
        let scene = translation_scene();
        // pattern offset (0, -2) leaves the image at v = 1
        let mut point = new_point(&scene, 1.0, 1.0);

        assert!(!point.has_valid_fingerprint());
        assert!(point.energy_th.is_nan());

        let status = point.trace_on(&scene.store, scene.target, &scene.precalc, &scene.settings);
        assert_eq!(status, TraceStatus::Oob);
    }

    #[test]
    fn test_weights_shrink_with_gradient_strength() {
        // flat image: all weights exactly 1
        let scene = scene_with_target(|_, _| 128.0);
        let mut store = crate::frame::FrameStore::new();
        let flat = vec![128.0f32; 64 * 64];
        let flat_id = store.insert(&flat, 64, 64, 1, 1.0, crate::frame::AffineLight::default());
        let flat_point =
            ImmaturePoint::new(32.0, 32.0, store.get(flat_id).unwrap(), 1, &scene.settings);
        for idx in 0..PATTERN_SIZE {
            assert_relative_eq!(flat_point.weight(idx), 1.0, epsilon = 1e-5);
        }

        // textured host: weights strictly below 1 where gradients exist
        let textured = new_point(&scene, 60.0, 90.0);
        assert!((0..PATTERN_SIZE).any(|idx| textured.weight(idx) < 1.0));
    }

    // ---- trace_on scenarios ----

    #[test]
    fn test_trace_brackets_true_idepth() {
        let scene = translation_scene();
        let mut point = new_point(&scene, 60.0, 90.0);

        let status = point.trace_on(&scene.store, scene.target, &scene.precalc, &scene.settings);

        assert_eq!(status, TraceStatus::Good);
        assert!(point.idepth_min.is_finite() && point.idepth_max.is_finite());
        assert!(point.idepth_min <= point.idepth_max);
        assert!(point.idepth_max >= 0.0);
        // interval must bracket the simulated depth within its own bound
        assert!(point.idepth_min <= IDEPTH_TRUE + 0.01);
        assert!(point.idepth_max >= IDEPTH_TRUE - 0.01);
        // refined pixel sits at the true disparity
        assert_relative_eq!(
            point.last_trace_uv.x,
            60.0 + scene_disparity(),
            epsilon = 0.5
        );
        assert!(point.last_trace_pixel_interval > 0.0);
    }

    #[test]
    fn test_trace_near_border_returns_oob() {
        let scene = translation_scene();
        // min-depth projection of (2, 2) is (2, 2): inside the 5 px border
        let mut point = new_point(&scene, 2.0, 2.0);
        // keep the fingerprint itself valid for this scenario
        assert!(point.has_valid_fingerprint());

        let status = point.trace_on(&scene.store, scene.target, &scene.precalc, &scene.settings);
        assert_eq!(status, TraceStatus::Oob);
        assert_eq!(point.last_trace_uv, Vector2::new(-1.0, -1.0));
    }

    #[test]
    fn test_trace_on_terminal_point_is_a_no_op() {
        let scene = translation_scene();
        let mut point = new_point(&scene, 2.0, 2.0);
        assert_eq!(
            point.trace_on(&scene.store, scene.target, &scene.precalc, &scene.settings),
            TraceStatus::Oob
        );

        // poison the interval; a terminal point must not touch it
        point.idepth_min = 123.0;
        point.idepth_max = 456.0;
        let again = point.trace_on(&scene.store, scene.target, &scene.precalc, &scene.settings);
        assert_eq!(again, TraceStatus::Oob);
        assert_eq!(point.idepth_min, 123.0);
        assert_eq!(point.idepth_max, 456.0);
    }

    #[test]
    fn test_tight_interval_is_skipped() {
        let scene = static_scene();
        let mut point = new_point(&scene, 60.0, 90.0);
        // both endpoints project identically under zero motion
        point.idepth_min = 0.5;
        point.idepth_max = 0.5;

        let status = point.trace_on(&scene.store, scene.target, &scene.precalc, &scene.settings);
        assert_eq!(status, TraceStatus::Skipped);
        assert_relative_eq!(point.last_trace_uv.x, 60.0, epsilon = 1e-3);
        assert_relative_eq!(point.last_trace_uv.y, 90.0, epsilon = 1e-3);
    }

    #[test]
    fn test_photometric_mismatch_is_outlier_then_oob() {
        // target recorded something entirely different from the host
        let scene = scene_with_target(|_, _| 255.0);
        let mut point = new_point(&scene, 60.0, 90.0);

        let first = point.trace_on(&scene.store, scene.target, &scene.precalc, &scene.settings);
        assert_eq!(first, TraceStatus::Outlier);
        assert_eq!(point.last_trace_uv, Vector2::new(-1.0, -1.0));

        let second = point.trace_on(&scene.store, scene.target, &scene.precalc, &scene.settings);
        assert_eq!(second, TraceStatus::Oob);
    }

    #[test]
    fn test_dead_target_handle_is_oob() {
        let mut scene = translation_scene();
        let mut point = new_point(&scene, 60.0, 90.0);
        scene.store.remove(scene.target);

        let status = point.trace_on(&scene.store, scene.target, &scene.precalc, &scene.settings);
        assert_eq!(status, TraceStatus::Oob);
    }

    #[test]
    fn test_quality_only_drops_on_short_searches() {
        let scene = translation_scene();

        // short search (interval spans ~7 px -> under the step cap):
        // quality must not increase
        let mut point = new_point(&scene, 60.0, 90.0);
        point.idepth_min = 0.44;
        point.idepth_max = 0.56;
        point.quality = 0.5;
        let status = point.trace_on(&scene.store, scene.target, &scene.precalc, &scene.settings);
        assert_eq!(status, TraceStatus::Good);
        assert!(point.quality <= 0.5);

        // long search (fresh point, unbounded interval): quality is
        // re-measured even if that raises it
        let mut fresh = new_point(&scene, 60.0, 90.0);
        fresh.quality = 0.5;
        let status = fresh.trace_on(&scene.store, scene.target, &scene.precalc, &scene.settings);
        assert_eq!(status, TraceStatus::Good);
        assert!(fresh.quality > 0.5);
    }

    #[test]
    fn test_quality_is_never_negative() {
        let scene = translation_scene();
        let mut point = new_point(&scene, 60.0, 90.0);
        point.trace_on(&scene.store, scene.target, &scene.precalc, &scene.settings);
        assert!(point.quality >= 0.0);
    }

    #[test]
    fn test_good_trace_tightens_on_retrace() {
        let scene = translation_scene();
        let mut point = new_point(&scene, 60.0, 90.0);

        assert_eq!(
            point.trace_on(&scene.store, scene.target, &scene.precalc, &scene.settings),
            TraceStatus::Good
        );
        let width_first = point.idepth_max - point.idepth_min;
        assert!(width_first.is_finite() && width_first > 0.0);

        // second trace against the same geometry: interval stays bracketing
        // and does not blow back up
        let second = point.trace_on(&scene.store, scene.target, &scene.precalc, &scene.settings);
        assert!(matches!(
            second,
            TraceStatus::Good | TraceStatus::Skipped | TraceStatus::BadCondition
        ));
        if second == TraceStatus::Good {
            assert!(point.idepth_max - point.idepth_min <= width_first + 1e-4);
        }
    }

    // ---- calc_residual ----

    #[test]
    fn test_calc_residual_small_at_true_idepth() {
        let scene = translation_scene();
        let point = new_point(&scene, 60.0, 90.0);
        let res = CandidateResidual::new(scene.target);

        let at_true = point.calc_residual(
            &scene.store,
            &scene.precalc,
            &res,
            IDEPTH_TRUE,
            1.0,
            &scene.settings,
        );
        let off_true = point.calc_residual(
            &scene.store,
            &scene.precalc,
            &res,
            IDEPTH_TRUE + 0.2,
            1.0,
            &scene.settings,
        );
        assert!(at_true < point.energy_th * 0.25);
        assert!(at_true < off_true);
    }

    #[test]
    fn test_calc_residual_is_idempotent() {
        let scene = translation_scene();
        let point = new_point(&scene, 60.0, 90.0);
        let res = CandidateResidual::new(scene.target);

        let first =
            point.calc_residual(&scene.store, &scene.precalc, &res, 0.37, 1.0, &scene.settings);
        let second =
            point.calc_residual(&scene.store, &scene.precalc, &res, 0.37, 1.0, &scene.settings);
        assert_eq!(first, second);
    }

    #[test]
    fn test_calc_residual_penalizes_any_failed_offset() {
        let scene = static_scene();
        // center projects inside the inner border but the (+2, 0) offset
        // crosses it: width 240 ⇒ border at 237, center at 236
        let point = new_point(&scene, 236.0, 90.0);
        assert!(point.has_valid_fingerprint());
        let res = CandidateResidual::new(scene.target);

        let energy =
            point.calc_residual(&scene.store, &scene.precalc, &res, 0.5, 1.0, &scene.settings);
        assert_eq!(energy, PROJECTION_FAILED_ENERGY);
    }

    #[test]
    fn test_calc_residual_penalizes_dead_handle() {
        let mut scene = translation_scene();
        let point = new_point(&scene, 60.0, 90.0);
        let res = CandidateResidual::new(scene.target);
        scene.store.remove(scene.target);

        let energy = point.calc_residual(
            &scene.store,
            &scene.precalc,
            &res,
            IDEPTH_TRUE,
            1.0,
            &scene.settings,
        );
        assert_eq!(energy, PROJECTION_FAILED_ENERGY);
    }

    #[test]
    fn test_calc_residual_clamps_to_budget() {
        let scene = scene_with_target(|_, _| 255.0);
        let point = new_point(&scene, 60.0, 90.0);
        let res = CandidateResidual::new(scene.target);

        let energy = point.calc_residual(
            &scene.store,
            &scene.precalc,
            &res,
            IDEPTH_TRUE,
            2.0,
            &scene.settings,
        );
        assert_relative_eq!(energy, point.energy_th * 2.0, epsilon = 1e-2);
    }

    // ---- linearize_residual ----

    #[test]
    fn test_linearize_marks_inlier_and_builds_system() {
        let scene = translation_scene();
        let point = new_point(&scene, 60.0, 90.0);
        let mut res = CandidateResidual::new(scene.target);
        let (mut h_dd, mut b_d) = (0.0, 0.0);

        let energy = point.linearize_residual(
            &scene.store,
            &scene.camera,
            &scene.precalc,
            &mut res,
            IDEPTH_TRUE,
            1.0,
            &scene.settings,
            &mut h_dd,
            &mut b_d,
        );

        assert_eq!(res.new_state, ResState::In);
        assert_eq!(res.new_energy, energy);
        assert!(energy < point.energy_th);
        assert!(h_dd > 0.0);
        // near the optimum the gradient is an order smaller than the
        // curvature-scaled step unit
        assert!((b_d / h_dd).abs() < 0.05);
    }

    #[test]
    fn test_linearize_gradient_pulls_toward_true_idepth() {
        let scene = translation_scene();
        let point = new_point(&scene, 60.0, 90.0);
        let settings = &scene.settings;

        let mut res = CandidateResidual::new(scene.target);
        let (mut h_dd, mut b_d) = (0.0, 0.0);
        point.linearize_residual(
            &scene.store,
            &scene.camera,
            &scene.precalc,
            &mut res,
            IDEPTH_TRUE - 0.05,
            1000.0,
            settings,
            &mut h_dd,
            &mut b_d,
        );
        // Gauss-Newton step −b/H must point toward the true inverse depth
        let step = -b_d / h_dd;
        assert!(step > 0.0, "step {step} should increase idepth");
        assert!((IDEPTH_TRUE - 0.05 + step - IDEPTH_TRUE).abs() < 0.05);
    }

    #[test]
    fn test_linearize_short_circuits_sticky_oob() {
        let scene = translation_scene();
        let point = new_point(&scene, 60.0, 90.0);
        let mut res = CandidateResidual::new(scene.target);
        res.state = ResState::Oob;
        res.energy = 77.0;
        let (mut h_dd, mut b_d) = (0.0, 0.0);

        let energy = point.linearize_residual(
            &scene.store,
            &scene.camera,
            &scene.precalc,
            &mut res,
            IDEPTH_TRUE,
            1.0,
            &scene.settings,
            &mut h_dd,
            &mut b_d,
        );

        assert_eq!(energy, 77.0);
        assert_eq!(res.new_state, ResState::Oob);
        assert_eq!(h_dd, 0.0);
        assert_eq!(b_d, 0.0);
    }

    #[test]
    fn test_linearize_projection_failure_keeps_stored_energy() {
        let scene = static_scene();
        let point = new_point(&scene, 236.0, 90.0);
        let mut res = CandidateResidual::new(scene.target);
        res.energy = 5.0;
        let (mut h_dd, mut b_d) = (0.0, 0.0);

        let energy = point.linearize_residual(
            &scene.store,
            &scene.camera,
            &scene.precalc,
            &mut res,
            0.5,
            1.0,
            &scene.settings,
            &mut h_dd,
            &mut b_d,
        );

        assert_eq!(energy, 5.0);
        assert_eq!(res.new_state, ResState::Oob);
    }

    #[test]
    fn test_linearize_clamps_and_marks_outlier() {
        let scene = scene_with_target(|_, _| 255.0);
        let point = new_point(&scene, 60.0, 90.0);
        let mut res = CandidateResidual::new(scene.target);
        let (mut h_dd, mut b_d) = (0.0, 0.0);

        let energy = point.linearize_residual(
            &scene.store,
            &scene.camera,
            &scene.precalc,
            &mut res,
            IDEPTH_TRUE,
            1.0,
            &scene.settings,
            &mut h_dd,
            &mut b_d,
        );

        assert_eq!(res.new_state, ResState::Outlier);
        assert_relative_eq!(energy, point.energy_th, epsilon = 1e-2);
    }

    // ---- sensitivity + activation ----

    #[test]
    fn test_d_pix_d_idepth_matches_pure_translation() {
        let scene = translation_scene();
        let point = new_point(&scene, 60.0, 90.0);

        // pure x translation: sensitivity is exactly fx·|tx| (drescale = 1)
        let s = point
            .d_pix_d_idepth(
                &scene.store,
                &scene.camera,
                &scene.precalc,
                scene.target,
                IDEPTH_TRUE,
            )
            .expect("center point must project");
        assert_relative_eq!(s, scene.camera.fx * 0.3, epsilon = 0.05);

        // dead handle: no sensitivity
        let mut scene2 = translation_scene();
        scene2.store.remove(scene2.target);
        assert!(point
            .d_pix_d_idepth(
                &scene2.store,
                &scene2.camera,
                &scene2.precalc,
                scene2.target,
                IDEPTH_TRUE
            )
            .is_none());
    }

    #[test]
    fn test_ready_for_activation_requires_good_history() {
        let scene = translation_scene();
        let mut point = new_point(&scene, 60.0, 90.0);

        // untraced: not ready
        assert!(!point.ready_for_activation(&scene.settings));

        point.trace_on(&scene.store, scene.target, &scene.precalc, &scene.settings);
        assert_eq!(point.last_trace_status, TraceStatus::Good);
        if point.quality > scene.settings.min_trace_quality {
            assert!(point.ready_for_activation(&scene.settings));
        }

        // a negative-depth interval disqualifies
        point.idepth_min = -2.0;
        point.idepth_max = 1.0;
        assert!(!point.ready_for_activation(&scene.settings));
    }
}
