//! Shared synthetic-scene fixtures for depth tests.
//!
//! The standard scene is a fronto-parallel textured plane at depth 2.0
//! (inverse depth 0.5) seen from a host camera at the origin and a target
//! camera translated 0.3 along +x. With fx = 200 that makes every plane
//! pixel shift by exactly 30 px of disparity, so the target image shows the
//! host texture displaced 30 px to the right.

use nalgebra::Vector3;

use crate::depth::settings::TraceSettings;
use crate::frame::{AffineLight, Camera, FrameId, FramePrecalc, FrameStore};
use crate::geometry::SE3;

pub const SCENE_W: usize = 240;
pub const SCENE_H: usize = 180;
pub const IDEPTH_TRUE: f32 = 0.5;
pub const BASELINE_X: f64 = 0.3;

pub fn scene_camera() -> Camera {
    Camera::new(200.0, 200.0, 120.0, 90.0)
}

/// Disparity of the plane between host and target.
pub fn scene_disparity() -> f32 {
    scene_camera().fx * BASELINE_X as f32 * IDEPTH_TRUE
}

/// Smooth, aperiodic multi-frequency texture with usable gradients
/// everywhere.
pub fn texture(x: f32, y: f32) -> f32 {
    120.0
        + 45.0 * (0.20 * x).sin()
        + 35.0 * (0.17 * y).cos()
        + 25.0 * (0.12 * (x + y)).sin()
}

pub fn render<F: Fn(f32, f32) -> f32>(f: F) -> Vec<f32> {
    let mut img = vec![0.0f32; SCENE_W * SCENE_H];
    for y in 0..SCENE_H {
        for x in 0..SCENE_W {
            img[y * SCENE_W + x] = f(x as f32, y as f32);
        }
    }
    img
}

pub struct Scene {
    pub store: FrameStore,
    pub camera: Camera,
    pub host: FrameId,
    pub target: FrameId,
    pub precalc: FramePrecalc,
    pub settings: TraceSettings,
}

/// Host + target observing the standard plane; `target_texture` overrides
/// what the target camera actually recorded (to fabricate mismatches).
pub fn scene_with_target<F: Fn(f32, f32) -> f32>(target_texture: F) -> Scene {
    let mut store = FrameStore::new();
    let camera = scene_camera();

    let host_img = render(texture);
    let target_img = render(target_texture);

    let host = store.insert(&host_img, SCENE_W, SCENE_H, 1, 1.0, AffineLight::default());
    let target = store.insert(&target_img, SCENE_W, SCENE_H, 1, 1.0, AffineLight::default());

    let host_pose = SE3::identity();
    let target_pose = SE3::from_translation(Vector3::new(BASELINE_X, 0.0, 0.0));
    let precalc = FramePrecalc::new(
        store.get(host).unwrap(),
        &host_pose,
        store.get(target).unwrap(),
        &target_pose,
        &camera,
    );

    let settings = TraceSettings {
        // wide enough to reach the 30 px disparity from a fresh point
        max_pix_search: 0.15,
        ..TraceSettings::default()
    };

    Scene {
        store,
        camera,
        host,
        target,
        precalc,
        settings,
    }
}

/// The consistent scene: target records the plane exactly.
pub fn translation_scene() -> Scene {
    let disp = scene_disparity();
    scene_with_target(move |x, y| texture(x - disp, y))
}

/// Host and target at the identical pose (zero baseline), identical images.
pub fn static_scene() -> Scene {
    let mut scene = scene_with_target(texture);
    scene.precalc = FramePrecalc::identity();
    scene
}
