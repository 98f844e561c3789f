use anyhow::Result;
use nalgebra::Vector3;
use rand::{Rng, SeedableRng};

use rust_dvo::depth::{refine_idepth, ImmaturePoint, TraceSettings, TraceStatus};
use rust_dvo::frame::{AffineLight, Camera, FramePrecalc, FrameStore};
use rust_dvo::geometry::SE3;

const WIDTH: usize = 640;
const HEIGHT: usize = 480;
const PLANE_IDEPTH: f32 = 0.5;
const BASELINE_X: f64 = 0.15;

/// Smooth aperiodic test texture.
fn texture(x: f32, y: f32) -> f32 {
    120.0
        + 45.0 * (0.20 * x).sin()
        + 35.0 * (0.17 * y).cos()
        + 25.0 * (0.12 * (x + y)).sin()
}

fn render<F: Fn(f32, f32) -> f32>(f: F) -> Vec<f32> {
    let mut img = vec![0.0f32; WIDTH * HEIGHT];
    for y in 0..HEIGHT {
        for x in 0..WIDTH {
            img[y * WIDTH + x] = f(x as f32, y as f32);
        }
    }
    img
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let camera = Camera::new(300.0, 300.0, 320.0, 240.0);
    let settings = TraceSettings::default();

    // A fronto-parallel plane at depth 1/PLANE_IDEPTH seen from two cameras
    // a small x-translation apart: every plane pixel shifts by a uniform
    // disparity between the two images.
    let disparity = camera.fx * BASELINE_X as f32 * PLANE_IDEPTH;
    println!(
        "Synthetic plane scene: {}x{}, baseline {:.2} m, disparity {:.1} px",
        WIDTH, HEIGHT, BASELINE_X, disparity
    );

    let host_img = render(texture);
    let target_img = render(|x, y| texture(x - disparity, y));

    let mut store = FrameStore::new();
    let host = store.insert(&host_img, WIDTH, HEIGHT, 3, 1.0, AffineLight::default());
    let target = store.insert(&target_img, WIDTH, HEIGHT, 3, 1.0, AffineLight::default());

    let host_pose = SE3::identity();
    let target_pose = SE3::from_translation(Vector3::new(BASELINE_X, 0.0, 0.0));
    let precalc = FramePrecalc::new(
        store.get(host).unwrap(),
        &host_pose,
        store.get(target).unwrap(),
        &target_pose,
        &camera,
    );

    // Jittered selection grid standing in for the external point selector.
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let mut points = Vec::new();
    let host_frame = store.get(host).unwrap();
    for gy in (40..HEIGHT - 40).step_by(40) {
        for gx in (40..WIDTH - 80).step_by(40) {
            let u = gx as f32 + rng.gen_range(-2.0..2.0);
            let v = gy as f32 + rng.gen_range(-2.0..2.0);
            let mut point = ImmaturePoint::new(u, v, host_frame, 1, &settings);
            point.idepth_gt = Some(PLANE_IDEPTH);
            if point.has_valid_fingerprint() {
                points.push(point);
            }
        }
    }
    println!("Selected {} immature points", points.len());

    // Trace every point against the target frame.
    let mut counts = [0usize; 6];
    for point in &mut points {
        let status = point.trace_on(&store, target, &precalc, &settings);
        let slot = match status {
            TraceStatus::Uninitialized => 0,
            TraceStatus::Good => 1,
            TraceStatus::Oob => 2,
            TraceStatus::Outlier => 3,
            TraceStatus::Skipped => 4,
            TraceStatus::BadCondition => 5,
        };
        counts[slot] += 1;
    }
    println!(
        "Trace outcomes: good {} | oob {} | outlier {} | skipped {} | bad-condition {}",
        counts[1], counts[2], counts[3], counts[4], counts[5]
    );

    // Refine depth for the well-traced points and compare to ground truth.
    let targets = vec![(target, precalc.clone())];
    let mut refined = 0usize;
    let mut interval_hits = 0usize;
    let mut abs_err_sum = 0.0f32;
    for point in &points {
        if point.last_trace_status != TraceStatus::Good {
            continue;
        }
        let gt = point.idepth_gt.expect("demo points carry ground truth");
        if point.idepth_min <= gt && gt <= point.idepth_max {
            interval_hits += 1;
        }
        if let Some(result) = refine_idepth(point, &store, &camera, &targets, &settings) {
            abs_err_sum += (result.idepth - gt).abs();
            refined += 1;
        }
    }

    if refined > 0 {
        println!(
            "Refined {}/{} good points; interval bracketed truth for {}; mean |idepth error| {:.5}",
            refined,
            counts[1],
            interval_hits,
            abs_err_sum / refined as f32
        );
    } else {
        println!("No points survived refinement");
    }

    Ok(())
}
