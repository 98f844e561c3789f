//! Image pyramid with precomputed gradient channels.
//!
//! Each level stores three channels per pixel: intensity, d/dx and d/dy.
//! The tracing code samples all three bilinearly at sub-pixel positions.
//! Sampling outside the valid 2×2 interpolation support returns NaN; callers
//! treat non-finite samples as a failed lookup rather than an error.

use nalgebra::Vector3;

/// One pyramid level: intensity plus x/y gradients, row-major.
#[derive(Debug, Clone)]
pub struct PyramidLevel {
    pub width: usize,
    pub height: usize,
    /// Per-pixel (intensity, dI/dx, dI/dy).
    data: Vec<Vector3<f32>>,
}

impl PyramidLevel {
    /// Build a level from a raw intensity buffer, computing gradients by
    /// central differences. The one-pixel image border keeps zero gradients.
    pub fn from_intensity(intensity: &[f32], width: usize, height: usize) -> Self {
        assert_eq!(intensity.len(), width * height);

        let mut data: Vec<Vector3<f32>> = intensity
            .iter()
            .map(|&c| Vector3::new(c, 0.0, 0.0))
            .collect();

        for y in 1..height - 1 {
            for x in 1..width - 1 {
                let idx = y * width + x;
                let dx = 0.5 * (intensity[idx + 1] - intensity[idx - 1]);
                let dy = 0.5 * (intensity[idx + width] - intensity[idx - width]);
                data[idx].y = dx;
                data[idx].z = dy;
            }
        }

        Self {
            width,
            height,
            data,
        }
    }

    /// Downsample by 2×2 averaging of the intensity channel, then recompute
    /// gradients on the coarser grid.
    pub fn downsample(&self) -> Self {
        let w = self.width / 2;
        let h = self.height / 2;
        let mut intensity = vec![0.0f32; w * h];
        for y in 0..h {
            for x in 0..w {
                let i00 = self.data[(2 * y) * self.width + 2 * x].x;
                let i01 = self.data[(2 * y) * self.width + 2 * x + 1].x;
                let i10 = self.data[(2 * y + 1) * self.width + 2 * x].x;
                let i11 = self.data[(2 * y + 1) * self.width + 2 * x + 1].x;
                intensity[y * w + x] = 0.25 * (i00 + i01 + i10 + i11);
            }
        }
        Self::from_intensity(&intensity, w, h)
    }

    #[inline]
    fn in_support(&self, x: f32, y: f32) -> bool {
        self.width >= 2
            && self.height >= 2
            && x >= 0.0
            && y >= 0.0
            && x <= (self.width - 2) as f32
            && y <= (self.height - 2) as f32
    }

    /// Bilinear intensity sample. NaN outside the valid support.
    pub fn sample_intensity(&self, x: f32, y: f32) -> f32 {
        if !self.in_support(x, y) || !x.is_finite() || !y.is_finite() {
            return f32::NAN;
        }
        let xi = x.floor() as usize;
        let yi = y.floor() as usize;
        let ax = x - xi as f32;
        let ay = y - yi as f32;
        let idx = yi * self.width + xi;

        let top = (1.0 - ax) * self.data[idx].x + ax * self.data[idx + 1].x;
        let bot = (1.0 - ax) * self.data[idx + self.width].x + ax * self.data[idx + self.width + 1].x;
        (1.0 - ay) * top + ay * bot
    }

    /// Bilinear sample of (intensity, dI/dx, dI/dy). All-NaN outside the
    /// valid support.
    pub fn sample_with_gradient(&self, x: f32, y: f32) -> Vector3<f32> {
        if !self.in_support(x, y) || !x.is_finite() || !y.is_finite() {
            return Vector3::repeat(f32::NAN);
        }
        let xi = x.floor() as usize;
        let yi = y.floor() as usize;
        let ax = x - xi as f32;
        let ay = y - yi as f32;
        let idx = yi * self.width + xi;

        let top = (1.0 - ax) * self.data[idx] + ax * self.data[idx + 1];
        let bot =
            (1.0 - ax) * self.data[idx + self.width] + ax * self.data[idx + self.width + 1];
        (1.0 - ay) * top + ay * bot
    }
}

/// Full pyramid; level 0 is the input resolution.
#[derive(Debug, Clone)]
pub struct ImagePyramid {
    levels: Vec<PyramidLevel>,
}

impl ImagePyramid {
    /// Build `num_levels` levels from a raw intensity image.
    ///
    /// Dimensions must stay divisible far enough for the requested levels;
    /// tracing only ever touches level 0, coarser levels serve the outer
    /// initializer and coarse tracker.
    pub fn new(intensity: &[f32], width: usize, height: usize, num_levels: usize) -> Self {
        assert!(num_levels >= 1);
        let mut levels = Vec::with_capacity(num_levels);
        levels.push(PyramidLevel::from_intensity(intensity, width, height));
        for _ in 1..num_levels {
            let next = levels.last().unwrap().downsample();
            levels.push(next);
        }
        Self { levels }
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn level(&self, level: usize) -> &PyramidLevel {
        &self.levels[level]
    }
}
