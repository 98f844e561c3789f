//! Frames and frame storage.
//!
//! A [`Frame`] owns an image pyramid (intensity + gradient channels) plus the
//! photometric calibration of its exposure. Frames live in a [`FrameStore`]
//! and are referenced everywhere else by [`FrameId`]; the windowed system
//! that owns the store may drop frames at any time between tracing passes,
//! so every dereference goes through `FrameStore::get` and a dead handle is
//! reported as an out-of-bounds result, never touched memory.

pub mod camera;
pub mod precalc;
pub mod pyramid;

use std::collections::HashMap;

pub use camera::Camera;
pub use precalc::{AffineLight, FramePrecalc};
pub use pyramid::{ImagePyramid, PyramidLevel};

/// Unique identifier for a frame within a [`FrameStore`].
///
/// Lightweight handle for cross-referencing without Arc/Rc, which keeps
/// frame ownership in one place and avoids cyclic references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub u64);

impl FrameId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "F{}", self.0)
    }
}

/// A single camera frame: pyramid plus photometric state.
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: FrameId,
    pub pyramid: ImagePyramid,
    /// Exposure time in seconds (1.0 when the sensor does not report it).
    pub exposure: f32,
    /// Per-frame affine brightness parameters, estimated by the outer
    /// tracker.
    pub aff_light: AffineLight,
}

impl Frame {
    /// Width of the full-resolution level.
    pub fn width(&self) -> usize {
        self.pyramid.level(0).width
    }

    /// Height of the full-resolution level.
    pub fn height(&self) -> usize {
        self.pyramid.level(0).height
    }

    /// The full-resolution level; all immature-point operations sample here.
    pub fn full_level(&self) -> &PyramidLevel {
        self.pyramid.level(0)
    }
}

/// Container issuing stable [`FrameId`] handles.
#[derive(Debug, Default)]
pub struct FrameStore {
    frames: HashMap<FrameId, Frame>,
    next_id: u64,
}

impl FrameStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a frame built from a raw intensity image.
    pub fn insert(
        &mut self,
        intensity: &[f32],
        width: usize,
        height: usize,
        num_levels: usize,
        exposure: f32,
        aff_light: AffineLight,
    ) -> FrameId {
        let id = FrameId::new(self.next_id);
        self.next_id += 1;
        self.frames.insert(
            id,
            Frame {
                id,
                pyramid: ImagePyramid::new(intensity, width, height, num_levels),
                exposure,
                aff_light,
            },
        );
        id
    }

    /// Look up a frame; `None` once the frame has been dropped.
    pub fn get(&self, id: FrameId) -> Option<&Frame> {
        self.frames.get(&id)
    }

    /// Drop a frame. Existing handles to it become dead and all point
    /// operations referencing them fail as out-of-bounds.
    pub fn remove(&mut self, id: FrameId) -> bool {
        self.frames.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
