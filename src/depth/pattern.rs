//! The fixed residual pattern sampled around every point.
//!
//! Eight offsets arranged in a spread cross around the center pixel; the
//! same pattern is shared process-wide by fingerprint construction, epipolar
//! tracing and residual linearization.

/// Number of pattern offsets.
pub const PATTERN_SIZE: usize = 8;

/// Pixel offsets (dx, dy) relative to the point's location.
#[rustfmt::skip]
pub const PATTERN: [[i32; 2]; PATTERN_SIZE] = [
    [ 0, -2],
    [-1, -1],
    [ 1, -1],
    [-2,  0],
    [ 0,  0],
    [ 2,  0],
    [-1,  1],
    [ 0,  2],
];

/// Furthest offset reach in any direction; sampling a pattern needs at least
/// this much margin around the center.
pub const PATTERN_PADDING: i32 = 2;
