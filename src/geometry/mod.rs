//! Geometry utilities: rigid transforms and projective point mappings.

pub mod projection;
pub mod se3;

pub use projection::{d_res_d_idepth, project_full, project_simple, Projection};
pub use se3::SE3;
