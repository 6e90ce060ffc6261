mod dataset;
pub use dataset::*;
mod camera;
pub use camera::*;
mod params;
pub use params::*;
mod keypoint;
pub use keypoint::*;
mod mappoint;
pub use mappoint::*;
mod frame;
pub use frame::*;
mod map;
pub use map::*;
pub mod geometry;

use sophus::nalgebra::Vector3;

pub type Real = f64;
pub type PointCoordinates = Vector3<Real>;
pub type ImageCoordinates = Vector3<Real>;

/// Monotonic id type shared by frames, keyframes, keypoints and map points.
pub type Id = u64;
