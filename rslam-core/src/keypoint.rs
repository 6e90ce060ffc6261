use sophus::nalgebra::{Point2, Vector3};

use crate::Id;

/// A single tracked 2D observation, optionally backed by a 3D map point.
///
/// `position` is always populated (a unit bearing ray computed from the
/// undistorted pixel, `spec.md` §3); `is_3d` only reflects whether the
/// backing map point has been triangulated, not whether the bearing itself
/// is known.
#[derive(Debug, Clone)]
pub struct Keypoint {
    pub id: Id,
    pub pixel: Point2<f64>,
    pub undistorted_pixel: Point2<f64>,
    pub right_pixel: Option<Point2<f64>>,
    pub position: Vector3<f64>,
    pub is_3d: bool,
    pub descriptor: Option<Vec<u8>>,
}

impl Keypoint {
    pub fn new(id: Id, pixel: Point2<f64>, undistorted_pixel: Point2<f64>, position: Vector3<f64>) -> Self {
        Self {
            id,
            pixel,
            undistorted_pixel,
            right_pixel: None,
            position,
            is_3d: false,
            descriptor: None,
        }
    }

    pub fn is_stereo(&self) -> bool {
        self.right_pixel.is_some()
    }
}

/// Hamming distance between two equal-length binary descriptors (e.g. ORB).
/// Returns `u32::MAX` when lengths differ, signalling "incomparable" to
/// callers in local-map matching rather than panicking.
pub fn descriptor_distance(a: &[u8], b: &[u8]) -> u32 {
    if a.len() != b.len() {
        return u32::MAX;
    }
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x ^ y).count_ones())
        .sum()
}
