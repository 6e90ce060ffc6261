//! Pure SE(3) and projection helpers shared by the front-end and mapper.
//!
//! Poses are carried as 4x4 homogeneous matrices (`sophus::nalgebra::Matrix4`)
//! rather than as `sophus::lie::Isometry3F64` group elements: the map store
//! only ever composes, inverts and applies rigid transforms to points, and
//! doing that directly on the matrix form keeps every operation here a
//! plain, auditable linear-algebra contract (`spec.md` §6's "specialized
//! 4x4 rigid inverse" kernel) instead of routing through unrelated Lie-group
//! machinery.

use sophus::nalgebra::{Matrix3x4, Matrix4, Vector3, Vector4};

use crate::Camera;
use crate::Frame;

pub type Pose = Matrix4<f64>;

pub fn identity_pose() -> Pose {
    Matrix4::identity()
}

pub fn pose_from_rt(rotation: sophus::nalgebra::Matrix3<f64>, translation: Vector3<f64>) -> Pose {
    let mut m = Matrix4::identity();
    m.fixed_view_mut::<3, 3>(0, 0).copy_from(&rotation);
    m.fixed_view_mut::<3, 1>(0, 3).copy_from(&translation);
    m
}

/// `inv(SE3, T)` — the specialized rigid inverse external kernel of
/// `spec.md` §6, exploiting the block structure of a homogeneous rigid
/// transform instead of a general 4x4 matrix inverse.
pub fn inv_se3(pose: &Pose) -> Pose {
    let r = pose.fixed_view::<3, 3>(0, 0).into_owned();
    let t = pose.fixed_view::<3, 1>(0, 3).into_owned();
    let rt = r.transpose();
    let neg_rt_t = -(rt * t);
    pose_from_rt(rt, Vector3::new(neg_rt_t.x, neg_rt_t.y, neg_rt_t.z))
}

pub fn transform_point4(pose: &Pose, point: &Vector4<f64>) -> Vector4<f64> {
    pose * point
}

/// Applies only the rotational part of `pose` to a direction vector
/// (used to carry a bearing between camera frames for parallax checks).
pub fn rotate_vector(pose: &Pose, v: &Vector3<f64>) -> Vector3<f64> {
    pose.fixed_view::<3, 3>(0, 0).into_owned() * v
}

pub fn to_homogeneous(point: &Vector3<f64>) -> Vector4<f64> {
    Vector4::new(point.x, point.y, point.z, 1.0)
}

pub fn from_homogeneous(point: &Vector4<f64>) -> Vector3<f64> {
    Vector3::new(point.x / point.w, point.y / point.w, point.z / point.w)
}

/// `project_world_to_camera` — transforms a homogeneous world point into the
/// frame's camera coordinates via its cached camera-from-world pose.
pub fn project_world_to_camera(frame: &Frame, world: &Vector4<f64>) -> Vector4<f64> {
    transform_point4(&frame.cw, world)
}

/// `project_camera_to_world` — the inverse transform, via the frame's cached
/// world-from-camera pose.
pub fn project_camera_to_world(frame: &Frame, cam: &Vector4<f64>) -> Vector4<f64> {
    transform_point4(&frame.wc, cam)
}

/// `project_world_to_image_distort` — full chain from a world point through
/// a frame's pose and a camera's distortion model to a raw pixel.
pub fn project_world_to_image_distort<C: Camera>(
    camera: &C,
    frame: &Frame,
    world: &Vector3<f64>,
) -> Option<sophus::nalgebra::Point2<f64>> {
    let cam4 = project_world_to_camera(frame, &to_homogeneous(world));
    camera.project(&from_homogeneous(&cam4))
}

/// The rigid transform from the reference (left) camera frame into `camera`'s
/// own frame, i.e. `Ti0` in `spec.md` §4.4.1's stereo pair notation. For the
/// reference camera itself this is the identity; `camera_to_robot` is reused
/// here as the per-camera extrinsic, with the stereo rig's left camera
/// standing in for "robot".
pub fn reference_to_camera<C: Camera>(camera: &C) -> Pose {
    inv_se3(&camera.camera_to_robot().matrix())
}

/// Reusable scratch space for `triangulate`, per `spec.md` §6 ("via a
/// shared cache"): avoids reallocating the 4x4 design matrix on every call.
#[derive(Debug, Default)]
pub struct TriangulationCache {
    design_matrix: Matrix4<f64>,
}

/// Linear (DLT) triangulation of a point seen by two calibrated views.
///
/// `triangulate(pixel_a, pixel_b, P_a, P_b, cache) -> homogeneous4` of
/// `spec.md` §6. Returns the *unnormalized* homogeneous solution; callers
/// divide by `w` themselves (the Mapper's "homogeneously normalize" step).
pub fn triangulate(
    pixel_a: &sophus::nalgebra::Point2<f64>,
    pixel_b: &sophus::nalgebra::Point2<f64>,
    p_a: &Matrix3x4<f64>,
    p_b: &Matrix3x4<f64>,
    cache: &mut TriangulationCache,
) -> Vector4<f64> {
    let a = &mut cache.design_matrix;
    for col in 0..4 {
        a[(0, col)] = pixel_a.x * p_a[(2, col)] - p_a[(0, col)];
        a[(1, col)] = pixel_a.y * p_a[(2, col)] - p_a[(1, col)];
        a[(2, col)] = pixel_b.x * p_b[(2, col)] - p_b[(0, col)];
        a[(3, col)] = pixel_b.y * p_b[(2, col)] - p_b[(1, col)];
    }
    let svd = a.svd(false, true);
    let v_t = svd.v_t.expect("v_t requested");
    let row = v_t.row(v_t.nrows() - 1);
    Vector4::new(row[0], row[1], row[2], row[3])
}

/// Builds the `K * [R|t]` 3x4 projection matrix for a camera sitting at
/// `pose` (camera-from-reference).
pub fn projection_matrix<C: Camera>(camera: &C, pose: &Matrix3x4<f64>) -> Matrix3x4<f64> {
    let k = sophus::nalgebra::Matrix3::new(
        camera.fx(), 0.0, camera.cx(),
        0.0, camera.fy(), camera.cy(),
        0.0, 0.0, 1.0,
    );
    k * pose
}

pub fn pose_to_3x4(pose: &Pose) -> Matrix3x4<f64> {
    pose.fixed_view::<3, 4>(0, 0).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverse_is_involutive() {
        let r = sophus::nalgebra::Matrix3::new(
            1.0, 0.0, 0.0,
            0.0, 0.0, -1.0,
            0.0, 1.0, 0.0,
        );
        let pose = pose_from_rt(r, Vector3::new(1.0, 2.0, 3.0));
        let back = inv_se3(&inv_se3(&pose));
        for i in 0..4 {
            for j in 0..4 {
                assert!((back[(i, j)] - pose[(i, j)]).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn inverse_round_trips_a_point() {
        let r = sophus::nalgebra::Matrix3::identity();
        let pose = pose_from_rt(r, Vector3::new(1.0, -2.0, 0.5));
        let p = Vector4::new(3.0, 4.0, 5.0, 1.0);
        let cam = transform_point4(&pose, &p);
        let world = transform_point4(&inv_se3(&pose), &cam);
        assert!((world - p).norm() < 1e-9);
    }
}
