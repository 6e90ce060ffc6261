//! Stereo and temporal triangulation passes run by the Mapper (`spec.md`
//! §4.4.1, §4.4.2) on top of the `triangulate` DLT kernel in
//! `rslam_core::geometry`.

use std::collections::HashMap;

use anyhow::Result;
use sophus::nalgebra::Point2;

use rslam_core::geometry::{
    from_homogeneous, identity_pose, inv_se3, project_camera_to_world, projection_matrix,
    pose_to_3x4, reference_to_camera, rotate_vector, to_homogeneous, transform_point4,
    triangulate, Pose, TriangulationCache,
};
use rslam_core::{Camera, Id, Map};

#[derive(Debug, Clone, Copy)]
pub struct TriangulationParams {
    pub max_reprojection_error: f64,
}

impl Default for TriangulationParams {
    fn default() -> Self {
        Self { max_reprojection_error: 1.0 }
    }
}

const MIN_DEPTH: f64 = 0.1;
const TEMPORAL_PARALLAX_THRESHOLD: f64 = 20.0;

/// `spec.md` §4.4.1: resolves every stereo-paired 2D keypoint of `kfid` into
/// a 3D map point, or drops the stereo pairing (keeping the 2D observation)
/// when the pair fails a depth or reprojection check.
pub fn triangulate_stereo<L: Camera, R: Camera>(
    map: &Map,
    left_camera: &L,
    right_camera: &R,
    kfid: Id,
    params: &TriangulationParams,
    cache: &mut TriangulationCache,
) -> Result<()> {
    let Some(kf) = map.get_keyframe(kfid) else {
        return Ok(());
    };

    let p_left = projection_matrix(left_camera, &pose_to_3x4(&identity_pose()));
    let ti0 = reference_to_camera(right_camera);
    let p_right = projection_matrix(right_camera, &pose_to_3x4(&ti0));

    let pending: Vec<(Id, Point2<f64>, Point2<f64>)> = kf
        .keypoints
        .values()
        .filter(|kp| !kp.is_3d)
        .filter_map(|kp| {
            let right = kp.right_pixel?;
            Some((kp.id, kp.undistorted_pixel, right_camera.undistort_pixel(&right)))
        })
        .collect();

    for (kpid, left_px, right_px) in pending {
        let homogeneous = triangulate(&left_px, &right_px, &p_left, &p_right, cache);
        let point_left = from_homogeneous(&homogeneous);
        let point_right = from_homogeneous(&transform_point4(&ti0, &to_homogeneous(&point_left)));

        let reproj_left = left_camera.project_undistort(&point_left);
        let reproj_right = right_camera.project_undistort(&point_right);

        let accepted = point_left.z > MIN_DEPTH
            && point_right.z > MIN_DEPTH
            && reproj_left
                .map(|p| (p - left_px).norm() <= params.max_reprojection_error)
                .unwrap_or(false)
            && reproj_right
                .map(|p| (p - right_px).norm() <= params.max_reprojection_error)
                .unwrap_or(false);

        if !accepted {
            map.remove_stereo_keypoint(kfid, kpid)?;
            continue;
        }

        let world = from_homogeneous(&project_camera_to_world(&kf, &to_homogeneous(&point_left)));
        map.update_mappoint(kpid, world)?;
    }

    Ok(())
}

/// `spec.md` §4.4.2: promotes 2D keypoints of `kfid` that are also observed
/// by an older keyframe into 3D map points once their parallax is large
/// enough to triangulate reliably. Low-parallax pairs are left untouched for
/// a later, more separated keyframe to resolve.
pub fn triangulate_temporal<C: Camera>(
    map: &Map,
    camera: &C,
    kfid: Id,
    params: &TriangulationParams,
    cache: &mut TriangulationCache,
) -> Result<()> {
    let Some(current) = map.get_keyframe(kfid) else {
        return Ok(());
    };

    let mut rel_pose_cache: HashMap<Id, (Pose, Pose)> = HashMap::new();

    let pending: Vec<Id> = current.keypoints.values().filter(|kp| !kp.is_3d).map(|kp| kp.id).collect();

    for kpid in pending {
        let Some(mp) = map.get_mappoint(kpid) else { continue };
        let Some(observer_id) = mp.first_observer() else { continue };
        if observer_id == kfid || mp.observers.len() < 2 {
            continue;
        }
        let Some(observer) = map.get_keyframe(observer_id) else { continue };
        let Some(current_kp) = map.get_keypoint(kfid, kpid) else { continue };
        let Some(observer_kp) = map.get_keypoint(observer_id, kpid) else { continue };

        let (rel_pose, rel_pose_inv) = rel_pose_cache
            .entry(observer_id)
            .or_insert_with(|| {
                let rel = observer.cw * current.wc;
                let rel_inv = inv_se3(&rel);
                (rel, rel_inv)
            })
            .clone();

        let p1 = projection_matrix(camera, &pose_to_3x4(&identity_pose()));
        let p2 = projection_matrix(camera, &pose_to_3x4(&rel_pose_inv));

        let homogeneous = triangulate(
            &observer_kp.undistorted_pixel,
            &current_kp.undistorted_pixel,
            &p1,
            &p2,
            cache,
        );
        let point_in_observer = from_homogeneous(&homogeneous);
        let point_in_current =
            from_homogeneous(&transform_point4(&rel_pose_inv, &to_homogeneous(&point_in_observer)));

        let rotated_bearing = rotate_vector(&rel_pose, &current_kp.position);
        let parallax = match camera.project_undistort(&rotated_bearing) {
            Some(p) => (p - observer_kp.undistorted_pixel).norm(),
            None => f64::INFINITY,
        };

        if parallax <= TEMPORAL_PARALLAX_THRESHOLD {
            continue;
        }

        let reproj_observer = camera.project_undistort(&point_in_observer);
        let reproj_current = camera.project_undistort(&point_in_current);

        // `spec.md` §4.4.2 only names "negative depth in either view" here,
        // unlike §4.4.1's explicit "depth < 0.1" floor for the stereo pass —
        // so the temporal reject uses a strict non-positive check rather
        // than reusing `MIN_DEPTH`.
        let bad_geometry = point_in_observer.z <= 0.0
            || point_in_current.z <= 0.0
            || reproj_observer
                .map(|p| (p - observer_kp.undistorted_pixel).norm() > params.max_reprojection_error)
                .unwrap_or(true)
            || reproj_current
                .map(|p| (p - current_kp.undistorted_pixel).norm() > params.max_reprojection_error)
                .unwrap_or(true);

        if bad_geometry {
            map.remove_mappoint_obs(kpid, kfid)?;
        } else {
            let world = from_homogeneous(&project_camera_to_world(&observer, &to_homogeneous(&point_in_observer)));
            map.update_mappoint(kpid, world)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rslam_core::geometry::pose_from_rt;
    use rslam_core::{Keypoint, Map};
    use rslam_sensor::pinhole_camera::PinholeCamera;
    use sophus::core::linalg::VecF64;
    use sophus::image::ImageSize;
    use sophus::nalgebra::{Matrix3, Vector3};
    use sophus::sensor::camera_enum::perspective_camera::PinholeCameraF64;

    fn test_camera() -> PinholeCamera {
        let model = PinholeCameraF64::from_params_and_size(
            &VecF64::<4>::new(500.0, 500.0, 320.0, 240.0),
            ImageSize::new(640, 480),
        );
        PinholeCamera::new(model)
    }

    #[test]
    fn stereo_pair_with_good_geometry_is_promoted() {
        let map = Map::new();
        map.begin_frame();
        let kfid = map.create_keyframe();

        let left_camera = test_camera();
        let right_camera = test_camera()
            .with_camera_to_robot(sophus::lie::Isometry3F64::from_translation(&VecF64::<3>::new(-0.1, 0.0, 0.0)));

        let world = Vector3::new(0.1, -0.05, 3.0);
        let left_px = left_camera.project_undistort(&world).unwrap();
        let ti0 = rslam_core::geometry::reference_to_camera(&right_camera);
        let right_point = from_homogeneous_test(&ti0, &world);
        let right_px = right_camera.project_undistort(&right_point).unwrap();

        let mut kp = Keypoint::new(1, left_px, left_px, left_camera.unproject(&left_px));
        kp.right_pixel = Some(right_px);
        map.insert_2d_keypoint(kfid, kp);

        let mut cache = TriangulationCache::default();
        triangulate_stereo(&map, &left_camera, &right_camera, kfid, &TriangulationParams::default(), &mut cache).unwrap();

        let point = map.world_point_of(1).expect("triangulated");
        assert!((point - world).norm() < 1e-6);
    }

    #[test]
    fn stereo_pair_with_bad_geometry_keeps_keypoint_but_drops_pairing() {
        let map = Map::new();
        map.begin_frame();
        let kfid = map.create_keyframe();

        let left_camera = test_camera();
        let right_camera = test_camera()
            .with_camera_to_robot(sophus::lie::Isometry3F64::from_translation(&VecF64::<3>::new(-0.1, 0.0, 0.0)));

        let left_px = Point2::new(320.0, 240.0);
        let right_px = Point2::new(322.0, 40.0); // inconsistent with any valid epipolar pairing

        let mut kp = Keypoint::new(7, left_px, left_px, left_camera.unproject(&left_px));
        kp.right_pixel = Some(right_px);
        map.insert_2d_keypoint(kfid, kp);

        let mut cache = TriangulationCache::default();
        triangulate_stereo(&map, &left_camera, &right_camera, kfid, &TriangulationParams::default(), &mut cache).unwrap();

        assert!(map.world_point_of(7).is_none());
        let kp = map.get_keypoint(kfid, 7).expect("keypoint retained");
        assert!(kp.right_pixel.is_none());
    }

    #[test]
    fn temporal_pair_with_enough_parallax_is_promoted() {
        let map = Map::new();
        map.begin_frame();
        let observer_kfid = map.create_keyframe();

        let camera = test_camera();
        let world = Vector3::new(0.3, 0.1, 2.0);
        let observer_px = camera.project_undistort(&world).unwrap();

        let kp = Keypoint::new(3, observer_px, observer_px, camera.unproject(&observer_px));
        map.insert_2d_keypoint(observer_kfid, kp);

        // A second keyframe translated 0.6m to the side, re-observing the same
        // landmark with enough parallax to triangulate.
        let translated_wc = pose_from_rt(Matrix3::identity(), Vector3::new(0.6, 0.0, 0.0));
        map.begin_frame();
        map.with_current_frame_mut(|f| f.set_wc(translated_wc));
        let current_kfid = map.create_keyframe();

        let current_camera_point = from_homogeneous_test(&inv_se3(&translated_wc), &world);
        let current_px = camera.project_undistort(&current_camera_point).unwrap();
        let current_kp = Keypoint::new(3, current_px, current_px, camera.unproject(&current_px));
        map.add_keypoint_observation(current_kfid, current_kp);

        let mut cache = TriangulationCache::default();
        triangulate_temporal(&map, &camera, current_kfid, &TriangulationParams::default(), &mut cache).unwrap();

        let point = map.world_point_of(3).expect("triangulated");
        assert!((point - world).norm() < 1e-4);
    }

    /// `spec.md` §8 scenario 5: low parallax must leave the keypoint
    /// retained as 2D rather than removed or promoted, even with a shallow
    /// depth. Zero camera motion between the two keyframes gives identical
    /// pixels for the same keypoint id and therefore zero parallax.
    #[test]
    fn temporal_pair_with_low_parallax_is_deferred_not_removed() {
        let map = Map::new();
        map.begin_frame();
        let observer_kfid = map.create_keyframe();

        let camera = test_camera();
        // depth 0.05 m: well under the stereo pass's 0.1 m floor.
        let point_in_observer = Vector3::new(0.01, 0.005, 0.05);
        let observer_px = raw_pixel(&camera, &point_in_observer);
        let kp = Keypoint::new(4, observer_px, observer_px, camera.unproject(&observer_px));
        map.insert_2d_keypoint(observer_kfid, kp);

        // No camera motion at all: the same keypoint reappears at the same
        // pixel in the next keyframe, so parallax is exactly zero.
        map.begin_frame();
        let current_kfid = map.create_keyframe();
        let current_kp = Keypoint::new(4, observer_px, observer_px, camera.unproject(&observer_px));
        map.add_keypoint_observation(current_kfid, current_kp);

        let mut cache = TriangulationCache::default();
        triangulate_temporal(&map, &camera, current_kfid, &TriangulationParams::default(), &mut cache).unwrap();

        assert!(map.world_point_of(4).is_none());
        let kp = map.get_keypoint(current_kfid, 4).expect("keypoint retained, not removed");
        assert!(!kp.is_3d);
    }

    /// `spec.md` §8 invariant: "Temporal triangulation never promotes a map
    /// point to 3D with negative depth in either participating camera."
    /// Both views here see the synthetic landmark behind the camera
    /// (negative depth in the observer frame, and still negative once
    /// carried into the current frame by a pure sideways translation), so
    /// even though the pixels imply more than enough parallax to attempt
    /// triangulation, the result must be rejected rather than promoted.
    #[test]
    fn temporal_pair_with_negative_depth_is_never_promoted() {
        let map = Map::new();
        map.begin_frame();
        let observer_kfid = map.create_keyframe();

        let camera = test_camera();
        let point_in_observer = Vector3::new(0.3, 0.1, -2.0);
        let observer_px = raw_pixel(&camera, &point_in_observer);
        let observer_kp = Keypoint::new(9, observer_px, observer_px, point_in_observer.normalize());
        map.insert_2d_keypoint(observer_kfid, observer_kp);

        let translated_wc = pose_from_rt(Matrix3::identity(), Vector3::new(0.6, 0.0, 0.0));
        map.begin_frame();
        map.with_current_frame_mut(|f| f.set_wc(translated_wc));
        let current_kfid = map.create_keyframe();

        let rel_pose_inv = inv_se3(&translated_wc);
        let point_in_current = from_homogeneous_test(&rel_pose_inv, &point_in_observer);
        let current_px = raw_pixel(&camera, &point_in_current);
        let current_kp = Keypoint::new(9, current_px, current_px, point_in_current.normalize());
        map.add_keypoint_observation(current_kfid, current_kp);

        let mut cache = TriangulationCache::default();
        triangulate_temporal(&map, &camera, current_kfid, &TriangulationParams::default(), &mut cache).unwrap();

        assert!(map.world_point_of(9).is_none());
    }

    /// Projects `point` through `camera`'s ideal pinhole model without the
    /// positive-depth guard `Camera::project_undistort` enforces, so tests
    /// can fabricate pixel/bearing pairs for points behind the camera.
    fn raw_pixel(camera: &PinholeCamera, point: &Vector3<f64>) -> Point2<f64> {
        Point2::new(
            camera.fx() * point.x / point.z + camera.cx(),
            camera.fy() * point.y / point.z + camera.cy(),
        )
    }

    fn from_homogeneous_test(pose: &Pose, point: &Vector3<f64>) -> Vector3<f64> {
        from_homogeneous(&transform_point4(pose, &to_homogeneous(point)))
    }
}
