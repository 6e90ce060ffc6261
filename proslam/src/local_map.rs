//! Local-map matching: projects the covisible local map into a freshly
//! promoted keyframe and merges redundant map points it rediscovers
//! (`spec.md` §4.4.3).

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use sophus::nalgebra::Point2;

use rslam_core::geometry::{from_homogeneous, project_world_to_camera, to_homogeneous};
use rslam_core::{descriptor_distance, Camera, Frame, Id, Map, MapPoint};

#[derive(Debug, Clone, Copy)]
pub struct LocalMapParams {
    pub max_projection_distance: f64,
    pub max_descriptor_distance: f64,
    pub local_map_target: usize,
}

const MIN_DEPTH: f64 = 0.1;
const FOV_COSINE_THRESHOLD: f64 = 0.5;
const WIDE_GATE_3D_THRESHOLD: usize = 30;

/// `spec.md` §4.4.3. Only runs meaningfully once `kfid > 0` has a
/// predecessor to draw a local map from; callers gate on that themselves.
pub fn match_local_map<C: Camera>(map: &Map, camera: &C, kfid: Id, params: &LocalMapParams) -> Result<()> {
    let Some(kf) = map.get_keyframe(kfid) else {
        return Ok(());
    };

    if map.candidate_mappoints(kfid).len() < params.local_map_target {
        if let Some(oldest) = map.oldest_covisible(kfid) {
            map.union_local_map(kfid, oldest);
        }
    }

    let observed: HashSet<Id> = kf.keypoints.keys().copied().collect();
    let projection_distance = if kf.nb_3d_kpts < WIDE_GATE_3D_THRESHOLD {
        params.max_projection_distance * 2.0
    } else {
        params.max_projection_distance
    };

    // Keyed by the *surrounding* keypoint id, since a single surrounding
    // keypoint may attract several candidates and only the closest survives.
    let mut merge_plan: HashMap<Id, (Id, u32)> = HashMap::new();

    for candidate_id in map.candidate_mappoints(kfid) {
        if observed.contains(&candidate_id) {
            continue;
        }
        let Some(candidate) = map.get_mappoint(candidate_id) else { continue };
        if !candidate.is_3d {
            continue;
        }

        let cam4 = project_world_to_camera(&kf, &to_homogeneous(&candidate.world));
        let cam_point = from_homogeneous(&cam4);
        if cam_point.z < MIN_DEPTH {
            continue;
        }
        if cam_point.z / cam_point.norm() < FOV_COSINE_THRESHOLD {
            continue;
        }
        let Some(projected) = camera.project_undistort(&cam_point) else { continue };
        if !camera.in_image(&projected) {
            continue;
        }

        let Some((surrounding_id, distance)) = find_best_match(
            map,
            camera,
            &kf,
            &candidate,
            &projected,
            projection_distance,
            params.max_descriptor_distance,
        ) else {
            continue;
        };

        merge_plan
            .entry(surrounding_id)
            .and_modify(|existing| {
                if distance < existing.1 {
                    *existing = (candidate_id, distance);
                }
            })
            .or_insert((candidate_id, distance));
    }

    map.with_optimization_lock(|| -> Result<()> {
        for (surrounding_id, (candidate_id, _)) in merge_plan {
            map.merge_mappoints(candidate_id, surrounding_id)?;
        }
        Ok(())
    })
}

/// Screens `kf`'s own keypoints near `projection` for the best match to
/// `candidate`: pixel distance, disjoint observer sets, the candidate's own
/// average reprojection across its existing observers, and descriptor
/// distance. Tracks the best and second-best descriptor distance, though the
/// Lowe-ratio gate between them is, per the upstream design note, computed
/// but left unenforced.
fn find_best_match<C: Camera>(
    map: &Map,
    camera: &C,
    kf: &Frame,
    candidate: &MapPoint,
    projection: &Point2<f64>,
    max_projection_distance: f64,
    max_descriptor_distance: f64,
) -> Option<(Id, u32)> {
    let candidate_reprojection_ok = average_reprojection(map, camera, candidate) <= max_projection_distance;
    if !candidate_reprojection_ok {
        return None;
    }

    let mut best: Option<(Id, u32)> = None;
    let mut second_best = u32::MAX;

    for kp in kf.keypoints.values() {
        if (kp.undistorted_pixel - projection).norm() > max_projection_distance {
            continue;
        }
        let Some(surrounding) = map.get_mappoint(kp.id) else { continue };
        if surrounding.observers.iter().any(|o| candidate.observers.contains(o)) {
            continue;
        }
        let (Some(a), Some(b)) = (&surrounding.descriptor, &candidate.descriptor) else {
            continue;
        };
        let distance = descriptor_distance(a, b);
        if distance as f64 > max_descriptor_distance {
            continue;
        }

        match best {
            None => best = Some((kp.id, distance)),
            Some((_, best_d)) if distance < best_d => {
                second_best = best_d;
                best = Some((kp.id, distance));
            }
            Some(_) if distance < second_best => second_best = distance,
            _ => {}
        }
    }

    let _ = second_best;
    best
}

/// Average pixel reprojection error of `candidate`'s own world point across
/// every keyframe that already observes it — a sanity gate on the
/// candidate's triangulation quality before it is allowed to absorb a new
/// observation.
fn average_reprojection<C: Camera>(map: &Map, camera: &C, candidate: &MapPoint) -> f64 {
    let mut total = 0.0;
    let mut count = 0usize;
    for &observer_id in &candidate.observers {
        let Some(observer_kf) = map.get_keyframe(observer_id) else { continue };
        let Some(kp) = map.get_keypoint(observer_id, candidate.id) else { continue };
        let cam4 = project_world_to_camera(&observer_kf, &to_homogeneous(&candidate.world));
        let Some(reprojected) = camera.project_undistort(&from_homogeneous(&cam4)) else {
            continue;
        };
        total += (reprojected - kp.undistorted_pixel).norm();
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        total / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rslam_core::geometry::pose_from_rt;
    use rslam_core::Keypoint;
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
    fn disjoint_matching_descriptors_merge_into_surviving_surrounding_point() {
        let map = Map::new();
        let camera = test_camera();

        map.begin_frame();
        let kf_a = map.create_keyframe();
        let world_a = Vector3::new(0.05, 0.0, 3.0);
        let px_a = camera.project_undistort(&world_a).unwrap();
        let mut kp_a = Keypoint::new(10, px_a, px_a, camera.unproject(&px_a));
        kp_a.descriptor = Some(vec![0b1010_1010; 4]);
        map.insert_2d_keypoint(kf_a, kp_a);
        map.update_mappoint(10, world_a).unwrap();

        let translated_wc = pose_from_rt(Matrix3::identity(), Vector3::new(0.02, 0.0, 0.0));
        map.begin_frame();
        map.with_current_frame_mut(|f| f.set_wc(translated_wc));
        let kf_b = map.create_keyframe();

        // A 3 px offset from where point 10 truly projects into kf_b.
        let px_b = Point2::new(px_a.x + 3.0, px_a.y);
        let mut kp_b = Keypoint::new(20, px_b, px_b, camera.unproject(&px_b));
        kp_b.descriptor = Some(vec![0b1010_1010; 4]);
        map.insert_2d_keypoint(kf_b, kp_b);
        map.update_mappoint(20, Vector3::new(0.08, 0.0, 3.0)).unwrap();

        map.update_frame_covisibility(kf_a).unwrap();
        map.update_frame_covisibility(kf_b).unwrap();
        map.union_local_map(kf_b, kf_a);

        let params = LocalMapParams {
            max_projection_distance: 10.0,
            max_descriptor_distance: 64.0,
            local_map_target: 0,
        };
        match_local_map(&map, &camera, kf_b, &params).unwrap();

        assert!(map.get_mappoint(10).is_none());
        let surviving = map.get_mappoint(20).expect("surviving point");
        assert!(surviving.observers.contains(&kf_a));
        assert!(surviving.observers.contains(&kf_b));
    }
}
