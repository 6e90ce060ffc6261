//! Per-frame optical-flow tracking, initialization detection, and keyframe
//! selection (`spec.md` §4.3).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use crossbeam_channel::Sender;
use opencv::core::{KeyPointTraitConst, Mat, Point2f};
use sophus::nalgebra::Point2;

use rslam_core::geometry::{project_world_to_image_distort, rotate_vector};
use rslam_core::{Camera, Frame, Id, Keypoint, Map, Params, RuntimeState};

use crate::frame_point_generator::FramePointGenerator;
use crate::keyframe_job::KeyFrameJob;
use crate::klt::{fb_tracking, KltParams};
use crate::motion_model::MotionModel;

/// Monotonic keypoint-id allocator. A keypoint's id is reused as its backing
/// map point's id for the lifetime of the observation (`spec.md` §3), so
/// every newly detected keypoint needs a fresh one.
#[derive(Debug, Default)]
struct KeypointIdAllocator(AtomicU64);

impl KeypointIdAllocator {
    fn next(&self) -> Id {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Clone, Copy)]
enum ParallaxStat {
    Median,
    #[allow(dead_code)]
    Mean,
}

/// `compute_parallax` of `spec.md` §4.3.1: median (default) or mean pixel
/// distance between a reference keyframe's undistorted pixels and either the
/// current frame's undistorted pixels, or — with rotation compensation — the
/// projection of the current bearing rotated into the reference frame.
fn compute_parallax<C: Camera>(
    camera: &C,
    reference: &Frame,
    current: &Frame,
    only_2d: bool,
    stat: ParallaxStat,
    compensate_rotation: bool,
) -> f64 {
    let rel_pose = compensate_rotation.then(|| reference.cw * current.wc);

    let mut distances = Vec::with_capacity(reference.keypoints.len());
    for (id, ref_kp) in &reference.keypoints {
        if only_2d && ref_kp.is_3d {
            continue;
        }
        let Some(cur_kp) = current.keypoints.get(id) else { continue };

        let distance = if let Some(rel_pose) = rel_pose {
            let rotated = rotate_vector(&rel_pose, &cur_kp.position);
            match camera.project_undistort(&rotated) {
                Some(p) => (p - ref_kp.undistorted_pixel).norm(),
                None => continue,
            }
        } else {
            (cur_kp.undistorted_pixel - ref_kp.undistorted_pixel).norm()
        };
        distances.push(distance);
    }

    if distances.is_empty() {
        return 0.0;
    }

    match stat {
        ParallaxStat::Mean => distances.iter().sum::<f64>() / distances.len() as f64,
        ParallaxStat::Median => {
            distances.sort_by(|a, b| a.partial_cmp(b).expect("parallax distance is never NaN"));
            let mid = distances.len() / 2;
            if distances.len() % 2 == 0 {
                (distances[mid - 1] + distances[mid]) / 2.0
            } else {
                distances[mid]
            }
        }
    }
}

/// Fraction of 3D-prior keypoints that must succeed KLT before downstream
/// pose recovery is skipped (`spec.md` §4.3 step 4).
const MIN_3D_PRIOR_SUCCESS_RATIO: f64 = 0.33;
const MIN_KEYPOINTS_TO_STAY_INITIALIZED: usize = 50;
const MIN_KEYPOINTS_TO_DECLARE_INITIALIZED: usize = 8;

/// The Front-End Tracker (`spec.md` §4.3). One instance owns the
/// double-buffered image pair and drives the Map Store's current frame
/// forward one tick per call to `track`.
pub struct Tracker<C: Camera> {
    map: Arc<Map>,
    camera: C,
    params: Params,
    state: Arc<RuntimeState>,
    motion_model: MotionModel,
    detector: FramePointGenerator,
    ids: KeypointIdAllocator,

    previous_image: Option<Mat>,
    current_image: Option<Mat>,
    /// The current tick's right-camera image (`spec.md` §6: "Stereo mode
    /// adds a right image"), carried only far enough to hand off to the
    /// Mapper's `KeyFrameJob` on keyframe promotion — the Front-End itself
    /// never tracks against it.
    current_right_image: Option<Mat>,
    reference_keyframe: Option<Id>,

    keyframe_sender: Sender<KeyFrameJob>,
}

impl<C: Camera> Tracker<C> {
    pub fn new(
        map: Arc<Map>,
        camera: C,
        params: Params,
        state: Arc<RuntimeState>,
        keyframe_sender: Sender<KeyFrameJob>,
    ) -> Result<Self> {
        let detector = crate::frame_point_generator::FramePointGeneratorCfg::default()
            .finalize(camera.cols(), camera.rows())?;
        Ok(Self {
            map,
            camera,
            params,
            state,
            motion_model: MotionModel::new(),
            detector,
            ids: KeypointIdAllocator::default(),
            previous_image: None,
            current_image: None,
            current_right_image: None,
            reference_keyframe: None,
            keyframe_sender,
        })
    }

    fn klt_params(&self) -> KltParams {
        KltParams {
            window_size: self.params.window_size as i32,
            pyramid_levels: self.params.pyramid_levels as i32,
            max_ktl_distance: self.params.max_ktl_distance,
        }
    }

    fn enqueue_keyframe(&self, kfid: Id) -> Result<()> {
        let image = self.current_image.clone().unwrap_or_default();
        self.keyframe_sender
            .send(KeyFrameJob::with_images(kfid, image, self.current_right_image.clone()))
            .map_err(|_| anyhow::anyhow!("mapper queue closed"))
    }

    /// `track(image, time) -> bool`, the Front-End's one public entry point
    /// (`spec.md` §4.3). Returns whether a new keyframe was promoted.
    pub fn track(&mut self, image: Mat, time: f64) -> Result<bool> {
        self.track_with_right(image, None, time)
    }

    /// Stereo-mode variant of `track`: same contract, but also carries the
    /// tick's right-camera image (`spec.md` §6) through to the Mapper's
    /// `KeyFrameJob` whenever this tick promotes a keyframe.
    pub fn track_with_right(&mut self, image: Mat, right_image: Option<Mat>, time: f64) -> Result<bool> {
        let previous_frame = self.map.get_current_frame();
        let frame_id = self.map.begin_frame();

        self.previous_image = self.current_image.take();
        self.current_image = Some(image);
        self.current_right_image = right_image;

        if frame_id == 1 {
            return self.bootstrap();
        }

        let predicted = self.motion_model.predict(previous_frame.wc, time);
        self.map.with_current_frame_mut(|f| f.set_wc(predicted));

        self.klt_tracking()?;

        if !self.state.vision_initialized() {
            return self.initialization_gate();
        }

        Ok(self.steady_state_keyframe_trigger())
    }

    /// `spec.md` §4.3 step 2: the very first frame never runs tracking —
    /// only seeds the initial keypoint set and forces a keyframe.
    fn bootstrap(&mut self) -> Result<bool> {
        let frame_id = self.map.current_frame_id();
        let image = self.current_image.as_ref().expect("set just above").clone();
        let detected = self.detector.detect_keypoints(&image)?;

        for cv_kp in detected.iter().take(self.params.max_nb_keypoints) {
            let pt = cv_kp.pt();
            let pixel = Point2::new(pt.x as f64, pt.y as f64);
            let undistorted = self.camera.undistort_pixel(&pixel);
            let position = self.camera.unproject(&undistorted);
            let id = self.ids.next();
            self.map
                .insert_2d_keypoint(frame_id, Keypoint::new(id, pixel, undistorted, position));
        }

        let kfid = self.map.create_keyframe();
        self.reference_keyframe = Some(kfid);
        self.enqueue_keyframe(kfid)?;
        Ok(true)
    }

    /// `spec.md` §4.3 step 4: forward–backward KLT, split into a 3D-prior
    /// pass (seeded by reprojecting the map point) and a plain-prior pass
    /// (seeded at the last pixel), the latter absorbing 3D-prior failures.
    fn klt_tracking(&mut self) -> Result<()> {
        let current = self.map.get_current_frame();

        let mut prior_ids_3d = Vec::new();
        let mut prior_pixels_3d = Vec::new();
        let mut plain_ids = Vec::new();
        let mut plain_pixels = Vec::new();

        for kp in current.keypoints.values() {
            if self.params.use_prior && kp.is_3d {
                if let Some(world) = self.map.world_point_of(kp.id) {
                    if let Some(pixel) = project_world_to_image_distort(&self.camera, &current, &world) {
                        prior_ids_3d.push(kp.id);
                        prior_pixels_3d.push(Point2f::new(pixel.x as f32, pixel.y as f32));
                        continue;
                    }
                }
            }
            plain_ids.push(kp.id);
            plain_pixels.push(Point2f::new(kp.pixel.x as f32, kp.pixel.y as f32));
        }

        let (Some(prev_img), Some(cur_img)) = (self.previous_image.as_ref(), self.current_image.as_ref()) else {
            return Ok(());
        };

        let full_params = self.klt_params();
        let shallow_params = KltParams { pyramid_levels: 1.min(full_params.pyramid_levels), ..full_params };

        let nb_3d_priors = prior_ids_3d.len();
        let result_3d = fb_tracking(prev_img, cur_img, &prior_pixels_3d, &shallow_params)?;

        let mut nb_3d_success = 0usize;
        for (i, &id) in prior_ids_3d.iter().enumerate() {
            if result_3d.status[i] {
                nb_3d_success += 1;
                let np = result_3d.new_pixels[i];
                self.map
                    .update_keypoint(current.id, id, Point2::new(np.x as f64, np.y as f64), &self.camera)?;
            } else {
                plain_ids.push(id);
                plain_pixels.push(np_fallback(&current, id));
            }
        }

        let result_plain = fb_tracking(prev_img, cur_img, &plain_pixels, &full_params)?;
        for (i, &id) in plain_ids.iter().enumerate() {
            if result_plain.status[i] {
                let np = result_plain.new_pixels[i];
                self.map
                    .update_keypoint(current.id, id, Point2::new(np.x as f64, np.y as f64), &self.camera)?;
            } else {
                self.map.remove_obs_from_current_frame(id);
            }
        }

        if nb_3d_priors > 0 && (nb_3d_success as f64) < MIN_3D_PRIOR_SUCCESS_RATIO * nb_3d_priors as f64 {
            self.state.set_p3p_required(true);
        }

        Ok(())
    }

    /// `spec.md` §4.3 step 5. Returns `false` unless parallax against the
    /// reference keyframe clears `initial_parallax`, in which case a
    /// keyframe is forced and `vision_initialized` flips permanently.
    fn initialization_gate(&mut self) -> Result<bool> {
        let current = self.map.get_current_frame();
        if current.nb_keypoints < MIN_KEYPOINTS_TO_STAY_INITIALIZED {
            self.state.set_reset_required(true);
            return Ok(false);
        }

        let Some(reference_id) = self.reference_keyframe else {
            self.state.set_reset_required(true);
            return Ok(false);
        };
        let Some(reference) = self.map.get_keyframe(reference_id) else {
            self.state.set_reset_required(true);
            return Ok(false);
        };

        let parallax =
            compute_parallax(&self.camera, &reference, &current, false, ParallaxStat::Median, true);

        if parallax > self.params.initial_parallax && current.nb_keypoints >= MIN_KEYPOINTS_TO_DECLARE_INITIALIZED {
            self.state.set_vision_initialized(true);
            let kfid = self.map.create_keyframe();
            self.reference_keyframe = Some(kfid);
            self.enqueue_keyframe(kfid)?;
            return Ok(true);
        }

        Ok(false)
    }

    /// `spec.md` §4.3 step 6 and §9's open question: the steady-state
    /// trigger is a deliberate stub — the precise criterion is unspecified
    /// upstream, so keyframe cadence during steady-state tracking currently
    /// defers entirely to the Mapper's own downstream heuristics.
    fn steady_state_keyframe_trigger(&mut self) -> bool {
        false
    }
}

fn np_fallback(frame: &Frame, id: Id) -> Point2f {
    let pixel = frame.keypoints.get(&id).map(|kp| kp.pixel).unwrap_or_default();
    Point2f::new(pixel.x as f32, pixel.y as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rslam_core::Map;
    use sophus::nalgebra::Vector3;

    #[test]
    fn identical_frames_have_zero_parallax() {
        let camera = test_camera();
        let mut frame = Frame::new(1, None);
        let pixel = Point2::new(100.0, 100.0);
        frame.insert_keypoint(Keypoint::new(1, pixel, pixel, camera.unproject(&pixel)));
        let parallax = compute_parallax(&camera, &frame, &frame, false, ParallaxStat::Mean, false);
        assert_eq!(parallax, 0.0);
    }

    #[test]
    fn parallax_is_zero_with_no_shared_keypoints() {
        let camera = test_camera();
        let mut reference = Frame::new(1, None);
        reference.insert_keypoint(Keypoint::new(
            1,
            Point2::new(0.0, 0.0),
            Point2::new(0.0, 0.0),
            Vector3::new(0.0, 0.0, 1.0),
        ));
        let current = Frame::new(2, None);
        let parallax = compute_parallax(&camera, &reference, &current, false, ParallaxStat::Mean, false);
        assert_eq!(parallax, 0.0);
    }

    #[test]
    fn begin_frame_carries_current_frame_keypoints_forward() {
        let map = Map::new();
        map.begin_frame();
        map.with_current_frame_mut(|f| {
            f.insert_keypoint(Keypoint::new(1, Point2::new(1.0, 1.0), Point2::new(1.0, 1.0), Vector3::new(0.0, 0.0, 1.0)))
        });

        let id = map.begin_frame();
        let current = map.get_frame(id).unwrap();
        assert!(current.keypoints.contains_key(&1));
    }

    fn test_camera() -> rslam_sensor::pinhole_camera::PinholeCamera {
        use sophus::core::linalg::VecF64;
        use sophus::image::ImageSize;
        use sophus::sensor::camera_enum::perspective_camera::PinholeCameraF64;
        let model = PinholeCameraF64::from_params_and_size(
            &VecF64::<4>::new(500.0, 500.0, 320.0, 240.0),
            ImageSize::new(640, 480),
        );
        rslam_sensor::pinhole_camera::PinholeCamera::new(model)
    }
}
