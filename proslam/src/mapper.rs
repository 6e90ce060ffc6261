//! The Mapper background worker (`spec.md` §4.4): consumes keyframe jobs off
//! the Front-End's FIFO, triangulates new 3D map points, grows the
//! covisibility graph, merges redundant map points via local-map matching,
//! and hands the keyframe off to the `Estimator`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use opencv::core::Point2f;
use sophus::nalgebra::Point2;

use rslam_core::geometry::TriangulationCache;
use rslam_core::{Camera, Id, Map, Params, RuntimeState};

use crate::estimator::Estimator;
use crate::keyframe_job::KeyFrameJob;
use crate::klt::{fb_tracking, KltParams};
use crate::local_map::{match_local_map, LocalMapParams};
use crate::triangulation::{triangulate_stereo, triangulate_temporal, TriangulationParams};

/// How long the Mapper blocks on an empty queue before re-checking
/// `exit_required` (`spec.md` §4.4 step 1: "if empty, sleep briefly and
/// retry"; realized here as `recv_timeout` on the bounded channel rather
/// than a busy poll, per `spec.md` §5's preference for a condition variable).
const POLL_INTERVAL: Duration = Duration::from_millis(20);

const RESET_GATE_FIRST_KEYFRAME: usize = 30;
const RESET_GATE_EARLY_KEYFRAME: usize = 3;
const EARLY_KEYFRAME_HORIZON: Id = 10;

/// Handle returned to the thread that constructs a `Mapper`: lets the
/// caller request shutdown, poll the estimator handoff, and join.
pub struct MapperHandle {
    state: Arc<RuntimeState>,
    new_kf_available: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl MapperHandle {
    pub fn new_kf_available(&self) -> bool {
        self.new_kf_available.load(Ordering::Acquire)
    }

    /// Sets the shared `exit_required` flag the Mapper observes at the top
    /// of its loop (`spec.md` §5 "Cancellation") and joins the worker.
    pub fn shutdown(mut self) {
        self.state.request_exit();
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MapperHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.join.take() {
            self.state.request_exit();
            let _ = handle.join();
        }
    }
}

/// The Mapper (`spec.md` §4.4). Generic over the left and (optional) right
/// camera models, mirroring `Tracker<C: Camera>`'s generic front-end.
pub struct Mapper<L: Camera, R: Camera> {
    map: Arc<Map>,
    left_camera: L,
    right_camera: Option<R>,
    params: Params,
    state: Arc<RuntimeState>,
    receiver: Receiver<KeyFrameJob>,
    estimator: Estimator,
    /// Reusable scratch buffer for the right-image frame used by stereo
    /// matching (`spec.md` §5: "owned exclusively by the Mapper"). The Mat
    /// itself already wraps a reference-counted buffer in `opencv`, so
    /// overwriting this field each keyframe reuses its backing allocation
    /// the same way `Tracker`'s `previous_image`/`current_image` pair does.
    right_image: Option<opencv::core::Mat>,
    triangulation_cache: TriangulationCache,
}

impl<L, R> Mapper<L, R>
where
    L: Camera + 'static,
    R: Camera + 'static,
{
    /// Spawns the Mapper's worker thread (and, per `spec.md` §5, the
    /// `Estimator`'s thread alongside it), returning a handle for shutdown
    /// and for polling `new_kf_available`.
    pub fn spawn(
        map: Arc<Map>,
        left_camera: L,
        right_camera: Option<R>,
        params: Params,
        state: Arc<RuntimeState>,
        receiver: Receiver<KeyFrameJob>,
    ) -> MapperHandle {
        let estimator = Estimator::start();
        let new_kf_available = estimator.new_kf_flag();
        let handle_state = state.clone();

        let mut mapper = Mapper {
            map,
            left_camera,
            right_camera,
            params,
            state,
            receiver,
            estimator,
            right_image: None,
            triangulation_cache: TriangulationCache::default(),
        };

        let join = std::thread::spawn(move || mapper.run());

        MapperHandle { state: handle_state, new_kf_available, join: Some(join) }
    }

    fn klt_params(&self) -> KltParams {
        KltParams {
            window_size: self.params.window_size as i32,
            pyramid_levels: self.params.pyramid_levels as i32,
            max_ktl_distance: self.params.max_ktl_distance,
        }
    }

    fn triangulation_params(&self) -> TriangulationParams {
        TriangulationParams { max_reprojection_error: self.params.max_reprojection_error }
    }

    fn local_map_params(&self) -> LocalMapParams {
        LocalMapParams {
            max_projection_distance: self.params.max_projection_distance,
            max_descriptor_distance: self.params.max_descriptor_distance,
            local_map_target: self.params.local_map_target(),
        }
    }

    /// `spec.md` §4.4 "Main loop": pop a job, process it, repeat until
    /// `exit_required`. Per-keyframe errors are logged and do not stop the
    /// loop (`spec.md` §7: "the Mapper loop catches and reports per-keyframe
    /// exceptions without terminating the thread").
    fn run(&mut self) {
        loop {
            if self.state.exit_required() {
                break;
            }
            let job = match self.receiver.recv_timeout(POLL_INTERVAL) {
                Ok(job) => job,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            let kfid = job.kfid;
            if let Err(err) = self.process_keyframe(job) {
                log::warn!("mapper: keyframe {kfid} failed: {err:#}");
            }
        }
        log::debug!("mapper: exit_required observed, forwarding shutdown to estimator");
        self.estimator.shutdown_and_join();
    }

    /// `spec.md` §4.4 steps 2-8, run under the documented lock order (every
    /// map-mutating step acquires `map_lock`; local-map matching additionally
    /// takes `optimization_lock` first, inside `match_local_map` itself).
    fn process_keyframe(&mut self, job: KeyFrameJob) -> Result<()> {
        let kfid = job.kfid;
        if self.map.get_keyframe(kfid).is_none() {
            // Missing entity (`spec.md` §7): the keyframe was already
            // retired by a reset between enqueue and pop. Self-heal.
            return Ok(());
        }

        if self.params.stereo {
            if let Some(right_camera) = self.right_camera.as_ref() {
                if let (Some(left_image), Some(right_image)) =
                    (job.image_left.as_ref(), job.image_right.as_ref())
                {
                    self.right_image = Some(right_image.clone());
                    let klt_params = self.klt_params();
                    let triangulation_params = self.triangulation_params();
                    stereo_step(
                        &self.map,
                        &self.left_camera,
                        right_camera,
                        kfid,
                        left_image,
                        self.right_image.as_ref().expect("just assigned"),
                        &klt_params,
                        &triangulation_params,
                        &mut self.triangulation_cache,
                    )?;
                }
            }
        }

        let kf = self
            .map
            .get_keyframe(kfid)
            .ok_or_else(|| anyhow!("keyframe {kfid} vanished mid-processing"))?;
        if kf.nb_2d_kpts > 0 && kfid > 0 {
            let triangulation_params = self.triangulation_params();
            triangulate_temporal(
                &self.map,
                &self.left_camera,
                kfid,
                &triangulation_params,
                &mut self.triangulation_cache,
            )?;
        }

        if self.reset_gate(kfid)? {
            self.drain_queue();
            return Ok(());
        }

        self.map.update_frame_covisibility(kfid)?;

        if self.params.do_local_matching && kfid > 0 {
            let local_map_params = self.local_map_params();
            match_local_map(&self.map, &self.left_camera, kfid, &local_map_params)?;
        }

        self.estimator.enqueue_keyframe(kfid)?;
        Ok(())
    }

    /// `spec.md` §4.4 step 5: a degenerate-initialization guard. Drains the
    /// queue rather than processing a keyframe whose own triangulation
    /// quality is too thin to trust, mirroring `spec.md` §7's "Degenerate
    /// initialization ... set `reset_required`".
    fn reset_gate(&self, kfid: Id) -> Result<bool> {
        if !self.state.vision_initialized() {
            return Ok(false);
        }
        let kf = self
            .map
            .get_keyframe(kfid)
            .ok_or_else(|| anyhow!("keyframe {kfid} vanished mid-processing"))?;

        let starved_first_keyframe = kfid == 1 && kf.nb_3d_kpts < RESET_GATE_FIRST_KEYFRAME;
        let starved_early_keyframe =
            kfid < EARLY_KEYFRAME_HORIZON && kf.nb_3d_kpts < RESET_GATE_EARLY_KEYFRAME;

        if starved_first_keyframe || starved_early_keyframe {
            log::warn!(
                "mapper: keyframe {kfid} has only {} 3D keypoints, requesting reset",
                kf.nb_3d_kpts
            );
            self.state.set_reset_required(true);
            return Ok(true);
        }
        Ok(false)
    }

    fn drain_queue(&self) {
        while self.receiver.try_recv().is_ok() {}
    }
}

/// `spec.md` §4.4 step 3: matches a keyframe's unresolved left keypoints into
/// the right image via the same forward-backward KLT kernel the Front-End
/// uses (a rectified stereo pair's epipolar match is, to first order, a
/// purely horizontal optical flow), then triangulates whatever pairs were
/// formed. A free function (rather than a `Mapper` method) so the caller can
/// borrow `left_camera`, `right_camera` and `cache` as disjoint fields of the
/// same `Mapper` without fighting the borrow checker over a `&mut self`
/// receiver.
#[allow(clippy::too_many_arguments)]
fn stereo_step<L: Camera, R: Camera>(
    map: &Map,
    left_camera: &L,
    right_camera: &R,
    kfid: Id,
    left_image: &opencv::core::Mat,
    right_image: &opencv::core::Mat,
    klt_params: &KltParams,
    triangulation_params: &TriangulationParams,
    cache: &mut TriangulationCache,
) -> Result<()> {
    let Some(kf) = map.get_keyframe(kfid) else {
        return Ok(());
    };

    let pending: Vec<(Id, Point2f)> = kf
        .keypoints
        .values()
        .filter(|kp| !kp.is_3d && kp.right_pixel.is_none())
        .map(|kp| (kp.id, Point2f::new(kp.pixel.x as f32, kp.pixel.y as f32)))
        .collect();
    if pending.is_empty() {
        return Ok(());
    }

    let ids: Vec<Id> = pending.iter().map(|(id, _)| *id).collect();
    let prior_pixels: Vec<Point2f> = pending.iter().map(|(_, p)| *p).collect();
    let result = fb_tracking(left_image, right_image, &prior_pixels, klt_params)?;

    let mut any_paired = false;
    for (i, &kpid) in ids.iter().enumerate() {
        if !result.status[i] {
            continue;
        }
        let np = result.new_pixels[i];
        map.set_stereo_pixel(kfid, kpid, Point2::new(np.x as f64, np.y as f64))?;
        any_paired = true;
    }

    if any_paired {
        triangulate_stereo(map, left_camera, right_camera, kfid, triangulation_params, cache)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rslam_core::{Keypoint, RuntimeState};
    use rslam_sensor::pinhole_camera::PinholeCamera;
    use sophus::core::linalg::VecF64;
    use sophus::image::ImageSize;
    use sophus::nalgebra::Vector3;
    use sophus::sensor::camera_enum::perspective_camera::PinholeCameraF64;

    fn test_camera() -> PinholeCamera {
        let model = PinholeCameraF64::from_params_and_size(
            &VecF64::<4>::new(500.0, 500.0, 320.0, 240.0),
            ImageSize::new(640, 480),
        );
        PinholeCamera::new(model)
    }

    /// `spec.md` §8 scenario 4 at the Mapper-wiring level: a starved first
    /// keyframe (far fewer than 30 3D keypoints) must be caught by the reset
    /// gate once `vision_initialized` is set, rather than flow through to
    /// covisibility/local-map matching.
    #[test]
    fn reset_gate_triggers_on_starved_first_keyframe() {
        let map = Arc::new(Map::new());
        map.begin_frame();
        let kfid = map.create_keyframe();
        assert_eq!(kfid, 0);
        let second_frame = map.begin_frame();
        let kfid = map.create_keyframe();
        let _ = second_frame;

        map.insert_2d_keypoint(
            kfid,
            Keypoint::new(1, Point2::new(1.0, 1.0), Point2::new(1.0, 1.0), Vector3::new(0.0, 0.0, 1.0)),
        );

        let camera = test_camera();
        let (sender, receiver) = crossbeam_channel::unbounded();
        let state = Arc::new(RuntimeState::default());
        state.set_vision_initialized(true);

        let mapper = Mapper::<PinholeCamera, PinholeCamera> {
            map: map.clone(),
            left_camera: camera,
            right_camera: None,
            params: Params::default(),
            state: state.clone(),
            receiver,
            estimator: Estimator::start(),
            right_image: None,
            triangulation_cache: TriangulationCache::default(),
        };

        let triggered = mapper.reset_gate(kfid).unwrap();
        assert!(triggered);
        assert!(state.reset_required());
        let _ = sender;
    }
}
