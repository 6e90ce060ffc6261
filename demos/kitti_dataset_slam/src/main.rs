use std::sync::Arc;

use anyhow::Result;
use proslam::{KeyFrameJob, Mapper, Tracker};
use rslam_core::{Map, Params, RuntimeState};
use rslam_dataset_reader::kitti_reader::KittiReader;
use rslam_sensor::HasStereoCamera;

fn main() -> Result<()> {
    env_logger::init();

    let rec = rerun::RecordingStreamBuilder::new("kitti_dataset_slam").spawn()?;

    let mut reader = KittiReader::new("datasets/01");
    reader.load_camera();
    reader.load_timestamp();

    let cameras = reader.get_cameras().clone();
    let cameras_pos = reader.get_cameres_pos().clone();
    let left_camera = cameras[0].clone();
    let right_camera = cameras.get(1).cloned().map(|cam| match cameras_pos.get(1) {
        Some(pose) => cam.with_camera_to_robot(pose.clone()),
        None => cam,
    });

    log::debug!("left camera: {:?}", left_camera.model);
    if let Some(right) = &right_camera {
        log::debug!("right camera: {:?}", right.model);
    }

    let stereo_enabled = right_camera.is_some();
    let map = Arc::new(Map::new());
    let params = Params { stereo: stereo_enabled, ..Params::default() };
    let state = Arc::new(RuntimeState::default());

    let (keyframe_sender, keyframe_receiver) = crossbeam_channel::unbounded::<KeyFrameJob>();

    let mapper_handle = Mapper::spawn(
        map.clone(),
        left_camera.clone(),
        right_camera,
        params.clone(),
        state.clone(),
        keyframe_receiver,
    );

    let mut tracker = Tracker::new(map.clone(), left_camera, params, state.clone(), keyframe_sender)?;

    while let Some((left, right)) = (&mut reader).get_stereo_frame() {
        let time = reader.get_timestamp();
        rec.set_time_seconds("dataset_time", time);

        let right_for_tracker = if stereo_enabled { Some(right) } else { None };
        match tracker.track_with_right(left, right_for_tracker, time) {
            Ok(promoted) => {
                if promoted {
                    log::debug!("promoted a new keyframe at t={time}");
                }
            }
            Err(err) => log::warn!("tracker failed at t={time}: {err:#}"),
        }

        if state.reset_required() {
            log::warn!("reset requested, stopping drive loop");
            break;
        }
        if mapper_handle.new_kf_available() {
            log::debug!("mapper has a keyframe ready for the estimator");
        }
    }

    mapper_handle.shutdown();
    Ok(())
}
