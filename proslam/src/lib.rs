pub mod frame_point_generator;

pub mod motion_model;
pub mod klt;
pub mod keyframe_job;
pub mod frontend;
pub mod mapper;
pub mod estimator;
pub mod triangulation;
pub mod local_map;

pub use estimator::Estimator;
pub use frontend::Tracker;
pub use keyframe_job::KeyFrameJob;
pub use mapper::Mapper;
pub use motion_model::MotionModel;
