use rslam_core::DistortionCoeffs;
use sophus::{lie::Isometry3F64, sensor::camera_enum::perspective_camera::PinholeCameraF64};

#[derive(Clone, Debug)]
pub struct PinholeCamera {
    pub model: PinholeCameraF64,

    // camera to robot transform (usually constant during operation)
    camera_to_robot: Isometry3F64,

    distortion: Option<DistortionCoeffs>,
}

impl rslam_core::Camera for PinholeCamera {
    fn cols(&self) -> usize {
        self.model.image_size().width
    }

    fn rows(&self) -> usize {
        self.model.image_size().height
    }

    fn camera_to_robot(&self) -> &sophus::lie::Isometry3F64 {
        &self.camera_to_robot
    }

    fn fx(&self) -> f64 {
        self.model.params()[0]
    }

    fn fy(&self) -> f64 {
        self.model.params()[1]
    }

    fn cx(&self) -> f64 {
        self.model.params()[2]
    }

    fn cy(&self) -> f64 {
        self.model.params()[3]
    }

    fn distortion(&self) -> Option<DistortionCoeffs> {
        self.distortion
    }
}

impl PinholeCamera {
    pub fn new(model: PinholeCameraF64) -> Self {
        Self {
            model,
            camera_to_robot: Isometry3F64::identity(),
            distortion: None,
        }
    }

    pub fn with_distortion(mut self, distortion: DistortionCoeffs) -> Self {
        self.distortion = Some(distortion);
        self
    }

    pub fn with_camera_to_robot(mut self, camera_to_robot: Isometry3F64) -> Self {
        self.camera_to_robot = camera_to_robot;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rslam_core::Camera;
    use sophus::core::linalg::VecF64;
    use sophus::image::ImageSize;
    use sophus::nalgebra::{Point2, Vector3};

    fn test_camera() -> PinholeCamera {
        let model = PinholeCameraF64::from_params_and_size(
            &VecF64::<4>::new(500.0, 500.0, 320.0, 240.0),
            ImageSize::new(640, 480),
        );
        PinholeCamera::new(model)
    }

    #[test]
    fn project_and_unproject_round_trip() {
        let cam = test_camera();
        let point = Vector3::new(0.2, -0.1, 2.0);
        let pixel = cam.project_undistort(&point).expect("in front of camera");
        let bearing = cam.unproject(&pixel);
        let scaled = bearing * (point.z / bearing.z);
        assert!((scaled - point).norm() < 1e-9);
    }

    #[test]
    fn point_behind_camera_does_not_project() {
        let cam = test_camera();
        let point = Vector3::new(0.0, 0.0, -1.0);
        assert!(cam.project_undistort(&point).is_none());
    }

    #[test]
    fn in_image_respects_bounds() {
        let cam = test_camera();
        assert!(cam.in_image(&Point2::new(320.0, 240.0)));
        assert!(!cam.in_image(&Point2::new(-1.0, 240.0)));
        assert!(!cam.in_image(&Point2::new(640.0, 240.0)));
    }
}
