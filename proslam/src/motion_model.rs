use rslam_core::geometry::{inv_se3, Pose};

/// Constant-velocity pose predictor (`spec.md` §4.2).
///
/// Stateless between calls except for the last observed `(timestamp, pose)`
/// pair: each call to `predict` is handed the previous frame's *true*
/// `world_from_camera` pose, derives a relative motion from it and whatever
/// was observed before that, and extrapolates one step forward.
#[derive(Debug, Default)]
pub struct MotionModel {
    last_observed: Option<(f64, Pose)>,
}

impl MotionModel {
    pub fn new() -> Self {
        Self { last_observed: None }
    }

    pub fn reset(&mut self) {
        self.last_observed = None;
    }

    /// Predicts the world-from-camera pose for the frame arriving at `time`,
    /// given the previous frame's world-from-camera pose `previous_wc`.
    ///
    /// On the first call, or immediately after a reset, there is no prior
    /// motion to extrapolate from: returns `previous_wc` unchanged (an
    /// identity delta).
    pub fn predict(&mut self, previous_wc: Pose, time: f64) -> Pose {
        let predicted = match self.last_observed {
            Some((_, before_previous)) => {
                let velocity = previous_wc * inv_se3(&before_previous);
                velocity * previous_wc
            }
            None => previous_wc,
        };
        self.last_observed = Some((time, previous_wc));
        predicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sophus::nalgebra::{Matrix3, Vector3};

    fn translation_pose(t: Vector3<f64>) -> Pose {
        rslam_core::geometry::pose_from_rt(Matrix3::identity(), t)
    }

    #[test]
    fn first_call_returns_identity_delta() {
        let mut model = MotionModel::new();
        let pose = translation_pose(Vector3::new(1.0, 0.0, 0.0));
        let predicted = model.predict(pose, 0.1);
        assert!((predicted - pose).norm() < 1e-12);
    }

    #[test]
    fn extrapolates_constant_translational_velocity() {
        let mut model = MotionModel::new();
        let first = translation_pose(Vector3::new(0.0, 0.0, 0.0));
        let second = translation_pose(Vector3::new(1.0, 0.0, 0.0));
        model.predict(first, 0.0);
        let predicted = model.predict(second, 0.1);
        let expected = translation_pose(Vector3::new(2.0, 0.0, 0.0));
        assert!((predicted - expected).norm() < 1e-9);
    }

    #[test]
    fn reset_clears_velocity() {
        let mut model = MotionModel::new();
        let first = translation_pose(Vector3::new(0.0, 0.0, 0.0));
        let second = translation_pose(Vector3::new(1.0, 0.0, 0.0));
        model.predict(first, 0.0);
        model.predict(second, 0.1);
        model.reset();
        let predicted = model.predict(second, 0.2);
        assert!((predicted - second).norm() < 1e-12);
    }
}
