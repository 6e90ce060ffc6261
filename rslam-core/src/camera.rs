use sophus::nalgebra::{Point2, Vector3};

/// Radial-tangential distortion coefficients `(k1, k2, p1, p2)`.
pub type DistortionCoeffs = [f64; 4];

/// Pure geometric contract a calibrated camera must satisfy.
///
/// `project`/`project_undistort`/`unproject`/`in_image` are the external
/// kernels referenced by the tracker and mapper; they never touch map
/// state and have no side effects.
pub trait Camera: Send + Sync {
    fn rows(&self) -> usize;
    fn cols(&self) -> usize;

    fn camera_to_robot(&self) -> &sophus::lie::Isometry3F64;

    fn fx(&self) -> f64;
    fn fy(&self) -> f64;
    fn cx(&self) -> f64;
    fn cy(&self) -> f64;
    fn distortion(&self) -> Option<DistortionCoeffs>;

    /// Projects a 3D point in camera coordinates to the pixel where it would
    /// appear in the raw (possibly distorted) image. `None` when the point
    /// is behind the camera.
    fn project(&self, point: &Vector3<f64>) -> Option<Point2<f64>> {
        let undist = self.project_undistort(point)?;
        Some(self.distort(&undist))
    }

    /// Projects a 3D point in camera coordinates through the ideal
    /// (distortion-free) pinhole model.
    fn project_undistort(&self, point: &Vector3<f64>) -> Option<Point2<f64>> {
        if point.z <= 0.0 {
            return None;
        }
        let x = self.fx() * point.x / point.z + self.cx();
        let y = self.fy() * point.y / point.z + self.cy();
        Some(Point2::new(x, y))
    }

    /// Inverse of `project_undistort`: turns an undistorted pixel into a
    /// unit bearing vector in camera coordinates.
    fn unproject(&self, pixel: &Point2<f64>) -> Vector3<f64> {
        let x = (pixel.x - self.cx()) / self.fx();
        let y = (pixel.y - self.cy()) / self.fy();
        Vector3::new(x, y, 1.0).normalize()
    }

    fn in_image(&self, pixel: &Point2<f64>) -> bool {
        pixel.x >= 0.0
            && pixel.y >= 0.0
            && pixel.x < self.cols() as f64
            && pixel.y < self.rows() as f64
    }

    /// Applies the distortion model to an ideal (undistorted) pixel.
    fn distort(&self, pixel: &Point2<f64>) -> Point2<f64> {
        let Some([k1, k2, p1, p2]) = self.distortion() else {
            return *pixel;
        };
        let xn = (pixel.x - self.cx()) / self.fx();
        let yn = (pixel.y - self.cy()) / self.fy();
        let r2 = xn * xn + yn * yn;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2;
        let xd = xn * radial + 2.0 * p1 * xn * yn + p2 * (r2 + 2.0 * xn * xn);
        let yd = yn * radial + p1 * (r2 + 2.0 * yn * yn) + 2.0 * p2 * xn * yn;
        Point2::new(self.fx() * xd + self.cx(), self.fy() * yd + self.cy())
    }

    /// Removes distortion from a raw pixel observation via a few steps of
    /// fixed-point iteration. Identity when the camera has no distortion.
    fn undistort_pixel(&self, raw: &Point2<f64>) -> Point2<f64> {
        if self.distortion().is_none() {
            return *raw;
        }
        let mut guess = *raw;
        for _ in 0..5 {
            let reprojected = self.distort(&guess);
            let error = Point2::new(raw.x - reprojected.x, raw.y - reprojected.y);
            guess = Point2::new(guess.x + error.x, guess.y + error.y);
        }
        guess
    }
}
