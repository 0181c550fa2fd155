//! Camera projection models
//!
//! A camera variable stores its intrinsics as one flat vector
//! `[fx, fy, cx, cy, d0, d1, ...]`. Factors rebuild a [`ProjectionModel`]
//! from that vector on every evaluation, so the model always reflects the
//! current estimate.

pub mod distortion;

use std::fmt;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

pub use distortion::{Distortion, Equi4, NoDistortion, RadTan4};

use crate::error::EvalFailure;
use crate::types::{Mat2, Mat23, Vec2, Vec3};

/// Number of pinhole projection parameters (fx, fy, cx, cy)
pub const PINHOLE_PARAMS: usize = 4;

/// Capabilities a camera model offers to the visual factors.
pub trait ProjectionModel {
    /// Project a camera-frame point to pixels, with ∂pixel/∂p_C (2x3).
    fn project(&self, p_c: &Vec3) -> Result<(Vec2, Mat23), EvalFailure>;

    /// Total number of intrinsic parameters (projection + distortion)
    fn parameter_count(&self) -> usize;

    /// ∂pixel / ∂intrinsics for a camera-frame point, 2 x parameter_count.
    fn parameter_jacobian(&self, p_c: &Vec3) -> DMatrix<f64>;
}

/// Camera model selected when a camera variable is created
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraModelKind {
    Pinhole,
    PinholeRadtan4,
    PinholeEqui4,
}

impl CameraModelKind {
    /// Number of distortion coefficients the model expects
    pub fn dist_size(&self) -> usize {
        match self {
            CameraModelKind::Pinhole => NoDistortion::PARAMS,
            CameraModelKind::PinholeRadtan4 => RadTan4::PARAMS,
            CameraModelKind::PinholeEqui4 => Equi4::PARAMS,
        }
    }

    pub fn params_size(&self) -> usize {
        PINHOLE_PARAMS + self.dist_size()
    }

    /// Build the projection model for a parameter vector of `params_size()`.
    pub fn instantiate(&self, resolution: [u32; 2], params: &[f64]) -> Box<dyn ProjectionModel> {
        match self {
            CameraModelKind::Pinhole => {
                Box::new(PinholeCamera::<NoDistortion>::from_params(resolution, params))
            }
            CameraModelKind::PinholeRadtan4 => {
                Box::new(PinholeCamera::<RadTan4>::from_params(resolution, params))
            }
            CameraModelKind::PinholeEqui4 => {
                Box::new(PinholeCamera::<Equi4>::from_params(resolution, params))
            }
        }
    }
}

impl fmt::Display for CameraModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CameraModelKind::Pinhole => "pinhole",
            CameraModelKind::PinholeRadtan4 => "pinhole-radtan4",
            CameraModelKind::PinholeEqui4 => "pinhole-equi4",
        };
        write!(f, "{}", name)
    }
}

/// Pinhole camera with a pluggable distortion model
///
///   u = fx * distort(X/Z, Y/Z).x + cx
///   v = fy * distort(X/Z, Y/Z).y + cy
#[derive(Clone, Copy, Debug)]
pub struct PinholeCamera<D> {
    /// Image size [width, height] in pixels
    pub resolution: [u32; 2],
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub distortion: D,
}

impl<D: Distortion> PinholeCamera<D> {
    pub fn new(resolution: [u32; 2], fx: f64, fy: f64, cx: f64, cy: f64, distortion: D) -> Self {
        Self {
            resolution,
            fx,
            fy,
            cx,
            cy,
            distortion,
        }
    }

    /// Build from `[fx, fy, cx, cy, distortion...]`
    pub fn from_params(resolution: [u32; 2], params: &[f64]) -> Self {
        Self::new(
            resolution,
            params[0],
            params[1],
            params[2],
            params[3],
            D::from_params(&params[PINHOLE_PARAMS..]),
        )
    }

    /// Camera matrix K
    pub fn k(&self) -> nalgebra::Matrix3<f64> {
        nalgebra::Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    /// Project without the Jacobian
    pub fn project_point(&self, p_c: &Vec3) -> Result<Vec2, EvalFailure> {
        // Simple depth test
        if p_c[2] <= 0.0 {
            return Err(EvalFailure::BehindCamera);
        }

        let p = Vec2::new(p_c[0] / p_c[2], p_c[1] / p_c[2]);
        let p_dist = self.distortion.distort(&p);
        let pixel = Vec2::new(self.fx * p_dist[0] + self.cx, self.fy * p_dist[1] + self.cy);

        let x_ok = pixel[0] >= 0.0 && pixel[0] <= self.resolution[0] as f64;
        let y_ok = pixel[1] >= 0.0 && pixel[1] <= self.resolution[1] as f64;
        if !x_ok || !y_ok {
            return Err(EvalFailure::OutOfImage);
        }
        Ok(pixel)
    }

    /// Pixel coordinates back to a normalized ray (z = 1)
    pub fn back_project(&self, pixel: &Vec2) -> Vec3 {
        let p_dist = Vec2::new((pixel[0] - self.cx) / self.fx, (pixel[1] - self.cy) / self.fy);
        let p = self.distortion.undistort(&p_dist);
        Vec3::new(p[0], p[1], 1.0)
    }
}

impl<D: Distortion> ProjectionModel for PinholeCamera<D> {
    fn project(&self, p_c: &Vec3) -> Result<(Vec2, Mat23), EvalFailure> {
        let pixel = self.project_point(p_c)?;

        let (x, y, z) = (p_c[0], p_c[1], p_c[2]);
        let z2 = z * z;
        #[rustfmt::skip]
        let j_norm = Mat23::new(
            1.0 / z, 0.0,     -x / z2,
            0.0,     1.0 / z, -y / z2,
        );
        let j_focal = Mat2::new(self.fx, 0.0, 0.0, self.fy);
        let p = Vec2::new(x / z, y / z);
        let jacobian = j_focal * self.distortion.point_jacobian(&p) * j_norm;

        Ok((pixel, jacobian))
    }

    fn parameter_count(&self) -> usize {
        PINHOLE_PARAMS + D::PARAMS
    }

    fn parameter_jacobian(&self, p_c: &Vec3) -> DMatrix<f64> {
        let p = Vec2::new(p_c[0] / p_c[2], p_c[1] / p_c[2]);
        let p_dist = self.distortion.distort(&p);

        let mut j = DMatrix::zeros(2, self.parameter_count());
        // fx, fy, cx, cy
        j[(0, 0)] = p_dist[0];
        j[(1, 1)] = p_dist[1];
        j[(0, 2)] = 1.0;
        j[(1, 3)] = 1.0;

        if D::PARAMS > 0 {
            let j_dist = self.distortion.param_jacobian(&p);
            for col in 0..D::PARAMS {
                j[(0, PINHOLE_PARAMS + col)] = self.fx * j_dist[(0, col)];
                j[(1, PINHOLE_PARAMS + col)] = self.fy * j_dist[(1, col)];
            }
        }
        j
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn radtan_camera() -> PinholeCamera<RadTan4> {
        PinholeCamera::from_params(
            [752, 480],
            &[458.654, 457.296, 367.215, 248.375, -0.28, 0.07, 0.0002, 0.00002],
        )
    }

    #[test]
    fn test_project_center() {
        let cam = radtan_camera();
        let (pixel, _) = cam.project(&Vec3::new(0.0, 0.0, 2.0)).unwrap();
        assert_relative_eq!(pixel, Vec2::new(367.215, 248.375), epsilon = 1e-12);
    }

    #[test]
    fn test_project_behind_camera() {
        let cam = radtan_camera();
        assert_eq!(
            cam.project(&Vec3::new(0.0, 0.0, -1.0)).unwrap_err(),
            EvalFailure::BehindCamera
        );
    }

    #[test]
    fn test_project_out_of_image() {
        let cam = radtan_camera();
        assert_eq!(
            cam.project(&Vec3::new(10.0, 0.0, 1.0)).unwrap_err(),
            EvalFailure::OutOfImage
        );
    }

    #[test]
    fn test_point_jacobian_numeric() {
        let cam = radtan_camera();
        let p_c = Vec3::new(0.1, -0.05, 1.5);
        let (pixel, jacobian) = cam.project(&p_c).unwrap();

        let step = 1e-7;
        for i in 0..3 {
            let mut p_step = p_c;
            p_step[i] += step;
            let (pixel_step, _) = cam.project(&p_step).unwrap();
            let col = (pixel_step - pixel) / step;
            assert_relative_eq!(Vec2::new(jacobian[(0, i)], jacobian[(1, i)]), col, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_parameter_jacobian_numeric() {
        let params = [458.654, 457.296, 367.215, 248.375, -0.28, 0.07, 0.0002, 0.00002];
        let cam = radtan_camera();
        let p_c = Vec3::new(0.1, -0.05, 1.5);
        let pixel = cam.project_point(&p_c).unwrap();
        let jacobian = cam.parameter_jacobian(&p_c);

        let step = 1e-7;
        for i in 0..params.len() {
            let mut params_step = params;
            params_step[i] += step;
            let cam_step = PinholeCamera::<RadTan4>::from_params([752, 480], &params_step);
            let col = (cam_step.project_point(&p_c).unwrap() - pixel) / step;
            assert_relative_eq!(jacobian.fixed_view::<2, 1>(0, i).into_owned(), col, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_back_project() {
        let cam = radtan_camera();
        let p_c = Vec3::new(0.2, 0.1, 1.0);
        let pixel = cam.project_point(&p_c).unwrap();
        assert_relative_eq!(cam.back_project(&pixel), p_c, epsilon = 1e-6);
    }

    #[test]
    fn test_model_kind_sizes() {
        assert_eq!(CameraModelKind::Pinhole.params_size(), 4);
        assert_eq!(CameraModelKind::PinholeRadtan4.params_size(), 8);
        let model = CameraModelKind::PinholeEqui4.instantiate([640, 480], &[400.0, 400.0, 320.0, 240.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(model.parameter_count(), 8);
    }
}
