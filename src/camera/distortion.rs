//! Lens distortion models applied to normalized image coordinates

use nalgebra::DMatrix;

use crate::types::{Mat2, Vec2};

/// Distortion acting on a normalized point `p = (x/z, y/z)`.
pub trait Distortion {
    /// Number of distortion coefficients
    const PARAMS: usize;

    fn from_params(params: &[f64]) -> Self;
    fn distort(&self, p: &Vec2) -> Vec2;
    fn undistort(&self, p: &Vec2) -> Vec2;
    /// ∂distort(p) / ∂p
    fn point_jacobian(&self, p: &Vec2) -> Mat2;
    /// ∂distort(p) / ∂coefficients, 2 x PARAMS
    fn param_jacobian(&self, p: &Vec2) -> DMatrix<f64>;
}

/// Identity distortion
#[derive(Clone, Copy, Debug, Default)]
pub struct NoDistortion;

impl Distortion for NoDistortion {
    const PARAMS: usize = 0;

    fn from_params(_params: &[f64]) -> Self {
        NoDistortion
    }

    fn distort(&self, p: &Vec2) -> Vec2 {
        *p
    }

    fn undistort(&self, p: &Vec2) -> Vec2 {
        *p
    }

    fn point_jacobian(&self, _p: &Vec2) -> Mat2 {
        Mat2::identity()
    }

    fn param_jacobian(&self, _p: &Vec2) -> DMatrix<f64> {
        DMatrix::zeros(2, 0)
    }
}

/// Radial-tangential distortion (k1, k2, p1, p2)
#[derive(Clone, Copy, Debug)]
pub struct RadTan4 {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
}

impl Distortion for RadTan4 {
    const PARAMS: usize = 4;

    fn from_params(params: &[f64]) -> Self {
        Self {
            k1: params[0],
            k2: params[1],
            p1: params[2],
            p2: params[3],
        }
    }

    fn distort(&self, p: &Vec2) -> Vec2 {
        let (x, y) = (p[0], p[1]);
        let x2 = x * x;
        let y2 = y * y;
        let xy = x * y;
        let r2 = x2 + y2;
        let r4 = r2 * r2;

        let radial = 1.0 + self.k1 * r2 + self.k2 * r4;
        let x_dist = x * radial + 2.0 * self.p1 * xy + self.p2 * (r2 + 2.0 * x2);
        let y_dist = y * radial + self.p1 * (r2 + 2.0 * y2) + 2.0 * self.p2 * xy;
        Vec2::new(x_dist, y_dist)
    }

    fn undistort(&self, p0: &Vec2) -> Vec2 {
        // Gauss-Newton on distort(p) = p0
        let mut p = *p0;
        for _ in 0..5 {
            let err = p0 - self.distort(&p);
            if err.norm_squared() < 1e-15 {
                break;
            }
            let j = self.point_jacobian(&p);
            match (j.transpose() * j).try_inverse() {
                Some(jtj_inv) => p += jtj_inv * j.transpose() * err,
                None => break,
            }
        }
        p
    }

    fn point_jacobian(&self, p: &Vec2) -> Mat2 {
        let (x, y) = (p[0], p[1]);
        let x2 = x * x;
        let y2 = y * y;
        let r2 = x2 + y2;
        let r4 = r2 * r2;
        let (k1, k2, p1, p2) = (self.k1, self.k2, self.p1, self.p2);

        let mut j = Mat2::zeros();
        j[(0, 0)] = 1.0 + k1 * r2 + k2 * r4 + 2.0 * p1 * y + 6.0 * p2 * x
            + x * (2.0 * k1 * x + 4.0 * k2 * x * r2);
        j[(1, 0)] = 2.0 * p1 * x + 2.0 * p2 * y + y * (2.0 * k1 * x + 4.0 * k2 * x * r2);
        j[(0, 1)] = j[(1, 0)];
        j[(1, 1)] = 1.0 + k1 * r2 + k2 * r4 + 6.0 * p1 * y + 2.0 * p2 * x
            + y * (2.0 * k1 * y + 4.0 * k2 * y * r2);
        j
    }

    fn param_jacobian(&self, p: &Vec2) -> DMatrix<f64> {
        let (x, y) = (p[0], p[1]);
        let xy = x * y;
        let x2 = x * x;
        let y2 = y * y;
        let r2 = x2 + y2;
        let r4 = r2 * r2;

        #[rustfmt::skip]
        let j = DMatrix::from_row_slice(2, 4, &[
            x * r2, x * r4, 2.0 * xy,      3.0 * x2 + y2,
            y * r2, y * r4, x2 + 3.0 * y2, 2.0 * xy,
        ]);
        j
    }
}

/// Equidistant (fisheye) distortion (k1, k2, k3, k4)
#[derive(Clone, Copy, Debug)]
pub struct Equi4 {
    pub k1: f64,
    pub k2: f64,
    pub k3: f64,
    pub k4: f64,
}

impl Equi4 {
    /// θ_d = θ (1 + k1 θ² + k2 θ⁴ + k3 θ⁶ + k4 θ⁸)
    fn theta_d(&self, th: f64) -> f64 {
        let th2 = th * th;
        let th4 = th2 * th2;
        let th6 = th4 * th2;
        let th8 = th4 * th4;
        th * (1.0 + self.k1 * th2 + self.k2 * th4 + self.k3 * th6 + self.k4 * th8)
    }
}

impl Distortion for Equi4 {
    const PARAMS: usize = 4;

    fn from_params(params: &[f64]) -> Self {
        Self {
            k1: params[0],
            k2: params[1],
            k3: params[2],
            k4: params[3],
        }
    }

    fn distort(&self, p: &Vec2) -> Vec2 {
        let r = p.norm();
        if r < 1e-8 {
            return *p;
        }
        let thd = self.theta_d(r.atan());
        p * (thd / r)
    }

    fn undistort(&self, p: &Vec2) -> Vec2 {
        let thd = p.norm();
        if thd < 1e-8 {
            return *p;
        }

        // Fixed-point iteration on θ
        let mut th = thd;
        for _ in 0..20 {
            let th2 = th * th;
            let th4 = th2 * th2;
            let th6 = th4 * th2;
            let th8 = th4 * th4;
            th = thd / (1.0 + self.k1 * th2 + self.k2 * th4 + self.k3 * th6 + self.k4 * th8);
        }
        p * (th.tan() / thd)
    }

    fn point_jacobian(&self, p: &Vec2) -> Mat2 {
        let (x, y) = (p[0], p[1]);
        let r = p.norm();
        if r < 1e-8 {
            return Mat2::identity();
        }

        let th = r.atan();
        let th2 = th * th;
        let th4 = th2 * th2;
        let th6 = th4 * th2;
        let th8 = th4 * th4;
        let thd = self.theta_d(th);
        let s = thd / r;

        let th_r = 1.0 / (r * r + 1.0);
        let thd_th = 1.0
            + 3.0 * self.k1 * th2
            + 5.0 * self.k2 * th4
            + 7.0 * self.k3 * th6
            + 9.0 * self.k4 * th8;
        let s_r = thd_th * th_r / r - thd / (r * r);
        let r_x = x / r;
        let r_y = y / r;

        Mat2::new(
            s + x * s_r * r_x,
            x * s_r * r_y,
            y * s_r * r_x,
            s + y * s_r * r_y,
        )
    }

    fn param_jacobian(&self, p: &Vec2) -> DMatrix<f64> {
        let (x, y) = (p[0], p[1]);
        let r = p.norm();
        if r < 1e-8 {
            return DMatrix::zeros(2, 4);
        }

        let th = r.atan();
        let th3 = th * th * th;
        let th5 = th3 * th * th;
        let th7 = th5 * th * th;
        let th9 = th7 * th * th;

        #[rustfmt::skip]
        let j = DMatrix::from_row_slice(2, 4, &[
            x * th3 / r, x * th5 / r, x * th7 / r, x * th9 / r,
            y * th3 / r, y * th5 / r, y * th7 / r, y * th9 / r,
        ]);
        j
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn numeric_point_jacobian<D: Distortion>(d: &D, p: &Vec2) -> Mat2 {
        let step = 1e-7;
        let mut j = Mat2::zeros();
        for i in 0..2 {
            let mut p_step = *p;
            p_step[i] += step;
            let col = (d.distort(&p_step) - d.distort(p)) / step;
            j.set_column(i, &col);
        }
        j
    }

    #[test]
    fn test_radtan_point_jacobian() {
        let d = RadTan4::from_params(&[0.1, 0.01, 0.001, 0.002]);
        let p = Vec2::new(0.3, -0.2);
        assert_relative_eq!(
            d.point_jacobian(&p),
            numeric_point_jacobian(&d, &p),
            epsilon = 1e-5
        );
    }

    #[test]
    fn test_radtan_undistort() {
        let d = RadTan4::from_params(&[-0.28, 0.07, 0.0002, 0.00002]);
        let p = Vec2::new(0.1, 0.2);
        let recovered = d.undistort(&d.distort(&p));
        assert_relative_eq!(recovered, p, epsilon = 1e-6);
    }

    #[test]
    fn test_equi_point_jacobian() {
        let d = Equi4::from_params(&[0.1, 0.01, 0.001, 0.0001]);
        let p = Vec2::new(0.3, -0.2);
        assert_relative_eq!(
            d.point_jacobian(&p),
            numeric_point_jacobian(&d, &p),
            epsilon = 1e-5
        );
    }

    #[test]
    fn test_equi_undistort() {
        let d = Equi4::from_params(&[0.1, 0.01, 0.001, 0.0001]);
        let p = Vec2::new(0.1, 0.2);
        let recovered = d.undistort(&d.distort(&p));
        assert_relative_eq!(recovered, p, epsilon = 1e-6);
    }

    #[test]
    fn test_no_distortion_is_identity() {
        let p = Vec2::new(0.4, 0.5);
        assert_eq!(NoDistortion.distort(&p), p);
        assert_eq!(NoDistortion.param_jacobian(&p).ncols(), 0);
    }
}
