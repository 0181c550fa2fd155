//! Rotation helpers shared by the pose manifold and the factors
//!
//! Quaternions are Hamilton, stored (w, x, y, z) in parameter vectors. All
//! Jacobians in this crate perturb rotations on the left:
//! `q ← δq(dα) ⊗ q`.

use nalgebra::{Matrix3, Matrix4, Quaternion, UnitQuaternion, Vector3, Vector4};

/// Below this angle the series expansions are used.
const SMALL_ANGLE: f64 = 1e-8;

/// Create a skew-symmetric matrix from a 3D vector, `[v]× u = v × u`
pub fn skew_symmetric(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v[2], v[1], v[2], 0.0, -v[0], -v[1], v[0], 0.0)
}

/// Quaternion increment for a rotation vector `dalpha`.
///
/// Built from the half-angle vector `dalpha / 2`; for small angles this is
/// the familiar `[1, dalpha / 2]` before normalisation, and it is the exact
/// exponential otherwise so that `quat_delta(-a)` undoes `quat_delta(a)`.
pub fn quat_delta(dalpha: &Vector3<f64>) -> UnitQuaternion<f64> {
    let half = 0.5 * dalpha;
    let half_norm = half.norm();
    let q = if half_norm < SMALL_ANGLE {
        Quaternion::new(1.0, half[0], half[1], half[2])
    } else {
        let s = half_norm.sin() / half_norm;
        Quaternion::new(half_norm.cos(), s * half[0], s * half[1], s * half[2])
    };
    UnitQuaternion::new_normalize(q)
}

/// Rotation vector of a unit quaternion (logarithm map).
pub fn log_quaternion(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    let w = q.w;
    let xyz = q.imag();
    let norm_xyz = xyz.norm();
    if norm_xyz < SMALL_ANGLE {
        // Near identity: log(q) ≈ 2 * xyz
        2.0 * xyz
    } else {
        // Pick the short way round
        let theta = 2.0 * norm_xyz.atan2(w.abs());
        w.signum() * theta / norm_xyz * xyz
    }
}

/// Quaternion as a (w, x, y, z) column
pub fn quat_coeffs(q: &UnitQuaternion<f64>) -> Vector4<f64> {
    Vector4::new(q.w, q.i, q.j, q.k)
}

/// Left product matrix: `q ⊗ p = quat_left(q) * p`
pub fn quat_left(q: &UnitQuaternion<f64>) -> Matrix4<f64> {
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);
    #[rustfmt::skip]
    let m = Matrix4::new(
        w, -x, -y, -z,
        x,  w, -z,  y,
        y,  z,  w, -x,
        z, -y,  x,  w,
    );
    m
}

/// Right product matrix: `p ⊗ q = quat_right(q) * p`
pub fn quat_right(q: &UnitQuaternion<f64>) -> Matrix4<f64> {
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);
    #[rustfmt::skip]
    let m = Matrix4::new(
        w, -x, -y, -z,
        x,  w,  z, -y,
        y, -z,  w,  x,
        z,  y, -x,  w,
    );
    m
}

/// Lower-right 3x3 (x, y, z) block of a quaternion product matrix
pub fn quat_mat_xyz(m: &Matrix4<f64>) -> Matrix3<f64> {
    m.fixed_view::<3, 3>(1, 1).into_owned()
}

/// Right Jacobian of SO(3):
/// `Jr(φ) = I - (1 - cos θ)/θ² [φ]× + (θ - sin θ)/θ³ [φ]×²`
pub fn right_jacobian(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let skew_phi = skew_symmetric(phi);
    if theta < 1e-6 {
        return Matrix3::identity() - 0.5 * skew_phi;
    }
    let theta_sq = theta * theta;
    Matrix3::identity() - ((1.0 - theta.cos()) / theta_sq) * skew_phi
        + ((theta - theta.sin()) / (theta_sq * theta)) * skew_phi * skew_phi
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_skew_cross_product() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let u = Vector3::new(4.0, 5.0, 6.0);
        assert_relative_eq!(skew_symmetric(&v) * u, v.cross(&u), epsilon = 1e-12);
    }

    #[test]
    fn test_quat_delta_matches_axis_angle() {
        let dalpha = Vector3::new(0.3, -0.2, 0.1);
        let expected = UnitQuaternion::from_scaled_axis(dalpha);
        assert_relative_eq!(quat_delta(&dalpha), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_quat_delta_inverse() {
        let dalpha = Vector3::new(0.05, 0.4, -0.7);
        let q = quat_delta(&-dalpha) * quat_delta(&dalpha);
        assert_relative_eq!(q, UnitQuaternion::identity(), epsilon = 1e-12);
    }

    #[test]
    fn test_log_quaternion_round_trip() {
        let phi = Vector3::new(0.1, -0.4, 0.25);
        assert_relative_eq!(log_quaternion(&quat_delta(&phi)), phi, epsilon = 1e-12);
    }

    #[test]
    fn test_product_matrices() {
        let q = UnitQuaternion::from_euler_angles(0.1, 0.2, 0.3);
        let p = UnitQuaternion::from_euler_angles(-0.3, 0.5, 0.05);
        let qp = quat_coeffs(&(q * p));
        assert_relative_eq!(quat_left(&q) * quat_coeffs(&p), qp, epsilon = 1e-12);
        assert_relative_eq!(quat_right(&p) * quat_coeffs(&q), qp, epsilon = 1e-12);
    }

    #[test]
    fn test_right_jacobian_identity_at_zero() {
        assert_relative_eq!(
            right_jacobian(&Vector3::zeros()),
            Matrix3::identity(),
            epsilon = 1e-12
        );
    }
}
