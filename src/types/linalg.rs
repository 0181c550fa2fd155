//! Linear algebra type system for the factor graph
//!
//! Fixed-size aliases for every block the factors produce, so residual and
//! Jacobian shapes are checked at compile time inside each factor.

use nalgebra::{SMatrix, SVector};

// ===== Local (tangent) dimensions =====
pub const POSE_LOCAL_DIM: usize = 6; // (dθ, dt)
pub const LANDMARK_DIM: usize = 3; // (x, y, z)
pub const SPEED_BIAS_DIM: usize = 9; // (v, ba, bg)

// ===== Storage dimensions =====
pub const POSE_GLOBAL_DIM: usize = 7; // (qw, qx, qy, qz, x, y, z)

// ===== Residual dimensions =====
pub const PIXEL_DIM: usize = 2; // (u, v)
pub const POSE_RESIDUAL_DIM: usize = 6;
pub const IMU_RESIDUAL_DIM: usize = 15; // (dp, dv, dθ, dba, dbg)

pub type Vec2 = SVector<f64, PIXEL_DIM>;
pub type Vec3 = SVector<f64, 3>;
pub type Vec6 = SVector<f64, POSE_RESIDUAL_DIM>;
pub type Vec9 = SVector<f64, SPEED_BIAS_DIM>;
pub type Vec15 = SVector<f64, IMU_RESIDUAL_DIM>;

pub type Mat2 = SMatrix<f64, 2, 2>;
pub type Mat3 = SMatrix<f64, 3, 3>;
pub type Mat4 = SMatrix<f64, 4, 4>;
pub type Mat6 = SMatrix<f64, POSE_RESIDUAL_DIM, POSE_RESIDUAL_DIM>;

// Projection Jacobians
pub type Mat23 = SMatrix<f64, PIXEL_DIM, 3>; // ∂pixel / ∂p_C
pub type Mat26 = SMatrix<f64, PIXEL_DIM, POSE_LOCAL_DIM>; // ∂pixel / ∂pose

// ===== IMU preintegration (15-dim error state) =====
pub type Mat15 = SMatrix<f64, IMU_RESIDUAL_DIM, IMU_RESIDUAL_DIM>;
pub type Mat15x12 = SMatrix<f64, IMU_RESIDUAL_DIM, 12>;
pub type Mat12 = SMatrix<f64, 12, 12>;
pub type Mat15x6 = SMatrix<f64, IMU_RESIDUAL_DIM, POSE_LOCAL_DIM>;
pub type Mat15x9 = SMatrix<f64, IMU_RESIDUAL_DIM, SPEED_BIAS_DIM>;
