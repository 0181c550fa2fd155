/// IMU Preintegration Factor
///
/// Integrates the inertial samples between two keyframes once, at factor
/// construction, into relative position/velocity/rotation deltas expressed
/// in the body frame of the first keyframe. Solver iterations only apply a
/// first-order bias correction to those deltas.
///
/// Error-state ordering (15): [α (0:3), β (3:6), θ (6:9), ba (9:12), bg (12:15)]
///
/// References:
/// - Forster et al., "On-Manifold Preintegration for Real-Time Visual-Inertial Odometry"
/// - Qin et al., "VINS-Mono: A Robust and Versatile Monocular Visual-Inertial State Estimator"
use nalgebra::{DMatrix, UnitQuaternion};

use crate::config::ImuNoise;
use crate::error::{GraphError, Result};
use crate::so3::{quat_delta, quat_left, quat_mat_xyz, quat_right, right_jacobian, skew_symmetric};
use crate::types::{ImuSample, Mat12, Mat15, Mat15x12, Mat15x6, Mat15x9, Mat3, Vec15, Vec3};
use crate::variables::Variable;

/// Preintegrated IMU Measurements between two keyframes
#[derive(Clone, Debug)]
pub struct PreintegratedImuMeasurements {
    /// Position delta α: ∫∫ R(t) a(t) dt dt
    pub delta_p: Vec3,

    /// Velocity delta β: ∫ R(t) a(t) dt
    pub delta_v: Vec3,

    /// Rotation delta γ: ∏ exp(ω(t) dt)
    pub delta_q: UnitQuaternion<f64>,

    /// Total time elapsed between keyframes [seconds]
    pub sum_dt: f64,

    /// Accelerometer bias the deltas were integrated with [m/s²]
    pub nominal_accel_bias: Vec3,

    /// Gyroscope bias the deltas were integrated with [rad/s]
    pub nominal_gyro_bias: Vec3,

    /// Covariance of the 15-dim error state
    pub covariance: Mat15,

    /// Error-state transition from the first sample, ∂δx_k / ∂δx_0
    pub jacobian: Mat15,

    /// Gravity magnitude [m/s²]
    pub gravity: f64,

    /// Continuous noise densities: diag(σa², σg², σba², σbg²)
    noise: Mat12,
}

impl PreintegratedImuMeasurements {
    /// Empty preintegration at the given nominal biases
    pub fn new(noise: &ImuNoise, accel_bias: Vec3, gyro_bias: Vec3) -> Self {
        let mut q = Mat12::zeros();
        let variances = [
            noise.accel_noise_density.powi(2),
            noise.gyro_noise_density.powi(2),
            noise.accel_random_walk.powi(2),
            noise.gyro_random_walk.powi(2),
        ];
        for (block, var) in variances.iter().enumerate() {
            for i in 0..3 {
                q[(3 * block + i, 3 * block + i)] = *var;
            }
        }

        Self {
            delta_p: Vec3::zeros(),
            delta_v: Vec3::zeros(),
            delta_q: UnitQuaternion::identity(),
            sum_dt: 0.0,
            nominal_accel_bias: accel_bias,
            nominal_gyro_bias: gyro_bias,
            covariance: Mat15::zeros(),
            jacobian: Mat15::identity(),
            gravity: noise.gravity,
            noise: q,
        }
    }

    /// Integrate a chronological sample stream over its N-1 intervals.
    pub fn from_samples(
        samples: &[ImuSample],
        noise: &ImuNoise,
        accel_bias: Vec3,
        gyro_bias: Vec3,
    ) -> Result<Self> {
        if samples.len() < 2 {
            return Err(GraphError::TooFewImuSamples(samples.len()));
        }
        for (index, pair) in samples.windows(2).enumerate() {
            if pair[1].timestamp <= pair[0].timestamp {
                return Err(GraphError::NonIncreasingImuTimestamps {
                    index: index + 1,
                    previous: pair[0].timestamp,
                    current: pair[1].timestamp,
                });
            }
        }

        let mut preintegration = Self::new(noise, accel_bias, gyro_bias);
        for pair in samples.windows(2) {
            let dt = pair[1].timestamp - pair[0].timestamp;
            preintegration.integrate_measurement(pair[0].accel, pair[0].gyro, dt);
        }
        Ok(preintegration)
    }

    /// Integrate one accel and gyro measurement held for `dt` seconds
    pub fn integrate_measurement(&mut self, accel: Vec3, gyro: Vec3, dt: f64) {
        // Correct measurements for the nominal bias
        let accel_corrected = accel - self.nominal_accel_bias;
        let gyro_corrected = gyro - self.nominal_gyro_bias;
        let rot = self.delta_q.to_rotation_matrix().into_inner();

        // Continuous error-state dynamics at this step
        let mut f = Mat15::zeros();
        f.fixed_view_mut::<3, 3>(0, 3).copy_from(&Mat3::identity());
        f.fixed_view_mut::<3, 3>(3, 6)
            .copy_from(&(-rot * skew_symmetric(&accel_corrected)));
        f.fixed_view_mut::<3, 3>(3, 9).copy_from(&(-rot));
        f.fixed_view_mut::<3, 3>(6, 6)
            .copy_from(&(-skew_symmetric(&gyro_corrected)));
        f.fixed_view_mut::<3, 3>(6, 12).copy_from(&(-Mat3::identity()));

        // Noise input [na, ng, nba, nbg]
        let mut g = Mat15x12::zeros();
        g.fixed_view_mut::<3, 3>(3, 0).copy_from(&(-rot));
        g.fixed_view_mut::<3, 3>(6, 3).copy_from(&(-Mat3::identity()));
        g.fixed_view_mut::<3, 3>(9, 6).copy_from(&Mat3::identity());
        g.fixed_view_mut::<3, 3>(12, 9).copy_from(&Mat3::identity());

        let mut phi = Mat15::identity() + f * dt;
        // Second-order terms of the position update
        phi.fixed_view_mut::<3, 3>(0, 6)
            .copy_from(&(-0.5 * rot * skew_symmetric(&accel_corrected) * dt * dt));
        phi.fixed_view_mut::<3, 3>(0, 9)
            .copy_from(&(-0.5 * rot * dt * dt));

        // Integrate position: α += β dt + ½ R a dt²
        self.delta_p += self.delta_v * dt + 0.5 * rot * accel_corrected * dt * dt;

        // Integrate velocity: β += R a dt
        self.delta_v += rot * accel_corrected * dt;

        // Integrate rotation: γ = γ ⊗ exp(ω dt)
        self.delta_q *= quat_delta(&(gyro_corrected * dt));

        self.sum_dt += dt;

        let cov = phi * self.covariance * phi.transpose() + g * self.noise * g.transpose() * dt;
        self.covariance = 0.5 * (cov + cov.transpose());
        self.jacobian = phi * self.jacobian;
    }

    /// ∂α / ∂ba
    pub fn dp_dba(&self) -> Mat3 {
        self.jacobian.fixed_view::<3, 3>(0, 9).into_owned()
    }

    /// ∂α / ∂bg
    pub fn dp_dbg(&self) -> Mat3 {
        self.jacobian.fixed_view::<3, 3>(0, 12).into_owned()
    }

    /// ∂β / ∂ba
    pub fn dv_dba(&self) -> Mat3 {
        self.jacobian.fixed_view::<3, 3>(3, 9).into_owned()
    }

    /// ∂β / ∂bg
    pub fn dv_dbg(&self) -> Mat3 {
        self.jacobian.fixed_view::<3, 3>(3, 12).into_owned()
    }

    /// ∂θ / ∂bg
    pub fn dq_dbg(&self) -> Mat3 {
        self.jacobian.fixed_view::<3, 3>(6, 12).into_owned()
    }

    /// Deltas corrected to first order for new bias estimates
    pub fn corrected(&self, accel_bias: &Vec3, gyro_bias: &Vec3) -> (Vec3, Vec3, UnitQuaternion<f64>) {
        let delta_ba = accel_bias - self.nominal_accel_bias;
        let delta_bg = gyro_bias - self.nominal_gyro_bias;

        let corrected_dp = self.delta_p + self.dp_dba() * delta_ba + self.dp_dbg() * delta_bg;
        let corrected_dv = self.delta_v + self.dv_dba() * delta_ba + self.dv_dbg() * delta_bg;
        let corrected_dq = self.delta_q * quat_delta(&(self.dq_dbg() * delta_bg));

        (corrected_dp, corrected_dv, corrected_dq)
    }
}

/// IMU factor over [pose_i, speed_bias_i, pose_j, speed_bias_j]
///
/// Residual (15): [position error; velocity error; 2·vec(rotation error);
/// ba_j − ba_i; bg_j − bg_i], with gravity acting along world −z.
#[derive(Clone, Debug)]
pub struct ImuFactor {
    pub preintegration: PreintegratedImuMeasurements,
}

impl ImuFactor {
    pub fn new(preintegration: PreintegratedImuMeasurements) -> Self {
        Self { preintegration }
    }

    /// Information = Covariance⁻¹
    pub fn information(&self) -> Result<DMatrix<f64>> {
        let inverse = self
            .preintegration
            .covariance
            .cholesky()
            .map(|c| c.inverse())
            .ok_or(GraphError::SingularImuCovariance)?;
        let symmetric = 0.5 * (inverse + inverse.transpose());
        Ok(DMatrix::from_column_slice(15, 15, symmetric.as_slice()))
    }

    pub fn evaluate(
        &self,
        pose_i: &Variable,
        sb_i: &Variable,
        pose_j: &Variable,
        sb_j: &Variable,
    ) -> (Vec15, ImuJacobians) {
        let pre = &self.preintegration;
        let dt = pre.sum_dt;
        let g = Vec3::new(0.0, 0.0, pre.gravity);

        let q_i = pose_i.rotation();
        let q_j = pose_j.rotation();
        let c_it = q_i.inverse().to_rotation_matrix().into_inner();
        let (r_i, r_j) = (pose_i.translation(), pose_j.translation());
        let (v_i, v_j) = (sb_i.velocity(), sb_j.velocity());
        let (ba_i, bg_i) = (sb_i.accel_bias(), sb_i.gyro_bias());
        let (ba_j, bg_j) = (sb_j.accel_bias(), sb_j.gyro_bias());

        let (alpha, beta, gamma) = pre.corrected(&ba_i, &bg_i);
        let phi = pre.dq_dbg() * (bg_i - pre.nominal_gyro_bias);

        let d_p = r_j - r_i - v_i * dt + 0.5 * g * dt * dt;
        let d_v = v_j - v_i + g * dt;

        // Rotation error E = γ⁻¹ ⊗ q_i⁻¹ ⊗ q_j, kept on the w ≥ 0 hemisphere
        let a = gamma.inverse() * q_i.inverse();
        let e = a * q_j;
        let sign = if e.w < 0.0 { -1.0 } else { 1.0 };

        let mut residual = Vec15::zeros();
        residual
            .fixed_rows_mut::<3>(0)
            .copy_from(&(c_it * d_p - alpha));
        residual
            .fixed_rows_mut::<3>(3)
            .copy_from(&(c_it * d_v - beta));
        residual
            .fixed_rows_mut::<3>(6)
            .copy_from(&(2.0 * sign * e.imag()));
        residual.fixed_rows_mut::<3>(9).copy_from(&(ba_j - ba_i));
        residual.fixed_rows_mut::<3>(12).copy_from(&(bg_j - bg_i));

        let j_q = sign * quat_mat_xyz(&(quat_left(&a) * quat_right(&q_j)));
        let j_q_bg =
            -sign * quat_mat_xyz(&quat_right(&e)) * right_jacobian(&phi) * pre.dq_dbg();
        let identity = Mat3::identity();

        let mut j_pose_i = Mat15x6::zeros();
        j_pose_i
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&(c_it * skew_symmetric(&d_p)));
        j_pose_i.fixed_view_mut::<3, 3>(0, 3).copy_from(&(-c_it));
        j_pose_i
            .fixed_view_mut::<3, 3>(3, 0)
            .copy_from(&(c_it * skew_symmetric(&d_v)));
        j_pose_i.fixed_view_mut::<3, 3>(6, 0).copy_from(&(-j_q));

        let mut j_sb_i = Mat15x9::zeros();
        j_sb_i.fixed_view_mut::<3, 3>(0, 0).copy_from(&(-c_it * dt));
        j_sb_i.fixed_view_mut::<3, 3>(0, 3).copy_from(&(-pre.dp_dba()));
        j_sb_i.fixed_view_mut::<3, 3>(0, 6).copy_from(&(-pre.dp_dbg()));
        j_sb_i.fixed_view_mut::<3, 3>(3, 0).copy_from(&(-c_it));
        j_sb_i.fixed_view_mut::<3, 3>(3, 3).copy_from(&(-pre.dv_dba()));
        j_sb_i.fixed_view_mut::<3, 3>(3, 6).copy_from(&(-pre.dv_dbg()));
        j_sb_i.fixed_view_mut::<3, 3>(6, 6).copy_from(&j_q_bg);
        j_sb_i.fixed_view_mut::<3, 3>(9, 3).copy_from(&(-identity));
        j_sb_i.fixed_view_mut::<3, 3>(12, 6).copy_from(&(-identity));

        let mut j_pose_j = Mat15x6::zeros();
        j_pose_j.fixed_view_mut::<3, 3>(0, 3).copy_from(&c_it);
        j_pose_j.fixed_view_mut::<3, 3>(6, 0).copy_from(&j_q);

        let mut j_sb_j = Mat15x9::zeros();
        j_sb_j.fixed_view_mut::<3, 3>(3, 0).copy_from(&c_it);
        j_sb_j.fixed_view_mut::<3, 3>(9, 3).copy_from(&identity);
        j_sb_j.fixed_view_mut::<3, 3>(12, 6).copy_from(&identity);

        (
            residual,
            ImuJacobians {
                pose_i: j_pose_i,
                sb_i: j_sb_i,
                pose_j: j_pose_j,
                sb_j: j_sb_j,
            },
        )
    }
}

/// Jacobian blocks of the IMU residual, one per referenced variable
#[derive(Clone, Debug)]
pub struct ImuJacobians {
    pub pose_i: Mat15x6,
    pub sb_i: Mat15x9,
    pub pose_j: Mat15x6,
    pub sb_j: Mat15x9,
}

impl ImuJacobians {
    pub fn into_blocks(self) -> Vec<DMatrix<f64>> {
        vec![
            DMatrix::from_column_slice(15, 6, self.pose_i.as_slice()),
            DMatrix::from_column_slice(15, 9, self.sb_i.as_slice()),
            DMatrix::from_column_slice(15, 6, self.pose_j.as_slice()),
            DMatrix::from_column_slice(15, 9, self.sb_j.as_slice()),
        ]
    }
}
