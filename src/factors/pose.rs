/// Pose prior factor
///
/// Residual (6): [2·vec(q_meas ⊗ q_est⁻¹); t_meas − t_est]
use nalgebra::Isometry3;

use crate::so3::skew_symmetric;
use crate::types::{Mat3, Mat6, Vec6};
use crate::variables::Variable;

#[derive(Clone, Debug)]
pub struct PoseFactor {
    /// Measured pose
    pub measurement: Isometry3<f64>,
}

impl PoseFactor {
    pub fn new(measurement: Isometry3<f64>) -> Self {
        Self { measurement }
    }

    /// Residual and ∂r/∂(dα, dt) for the current pose estimate.
    pub fn evaluate(&self, pose: &Variable) -> (Vec6, Mat6) {
        let q_est = pose.rotation();
        let mut dq = (self.measurement.rotation * q_est.inverse()).into_inner();
        // q and -q are the same rotation; keep the error near identity
        if dq.w < 0.0 {
            dq = -dq;
        }
        let dq_vec = dq.imag();
        let dt = self.measurement.translation.vector - pose.translation();

        let mut residual = Vec6::zeros();
        residual.fixed_rows_mut::<3>(0).copy_from(&(2.0 * dq_vec));
        residual.fixed_rows_mut::<3>(3).copy_from(&dt);

        // Δq ⊗ δq(-dα) linearized
        let mut jacobian = Mat6::zeros();
        jacobian
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&(-(Mat3::identity() * dq.w + skew_symmetric(&dq_vec))));
        jacobian
            .fixed_view_mut::<3, 3>(3, 3)
            .copy_from(&(-Mat3::identity()));

        (residual, jacobian)
    }
}
