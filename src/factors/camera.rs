/// Reprojection factor through a sensor-to-camera extrinsic
///
/// Variables: body pose T_WS, extrinsic T_SC, landmark p_W, camera
/// intrinsics. The camera pose is T_WC = T_WS · T_SC.
///
///   p_S = C_SW (p_W − r_WS)
///   p_C = C_CS (p_S − r_SC)
///   r   = z − h(p_C)
use nalgebra::DMatrix;

use crate::error::EvalFailure;
use crate::so3::skew_symmetric;
use crate::types::{Mat23, Mat26, Vec2};
use crate::variables::Variable;

#[derive(Clone, Debug)]
pub struct CamFactor {
    /// Observed pixel
    pub measurement: Vec2,
}

impl CamFactor {
    pub fn new(measurement: Vec2) -> Self {
        Self { measurement }
    }

    pub fn evaluate(
        &self,
        pose: &Variable,
        extrinsic: &Variable,
        landmark: &Variable,
        camera: &Variable,
    ) -> Result<(Vec2, Vec<DMatrix<f64>>), EvalFailure> {
        let c_sw = pose.rotation().inverse().to_rotation_matrix().into_inner();
        let c_cs = extrinsic
            .rotation()
            .inverse()
            .to_rotation_matrix()
            .into_inner();

        let d_w = landmark.position() - pose.translation();
        let p_s = c_sw * d_w;
        let d_s = p_s - extrinsic.translation();
        let p_c = c_cs * d_s;

        let model = camera
            .projection_model()
            .ok_or(EvalFailure::OutOfImage)?;
        let (predicted, j_h) = model.project(&p_c)?;
        let residual = self.measurement - predicted;

        let j_hs: Mat23 = j_h * c_cs;
        let j_hw: Mat23 = j_hs * c_sw;

        let mut j_pose = Mat26::zeros();
        j_pose
            .fixed_view_mut::<2, 3>(0, 0)
            .copy_from(&(-j_hw * skew_symmetric(&d_w)));
        j_pose.fixed_view_mut::<2, 3>(0, 3).copy_from(&j_hw);

        let mut j_extrinsic = Mat26::zeros();
        j_extrinsic
            .fixed_view_mut::<2, 3>(0, 0)
            .copy_from(&(-j_hs * skew_symmetric(&d_s)));
        j_extrinsic.fixed_view_mut::<2, 3>(0, 3).copy_from(&j_hs);

        let j_landmark: Mat23 = -j_hw;
        let j_camera = -model.parameter_jacobian(&p_c);

        Ok((
            residual,
            vec![
                DMatrix::from_column_slice(2, 6, j_pose.as_slice()),
                DMatrix::from_column_slice(2, 6, j_extrinsic.as_slice()),
                DMatrix::from_column_slice(2, 3, j_landmark.as_slice()),
                j_camera,
            ],
        ))
    }
}
