/// Bundle-adjustment reprojection factor
///
/// Variables: camera pose T_WC, landmark p_W, camera intrinsics.
///
///   p_C = C_CW (p_W − r_WC)
///   r   = z − h(p_C)
use nalgebra::DMatrix;

use crate::error::EvalFailure;
use crate::so3::skew_symmetric;
use crate::types::{Mat23, Mat26, Vec2};
use crate::variables::Variable;

#[derive(Clone, Debug)]
pub struct BaFactor {
    /// Observed pixel
    pub measurement: Vec2,
}

impl BaFactor {
    pub fn new(measurement: Vec2) -> Self {
        Self { measurement }
    }

    pub fn evaluate(
        &self,
        pose: &Variable,
        landmark: &Variable,
        camera: &Variable,
    ) -> Result<(Vec2, Vec<DMatrix<f64>>), EvalFailure> {
        // Transform point from world to camera frame
        let c_cw = pose.rotation().inverse().to_rotation_matrix().into_inner();
        let p_w = landmark.position();
        let d = p_w - pose.translation();
        let p_c = c_cw * d;

        let model = camera
            .projection_model()
            .ok_or(EvalFailure::OutOfImage)?;
        let (predicted, j_h) = model.project(&p_c)?;
        let residual = self.measurement - predicted;

        let j_hc: Mat23 = j_h * c_cw;

        let mut j_pose = Mat26::zeros();
        j_pose
            .fixed_view_mut::<2, 3>(0, 0)
            .copy_from(&(-j_hc * skew_symmetric(&d)));
        j_pose.fixed_view_mut::<2, 3>(0, 3).copy_from(&j_hc);

        let j_landmark: Mat23 = -j_hc;
        let j_camera = -model.parameter_jacobian(&p_c);

        Ok((
            residual,
            vec![
                DMatrix::from_column_slice(2, 6, j_pose.as_slice()),
                DMatrix::from_column_slice(2, 3, j_landmark.as_slice()),
                j_camera,
            ],
        ))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::camera::CameraModelKind;
    use crate::factors::{check_jacobians, Factor, FactorId, FactorKind};
    use crate::types::Vec3;
    use crate::variables::VariableId;
    use approx::assert_relative_eq;
    use nalgebra::{Isometry3, Matrix3, Rotation3, Translation3, UnitQuaternion};

    /// Camera at `position` looking along world +x
    pub(crate) fn camera_looking_along_x(position: Vec3) -> Isometry3<f64> {
        #[rustfmt::skip]
        let c_wc = Matrix3::new(
            0.0,  0.0, 1.0,
            -1.0, 0.0, 0.0,
            0.0, -1.0, 0.0,
        );
        let q = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(c_wc));
        Isometry3::from_parts(Translation3::from(position), q)
    }

    fn radtan_camera() -> Variable {
        Variable::camera(
            VariableId(2),
            0,
            [752, 480],
            CameraModelKind::PinholeRadtan4,
            &[458.654, 457.296, 367.215, 248.375],
            &[-0.28, 0.07, 0.0002, 0.00002],
        )
        .unwrap()
    }

    fn ba_factor(measurement: Vec2) -> Factor {
        Factor::new(
            FactorId(0),
            vec![VariableId(0), VariableId(1), VariableId(2)],
            DMatrix::identity(2, 2),
            FactorKind::BundleAdjustment(BaFactor::new(measurement)),
        )
        .unwrap()
    }

    #[test]
    fn test_zero_residual_when_prediction_matches() {
        let pose = Variable::pose(VariableId(0), 0.0, &camera_looking_along_x(Vec3::zeros()));
        let landmark = Variable::landmark(VariableId(1), &Vec3::new(1.0, 0.0, 0.0));
        let camera = radtan_camera();

        // Landmark on the optical axis projects to the principal point
        let factor = BaFactor::new(Vec2::new(367.215, 248.375));
        let (residual, _) = factor.evaluate(&pose, &landmark, &camera).unwrap();
        assert_relative_eq!(residual, Vec2::zeros(), epsilon = 1e-9);
    }

    #[test]
    fn test_behind_camera_fails() {
        let pose = Variable::pose(VariableId(0), 0.0, &camera_looking_along_x(Vec3::zeros()));
        let landmark = Variable::landmark(VariableId(1), &Vec3::new(-1.0, 0.0, 0.0));
        let camera = radtan_camera();

        let mut factor = ba_factor(Vec2::new(300.0, 200.0));
        let status = factor.eval(&[&pose, &landmark, &camera], true);
        assert_eq!(status, Err(EvalFailure::BehindCamera));
        assert_eq!(factor.residuals.norm(), 0.0);
        assert!(factor.jacobians.iter().all(|j| j.norm() == 0.0));
    }

    #[test]
    fn test_jacobians_finite_difference() {
        let pose_iso = Isometry3::from_parts(
            Translation3::new(0.1, 0.05, -0.1),
            UnitQuaternion::from_euler_angles(0.05, -0.02, 0.03)
                * camera_looking_along_x(Vec3::zeros()).rotation,
        );
        let pose = Variable::pose(VariableId(0), 0.0, &pose_iso);
        let landmark = Variable::landmark(VariableId(1), &Vec3::new(2.0, 0.2, -0.1));
        let camera = radtan_camera();
        let factor = ba_factor(Vec2::new(350.0, 260.0));
        let vars = [&pose, &landmark, &camera];

        for index in 0..3 {
            let check = check_jacobians(&factor, &vars, index, 1e-7, 1e-3).unwrap();
            assert!(
                check.passed,
                "block {} deviates by {}",
                index, check.max_deviation
            );
        }
    }
}
