/// Measurement factors
///
/// A factor references 1-4 graph variables by id and produces a residual
/// plus one Jacobian block per referenced variable (residual_dim x
/// local_size). Values are always recomputed from the variables handed to
/// `eval`; only IMU preintegration caches its integrated deltas.

pub mod ba;
pub mod camera;
pub mod check;
pub mod imu_preintegration;
pub mod marginalization;
pub mod pose;

use std::fmt;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

pub use ba::BaFactor;
pub use camera::CamFactor;
pub use check::{check_jacobians, JacobianCheck};
pub use imu_preintegration::{ImuFactor, ImuJacobians, PreintegratedImuMeasurements};
pub use marginalization::MargFactor;
pub use pose::PoseFactor;

use crate::error::{EvalFailure, GraphError, Result};
use crate::types::{IMU_RESIDUAL_DIM, PIXEL_DIM, POSE_RESIDUAL_DIM};
use crate::variables::Variable;
use crate::variables::VariableId;

/// Stable handle of a factor inside one graph
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FactorId(pub usize);

impl fmt::Display for FactorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

/// Closed set of factor kinds
#[derive(Clone, Debug)]
pub enum FactorKind {
    /// Unary prior on a pose: [pose]
    Pose(PoseFactor),
    /// Reprojection: [pose T_WC, landmark, camera]
    BundleAdjustment(BaFactor),
    /// Reprojection through an extrinsic: [pose T_WS, extrinsic T_SC, landmark, camera]
    Camera(CamFactor),
    /// [pose_i, speed_bias_i, pose_j, speed_bias_j]
    Imu(ImuFactor),
    /// Linearized prior over the remaining variables of a marginalization
    Marginalization(MargFactor),
}

impl FactorKind {
    pub fn name(&self) -> &'static str {
        match self {
            FactorKind::Pose(_) => "pose",
            FactorKind::BundleAdjustment(_) => "ba",
            FactorKind::Camera(_) => "cam",
            FactorKind::Imu(_) => "imu",
            FactorKind::Marginalization(_) => "marg",
        }
    }

    pub fn residual_size(&self) -> usize {
        match self {
            FactorKind::Pose(_) => POSE_RESIDUAL_DIM,
            FactorKind::BundleAdjustment(_) | FactorKind::Camera(_) => PIXEL_DIM,
            FactorKind::Imu(_) => IMU_RESIDUAL_DIM,
            FactorKind::Marginalization(m) => m.residual_size(),
        }
    }

    /// Visual factors carry a pixel measurement
    pub fn is_reprojection(&self) -> bool {
        matches!(self, FactorKind::BundleAdjustment(_) | FactorKind::Camera(_))
    }

    fn evaluate(
        &self,
        vars: &[&Variable],
    ) -> std::result::Result<(DVector<f64>, Vec<DMatrix<f64>>), EvalFailure> {
        match self {
            FactorKind::Pose(f) => {
                let (r, j) = f.evaluate(vars[0]);
                Ok((
                    DVector::from_column_slice(r.as_slice()),
                    vec![DMatrix::from_column_slice(6, 6, j.as_slice())],
                ))
            }
            FactorKind::BundleAdjustment(f) => {
                let (r, jacobians) = f.evaluate(vars[0], vars[1], vars[2])?;
                Ok((DVector::from_column_slice(r.as_slice()), jacobians))
            }
            FactorKind::Camera(f) => {
                let (r, jacobians) = f.evaluate(vars[0], vars[1], vars[2], vars[3])?;
                Ok((DVector::from_column_slice(r.as_slice()), jacobians))
            }
            FactorKind::Imu(f) => {
                let (r, jacobians) = f.evaluate(vars[0], vars[1], vars[2], vars[3]);
                Ok((DVector::from_column_slice(r.as_slice()), jacobians.into_blocks()))
            }
            FactorKind::Marginalization(f) => Ok(f.evaluate(vars)),
        }
    }
}

/// A factor as stored in the graph
#[derive(Clone, Debug)]
pub struct Factor {
    pub id: FactorId,
    /// Referenced variables, in the order the kind expects them
    pub variables: Vec<VariableId>,
    pub information: DMatrix<f64>,
    /// Upper-triangular Lᵀ with information = L Lᵀ
    sqrt_information: DMatrix<f64>,
    pub residuals: DVector<f64>,
    pub jacobians: Vec<DMatrix<f64>>,
    pub kind: FactorKind,
}

impl Factor {
    /// Validates the information matrix against the kind's residual size.
    pub fn new(
        id: FactorId,
        variables: Vec<VariableId>,
        information: DMatrix<f64>,
        kind: FactorKind,
    ) -> Result<Self> {
        let n = kind.residual_size();
        if information.nrows() != n || information.ncols() != n {
            return Err(GraphError::InformationShape {
                expected: n,
                rows: information.nrows(),
                cols: information.ncols(),
            });
        }
        let sqrt_information = sqrt_information(&information)?;

        Ok(Self {
            id,
            variables,
            information,
            sqrt_information,
            residuals: DVector::zeros(n),
            jacobians: Vec::new(),
            kind,
        })
    }

    pub fn residual_size(&self) -> usize {
        self.kind.residual_size()
    }

    /// Recompute residual (and Jacobians, if requested) from `vars`, which
    /// must line up with `self.variables`.
    ///
    /// Without `compute_jacobians` the Jacobians are cleared. On failure the
    /// residual and every Jacobian are zeroed.
    pub fn eval(
        &mut self,
        vars: &[&Variable],
        compute_jacobians: bool,
    ) -> std::result::Result<(), EvalFailure> {
        match self.kind.evaluate(vars) {
            Ok((residuals, jacobians)) => {
                self.residuals = residuals;
                if compute_jacobians {
                    self.jacobians = jacobians;
                } else {
                    self.jacobians.clear();
                }
                Ok(())
            }
            Err(failure) => {
                self.residuals.fill(0.0);
                self.jacobians = vars
                    .iter()
                    .map(|v| DMatrix::zeros(self.kind.residual_size(), v.local_size()))
                    .collect();
                Err(failure)
            }
        }
    }

    /// Lᵀ r, so that ½‖Lᵀ r‖² = ½ rᵀ·info·r
    pub fn whitened_residuals(&self) -> DVector<f64> {
        &self.sqrt_information * &self.residuals
    }

    pub fn whitened_jacobian(&self, index: usize) -> DMatrix<f64> {
        &self.sqrt_information * &self.jacobians[index]
    }

    /// ½ rᵀ·info·r for the last evaluated residual
    pub fn cost(&self) -> f64 {
        0.5 * self.whitened_residuals().norm_squared()
    }
}

/// Cholesky factor Lᵀ of a symmetric positive-definite information matrix
fn sqrt_information(information: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    let asymmetry = (information - information.transpose()).amax();
    if asymmetry > 1e-9 * information.amax().max(1.0) {
        return Err(GraphError::InformationNotPositiveDefinite);
    }
    information
        .clone()
        .cholesky()
        .map(|chol| chol.l().transpose())
        .ok_or(GraphError::InformationNotPositiveDefinite)
}
