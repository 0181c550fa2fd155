/// Finite-difference verification of analytic Jacobians
use serde::Serialize;

use super::Factor;
use crate::error::{GraphError, Result};
use crate::variables::Variable;

#[derive(Clone, Debug, Serialize)]
pub struct JacobianCheck {
    /// Largest |analytic - numeric| entry
    pub max_deviation: f64,
    pub passed: bool,
}

/// Compare the Jacobian block of variable `index` against forward
/// differences of the residual, nudging each local dimension by `step`
/// through `Variable::perturb`.
pub fn check_jacobians(
    factor: &Factor,
    vars: &[&Variable],
    index: usize,
    step: f64,
    threshold: f64,
) -> Result<JacobianCheck> {
    if index >= vars.len() || index >= factor.variables.len() {
        return Err(GraphError::JacobianIndex {
            factor: factor.id,
            index,
            len: factor.variables.len(),
        });
    }

    let mut scratch = factor.clone();
    scratch
        .eval(vars, true)
        .map_err(|failure| GraphError::FactorEvaluation(factor.id, failure))?;
    let r0 = scratch.residuals.clone();
    let analytic = scratch.jacobians[index].clone();

    let mut max_deviation: f64 = 0.0;
    for i in 0..vars[index].local_size() {
        let mut nudged = vars[index].clone();
        nudged.perturb(i, step);

        let mut perturbed: Vec<&Variable> = vars.to_vec();
        perturbed[index] = &nudged;
        scratch
            .eval(&perturbed, false)
            .map_err(|failure| GraphError::FactorEvaluation(factor.id, failure))?;

        let numeric = (&scratch.residuals - &r0) / step;
        let deviation = (numeric - analytic.column(i)).amax();
        max_deviation = max_deviation.max(deviation);
    }

    Ok(JacobianCheck {
        max_deviation,
        passed: max_deviation <= threshold,
    })
}
