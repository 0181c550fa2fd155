/// Marginalization prior
///
/// Folds a set of factors into a dense linear prior over the variables that
/// remain once the marginalized ones are eliminated:
///
///   H = JᵀJ, b = Jᵀr over [marginalized | remaining]
///   H* = Hrr − Hrm Hmm⁺ Hmr,  b* = br − Hrm Hmm⁺ bm
///   H* = J₀ᵀJ₀,  J₀ᵀr₀ = b*
///
/// and evaluates r = r₀ + J₀ (x ⊟ x₀) against the linearization point x₀.
use std::collections::BTreeMap;

use log::debug;
use nalgebra::{DMatrix, DVector};

use super::Factor;
use crate::error::{GraphError, Result};
use crate::variables::{Variable, VariableId};

/// Eigenvalues below this are treated as zero
const EIGEN_FLOOR: f64 = 1e-8;

#[derive(Clone, Debug)]
pub struct MargFactor {
    /// Factors folded into this prior
    pub absorbed: Vec<Factor>,
    pub marginalized: Vec<VariableId>,
    /// x₀ of every remaining variable, in factor variable order
    pub linearization_points: Vec<Variable>,
    /// J₀
    pub jacobian: DMatrix<f64>,
    /// r₀
    pub residual: DVector<f64>,
    /// Column of each remaining variable in `jacobian`
    offsets: Vec<usize>,
}

impl MargFactor {
    /// Linearize `factors` at the current variable values and eliminate
    /// `marginalized`. Fixed variables are held constant.
    pub fn build(
        mut factors: Vec<Factor>,
        marginalized: &[VariableId],
        variables: &BTreeMap<VariableId, Variable>,
    ) -> Result<Self> {
        let mut marg_order: Vec<VariableId> = Vec::new();
        let mut remain_order: Vec<VariableId> = Vec::new();
        let mut evaluated = vec![false; factors.len()];

        for (k, factor) in factors.iter_mut().enumerate() {
            let vars = factor
                .variables
                .iter()
                .map(|id| variables.get(id).ok_or(GraphError::UnknownVariable(*id)))
                .collect::<Result<Vec<&Variable>>>()?;

            if let Err(failure) = factor.eval(&vars, true) {
                debug!(
                    "Marginalization skips factor {} ({}): {}",
                    factor.id,
                    factor.kind.name(),
                    failure
                );
                continue;
            }
            evaluated[k] = true;

            for var in vars.iter().filter(|v| !v.fixed) {
                let order = if marginalized.contains(&var.id) {
                    &mut marg_order
                } else {
                    &mut remain_order
                };
                if !order.contains(&var.id) {
                    order.push(var.id);
                }
            }
        }

        // Column layout: marginalized block first
        let mut columns: BTreeMap<VariableId, (usize, usize)> = BTreeMap::new();
        let mut n = 0;
        for id in marg_order.iter().chain(remain_order.iter()) {
            let size = variables[id].local_size();
            columns.insert(*id, (n, size));
            n += size;
        }
        let m: usize = marg_order.iter().map(|id| variables[id].local_size()).sum();
        let nr = n - m;

        let mut h = DMatrix::<f64>::zeros(n, n);
        let mut b = DVector::<f64>::zeros(n);
        for (factor, _) in factors.iter().zip(&evaluated).filter(|(_, e)| **e) {
            let r = factor.whitened_residuals();
            let blocks: Vec<(usize, usize, DMatrix<f64>)> = factor
                .variables
                .iter()
                .enumerate()
                .filter_map(|(k, id)| {
                    columns
                        .get(id)
                        .map(|&(col, size)| (col, size, factor.whitened_jacobian(k)))
                })
                .collect();

            for (col_a, size_a, j_a) in &blocks {
                let mut b_a = b.rows_mut(*col_a, *size_a);
                b_a += j_a.transpose() * &r;
                for (col_b, size_b, j_b) in &blocks {
                    let mut h_ab = h.view_mut((*col_a, *col_b), (*size_a, *size_b));
                    h_ab += j_a.transpose() * j_b;
                }
            }
        }

        // Schur complement onto the remaining block
        let h_mm = h.view((0, 0), (m, m)).into_owned();
        let h_mr = h.view((0, m), (m, nr)).into_owned();
        let h_rr = h.view((m, m), (nr, nr)).into_owned();
        let b_m = b.rows(0, m).into_owned();
        let b_r = b.rows(m, nr).into_owned();

        let h_mm_inv = pseudo_inverse(&h_mm);
        let h_rm_inv = h_mr.transpose() * &h_mm_inv;
        let mut h_star = h_rr - &h_rm_inv * &h_mr;
        h_star = 0.5 * (&h_star + h_star.transpose());
        let b_star = b_r - &h_rm_inv * b_m;

        // H* = V S Vᵀ  ->  J₀ = S^½ Vᵀ,  r₀ = S^-½ Vᵀ b*
        let mut jacobian = DMatrix::<f64>::zeros(nr, nr);
        let mut residual = DVector::<f64>::zeros(nr);
        if nr > 0 {
            let eigen = h_star.symmetric_eigen();
            for i in 0..nr {
                let lambda = eigen.eigenvalues[i];
                if lambda <= EIGEN_FLOOR {
                    continue;
                }
                let s = lambda.sqrt();
                let v = eigen.eigenvectors.column(i);
                jacobian.row_mut(i).copy_from(&(s * v.transpose()));
                residual[i] = v.dot(&b_star) / s;
            }
        }

        let offsets = remain_order.iter().map(|id| columns[id].0 - m).collect();
        let linearization_points = remain_order.iter().map(|id| variables[id].clone()).collect();

        debug!(
            "Marginalized {} variables ({} dims) onto {} remaining ({} dims) from {} factors",
            marg_order.len(),
            m,
            remain_order.len(),
            nr,
            factors.len()
        );

        Ok(Self {
            absorbed: factors,
            marginalized: marginalized.to_vec(),
            linearization_points,
            jacobian,
            residual,
            offsets,
        })
    }

    /// Variables the prior is expressed over
    pub fn remaining(&self) -> Vec<VariableId> {
        self.linearization_points.iter().map(|v| v.id).collect()
    }

    pub fn residual_size(&self) -> usize {
        self.residual.len()
    }

    pub fn evaluate(&self, vars: &[&Variable]) -> (DVector<f64>, Vec<DMatrix<f64>>) {
        let mut residual = self.residual.clone();
        let mut jacobians = Vec::with_capacity(vars.len());

        for ((var, x0), &offset) in vars
            .iter()
            .zip(&self.linearization_points)
            .zip(&self.offsets)
        {
            let block = self.jacobian.columns(offset, x0.local_size());
            residual += &block * var.minus(x0);
            jacobians.push(block.into_owned());
        }
        (residual, jacobians)
    }
}

/// Pseudo-inverse of a symmetric positive semi-definite matrix
fn pseudo_inverse(m: &DMatrix<f64>) -> DMatrix<f64> {
    if m.is_empty() {
        return m.clone();
    }
    let eigen = m.clone().symmetric_eigen();
    let inv_values = eigen
        .eigenvalues
        .map(|lambda| if lambda > EIGEN_FLOOR { 1.0 / lambda } else { 0.0 });
    &eigen.eigenvectors * DMatrix::from_diagonal(&inv_values) * eigen.eigenvectors.transpose()
}
