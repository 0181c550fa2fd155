//! Damped Gauss-Newton (Levenberg-Marquardt) solver
//!
//! Each iteration solves (JᵀJ + λ·diag(JᵀJ)) δ = −Jᵀr, applies δ and keeps
//! it only if the cost went down:
//! - accepted: λ ← λ / 10
//! - rejected: λ ← λ × 10 and δ is undone
//!
//! Termination is reported through [`Termination`], never as an error.

use std::fmt;
use std::time::Instant;

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use serde::Serialize;

use crate::config::SolverConfig;
use crate::error::Result;
use crate::graph::FactorGraph;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// |Δcost| of the last accepted or rejected step fell below the threshold
    CostConverged,
    /// The next iteration would exceed the time budget
    TimeLimit,
    MaxIterations,
    /// λ reached `lambda_max` without an acceptable step
    DampingSaturated,
    /// No free variable takes part in any factor
    NothingToOptimize,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Termination::CostConverged => "cost converged",
            Termination::TimeLimit => "time limit",
            Termination::MaxIterations => "max iterations",
            Termination::DampingSaturated => "damping saturated",
            Termination::NothingToOptimize => "nothing to optimize",
        };
        write!(f, "{}", reason)
    }
}

/// Outcome of one damped step
#[derive(Clone, Copy, Debug, PartialEq)]
enum Step {
    /// Cost dropped to the contained value
    Accepted(f64),
    /// Candidate cost did not improve; the step was undone
    Rejected(f64),
    /// Damped system could not be factored; counted as a rejection
    NotPositiveDefinite,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Accepted(_) => write!(f, "accepted"),
            Step::Rejected(candidate) => write!(f, "rejected (candidate {:.6e})", candidate),
            Step::NotPositiveDefinite => write!(f, "rejected (not positive definite)"),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SolveSummary {
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    /// Wall-clock time [seconds]
    pub elapsed: f64,
    pub accepted_steps: usize,
    pub rejected_steps: usize,
    pub final_lambda: f64,
    pub termination: Termination,
    pub converged: bool,
}

#[derive(Clone, Debug, Default)]
pub struct Solver {
    pub config: SolverConfig,
}

impl Solver {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }

    /// Damped normal equations: (H + λ·max(diag(H), min_diagonal)) δ = −Jᵀr
    fn solve_step(&self, r: &DVector<f64>, j: &DMatrix<f64>, lambda: f64) -> Option<DVector<f64>> {
        let jt = j.transpose();
        let mut h = &jt * j;
        let g = -(&jt * r);
        for i in 0..h.nrows() {
            let d = h[(i, i)].max(self.config.min_diagonal);
            h[(i, i)] += lambda * d;
        }
        h.cholesky().map(|chol| chol.solve(&g))
    }

    /// Apply one damped step to `graph` and keep it only if the cost drops
    /// below `cost`. A rejected step is undone with the layout that applied it.
    fn try_step(
        &self,
        graph: &mut FactorGraph,
        r: &DVector<f64>,
        j: &DMatrix<f64>,
        lambda: f64,
        cost: f64,
    ) -> Result<Step> {
        let Some(delta) = self.solve_step(r, j, lambda) else {
            return Ok(Step::NotPositiveDefinite);
        };
        let layout = graph.update(&delta)?;
        let new_cost = graph.cost()?;
        if new_cost < cost {
            Ok(Step::Accepted(new_cost))
        } else {
            graph.update_with(&layout, &(-delta))?;
            Ok(Step::Rejected(new_cost))
        }
    }

    pub fn solve(&self, graph: &mut FactorGraph) -> Result<SolveSummary> {
        let start = Instant::now();
        let cfg = &self.config;

        let (mut r, mut j) = graph.eval()?;
        let initial_cost = 0.5 * r.norm_squared();
        let mut cost = initial_cost;
        let mut lambda = cfg.lambda;
        let mut iterations = 0;
        let mut accepted_steps = 0;
        let mut rejected_steps = 0;

        let mut termination = if j.ncols() == 0 {
            Termination::NothingToOptimize
        } else {
            Termination::MaxIterations
        };

        while termination == Termination::MaxIterations && iterations < cfg.max_iter {
            let iter_start = Instant::now();
            iterations += 1;

            let step = self.try_step(graph, &r, &j, lambda, cost)?;
            let cost_change = match step {
                Step::Accepted(new_cost) => {
                    let change = cost - new_cost;
                    cost = new_cost;
                    lambda /= 10.0;
                    accepted_steps += 1;
                    change
                }
                Step::Rejected(candidate) => {
                    lambda *= 10.0;
                    rejected_steps += 1;
                    cost - candidate
                }
                Step::NotPositiveDefinite => {
                    lambda *= 10.0;
                    rejected_steps += 1;
                    f64::INFINITY
                }
            };
            (r, j) = graph.eval()?;

            let iter_time = iter_start.elapsed().as_secs_f64();
            let total_time = start.elapsed().as_secs_f64();
            debug!(
                "iter {}: cost {:.6e}, change {:.3e}, lambda {:.1e}, iter time {:.3} ms, total {:.3} ms, {}",
                iterations,
                cost,
                cost_change,
                lambda,
                iter_time * 1e3,
                total_time * 1e3,
                step
            );

            if cost_change.abs() < cfg.cost_change_threshold {
                termination = Termination::CostConverged;
            } else if lambda >= cfg.lambda_max {
                termination = Termination::DampingSaturated;
            } else if total_time + iter_time > cfg.time_limit {
                termination = Termination::TimeLimit;
            }
        }

        let summary = SolveSummary {
            iterations,
            initial_cost,
            final_cost: cost,
            elapsed: start.elapsed().as_secs_f64(),
            accepted_steps,
            rejected_steps,
            final_lambda: lambda,
            termination,
            converged: termination == Termination::CostConverged,
        };
        if matches!(termination, Termination::DampingSaturated | Termination::TimeLimit) {
            warn!("Solve stopped early: {}", termination);
        }
        info!(
            "Solve finished ({}): {} iterations, cost {:.6e} -> {:.6e}, {:.3} s",
            summary.termination,
            summary.iterations,
            summary.initial_cost,
            summary.final_cost,
            summary.elapsed
        );
        Ok(summary)
    }
}
