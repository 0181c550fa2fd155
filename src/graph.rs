//! Factor graph: variable/factor arena, column layout and system assembly
//!
//! The graph owns every variable and factor in id-keyed maps. Factors refer
//! to variables by `VariableId` only, and nothing is removed before the
//! graph is dropped; marginalized variables are fixed instead.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use nalgebra::{DMatrix, DVector, Isometry3};
use serde::Serialize;

use crate::camera::CameraModelKind;
use crate::config::{GraphConfig, ImuNoise};
use crate::error::{GraphError, Result};
use crate::factors::{
    check_jacobians, BaFactor, CamFactor, Factor, FactorId, FactorKind, ImuFactor,
    JacobianCheck, MargFactor, PoseFactor, PreintegratedImuMeasurements,
};
use crate::types::{ImuSample, Vec2, Vec3};
use crate::variables::{Variable, VariableId, VariableType};

/// Per-graph handle generator
#[derive(Clone, Debug, Default)]
pub struct IdGenerator {
    next_variable: usize,
    next_factor: usize,
}

impl IdGenerator {
    pub fn next_variable(&mut self) -> VariableId {
        let id = VariableId(self.next_variable);
        self.next_variable += 1;
        id
    }

    pub fn next_factor(&mut self) -> FactorId {
        let id = FactorId(self.next_factor);
        self.next_factor += 1;
        id
    }
}

/// Contiguous column range owned by one variable type
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TypeBlock {
    pub variable_type: VariableType,
    pub start: usize,
    pub size: usize,
}

/// Variable → column assignment produced by the last `eval`
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ColumnLayout {
    /// First column of every non-fixed variable taking part
    pub columns: BTreeMap<VariableId, usize>,
    pub blocks: Vec<TypeBlock>,
    pub num_rows: usize,
    pub num_columns: usize,
    /// Factors excluded from the last assembly
    pub skipped: Vec<FactorId>,
}

impl ColumnLayout {
    pub fn column(&self, id: VariableId) -> Option<usize> {
        self.columns.get(&id).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct FactorGraph {
    config: GraphConfig,
    ids: IdGenerator,
    variables: BTreeMap<VariableId, Variable>,
    factors: BTreeMap<FactorId, Factor>,
    adjacency: BTreeMap<VariableId, BTreeSet<FactorId>>,
    layout: ColumnLayout,
}

impl FactorGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: GraphConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    // ===== Variables =====

    fn insert_variable(&mut self, variable: Variable) -> VariableId {
        let id = variable.id;
        self.adjacency.insert(id, BTreeSet::new());
        self.variables.insert(id, variable);
        id
    }

    /// Body (or camera) pose T_W*
    pub fn add_pose(&mut self, timestamp: f64, pose: &Isometry3<f64>) -> VariableId {
        let id = self.ids.next_variable();
        self.insert_variable(Variable::pose(id, timestamp, pose))
    }

    /// Sensor-to-camera transform T_SC
    pub fn add_extrinsic(&mut self, pose: &Isometry3<f64>) -> VariableId {
        let id = self.ids.next_variable();
        self.insert_variable(Variable::extrinsic(id, pose))
    }

    pub fn add_landmark(&mut self, p_w: &Vec3) -> VariableId {
        let id = self.ids.next_variable();
        self.insert_variable(Variable::landmark(id, p_w))
    }

    pub fn add_camera(
        &mut self,
        cam_index: usize,
        resolution: [u32; 2],
        model: CameraModelKind,
        proj_params: &[f64],
        dist_params: &[f64],
    ) -> Result<VariableId> {
        // Validate before spending an id
        let variable = Variable::camera(
            VariableId(usize::MAX),
            cam_index,
            resolution,
            model,
            proj_params,
            dist_params,
        )?;
        let id = self.ids.next_variable();
        Ok(self.insert_variable(Variable { id, ..variable }))
    }

    pub fn add_speed_bias(&mut self, timestamp: f64, v: &Vec3, ba: &Vec3, bg: &Vec3) -> VariableId {
        let id = self.ids.next_variable();
        self.insert_variable(Variable::speed_bias(id, timestamp, v, ba, bg))
    }

    pub fn set_fixed(&mut self, id: VariableId, fixed: bool) -> Result<()> {
        let variable = self
            .variables
            .get_mut(&id)
            .ok_or(GraphError::UnknownVariable(id))?;
        variable.fixed = fixed;
        Ok(())
    }

    pub fn variable(&self, id: VariableId) -> Result<&Variable> {
        self.variables.get(&id).ok_or(GraphError::UnknownVariable(id))
    }

    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.variables.values()
    }

    /// Current value of a pose or extrinsic
    pub fn pose(&self, id: VariableId) -> Result<Isometry3<f64>> {
        let variable = self.expect_kind(id, &[VariableType::Pose, VariableType::Extrinsic])?;
        Ok(variable.isometry())
    }

    pub fn landmark(&self, id: VariableId) -> Result<Vec3> {
        Ok(self.expect_kind(id, &[VariableType::Landmark])?.position())
    }

    pub fn num_variables(&self) -> usize {
        self.variables.len()
    }

    fn expect_kind(&self, id: VariableId, expected: &[VariableType]) -> Result<&Variable> {
        let variable = self.variable(id)?;
        let found = variable.variable_type();
        if expected.contains(&found) {
            Ok(variable)
        } else {
            Err(GraphError::WrongVariableKind {
                id,
                expected: expected.to_vec(),
                found,
            })
        }
    }

    // ===== Factors =====

    fn insert_factor(
        &mut self,
        variables: Vec<VariableId>,
        information: DMatrix<f64>,
        kind: FactorKind,
    ) -> Result<FactorId> {
        let id = self.ids.next_factor();
        let factor = Factor::new(id, variables, information, kind)?;
        for var in &factor.variables {
            self.adjacency.entry(*var).or_default().insert(id);
        }
        self.factors.insert(id, factor);
        Ok(id)
    }

    /// Prior on a pose or extrinsic
    pub fn add_pose_factor(
        &mut self,
        pose: VariableId,
        measurement: &Isometry3<f64>,
        information: DMatrix<f64>,
    ) -> Result<FactorId> {
        self.expect_kind(pose, &[VariableType::Pose, VariableType::Extrinsic])?;
        self.insert_factor(
            vec![pose],
            information,
            FactorKind::Pose(PoseFactor::new(*measurement)),
        )
    }

    /// Pixel observation of `landmark` by a camera whose pose is T_WC
    pub fn add_ba_factor(
        &mut self,
        pose: VariableId,
        landmark: VariableId,
        camera: VariableId,
        measurement: Vec2,
        information: DMatrix<f64>,
    ) -> Result<FactorId> {
        self.expect_kind(pose, &[VariableType::Pose])?;
        self.expect_kind(landmark, &[VariableType::Landmark])?;
        self.expect_kind(camera, &[VariableType::CameraParams])?;
        self.insert_factor(
            vec![pose, landmark, camera],
            information,
            FactorKind::BundleAdjustment(BaFactor::new(measurement)),
        )
    }

    /// Pixel observation through body pose T_WS and extrinsic T_SC
    pub fn add_cam_factor(
        &mut self,
        pose: VariableId,
        extrinsic: VariableId,
        landmark: VariableId,
        camera: VariableId,
        measurement: Vec2,
        information: DMatrix<f64>,
    ) -> Result<FactorId> {
        self.expect_kind(pose, &[VariableType::Pose])?;
        self.expect_kind(extrinsic, &[VariableType::Extrinsic])?;
        self.expect_kind(landmark, &[VariableType::Landmark])?;
        self.expect_kind(camera, &[VariableType::CameraParams])?;
        self.insert_factor(
            vec![pose, extrinsic, landmark, camera],
            information,
            FactorKind::Camera(CamFactor::new(measurement)),
        )
    }

    /// Preintegrate `samples` at the current biases of `sb_i`.
    ///
    /// Without an explicit information matrix the inverse preintegrated
    /// covariance is used.
    #[allow(clippy::too_many_arguments)]
    pub fn add_imu_factor(
        &mut self,
        pose_i: VariableId,
        sb_i: VariableId,
        pose_j: VariableId,
        sb_j: VariableId,
        samples: &[ImuSample],
        noise: &ImuNoise,
        information: Option<DMatrix<f64>>,
    ) -> Result<FactorId> {
        self.expect_kind(pose_i, &[VariableType::Pose])?;
        self.expect_kind(pose_j, &[VariableType::Pose])?;
        let speed_bias = self.expect_kind(sb_i, &[VariableType::SpeedBias])?;
        self.expect_kind(sb_j, &[VariableType::SpeedBias])?;

        let preintegration = PreintegratedImuMeasurements::from_samples(
            samples,
            noise,
            speed_bias.accel_bias(),
            speed_bias.gyro_bias(),
        )?;
        let factor = ImuFactor::new(preintegration);
        let information = match information {
            Some(info) => info,
            None => factor.information()?,
        };
        self.insert_factor(
            vec![pose_i, sb_i, pose_j, sb_j],
            information,
            FactorKind::Imu(factor),
        )
    }

    pub fn factor(&self, id: FactorId) -> Result<&Factor> {
        self.factors.get(&id).ok_or(GraphError::UnknownFactor(id))
    }

    pub fn factors(&self) -> impl Iterator<Item = &Factor> {
        self.factors.values()
    }

    pub fn num_factors(&self) -> usize {
        self.factors.len()
    }

    /// Factors currently referencing `id`
    pub fn factors_of(&self, id: VariableId) -> Result<Vec<FactorId>> {
        self.adjacency
            .get(&id)
            .map(|set| set.iter().copied().collect())
            .ok_or(GraphError::UnknownVariable(id))
    }

    /// Finite-difference check of one Jacobian block of a factor
    pub fn check_jacobians(
        &self,
        factor: FactorId,
        index: usize,
        step: f64,
        threshold: f64,
    ) -> Result<JacobianCheck> {
        let factor = self.factor(factor)?;
        let vars = resolve(&self.variables, &factor.variables)?;
        check_jacobians(factor, &vars, index, step, threshold)
    }

    // ===== Assembly =====

    /// Assemble the whitened residual vector and Jacobian.
    ///
    /// Columns are grouped by variable type in `param_order`; within a type,
    /// variables are ordered by first appearance among the surviving factors.
    /// Fixed variables get no columns. Factors failing their geometric
    /// precondition are skipped for this pass.
    pub fn eval(&mut self) -> Result<(DVector<f64>, DMatrix<f64>)> {
        self.layout = ColumnLayout::default();

        // Pass 1: resolve handles and tally touched dimensions per type
        let mut touched: BTreeMap<VariableType, BTreeSet<VariableId>> = BTreeMap::new();
        for factor in self.factors.values() {
            for var in resolve(&self.variables, &factor.variables)? {
                if !var.fixed {
                    touched.entry(var.variable_type()).or_default().insert(var.id);
                }
            }
        }
        for (ty, ids) in &touched {
            let dims: usize = ids.iter().map(|id| self.variables[id].local_size()).sum();
            debug!("eval: {} {:?} variables touched ({} dims)", ids.len(), ty, dims);
        }

        // Pass 2: evaluate, assign offsets within each type block
        let mut offsets: BTreeMap<VariableId, (VariableType, usize)> = BTreeMap::new();
        let mut totals: BTreeMap<VariableType, usize> = BTreeMap::new();
        let mut skipped = Vec::new();
        let mut num_rows = 0;
        for factor in self.factors.values_mut() {
            let vars = resolve(&self.variables, &factor.variables)?;
            if let Err(failure) = factor.eval(&vars, true) {
                debug!(
                    "eval: skipping factor {} ({}): {}",
                    factor.id,
                    factor.kind.name(),
                    failure
                );
                skipped.push(factor.id);
                continue;
            }

            num_rows += factor.residual_size();
            for var in vars.iter().filter(|v| !v.fixed) {
                if offsets.contains_key(&var.id) {
                    continue;
                }
                let ty = var.variable_type();
                let cursor = totals.entry(ty).or_insert(0);
                offsets.insert(var.id, (ty, *cursor));
                *cursor += var.local_size();
            }
        }

        // Block starts follow the configured order; unlisted types go last
        let mut order: Vec<VariableType> = Vec::new();
        for ty in &self.config.param_order {
            if !order.contains(ty) {
                order.push(*ty);
            }
        }
        for ty in VariableType::ALL {
            if !order.contains(&ty) {
                if totals.contains_key(&ty) {
                    debug!("eval: {:?} missing from param_order, appending its block", ty);
                }
                order.push(ty);
            }
        }

        let mut blocks = Vec::new();
        let mut starts: BTreeMap<VariableType, usize> = BTreeMap::new();
        let mut num_columns = 0;
        for ty in order {
            let size = totals.get(&ty).copied().unwrap_or(0);
            starts.insert(ty, num_columns);
            blocks.push(TypeBlock {
                variable_type: ty,
                start: num_columns,
                size,
            });
            num_columns += size;
        }

        let columns: BTreeMap<VariableId, usize> = offsets
            .iter()
            .map(|(id, (ty, offset))| (*id, starts[ty] + offset))
            .collect();

        // Pass 3: fill r and J
        let mut r = DVector::zeros(num_rows);
        let mut j = DMatrix::zeros(num_rows, num_columns);
        let mut row = 0;
        for factor in self.factors.values() {
            if skipped.contains(&factor.id) {
                continue;
            }
            let n = factor.residual_size();
            r.rows_mut(row, n).copy_from(&factor.whitened_residuals());

            for (k, id) in factor.variables.iter().enumerate() {
                let Some(&col) = columns.get(id) else {
                    continue;
                };
                let block = factor.whitened_jacobian(k);
                let mut target = j.view_mut((row, col), (n, block.ncols()));
                target += &block;
            }
            row += n;
        }

        self.layout = ColumnLayout {
            columns,
            blocks,
            num_rows,
            num_columns,
            skipped,
        };
        Ok((r, j))
    }

    /// Column layout from the last `eval` (empty after `update`)
    pub fn layout(&self) -> &ColumnLayout {
        &self.layout
    }

    /// Apply `dx` to every variable with an assigned column, then clear the
    /// layout. The consumed layout is returned so the step can be undone.
    pub fn update(&mut self, dx: &DVector<f64>) -> Result<ColumnLayout> {
        let layout = std::mem::take(&mut self.layout);
        self.update_with(&layout, dx)?;
        Ok(layout)
    }

    /// Apply `dx` laid out according to `layout`
    pub fn update_with(&mut self, layout: &ColumnLayout, dx: &DVector<f64>) -> Result<()> {
        if dx.len() != layout.num_columns {
            return Err(GraphError::UpdateDimension {
                expected: layout.num_columns,
                found: dx.len(),
            });
        }
        for (id, &col) in &layout.columns {
            let variable = self
                .variables
                .get_mut(id)
                .ok_or(GraphError::UnknownVariable(*id))?;
            if variable.fixed {
                continue;
            }
            let step = dx.rows(col, variable.local_size()).into_owned();
            variable.plus(&step);
        }
        Ok(())
    }

    /// ½ Σ rᵀ·info·r over factors that currently evaluate
    pub fn cost(&mut self) -> Result<f64> {
        let mut cost = 0.0;
        for factor in self.factors.values_mut() {
            let vars = resolve(&self.variables, &factor.variables)?;
            if factor.eval(&vars, false).is_ok() {
                cost += factor.cost();
            }
        }
        Ok(cost)
    }

    /// Raw pixel error of every visual factor that currently projects
    pub fn reprojection_errors(&mut self) -> Result<Vec<(FactorId, f64)>> {
        let mut errors = Vec::new();
        for factor in self.factors.values_mut() {
            if !factor.kind.is_reprojection() {
                continue;
            }
            let vars = resolve(&self.variables, &factor.variables)?;
            if factor.eval(&vars, false).is_ok() {
                errors.push((factor.id, factor.residuals.norm()));
            }
        }
        Ok(errors)
    }

    /// RMS pixel error, 0 when no visual factor projects
    pub fn reprojection_rmse(&mut self) -> Result<f64> {
        let errors = self.reprojection_errors()?;
        if errors.is_empty() {
            return Ok(0.0);
        }
        let sum_sq: f64 = errors.iter().map(|(_, e)| e * e).sum();
        Ok((sum_sq / errors.len() as f64).sqrt())
    }

    // ===== Marginalization =====

    /// Eliminate `ids`, replacing every factor that touches them with one
    /// linear prior over the other variables those factors reference.
    ///
    /// The marginalized variables stay in the graph, fixed. Returns `None`
    /// when every other variable involved is fixed, so no prior is needed.
    pub fn marginalize(&mut self, ids: &[VariableId]) -> Result<Option<FactorId>> {
        let mut incident: BTreeSet<FactorId> = BTreeSet::new();
        for id in ids {
            let factors = self
                .adjacency
                .get(id)
                .ok_or(GraphError::UnknownVariable(*id))?;
            if factors.is_empty() {
                return Err(GraphError::NothingToMarginalize(*id));
            }
            incident.extend(factors.iter().copied());
        }

        let mut absorbed = Vec::with_capacity(incident.len());
        for fid in &incident {
            if let Some(factor) = self.factors.remove(fid) {
                for var in &factor.variables {
                    if let Some(set) = self.adjacency.get_mut(var) {
                        set.remove(fid);
                    }
                }
                absorbed.push(factor);
            }
        }

        let marg = MargFactor::build(absorbed, ids, &self.variables)?;
        let remaining = marg.remaining();
        let id = if remaining.is_empty() {
            debug!(
                "Marginalization of {} factors leaves no free variable, dropping them",
                marg.absorbed.len()
            );
            None
        } else {
            let information = DMatrix::identity(marg.residual_size(), marg.residual_size());
            Some(self.insert_factor(remaining, information, FactorKind::Marginalization(marg))?)
        };

        for var in ids {
            self.set_fixed(*var, true)?;
        }
        self.layout = ColumnLayout::default();
        Ok(id)
    }
}

/// Look up the variables a factor references, in order
fn resolve<'a>(
    variables: &'a BTreeMap<VariableId, Variable>,
    ids: &[VariableId],
) -> Result<Vec<&'a Variable>> {
    ids.iter()
        .map(|id| variables.get(id).ok_or(GraphError::UnknownVariable(*id)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EvalFailure;
    use crate::factors::ba::tests::camera_looking_along_x;
    use approx::assert_relative_eq;

    fn add_pinhole(graph: &mut FactorGraph) -> VariableId {
        let camera = graph
            .add_camera(
                0,
                [640, 480],
                CameraModelKind::Pinhole,
                &[400.0, 400.0, 320.0, 240.0],
                &[],
            )
            .unwrap();
        graph.set_fixed(camera, true).unwrap();
        camera
    }

    /// Two cameras observing one landmark, camera intrinsics fixed
    fn two_view_graph() -> (FactorGraph, [VariableId; 4]) {
        let mut graph = FactorGraph::new();
        let camera = add_pinhole(&mut graph);
        let pose_a = graph.add_pose(0.0, &camera_looking_along_x(Vec3::zeros()));
        let pose_b = graph.add_pose(1.0, &camera_looking_along_x(Vec3::new(0.0, 0.5, 0.0)));
        let landmark = graph.add_landmark(&Vec3::new(1.0, 0.0, 0.0));

        // True projections of (1, 0, 0)
        graph
            .add_ba_factor(pose_a, landmark, camera, Vec2::new(320.0, 240.0), DMatrix::identity(2, 2))
            .unwrap();
        graph
            .add_ba_factor(pose_b, landmark, camera, Vec2::new(520.0, 240.0), DMatrix::identity(2, 2))
            .unwrap();
        (graph, [camera, pose_a, pose_b, landmark])
    }

    #[test]
    fn test_ids_are_monotonic_per_graph() {
        let mut first = FactorGraph::new();
        let mut second = FactorGraph::new();
        let a = first.add_landmark(&Vec3::zeros());
        let b = first.add_landmark(&Vec3::zeros());
        let c = second.add_landmark(&Vec3::zeros());
        assert_eq!((a, b, c), (VariableId(0), VariableId(1), VariableId(0)));
    }

    #[test]
    fn test_zero_residual_at_ground_truth() {
        let (mut graph, _) = two_view_graph();
        let (r, j) = graph.eval().unwrap();
        assert_eq!(r.len(), 4);
        assert!(r.norm() < 1e-9);
        // Two free poses and one landmark
        assert_eq!(j.ncols(), 15);
    }

    #[test]
    fn test_eval_is_deterministic() {
        let (mut graph, _) = two_view_graph();
        let mut dx = DVector::zeros(15);
        dx[12] = 0.1;
        graph.eval().unwrap();
        graph.update(&dx).unwrap();

        let (r1, j1) = graph.eval().unwrap();
        let (r2, j2) = graph.eval().unwrap();
        assert_eq!(r1, r2);
        assert_eq!(j1, j2);
    }

    #[test]
    fn test_fixed_variable_gets_no_columns() {
        let (mut graph, [_, pose_a, pose_b, landmark]) = two_view_graph();
        graph.set_fixed(pose_a, true).unwrap();
        graph.set_fixed(pose_b, true).unwrap();

        let (_, j) = graph.eval().unwrap();
        assert_eq!(j.ncols(), 3);
        assert_eq!(graph.layout().column(landmark), Some(0));
        assert_eq!(graph.layout().column(pose_a), None);

        let before = graph.variable(pose_a).unwrap().param.clone();
        graph.update(&DVector::from_element(3, 0.1)).unwrap();
        assert_eq!(graph.variable(pose_a).unwrap().param, before);
        assert_relative_eq!(
            graph.landmark(landmark).unwrap(),
            Vec3::new(1.1, 0.1, 0.1),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_column_blocks_follow_param_order() {
        let mut graph = FactorGraph::with_config(GraphConfig {
            param_order: vec![VariableType::Landmark],
        });
        let camera = add_pinhole(&mut graph);
        let pose = graph.add_pose(0.0, &camera_looking_along_x(Vec3::zeros()));
        let landmark = graph.add_landmark(&Vec3::new(1.0, 0.0, 0.0));
        graph
            .add_ba_factor(pose, landmark, camera, Vec2::new(320.0, 240.0), DMatrix::identity(2, 2))
            .unwrap();

        graph.eval().unwrap();
        let layout = graph.layout();
        assert_eq!(layout.column(landmark), Some(0));
        assert_eq!(layout.column(pose), Some(3));
        assert_eq!(layout.blocks[0].variable_type, VariableType::Landmark);
    }

    #[test]
    fn test_failing_factor_is_skipped() {
        let (mut graph, [camera, pose_a, _, _]) = two_view_graph();
        let behind = graph.add_landmark(&Vec3::new(-1.0, 0.0, 0.0));
        let bad = graph
            .add_ba_factor(pose_a, behind, camera, Vec2::new(320.0, 240.0), DMatrix::identity(2, 2))
            .unwrap();

        let (r, _) = graph.eval().unwrap();
        assert_eq!(r.len(), 4);
        assert_eq!(graph.layout().skipped, vec![bad]);
        assert_eq!(graph.layout().column(behind), None);

        // Still in the graph, still failing
        let factor = graph.factor(bad).unwrap();
        assert_eq!(factor.residuals.norm(), 0.0);
        let vars = resolve(&graph.variables, &factor.variables).unwrap();
        let mut factor = factor.clone();
        assert_eq!(factor.eval(&vars, true), Err(EvalFailure::BehindCamera));
    }

    #[test]
    fn test_update_checks_dimension() {
        let (mut graph, _) = two_view_graph();
        graph.eval().unwrap();
        let err = graph.update(&DVector::zeros(2)).unwrap_err();
        assert_eq!(
            err,
            GraphError::UpdateDimension {
                expected: 15,
                found: 2
            }
        );
    }

    #[test]
    fn test_update_clears_layout() {
        let (mut graph, _) = two_view_graph();
        graph.eval().unwrap();
        let layout = graph.update(&DVector::zeros(15)).unwrap();
        assert_eq!(layout.num_columns, 15);
        assert!(graph.layout().is_empty());
    }

    #[test]
    fn test_construction_errors() {
        let (mut graph, [camera, pose_a, _, landmark]) = two_view_graph();

        let err = graph
            .add_ba_factor(pose_a, VariableId(99), camera, Vec2::zeros(), DMatrix::identity(2, 2))
            .unwrap_err();
        assert_eq!(err, GraphError::UnknownVariable(VariableId(99)));

        let err = graph
            .add_ba_factor(landmark, pose_a, camera, Vec2::zeros(), DMatrix::identity(2, 2))
            .unwrap_err();
        assert!(matches!(err, GraphError::WrongVariableKind { found: VariableType::Landmark, .. }));

        let err = graph
            .add_pose_factor(pose_a, &Isometry3::identity(), DMatrix::identity(2, 2))
            .unwrap_err();
        assert!(matches!(err, GraphError::InformationShape { .. }));

        assert_eq!(
            graph.factor(FactorId(42)).unwrap_err(),
            GraphError::UnknownFactor(FactorId(42))
        );
        // Failed constructions do not register anything
        assert_eq!(graph.num_factors(), 2);
    }

    #[test]
    fn test_adjacency_tracks_factors() {
        let (graph, [_, pose_a, _, landmark]) = two_view_graph();
        assert_eq!(graph.factors_of(pose_a).unwrap().len(), 1);
        assert_eq!(graph.factors_of(landmark).unwrap().len(), 2);
        assert!(graph.factors_of(VariableId(77)).is_err());
    }

    #[test]
    fn test_reprojection_rmse() {
        let (mut graph, [_, _, _, landmark]) = two_view_graph();
        assert!(graph.reprojection_rmse().unwrap() < 1e-9);

        // Shift the landmark sideways: both views see a 40 px error
        graph.eval().unwrap();
        let layout = graph.layout().clone();
        let mut dx = DVector::zeros(layout.num_columns);
        let col = layout.column(landmark).unwrap();
        dx[col + 1] = -0.1;
        graph.update_with(&layout, &dx).unwrap();

        let errors = graph.reprojection_errors().unwrap();
        assert_eq!(errors.len(), 2);
        assert_relative_eq!(graph.reprojection_rmse().unwrap(), 40.0, epsilon = 1e-9);
    }

    #[test]
    fn test_check_jacobians_through_graph() {
        let (graph, _) = two_view_graph();
        let check = graph.check_jacobians(FactorId(1), 1, 1e-7, 1e-3).unwrap();
        assert!(check.passed);
    }

    #[test]
    fn test_check_jacobians_rejects_bad_index() {
        let mut graph = FactorGraph::new();
        let pose = graph.add_pose(0.0, &Isometry3::identity());
        let prior = graph
            .add_pose_factor(pose, &Isometry3::identity(), DMatrix::identity(6, 6))
            .unwrap();

        assert_eq!(
            graph.check_jacobians(prior, 3, 1e-7, 1e-5).unwrap_err(),
            GraphError::JacobianIndex {
                factor: prior,
                index: 3,
                len: 1
            }
        );
        assert!(graph.check_jacobians(prior, 0, 1e-7, 1e-5).unwrap().passed);
    }

    #[test]
    fn test_cost_pass_drops_previous_jacobians() {
        let (mut graph, _) = two_view_graph();
        graph.eval().unwrap();
        assert_eq!(graph.factor(FactorId(0)).unwrap().jacobians.len(), 3);

        graph.cost().unwrap();
        assert!(graph.factors().all(|f| f.jacobians.is_empty()));
    }

    #[test]
    fn test_marginalize_with_only_fixed_neighbours() {
        let (mut graph, [_, pose_a, pose_b, landmark]) = two_view_graph();
        graph.set_fixed(pose_a, true).unwrap();
        graph.set_fixed(pose_b, true).unwrap();

        assert_eq!(graph.marginalize(&[landmark]).unwrap(), None);
        assert_eq!(graph.num_factors(), 0);
        assert!(graph.variable(landmark).unwrap().fixed);
        let (r, j) = graph.eval().unwrap();
        assert_eq!((r.len(), j.ncols()), (0, 0));
    }

    #[test]
    fn test_marginalization_matches_schur_complement() {
        let (mut graph, [_, pose_a, pose_b, landmark]) = two_view_graph();

        // Dense reference: columns are [pose_a | pose_b | landmark]
        let (_, j) = graph.eval().unwrap();
        let h = j.transpose() * &j;
        let h_pp = h.view((0, 0), (12, 12)).into_owned();
        let h_pl = h.view((0, 12), (12, 3)).into_owned();
        let h_ll = h.view((12, 12), (3, 3)).into_owned();
        let expected = &h_pp - &h_pl * h_ll.try_inverse().unwrap() * h_pl.transpose();

        let marg_id = graph.marginalize(&[landmark]).unwrap().unwrap();
        assert_eq!(graph.num_factors(), 1);
        assert!(graph.variable(landmark).unwrap().fixed);
        assert!(graph.factors_of(landmark).unwrap().is_empty());
        assert_eq!(graph.factors_of(pose_a).unwrap(), vec![marg_id]);

        let factor = graph.factor(marg_id).unwrap();
        assert_eq!(factor.variables, vec![pose_a, pose_b]);
        let FactorKind::Marginalization(marg) = &factor.kind else {
            panic!("expected a marginalization factor");
        };
        assert_eq!(marg.absorbed.len(), 2);
        let reduced = marg.jacobian.transpose() * &marg.jacobian;
        assert_relative_eq!(reduced, expected, epsilon = 1e-6);

        // At the linearization point the prior has zero residual
        let (r, j) = graph.eval().unwrap();
        assert!(r.norm() < 1e-6);
        assert_eq!(j.ncols(), 12);
    }

    #[test]
    fn test_marginalize_unknown_or_isolated() {
        let mut graph = FactorGraph::new();
        let lonely = graph.add_landmark(&Vec3::zeros());
        assert_eq!(
            graph.marginalize(&[lonely]).unwrap_err(),
            GraphError::NothingToMarginalize(lonely)
        );
        assert_eq!(
            graph.marginalize(&[VariableId(9)]).unwrap_err(),
            GraphError::UnknownVariable(VariableId(9))
        );
    }
}
