//! Variable (parameter block) store
//!
//! Every variable keeps its value in one flat storage vector of
//! `global_size()` entries and is updated through a tangent-space increment
//! of `local_size()` entries:
//!
//! - Pose / Extrinsic: `[qw, qx, qy, qz, x, y, z]`, local `[dα, dt]`
//! - Landmark: `[x, y, z]`
//! - Camera: `[fx, fy, cx, cy, distortion...]`
//! - Speed and bias: `[v, ba, bg]`

use std::fmt;

use nalgebra::{DVector, Isometry3, Quaternion, Translation3, UnitQuaternion};
use serde::{Deserialize, Serialize};

use crate::camera::{CameraModelKind, ProjectionModel, PINHOLE_PARAMS};
use crate::error::{GraphError, Result};
use crate::so3::{log_quaternion, quat_delta};
use crate::types::{Vec3, LANDMARK_DIM, POSE_GLOBAL_DIM, POSE_LOCAL_DIM, SPEED_BIAS_DIM};

/// Stable handle of a variable inside one graph
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VariableId(pub usize);

impl fmt::Display for VariableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{}", self.0)
    }
}

/// Type tag used to group variables into contiguous Jacobian column blocks
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    Pose,
    Extrinsic,
    Landmark,
    CameraParams,
    SpeedBias,
}

impl VariableType {
    pub const ALL: [VariableType; 5] = [
        VariableType::Pose,
        VariableType::CameraParams,
        VariableType::Landmark,
        VariableType::Extrinsic,
        VariableType::SpeedBias,
    ];
}

/// Camera bookkeeping carried next to the intrinsic parameters
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraInfo {
    pub cam_index: usize,
    /// Image size [width, height] in pixels
    pub resolution: [u32; 2],
    pub model: CameraModelKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum VariableKind {
    Pose,
    Extrinsic,
    Landmark,
    Camera(CameraInfo),
    SpeedBias,
}

/// A parameter block owned by the graph
#[derive(Clone, Debug)]
pub struct Variable {
    pub id: VariableId,
    pub kind: VariableKind,
    /// Measurement time [seconds], when the variable is tied to one
    pub timestamp: Option<f64>,
    /// Fixed variables never receive a Jacobian column
    pub fixed: bool,
    /// Storage vector, always `global_size()` long
    pub param: DVector<f64>,
}

fn pose_storage(pose: &Isometry3<f64>) -> DVector<f64> {
    let q = pose.rotation;
    let r = pose.translation.vector;
    DVector::from_column_slice(&[q.w, q.i, q.j, q.k, r[0], r[1], r[2]])
}

impl Variable {
    /// Body pose T_WS
    pub fn pose(id: VariableId, timestamp: f64, pose: &Isometry3<f64>) -> Self {
        Self {
            id,
            kind: VariableKind::Pose,
            timestamp: Some(timestamp),
            fixed: false,
            param: pose_storage(pose),
        }
    }

    /// Sensor-to-camera transform T_SC
    pub fn extrinsic(id: VariableId, pose: &Isometry3<f64>) -> Self {
        Self {
            id,
            kind: VariableKind::Extrinsic,
            timestamp: None,
            fixed: false,
            param: pose_storage(pose),
        }
    }

    pub fn landmark(id: VariableId, p_w: &Vec3) -> Self {
        Self {
            id,
            kind: VariableKind::Landmark,
            timestamp: None,
            fixed: false,
            param: DVector::from_column_slice(p_w.as_slice()),
        }
    }

    pub fn camera(
        id: VariableId,
        cam_index: usize,
        resolution: [u32; 2],
        model: CameraModelKind,
        proj_params: &[f64],
        dist_params: &[f64],
    ) -> Result<Self> {
        if proj_params.len() != PINHOLE_PARAMS {
            return Err(GraphError::CameraParamCount {
                model: model.to_string(),
                what: "projection",
                expected: PINHOLE_PARAMS,
                found: proj_params.len(),
            });
        }
        if dist_params.len() != model.dist_size() {
            return Err(GraphError::CameraParamCount {
                model: model.to_string(),
                what: "distortion",
                expected: model.dist_size(),
                found: dist_params.len(),
            });
        }

        let param = DVector::from_iterator(
            proj_params.len() + dist_params.len(),
            proj_params.iter().chain(dist_params.iter()).copied(),
        );
        Ok(Self {
            id,
            kind: VariableKind::Camera(CameraInfo {
                cam_index,
                resolution,
                model,
            }),
            timestamp: None,
            fixed: false,
            param,
        })
    }

    pub fn speed_bias(id: VariableId, timestamp: f64, v: &Vec3, ba: &Vec3, bg: &Vec3) -> Self {
        let mut param = DVector::zeros(SPEED_BIAS_DIM);
        param.fixed_rows_mut::<3>(0).copy_from(v);
        param.fixed_rows_mut::<3>(3).copy_from(ba);
        param.fixed_rows_mut::<3>(6).copy_from(bg);
        Self {
            id,
            kind: VariableKind::SpeedBias,
            timestamp: Some(timestamp),
            fixed: false,
            param,
        }
    }

    pub fn variable_type(&self) -> VariableType {
        match self.kind {
            VariableKind::Pose => VariableType::Pose,
            VariableKind::Extrinsic => VariableType::Extrinsic,
            VariableKind::Landmark => VariableType::Landmark,
            VariableKind::Camera(_) => VariableType::CameraParams,
            VariableKind::SpeedBias => VariableType::SpeedBias,
        }
    }

    /// Tangent-space dimension
    pub fn local_size(&self) -> usize {
        match self.kind {
            VariableKind::Pose | VariableKind::Extrinsic => POSE_LOCAL_DIM,
            VariableKind::Landmark => LANDMARK_DIM,
            VariableKind::Camera(_) => self.param.len(),
            VariableKind::SpeedBias => SPEED_BIAS_DIM,
        }
    }

    /// Storage dimension
    pub fn global_size(&self) -> usize {
        match self.kind {
            VariableKind::Pose | VariableKind::Extrinsic => POSE_GLOBAL_DIM,
            _ => self.local_size(),
        }
    }

    fn is_pose_like(&self) -> bool {
        matches!(self.kind, VariableKind::Pose | VariableKind::Extrinsic)
    }

    /// Apply a tangent-space update of `local_size()` entries.
    ///
    /// Poses compose the rotation increment on the left and add the
    /// translation; every other kind is plain vector addition.
    pub fn plus(&mut self, dx: &DVector<f64>) {
        debug_assert_eq!(dx.len(), self.local_size());

        if self.is_pose_like() {
            let dalpha = Vec3::new(dx[0], dx[1], dx[2]);
            let q = quat_delta(&dalpha) * self.rotation();
            self.set_rotation(&q);
            for i in 0..3 {
                self.param[4 + i] += dx[3 + i];
            }
        } else {
            self.param += dx;
        }
    }

    /// Nudge a single local dimension, used for finite-difference checks.
    pub fn perturb(&mut self, i: usize, step: f64) {
        let mut dx = DVector::zeros(self.local_size());
        dx[i] = step;
        self.plus(&dx);
    }

    /// Local difference `self ⊟ other`, so that `other.plus(d)` gives `self`.
    pub fn minus(&self, other: &Variable) -> DVector<f64> {
        if self.is_pose_like() {
            let dq = self.rotation() * other.rotation().inverse();
            let dalpha = log_quaternion(&dq);
            let dr = self.translation() - other.translation();
            DVector::from_column_slice(&[dalpha[0], dalpha[1], dalpha[2], dr[0], dr[1], dr[2]])
        } else {
            &self.param - &other.param
        }
    }

    // ===== Pose / Extrinsic =====

    pub fn rotation(&self) -> UnitQuaternion<f64> {
        UnitQuaternion::new_normalize(Quaternion::new(
            self.param[0],
            self.param[1],
            self.param[2],
            self.param[3],
        ))
    }

    pub fn translation(&self) -> Vec3 {
        Vec3::new(self.param[4], self.param[5], self.param[6])
    }

    pub fn isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(Translation3::from(self.translation()), self.rotation())
    }

    pub fn set_rotation(&mut self, q: &UnitQuaternion<f64>) {
        self.param[0] = q.w;
        self.param[1] = q.i;
        self.param[2] = q.j;
        self.param[3] = q.k;
    }

    pub fn set_isometry(&mut self, pose: &Isometry3<f64>) {
        self.param = pose_storage(pose);
    }

    // ===== Landmark =====

    pub fn position(&self) -> Vec3 {
        Vec3::new(self.param[0], self.param[1], self.param[2])
    }

    // ===== Speed and bias =====

    pub fn velocity(&self) -> Vec3 {
        self.param.fixed_rows::<3>(0).into_owned()
    }

    pub fn accel_bias(&self) -> Vec3 {
        self.param.fixed_rows::<3>(3).into_owned()
    }

    pub fn gyro_bias(&self) -> Vec3 {
        self.param.fixed_rows::<3>(6).into_owned()
    }

    // ===== Camera =====

    pub fn camera_info(&self) -> Option<&CameraInfo> {
        match &self.kind {
            VariableKind::Camera(info) => Some(info),
            _ => None,
        }
    }

    pub fn proj_params(&self) -> DVector<f64> {
        self.param.rows(0, PINHOLE_PARAMS).into_owned()
    }

    pub fn dist_params(&self) -> DVector<f64> {
        let n = self.param.len().saturating_sub(PINHOLE_PARAMS);
        self.param.rows(PINHOLE_PARAMS, n).into_owned()
    }

    /// Projection model for the current intrinsics; `None` for non-cameras.
    pub fn projection_model(&self) -> Option<Box<dyn ProjectionModel>> {
        self.camera_info()
            .map(|info| info.model.instantiate(info.resolution, self.param.as_slice()))
    }
}
