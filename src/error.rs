use thiserror::Error;

use crate::factors::FactorId;
use crate::variables::{VariableId, VariableType};

/// Graph construction and usage errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("Unknown variable: {0}")]
    UnknownVariable(VariableId),

    #[error("Unknown factor: {0}")]
    UnknownFactor(FactorId),

    #[error("Variable {id} is a {found:?}, expected one of {expected:?}")]
    WrongVariableKind {
        id: VariableId,
        expected: Vec<VariableType>,
        found: VariableType,
    },

    #[error("Camera model {model} takes {expected} {what} parameters, got {found}")]
    CameraParamCount {
        model: String,
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Information matrix must be {expected}x{expected}, got {rows}x{cols}")]
    InformationShape {
        expected: usize,
        rows: usize,
        cols: usize,
    },

    #[error("Information matrix is not positive definite")]
    InformationNotPositiveDefinite,

    #[error("IMU factor needs at least 2 samples, got {0}")]
    TooFewImuSamples(usize),

    #[error("IMU timestamps must be strictly increasing (sample {index}: {previous} -> {current})")]
    NonIncreasingImuTimestamps {
        index: usize,
        previous: f64,
        current: f64,
    },

    #[error("Preintegrated IMU covariance is singular")]
    SingularImuCovariance,

    #[error("Update vector has {found} entries, column layout expects {expected}")]
    UpdateDimension { expected: usize, found: usize },

    #[error("Factor {factor} references {len} variables, no Jacobian block {index}")]
    JacobianIndex {
        factor: FactorId,
        index: usize,
        len: usize,
    },

    #[error("Factor {0} failed to evaluate: {1}")]
    FactorEvaluation(FactorId, EvalFailure),

    #[error("Variable {0} has no incident factors to marginalize")]
    NothingToMarginalize(VariableId),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Result type for graph operations
pub type Result<T> = std::result::Result<T, GraphError>;

/// Recoverable per-factor precondition failure.
///
/// A factor returning one of these is skipped for the current assembly pass;
/// it stays in the graph and is re-evaluated on the next pass.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalFailure {
    #[error("Point is not in front of the camera")]
    BehindCamera,

    #[error("Projected point is outside the image plane")]
    OutOfImage,
}
