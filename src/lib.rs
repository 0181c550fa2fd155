//! Factor-graph backend for visual-inertial state estimation.
//!
//! Variables (poses, landmarks, camera intrinsics, speed/bias states) are
//! tied together by measurement factors in a [`FactorGraph`]; the
//! [`Solver`] refines them with damped Gauss-Newton steps.

pub mod camera;
pub mod config;
pub mod error;
pub mod factors;
pub mod graph;
pub mod so3;
pub mod solver;
pub mod types;
pub mod variables;

pub use camera::CameraModelKind;
pub use config::{Config, GraphConfig, ImuNoise, SolverConfig};
pub use error::{EvalFailure, GraphError, Result};
pub use factors::{Factor, FactorId, FactorKind};
pub use graph::{ColumnLayout, FactorGraph};
pub use solver::{SolveSummary, Solver, Termination};
pub use types::ImuSample;
pub use variables::{Variable, VariableId, VariableType};
