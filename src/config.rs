//! Runtime configuration for the graph, the solver and IMU noise
//!
//! Every struct deserializes with `#[serde(default)]`, so a JSON file only
//! needs the fields it wants to override.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};
use crate::variables::VariableType;

/// Damped Gauss-Newton parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub max_iter: usize,
    /// Initial damping
    pub lambda: f64,
    /// Damping at which the solve gives up
    pub lambda_max: f64,
    pub cost_change_threshold: f64,
    /// Wall-clock budget [seconds]
    pub time_limit: f64,
    /// Floor applied to diag(JᵀJ) before damping
    pub min_diagonal: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iter: 20,
            lambda: 1e-4,
            lambda_max: 1e10,
            cost_change_threshold: 1e-10,
            time_limit: 1.0,
            min_diagonal: 1e-6,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Column block order of the assembled Jacobian
    pub param_order: Vec<VariableType>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            param_order: VariableType::ALL.to_vec(),
        }
    }
}

/// Continuous-time IMU noise model
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImuNoise {
    /// Accelerometer white noise [m/s²/√Hz]
    pub accel_noise_density: f64,
    /// Gyroscope white noise [rad/s/√Hz]
    pub gyro_noise_density: f64,
    /// Accelerometer bias random walk [m/s³/√Hz]
    pub accel_random_walk: f64,
    /// Gyroscope bias random walk [rad/s²/√Hz]
    pub gyro_random_walk: f64,
    /// Gravity magnitude [m/s²], acting along -z in the world frame
    pub gravity: f64,
}

impl Default for ImuNoise {
    fn default() -> Self {
        Self {
            accel_noise_density: 0.08,
            gyro_noise_density: 0.004,
            accel_random_walk: 0.00004,
            gyro_random_walk: 2.0e-6,
            gravity: 9.81,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub solver: SolverConfig,
    pub graph: GraphConfig,
    pub imu: ImuNoise,
}

impl Config {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| GraphError::Config(e.to_string()))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| GraphError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&contents)
    }
}
