pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};

/// One inertial measurement: specific force and angular rate in the body frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImuSample {
    /// Sample time [seconds]
    pub timestamp: f64,
    /// Accelerometer reading [m/s²]
    pub accel: Vec3,
    /// Gyroscope reading [rad/s]
    pub gyro: Vec3,
}

impl ImuSample {
    pub fn new(timestamp: f64, accel: Vec3, gyro: Vec3) -> Self {
        Self {
            timestamp,
            accel,
            gyro,
        }
    }
}
