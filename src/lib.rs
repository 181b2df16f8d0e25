#![no_std]

//! IMU EKF - attitude estimation core for a 9-axis inertial measurement unit
//!
//! This library fuses triaxial accelerometer, gyroscope and magnetometer
//! samples into a drift-corrected orientation with an 11-state quaternion
//! Extended Kalman Filter, estimates the gyroscope bias online, and calibrates
//! accelerometer and magnetometer zero offsets from a sequence of static
//! poses.
//!
//! # Features
//!
//! - Quaternion EKF with quaternion-derivative and gyroscope-bias states
//! - Self-normalising predict step and bootstrap process noise for cold starts
//! - 14-pose static calibration with stillness and orientation gating
//! - Coordinate-descent zero-offset solver (no matrix inversion needed)
//! - Quantized offset persistence on a single flash page
//! - Fixed-size linear algebra only, no allocation
//! - `#![no_std]` compatible for embedded systems, optional `defmt` logging
//!
//! # Quick Start
//!
//! ```rust
//! use nalgebra::Vector3;
//! use imu_ekf::{Ekf, SensorSample};
//!
//! let mut ekf = Ekf::new();
//!
//! // Sensor readings
//! let sample = SensorSample {
//!     accelerometer: Vector3::new(0.0, 0.0, 9.81),      // m/s²
//!     gyroscope: Vector3::new(0.0, 0.0, 0.1),           // rad/s
//!     magnetometer: Vector3::new(-20.74, 0.0, 43.23),   // µT
//!     delta_time: 0.01,                                 // 10ms
//! };
//!
//! // Predict and correct
//! ekf.update(&sample).unwrap();
//!
//! // Roll, pitch, yaw in degrees
//! let euler = ekf.euler_degrees();
//! ```
//!
//! For a complete firmware loop with sensor driver, calibration and
//! persistence see [`Imu`].

#[macro_use]
mod logging;

pub mod calibration;
pub mod descent;
mod ekf;
mod error;
mod imu;
pub mod math;
mod offset;
mod sensors;
pub mod store;
mod types;

// Re-export all public types and functions
pub use calibration::{Calibration, CalibrationEvent, pose_direction};
pub use descent::{CoordinateDescent, DescentStatus};
pub use ekf::{Covariance, Ekf, MEASUREMENT_SIZE, Measurement, STATE_SIZE, State};
pub use error::{FilterFault, PersistenceError, SensorError, SingularMatrix, SolverError};
pub use imu::{Cycle, Imu, Telemetry};
pub use math::{DEG_TO_RAD, QuaternionExt, RAD_TO_DEG, Vector3Ext};
pub use offset::ZeroOffsets;
pub use sensors::{SensorDriver, Sensors};
pub use store::{PageStorage, ParameterStore, RamPage, Slot};
pub use types::*;
