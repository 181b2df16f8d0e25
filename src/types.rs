//! Settings, constants and value types shared across the estimator

use crate::error::FilterFault;
use nalgebra::Vector3;

/// Gravity magnitude in m/s², along earth +Z
pub const GRAVITY: f32 = 9.81;

/// Local earth magnetic field in µT (north, east, up)
pub const MAGNETIC_REFERENCE: [f32; 3] = [-20.74, 0.0, 43.23];

/// Number of calibration poses
pub const POSE_COUNT: usize = 14;

/// Extended Kalman Filter settings
///
/// Per-channel noise variances and the reference vectors the measurements are
/// compared against. The bootstrap factor inflates the process noise right
/// after (re)initialisation and decays toward 1 with the given time constant,
/// so the filter converges from the identity quaternion on its own.
///
/// # Example
/// ```
/// use imu_ekf::{Ekf, EkfSettings};
///
/// let settings = EkfSettings {
///     accelerometer_noise: 5.0,     // trust gravity less on a vibrating mount
///     bootstrap_time_constant: 1.0, // settle faster after a reset
///     ..Default::default()
/// };
/// let ekf = Ekf::with_settings(settings);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EkfSettings {
    /// Process noise of the quaternion states
    pub quaternion_noise: f32,
    /// Process noise of the quaternion derivative states
    pub derivative_noise: f32,
    /// Random-walk noise of the gyroscope bias states
    pub bias_noise: f32,
    /// Accelerometer measurement variance, (m/s²)²
    pub accelerometer_noise: f32,
    /// Gyroscope measurement variance, (rad/s)²
    pub gyroscope_noise: f32,
    /// Magnetometer measurement variance, µT²
    pub magnetometer_noise: f32,
    /// Process noise multiplier applied right after initialisation
    pub bootstrap_factor: f32,
    /// Time constant in seconds of the bootstrap decay toward 1
    pub bootstrap_time_constant: f32,
    /// Gravity magnitude in m/s²
    pub gravity: f32,
    /// Earth magnetic field in µT
    pub magnetic_reference: Vector3<f32>,
}

impl Default for EkfSettings {
    fn default() -> Self {
        Self {
            quaternion_noise: 1e-6,
            derivative_noise: 1e-6,
            bias_noise: 0.1,
            accelerometer_noise: 3.0,
            gyroscope_noise: 0.004,
            magnetometer_noise: 7.0,
            bootstrap_factor: 1000.0,
            bootstrap_time_constant: 2.0,
            gravity: GRAVITY,
            magnetic_reference: Vector3::from(MAGNETIC_REFERENCE),
        }
    }
}

/// Step schedule of the coordinate-descent offset solver
///
/// The solver searches for the offset that makes every measured vector have
/// length `target_norm`. It starts with `initial_step`, divides the step by
/// `step_divisor` whenever no neighbour improves, and stops once the step is
/// below `minimum_step`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DescentSettings {
    /// Expected magnitude of the measured reference vector
    pub target_norm: f32,
    /// First step size in sensor units
    pub initial_step: f32,
    /// Search stops when the step falls below this value
    pub minimum_step: f32,
    /// Step reduction factor on stagnation; must be greater than 1
    pub step_divisor: f32,
}

impl DescentSettings {
    /// Schedule for accelerometer zero offsets (m/s²)
    pub fn accelerometer() -> Self {
        Self {
            target_norm: GRAVITY,
            initial_step: 0.5,
            minimum_step: 0.01,
            step_divisor: 2.0,
        }
    }

    /// Schedule for magnetometer zero offsets (µT)
    pub fn magnetometer() -> Self {
        Self {
            target_norm: Vector3::from(MAGNETIC_REFERENCE).norm(),
            initial_step: 10.0,
            minimum_step: 0.1,
            step_divisor: 2.0,
        }
    }
}

impl Default for DescentSettings {
    fn default() -> Self {
        Self::accelerometer()
    }
}

/// Calibration procedure settings
///
/// # Example
/// ```
/// use imu_ekf::CalibrationSettings;
///
/// let settings = CalibrationSettings {
///     activation_angle: 5.0,   // demand a more precise hold
///     deactivation_angle: 7.0,
///     pose_timeout: 60.0,
///     ..Default::default()
/// };
/// assert!(settings.activation_angle < settings.deactivation_angle);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationSettings {
    /// Seconds between two samples entering the stillness ring
    pub sample_period: f32,
    /// Maximum deviation from the target pose, in degrees, to start capturing
    pub activation_angle: f32,
    /// Deviation in degrees beyond which a running capture is abandoned
    pub deactivation_angle: f32,
    /// Maximum per-axis accelerometer standard deviation to start capturing
    pub activation_spread: f32,
    /// Per-axis standard deviation beyond which a running capture is abandoned
    pub deactivation_spread: f32,
    /// Seconds to wait on one pose before reporting a timeout
    pub pose_timeout: f32,
    /// Solver sweeps performed per control cycle while converging
    pub sweeps_per_cycle: u32,
    /// Accelerometer solver schedule
    pub accelerometer: DescentSettings,
    /// Magnetometer solver schedule
    pub magnetometer: DescentSettings,
    /// Quantization ranges used when persisting solved offsets
    pub storage: StorageRanges,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            sample_period: 0.04,
            activation_angle: 10.0,
            deactivation_angle: 12.0,
            activation_spread: 0.07,
            deactivation_spread: 0.14,
            pose_timeout: 30.0,
            sweeps_per_cycle: 8,
            accelerometer: DescentSettings::accelerometer(),
            magnetometer: DescentSettings::magnetometer(),
            storage: StorageRanges::default(),
        }
    }
}

/// Settings of the complete control loop
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ImuSettings {
    pub ekf: EkfSettings,
    pub calibration: CalibrationSettings,
}

/// Quantization ranges of the persisted zero offsets
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StorageRanges {
    /// Accelerometer offsets are stored over ±this value (m/s²)
    pub accelerometer: f32,
    /// Magnetometer offsets are stored over ±this value (µT)
    pub magnetometer: f32,
}

impl Default for StorageRanges {
    fn default() -> Self {
        Self {
            accelerometer: 2.0 * GRAVITY,
            magnetometer: 1000.0,
        }
    }
}

/// One reading of all three sensors as returned by a driver
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    /// Acceleration in m/s²
    pub accelerometer: Vector3<f32>,
    /// Angular rate in rad/s
    pub gyroscope: Vector3<f32>,
    /// Magnetic field in µT
    pub magnetometer: Vector3<f32>,
}

impl RawSample {
    /// True when every component is finite
    pub fn is_finite(&self) -> bool {
        self.accelerometer.iter().all(|v| v.is_finite())
            && self.gyroscope.iter().all(|v| v.is_finite())
            && self.magnetometer.iter().all(|v| v.is_finite())
    }
}

/// Offset-corrected sensor reading with the time elapsed since the previous one
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSample {
    pub accelerometer: Vector3<f32>,
    pub gyroscope: Vector3<f32>,
    pub magnetometer: Vector3<f32>,
    /// Seconds since the previous sample
    pub delta_time: f32,
}

/// Estimator health
///
/// # Example
/// ```
/// use imu_ekf::Ekf;
///
/// let ekf = Ekf::new();
/// let health = ekf.health();
///
/// if !health.is_healthy() {
///     println!("{} faulted cycles in a row", health.consecutive_faults);
/// }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FilterHealth {
    /// Most recent fault, kept after recovery for diagnostics
    pub last_fault: Option<FilterFault>,
    /// Faulted cycles since the last good one
    pub consecutive_faults: u32,
}

impl FilterHealth {
    /// True when the latest cycle completed
    pub fn is_healthy(&self) -> bool {
        self.consecutive_faults == 0
    }
}

/// Sensor whose zero offset is being solved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CalibrationSensor {
    Accelerometer,
    Magnetometer,
}

/// Progress within one pose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PosePhase {
    /// Waiting for the device to be held still in the target orientation
    #[default]
    Waiting,
    /// Averaging samples; `captured` of one ring rotation so far
    Capturing { captured: u16 },
}

/// Calibration state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CalibrationState {
    #[default]
    Idle,
    /// Collecting pose `pose` (0 to 13)
    Collecting { pose: usize, phase: PosePhase },
    /// Solving the zero offset of `sensor`
    Converging { sensor: CalibrationSensor },
}

/// Calibration progress for display and telemetry
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CalibrationProgress {
    pub state: CalibrationState,
    /// Angle in degrees between the latest accelerometer reading and the target pose
    pub deviation: f32,
    /// Largest per-axis standard deviation of the stillness ring
    pub spread: f32,
    /// Relative RMS length error of the offset being solved (or last solved)
    pub convergence_error: f32,
}
