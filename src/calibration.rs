//! Static-pose zero-offset calibration
//!
//! The device is held still in 14 prescribed orientations in turn. For each
//! pose the engine waits until the accelerometer points close enough to the
//! target direction and the recent readings are steady, then averages
//! accelerometer and magnetometer readings over one ring rotation. Once all
//! poses are collected the coordinate-descent solver finds the accelerometer
//! offset, then the magnetometer offset, and each result is persisted.
//!
//! # States
//!
//! ```text
//! Idle ──start──▶ Collecting{pose 0..=13} ──all poses──▶ Converging{accelerometer}
//!   ▲                 │  Waiting ⇄ Capturing                  │
//!   │                 └──abort──▶ Idle                        ▼
//!   └──────────────────────────────────────────── Converging{magnetometer}
//! ```

use crate::descent::{CoordinateDescent, DescentStatus};
use crate::error::SolverError;
use crate::math::{DEG_TO_RAD, Vector3Ext, small_angle_cos};
use crate::store::{PageStorage, ParameterStore, Slot};
use crate::types::{
    CalibrationProgress, CalibrationSensor, CalibrationSettings, CalibrationState, POSE_COUNT,
    PosePhase, SensorSample,
};
use core::f32::consts::FRAC_1_SQRT_2;
use nalgebra::{ComplexField, Vector3};

/// Samples in the stillness ring; also the number averaged per pose
pub const RING_LENGTH: usize = 50;

/// Target accelerometer direction of pose `index`
///
/// Starting from straight up, each following pose turns a quarter-turn about
/// Z, and poses 1, 5, 9 and 13 additionally tilt an eighth-turn about X:
/// up, four headings at 45° above the horizon, four horizontal headings,
/// four headings at 45° below the horizon, down.
///
/// # Example
/// ```
/// use nalgebra::Vector3;
/// use imu_ekf::calibration::pose_direction;
///
/// assert_eq!(pose_direction(0), Vector3::new(0.0, 0.0, 1.0));
/// assert!((pose_direction(6) - Vector3::new(1.0, 0.0, 0.0)).norm() < 1e-6);
/// assert!((pose_direction(13) - Vector3::new(0.0, 0.0, -1.0)).norm() < 1e-6);
/// ```
pub fn pose_direction(index: usize) -> Vector3<f32> {
    let mut direction = Vector3::z();
    for i in 1..=index {
        direction = direction.rotate_about(&Vector3::z(), 0.0, 1.0);
        if i % 4 == 1 {
            direction = direction.rotate_about(&Vector3::x(), FRAC_1_SQRT_2, FRAC_1_SQRT_2);
        }
    }
    direction
}

/// Something the user or telemetry should hear about
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalibrationEvent {
    /// Pose averaged and stored; the next pose (or convergence) follows
    PoseAccepted { pose: usize },
    /// Device moved during capture; the pose is being retried
    CaptureAborted { pose: usize },
    /// No capture within the pose timeout; the pose is still being retried
    PoseTimedOut { pose: usize },
    /// Offset solved and handed to the store
    OffsetSolved {
        sensor: CalibrationSensor,
        offset: Vector3<f32>,
        /// Relative RMS length error at the solution
        error: f32,
        /// Whether the offset was persisted
        stored: bool,
    },
    /// Solver rejected the collected data; calibration returned to idle
    Failed {
        sensor: CalibrationSensor,
        error: SolverError,
    },
}

/// Calibration engine
///
/// Driven once per control cycle with a raw (offset-free) sample through
/// [`step`](Self::step).
pub struct Calibration {
    settings: CalibrationSettings,
    state: CalibrationState,
    /// Cosines of the activation and deactivation angles
    activation_cos: f32,
    deactivation_cos: f32,
    /// Stillness ring of decimated accelerometer samples
    ring: [Vector3<f32>; RING_LENGTH],
    ring_len: usize,
    ring_next: usize,
    sample_timer: f32,
    pose_timer: f32,
    target: Vector3<f32>,
    accelerometer_mean: Vector3<f32>,
    magnetometer_mean: Vector3<f32>,
    accelerometer_poses: [Vector3<f32>; POSE_COUNT],
    magnetometer_poses: [Vector3<f32>; POSE_COUNT],
    solver: Option<CoordinateDescent<POSE_COUNT>>,
    deviation: f32,
    spread: f32,
    convergence_error: f32,
}

impl Calibration {
    pub fn new(settings: CalibrationSettings) -> Self {
        let mut calibration = Calibration {
            settings,
            state: CalibrationState::Idle,
            activation_cos: 0.0,
            deactivation_cos: 0.0,
            ring: [Vector3::zeros(); RING_LENGTH],
            ring_len: 0,
            ring_next: 0,
            sample_timer: 0.0,
            pose_timer: 0.0,
            target: Vector3::z(),
            accelerometer_mean: Vector3::zeros(),
            magnetometer_mean: Vector3::zeros(),
            accelerometer_poses: [Vector3::zeros(); POSE_COUNT],
            magnetometer_poses: [Vector3::zeros(); POSE_COUNT],
            solver: None,
            deviation: 0.0,
            spread: 0.0,
            convergence_error: 0.0,
        };
        calibration.process_settings();
        calibration
    }

    pub fn settings(&self) -> CalibrationSettings {
        self.settings
    }

    /// Replace the settings; takes effect immediately
    pub fn set_settings(&mut self, settings: CalibrationSettings) {
        self.settings = settings;
        self.process_settings();
    }

    /// Begin a calibration pass at the first pose, discarding any pass in progress
    pub fn start(&mut self) {
        self.accelerometer_poses = [Vector3::zeros(); POSE_COUNT];
        self.magnetometer_poses = [Vector3::zeros(); POSE_COUNT];
        self.solver = None;
        self.convergence_error = 0.0;
        self.enter_pose(0);
        log_info!("calibration started");
    }

    /// Return to idle and discard partial results
    pub fn abort(&mut self) {
        if self.is_active() {
            log_info!("calibration aborted");
        }
        self.state = CalibrationState::Idle;
        self.solver = None;
    }

    /// True unless idle
    pub fn is_active(&self) -> bool {
        self.state != CalibrationState::Idle
    }

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    pub fn progress(&self) -> CalibrationProgress {
        CalibrationProgress {
            state: self.state,
            deviation: self.deviation,
            spread: self.spread,
            convergence_error: self.convergence_error,
        }
    }

    /// Average readings of the collected poses, accelerometer then magnetometer
    pub fn pose_measurements(&self) -> (&[Vector3<f32>; POSE_COUNT], &[Vector3<f32>; POSE_COUNT]) {
        (&self.accelerometer_poses, &self.magnetometer_poses)
    }

    /// Advance the procedure by one control cycle
    ///
    /// Solved offsets are persisted through `store`. Does nothing while idle.
    pub fn step<S: PageStorage>(
        &mut self,
        sample: &SensorSample,
        store: &mut ParameterStore<S>,
    ) -> Option<CalibrationEvent> {
        match self.state {
            CalibrationState::Idle => None,
            CalibrationState::Collecting { pose, phase } => self.collect(pose, phase, sample),
            CalibrationState::Converging { sensor } => self.converge(sensor, store),
        }
    }

    fn process_settings(&mut self) {
        self.activation_cos = small_angle_cos(self.settings.activation_angle * DEG_TO_RAD);
        self.deactivation_cos = small_angle_cos(self.settings.deactivation_angle * DEG_TO_RAD);
    }

    fn enter_pose(&mut self, pose: usize) {
        self.target = pose_direction(pose);
        self.ring_len = 0;
        self.ring_next = 0;
        self.sample_timer = 0.0;
        self.pose_timer = 0.0;
        self.spread = 0.0;
        self.state = CalibrationState::Collecting {
            pose,
            phase: PosePhase::Waiting,
        };
    }

    fn collect(
        &mut self,
        pose: usize,
        phase: PosePhase,
        sample: &SensorSample,
    ) -> Option<CalibrationEvent> {
        let accelerometer = sample.accelerometer;
        let magnitude = accelerometer.norm();
        let cos = if magnitude > 0.0 {
            accelerometer.dot(&self.target) / magnitude
        } else {
            -1.0
        };
        self.deviation = accelerometer.deviation_degrees(&self.target);

        self.sample_timer += sample.delta_time;
        let tick = self.sample_timer >= self.settings.sample_period;
        if tick {
            self.sample_timer = 0.0;
            self.push(accelerometer);
        }
        let spread = self.ring_spread();
        if let Some(spread) = spread {
            self.spread = spread;
        }

        match phase {
            PosePhase::Waiting => {
                let steady = spread.is_some_and(|s| s <= self.settings.activation_spread);
                if steady && cos >= self.activation_cos {
                    self.accelerometer_mean = Vector3::zeros();
                    self.magnetometer_mean = Vector3::zeros();
                    self.set_phase(pose, PosePhase::Capturing { captured: 0 });
                    log_debug!("capturing pose {}", pose);
                    return None;
                }

                self.pose_timer += sample.delta_time;
                if self.pose_timer >= self.settings.pose_timeout {
                    self.pose_timer = 0.0;
                    log_warn!("pose {} not acquired", pose);
                    return Some(CalibrationEvent::PoseTimedOut { pose });
                }
                None
            }
            PosePhase::Capturing { captured } => {
                let moved = spread.is_none_or(|s| s > self.settings.deactivation_spread);
                if moved || cos < self.deactivation_cos {
                    self.pose_timer = 0.0;
                    self.set_phase(pose, PosePhase::Waiting);
                    log_debug!("capture of pose {} aborted", pose);
                    return Some(CalibrationEvent::CaptureAborted { pose });
                }
                if !tick {
                    return None;
                }

                let captured = captured + 1;
                let weight = 1.0 / captured as f32;
                self.accelerometer_mean += (accelerometer - self.accelerometer_mean) * weight;
                self.magnetometer_mean += (sample.magnetometer - self.magnetometer_mean) * weight;

                if (captured as usize) < RING_LENGTH {
                    self.set_phase(pose, PosePhase::Capturing { captured });
                    return None;
                }

                self.accelerometer_poses[pose] = self.accelerometer_mean;
                self.magnetometer_poses[pose] = self.magnetometer_mean;
                log_info!("pose {} accepted", pose);
                if pose + 1 < POSE_COUNT {
                    self.enter_pose(pose + 1);
                } else {
                    self.begin_converging(CalibrationSensor::Accelerometer);
                }
                Some(CalibrationEvent::PoseAccepted { pose })
            }
        }
    }

    fn converge<S: PageStorage>(
        &mut self,
        sensor: CalibrationSensor,
        store: &mut ParameterStore<S>,
    ) -> Option<CalibrationEvent> {
        if self.solver.is_none() {
            if let Err(error) = self.start_solver(sensor) {
                return Some(self.fail(sensor, error));
            }
        }
        let sweeps = self.settings.sweeps_per_cycle;
        let solver = self.solver.as_mut()?;
        let result = sweep(solver, sweeps);
        let (offset, error) = (solver.offset(), solver.relative_rms());

        let status = match result {
            Ok(status) => status,
            Err(error) => return Some(self.fail(sensor, error)),
        };
        self.convergence_error = error;
        if status == DescentStatus::Searching {
            return None;
        }

        let (slot, range) = match sensor {
            CalibrationSensor::Accelerometer => {
                (Slot::AccelerometerZero, self.settings.storage.accelerometer)
            }
            CalibrationSensor::Magnetometer => {
                (Slot::MagnetometerZero, self.settings.storage.magnetometer)
            }
        };
        let stored = match store.store(&offset, slot, range) {
            Ok(()) => true,
            Err(_e) => {
                log_warn!("persisting {} offset failed", slot);
                false
            }
        };
        log_info!("{} offset solved", sensor);

        match sensor {
            CalibrationSensor::Accelerometer => {
                self.begin_converging(CalibrationSensor::Magnetometer)
            }
            CalibrationSensor::Magnetometer => {
                self.state = CalibrationState::Idle;
                self.solver = None;
            }
        }

        Some(CalibrationEvent::OffsetSolved {
            sensor,
            offset,
            error,
            stored,
        })
    }

    fn begin_converging(&mut self, sensor: CalibrationSensor) {
        self.solver = None;
        self.state = CalibrationState::Converging { sensor };
    }

    fn start_solver(&mut self, sensor: CalibrationSensor) -> Result<(), SolverError> {
        let (measurements, settings) = match sensor {
            CalibrationSensor::Accelerometer => {
                (self.accelerometer_poses, self.settings.accelerometer)
            }
            CalibrationSensor::Magnetometer => {
                (self.magnetometer_poses, self.settings.magnetometer)
            }
        };
        self.solver = Some(CoordinateDescent::new(measurements, settings)?);
        Ok(())
    }

    fn fail(&mut self, sensor: CalibrationSensor, error: SolverError) -> CalibrationEvent {
        log_warn!("{} calibration failed: {}", sensor, error);
        self.state = CalibrationState::Idle;
        self.solver = None;
        CalibrationEvent::Failed { sensor, error }
    }

    fn set_phase(&mut self, pose: usize, phase: PosePhase) {
        self.state = CalibrationState::Collecting { pose, phase };
    }

    fn push(&mut self, sample: Vector3<f32>) {
        self.ring[self.ring_next] = sample;
        self.ring_next = (self.ring_next + 1) % RING_LENGTH;
        self.ring_len = (self.ring_len + 1).min(RING_LENGTH);
    }

    /// Largest per-axis standard deviation of a full ring
    fn ring_spread(&self) -> Option<f32> {
        if self.ring_len < RING_LENGTH {
            return None;
        }
        let count = RING_LENGTH as f32;
        let mean = self.ring.iter().sum::<Vector3<f32>>() / count;
        let variance = self
            .ring
            .iter()
            .map(|v| (v - mean).component_mul(&(v - mean)))
            .sum::<Vector3<f32>>()
            / count;
        Some(variance.max().sqrt())
    }
}

fn sweep<const N: usize>(
    solver: &mut CoordinateDescent<N>,
    sweeps: u32,
) -> Result<DescentStatus, SolverError> {
    let mut status = DescentStatus::Searching;
    for _ in 0..sweeps.max(1) {
        status = solver.iterate()?;
        if status == DescentStatus::Converged {
            break;
        }
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RamPage;

    fn still(accelerometer: Vector3<f32>) -> SensorSample {
        SensorSample {
            accelerometer,
            gyroscope: Vector3::zeros(),
            magnetometer: Vector3::new(-20.74, 0.0, 43.23),
            delta_time: 0.01,
        }
    }

    #[test]
    fn test_pose_sequence_spans_sphere() {
        let half = FRAC_1_SQRT_2;
        let expected = [
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(0.0, -half, half),
            Vector3::new(half, 0.0, half),
            Vector3::new(0.0, half, half),
            Vector3::new(-half, 0.0, half),
            Vector3::new(0.0, -1.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
            Vector3::new(-1.0, 0.0, 0.0),
        ];
        for (i, direction) in expected.iter().enumerate() {
            assert!((pose_direction(i) - direction).norm() < 1e-5, "pose {}", i);
        }

        let sum: Vector3<f32> = (0..POSE_COUNT).map(pose_direction).sum();
        assert!(sum.norm() < 1e-5);
    }

    #[test]
    fn test_idle_ignores_samples() {
        let mut calibration = Calibration::new(CalibrationSettings::default());
        let mut store = ParameterStore::new(RamPage::new());

        assert_eq!(calibration.step(&still(Vector3::new(0.0, 0.0, 9.81)), &mut store), None);
        assert_eq!(calibration.state(), CalibrationState::Idle);
    }

    #[test]
    fn test_first_pose_capture_and_accept() {
        let mut calibration = Calibration::new(CalibrationSettings::default());
        let mut store = ParameterStore::new(RamPage::new());
        calibration.start();

        let sample = still(Vector3::new(0.1, -0.1, 9.8));
        let mut accepted = None;
        for _ in 0..1000 {
            if let Some(event) = calibration.step(&sample, &mut store) {
                accepted = Some(event);
                break;
            }
        }

        assert_eq!(accepted, Some(CalibrationEvent::PoseAccepted { pose: 0 }));
        assert_eq!(
            calibration.state(),
            CalibrationState::Collecting { pose: 1, phase: PosePhase::Waiting }
        );
        let (accelerometer, magnetometer) = calibration.pose_measurements();
        assert!((accelerometer[0] - sample.accelerometer).norm() < 1e-4);
        assert!((magnetometer[0] - sample.magnetometer).norm() < 1e-3);
    }

    #[test]
    fn test_abort_returns_to_idle() {
        let mut calibration = Calibration::new(CalibrationSettings::default());
        calibration.start();
        assert!(calibration.is_active());

        calibration.abort();
        assert_eq!(calibration.state(), CalibrationState::Idle);
    }

    #[test]
    fn test_ring_spread_of_alternating_samples() {
        let mut calibration = Calibration::new(CalibrationSettings::default());
        for i in 0..RING_LENGTH {
            let x = if i % 2 == 0 { 1.0 } else { -1.0 };
            calibration.push(Vector3::new(x, 0.0, 9.81));
        }
        let spread = calibration.ring_spread().unwrap();
        assert!((spread - 1.0).abs() < 1e-5);
    }
}
