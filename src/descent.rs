//! Coordinate-descent zero-offset solver
//!
//! Finds the offset `z` for which every measured vector `m - z` has the same
//! known length. The search is a 3-D hill climb on a shrinking lattice: each
//! sweep evaluates the 26 neighbours of the current offset at one step
//! distance, moves to the best strictly better one, and divides the step when
//! none improves.

use crate::error::SolverError;
use crate::types::DescentSettings;
use nalgebra::{ComplexField, Vector3};

/// Outcome of one solver sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DescentStatus {
    /// The step is still at or above the minimum
    Searching,
    /// The step fell below the minimum; the offset is final
    Converged,
}

/// Mean squared relative length error of `measurements` corrected by `offset`
///
/// `Σ (‖mᵢ − offset‖ / target − 1)² / n`
///
/// # Example
/// ```
/// use nalgebra::Vector3;
/// use imu_ekf::descent::mean_squared_relative_error;
///
/// let measurements = [Vector3::new(0.0, 0.0, 2.0), Vector3::new(0.0, 0.0, -2.0)];
/// assert_eq!(mean_squared_relative_error(&measurements, &Vector3::zeros(), 2.0), 0.0);
/// assert_eq!(mean_squared_relative_error(&measurements, &Vector3::zeros(), 1.0), 1.0);
/// ```
pub fn mean_squared_relative_error(
    measurements: &[Vector3<f32>],
    offset: &Vector3<f32>,
    target: f32,
) -> f32 {
    let sum: f32 = measurements
        .iter()
        .map(|m| {
            let relative = (m - offset).norm() / target - 1.0;
            relative * relative
        })
        .sum();
    sum / measurements.len() as f32
}

/// Offset solver over `N` pose measurements
///
/// # Example
/// ```
/// use nalgebra::Vector3;
/// use imu_ekf::{CoordinateDescent, DescentSettings};
///
/// let offset = Vector3::new(0.2, -0.1, 0.3);
/// let measurements = [
///     Vector3::new(9.81, 0.0, 0.0) + offset,
///     Vector3::new(-9.81, 0.0, 0.0) + offset,
///     Vector3::new(0.0, 9.81, 0.0) + offset,
///     Vector3::new(0.0, -9.81, 0.0) + offset,
///     Vector3::new(0.0, 0.0, 9.81) + offset,
///     Vector3::new(0.0, 0.0, -9.81) + offset,
/// ];
///
/// let mut solver = CoordinateDescent::new(measurements, DescentSettings::accelerometer()).unwrap();
/// let solved = solver.solve().unwrap();
/// assert!((solved - offset).amax() < 0.01);
/// ```
#[derive(Debug, Clone)]
pub struct CoordinateDescent<const N: usize> {
    measurements: [Vector3<f32>; N],
    settings: DescentSettings,
    offset: Vector3<f32>,
    error: f32,
    step: f32,
    sweeps: u32,
}

impl<const N: usize> CoordinateDescent<N> {
    /// Validate the inputs and start the search at a zero offset
    ///
    /// # Errors
    /// - [`SolverError::InvalidTarget`] for a target norm that is not finite and positive
    /// - [`SolverError::InvalidSchedule`] for steps that are not finite and positive,
    ///   or a divisor not greater than 1
    /// - [`SolverError::InvalidMeasurement`] for non-finite measurements
    /// - [`SolverError::NonFinite`] when the initial error cannot be evaluated
    pub fn new(
        measurements: [Vector3<f32>; N],
        settings: DescentSettings,
    ) -> Result<Self, SolverError> {
        if !(settings.target_norm.is_finite() && settings.target_norm > 0.0) {
            return Err(SolverError::InvalidTarget);
        }
        let positive = |v: f32| v.is_finite() && v > 0.0;
        if !positive(settings.initial_step)
            || !positive(settings.minimum_step)
            || !(settings.step_divisor.is_finite() && settings.step_divisor > 1.0)
        {
            return Err(SolverError::InvalidSchedule);
        }
        if !measurements.iter().all(|m| m.iter().all(|v| v.is_finite())) {
            return Err(SolverError::InvalidMeasurement);
        }

        let offset = Vector3::zeros();
        let error = mean_squared_relative_error(&measurements, &offset, settings.target_norm);
        if !error.is_finite() {
            return Err(SolverError::NonFinite);
        }

        Ok(Self {
            measurements,
            settings,
            offset,
            error,
            step: settings.initial_step,
            sweeps: 0,
        })
    }

    /// Perform one 26-neighbour sweep
    ///
    /// Calling this after convergence does nothing and reports
    /// [`DescentStatus::Converged`] again.
    pub fn iterate(&mut self) -> Result<DescentStatus, SolverError> {
        if self.is_converged() {
            return Ok(DescentStatus::Converged);
        }

        let mut best_offset = self.offset;
        let mut best_error = self.error;
        for dx in -1i8..=1 {
            for dy in -1i8..=1 {
                for dz in -1i8..=1 {
                    if dx == 0 && dy == 0 && dz == 0 {
                        continue;
                    }
                    let direction = Vector3::new(dx as f32, dy as f32, dz as f32);
                    let candidate = self.offset + direction * self.step;
                    let error = mean_squared_relative_error(
                        &self.measurements,
                        &candidate,
                        self.settings.target_norm,
                    );
                    if !error.is_finite() {
                        return Err(SolverError::NonFinite);
                    }
                    if error < best_error {
                        best_error = error;
                        best_offset = candidate;
                    }
                }
            }
        }

        if best_error < self.error {
            self.offset = best_offset;
            self.error = best_error;
        } else {
            self.step /= self.settings.step_divisor;
        }
        self.sweeps += 1;

        if self.is_converged() {
            Ok(DescentStatus::Converged)
        } else {
            Ok(DescentStatus::Searching)
        }
    }

    /// Sweep until the step falls below the minimum and return the offset
    pub fn solve(&mut self) -> Result<Vector3<f32>, SolverError> {
        while self.iterate()? == DescentStatus::Searching {}
        Ok(self.offset)
    }

    /// Current offset estimate
    pub fn offset(&self) -> Vector3<f32> {
        self.offset
    }

    /// Mean squared relative error at the current offset
    pub fn error(&self) -> f32 {
        self.error
    }

    /// Root of [`error`](Self::error): the typical relative length error
    pub fn relative_rms(&self) -> f32 {
        self.error.sqrt()
    }

    pub fn step(&self) -> f32 {
        self.step
    }

    /// Number of sweeps performed so far
    pub fn sweeps(&self) -> u32 {
        self.sweeps
    }

    pub fn is_converged(&self) -> bool {
        self.step < self.settings.minimum_step
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axis_measurements(offset: Vector3<f32>, norm: f32) -> [Vector3<f32>; 6] {
        [
            Vector3::x() * norm + offset,
            -Vector3::x() * norm + offset,
            Vector3::y() * norm + offset,
            -Vector3::y() * norm + offset,
            Vector3::z() * norm + offset,
            -Vector3::z() * norm + offset,
        ]
    }

    #[test]
    fn test_error_is_zero_at_true_offset() {
        let offset = Vector3::new(1.0, 2.0, -3.0);
        let measurements = axis_measurements(offset, 5.0);
        assert!(mean_squared_relative_error(&measurements, &offset, 5.0) < 1e-12);
        assert!(mean_squared_relative_error(&measurements, &Vector3::zeros(), 5.0) > 1e-3);
    }

    #[test]
    fn test_step_shrinks_on_stagnation() {
        let measurements = axis_measurements(Vector3::zeros(), 9.81);
        let mut solver = CoordinateDescent::new(measurements, DescentSettings::accelerometer()).unwrap();

        assert_eq!(solver.iterate(), Ok(DescentStatus::Searching));
        assert_eq!(solver.offset(), Vector3::zeros());
        assert_eq!(solver.step(), 0.25);
    }

    #[test]
    fn test_error_never_increases() {
        let measurements = axis_measurements(Vector3::new(0.4, -0.3, 0.2), 9.81);
        let mut solver = CoordinateDescent::new(measurements, DescentSettings::accelerometer()).unwrap();

        let mut previous = solver.error();
        while solver.iterate().unwrap() == DescentStatus::Searching {
            assert!(solver.error() <= previous);
            previous = solver.error();
        }
        assert!(solver.is_converged());
        assert_eq!(solver.iterate(), Ok(DescentStatus::Converged));
    }

    #[test]
    fn test_rejects_invalid_settings() {
        let measurements = axis_measurements(Vector3::zeros(), 1.0);
        let settings = DescentSettings::accelerometer();

        let bad_target = DescentSettings { target_norm: 0.0, ..settings };
        assert_eq!(
            CoordinateDescent::new(measurements, bad_target).err(),
            Some(SolverError::InvalidTarget)
        );

        let bad_divisor = DescentSettings { step_divisor: 1.0, ..settings };
        assert_eq!(
            CoordinateDescent::new(measurements, bad_divisor).err(),
            Some(SolverError::InvalidSchedule)
        );

        let mut nan = measurements;
        nan[2].y = f32::NAN;
        assert_eq!(
            CoordinateDescent::new(nan, settings).err(),
            Some(SolverError::InvalidMeasurement)
        );
    }
}
