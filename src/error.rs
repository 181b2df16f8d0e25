//! Error types for the estimator, calibration and adapter boundaries
//!
//! Numeric faults are handled inside the component that owns the numbers and
//! surface as health/progress information. Adapter errors wrap whatever the
//! external driver or storage reports.

use core::fmt;

/// A pivot of a Gauss-Jordan inversion was zero or not finite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SingularMatrix;

impl fmt::Display for SingularMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("matrix is singular")
    }
}

/// Estimator health faults
///
/// A faulted step leaves state and covariance at their last finite values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FilterFault {
    /// Elapsed time was zero, negative or not finite
    InvalidTimeStep,
    /// A measurement component was not finite
    InvalidMeasurement,
    /// Innovation covariance could not be inverted
    SingularInnovation,
    /// The step would have produced a non-finite state or covariance
    NonFinite,
}

impl fmt::Display for FilterFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTimeStep => f.write_str("invalid time step"),
            Self::InvalidMeasurement => f.write_str("non-finite measurement"),
            Self::SingularInnovation => f.write_str("singular innovation covariance"),
            Self::NonFinite => f.write_str("non-finite filter state"),
        }
    }
}

/// Zero-offset solver errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SolverError {
    /// Target norm is zero, negative or not finite
    InvalidTarget,
    /// Step schedule cannot terminate (non-positive steps or divisor <= 1)
    InvalidSchedule,
    /// A pose measurement is not finite
    InvalidMeasurement,
    /// The error function evaluated to a non-finite value
    NonFinite,
}

impl fmt::Display for SolverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTarget => f.write_str("invalid target norm"),
            Self::InvalidSchedule => f.write_str("invalid step schedule"),
            Self::InvalidMeasurement => f.write_str("non-finite pose measurement"),
            Self::NonFinite => f.write_str("non-finite convergence error"),
        }
    }
}

/// Sensor adapter errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError<E> {
    /// Bus transaction with the sensors failed
    Bus(E),
    /// No time base yet; the first sample only starts the clock
    NotReady,
    /// No time has elapsed since the previous sample
    Stale,
    /// The driver returned non-finite values
    InvalidSample,
}

impl<E: fmt::Debug> fmt::Display for SensorError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bus(e) => write!(f, "sensor bus error: {:?}", e),
            Self::NotReady => f.write_str("sensor time base not ready"),
            Self::Stale => f.write_str("stale sensor sample"),
            Self::InvalidSample => f.write_str("non-finite sensor sample"),
        }
    }
}

/// Persistence adapter errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceError<E> {
    /// Page read or write failed
    Storage(E),
    /// Quantization range is zero, negative or not finite
    InvalidRange,
    /// Value to store is not finite
    InvalidValue,
}

impl<E: fmt::Debug> fmt::Display for PersistenceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {:?}", e),
            Self::InvalidRange => f.write_str("invalid quantization range"),
            Self::InvalidValue => f.write_str("non-finite value"),
        }
    }
}
