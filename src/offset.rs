//! Accelerometer and magnetometer zero offsets

use crate::types::{CalibrationSensor, RawSample};
use nalgebra::Vector3;

/// Additive zero offsets subtracted from raw readings
///
/// The gyroscope has no entry here: its bias is a state of the estimator.
///
/// # Example
/// ```
/// use nalgebra::Vector3;
/// use imu_ekf::{RawSample, ZeroOffsets};
///
/// let offsets = ZeroOffsets {
///     accelerometer: Vector3::new(0.1, -0.2, 0.3),
///     magnetometer: Vector3::new(5.0, 0.0, -3.0),
/// };
/// let raw = RawSample {
///     accelerometer: Vector3::new(0.1, -0.2, 10.11),
///     gyroscope: Vector3::zeros(),
///     magnetometer: Vector3::new(-15.74, 0.0, 40.23),
/// };
/// let corrected = offsets.apply(&raw);
/// assert!((corrected.accelerometer.z - 9.81).abs() < 1e-5);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZeroOffsets {
    /// Accelerometer offset in m/s²
    pub accelerometer: Vector3<f32>,
    /// Magnetometer (hard iron) offset in µT
    pub magnetometer: Vector3<f32>,
}

impl ZeroOffsets {
    /// Offsets that leave readings unchanged
    pub fn zero() -> Self {
        Self {
            accelerometer: Vector3::zeros(),
            magnetometer: Vector3::zeros(),
        }
    }

    /// Subtract the offsets from a raw reading
    pub fn apply(&self, raw: &RawSample) -> RawSample {
        RawSample {
            accelerometer: raw.accelerometer - self.accelerometer,
            gyroscope: raw.gyroscope,
            magnetometer: raw.magnetometer - self.magnetometer,
        }
    }

    /// Offset of one sensor
    pub fn get(&self, sensor: CalibrationSensor) -> Vector3<f32> {
        match sensor {
            CalibrationSensor::Accelerometer => self.accelerometer,
            CalibrationSensor::Magnetometer => self.magnetometer,
        }
    }

    /// Replace the offset of one sensor
    pub fn set(&mut self, sensor: CalibrationSensor, offset: Vector3<f32>) {
        match sensor {
            CalibrationSensor::Accelerometer => self.accelerometer = offset,
            CalibrationSensor::Magnetometer => self.magnetometer = offset,
        }
    }
}

impl Default for ZeroOffsets {
    fn default() -> Self {
        Self::zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_leaves_gyroscope_untouched() {
        let offsets = ZeroOffsets {
            accelerometer: Vector3::new(1.0, 2.0, 3.0),
            magnetometer: Vector3::new(10.0, 20.0, 30.0),
        };
        let raw = RawSample {
            accelerometer: Vector3::new(1.0, 2.0, 3.0),
            gyroscope: Vector3::new(0.1, 0.2, 0.3),
            magnetometer: Vector3::new(100.0, 200.0, 300.0),
        };

        let corrected = offsets.apply(&raw);
        assert_eq!(corrected.accelerometer, Vector3::zeros());
        assert_eq!(corrected.gyroscope, raw.gyroscope);
        assert_eq!(corrected.magnetometer, Vector3::new(90.0, 180.0, 270.0));
    }

    #[test]
    fn test_set_by_sensor() {
        let mut offsets = ZeroOffsets::zero();
        offsets.set(CalibrationSensor::Magnetometer, Vector3::new(1.0, 1.0, 1.0));

        assert_eq!(offsets.get(CalibrationSensor::Accelerometer), Vector3::zeros());
        assert_eq!(offsets.get(CalibrationSensor::Magnetometer), Vector3::new(1.0, 1.0, 1.0));
    }
}
