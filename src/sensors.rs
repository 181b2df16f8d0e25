//! Sensor adapter
//!
//! [`SensorDriver`] is the bus-level driver supplied by the board support
//! code. [`Sensors`] wraps it with zero-offset subtraction and elapsed time
//! measurement on the driver's wrapping microsecond counter.

use crate::error::SensorError;
use crate::offset::ZeroOffsets;
use crate::types::{RawSample, SensorSample};
use core::fmt;

/// Triaxial accelerometer, gyroscope and magnetometer on one bus
pub trait SensorDriver {
    type Error: fmt::Debug;

    /// Read one sample of all three sensors
    fn read(&mut self) -> Result<RawSample, Self::Error>;

    /// Free-running microsecond counter; wraps at `u32::MAX`
    fn timestamp_micros(&self) -> u32;

    /// Bring the sensors back to a known state after a bus fault
    fn reinitialise(&mut self) -> Result<(), Self::Error>;
}

/// Driver wrapper producing offset-corrected, time-stamped samples
///
/// # Example
/// ```
/// use nalgebra::Vector3;
/// use imu_ekf::{RawSample, SensorDriver, SensorError, Sensors};
///
/// struct Fixed(u32);
///
/// impl SensorDriver for Fixed {
///     type Error = ();
///     fn read(&mut self) -> Result<RawSample, ()> {
///         self.0 += 10_000;
///         Ok(RawSample {
///             accelerometer: Vector3::new(0.0, 0.0, 9.81),
///             gyroscope: Vector3::zeros(),
///             magnetometer: Vector3::new(-20.74, 0.0, 43.23),
///         })
///     }
///     fn timestamp_micros(&self) -> u32 { self.0 }
///     fn reinitialise(&mut self) -> Result<(), ()> { Ok(()) }
/// }
///
/// let mut sensors = Sensors::new(Fixed(0));
/// assert_eq!(sensors.sample(), Err(SensorError::NotReady));
/// let sample = sensors.sample().unwrap();
/// assert!((sample.delta_time - 0.01).abs() < 1e-6);
/// ```
pub struct Sensors<D: SensorDriver> {
    driver: D,
    offsets: ZeroOffsets,
    offsets_enabled: bool,
    last_timestamp: Option<u32>,
}

impl<D: SensorDriver> Sensors<D> {
    /// Wrap `driver` with zero offsets, subtraction enabled
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            offsets: ZeroOffsets::zero(),
            offsets_enabled: true,
            last_timestamp: None,
        }
    }

    /// Read the sensors and compute the time since the previous read
    ///
    /// The first successful read only starts the time base and returns
    /// [`SensorError::NotReady`]. A read at the same counter value as the
    /// previous one returns [`SensorError::Stale`].
    pub fn sample(&mut self) -> Result<SensorSample, SensorError<D::Error>> {
        let raw = self.driver.read().map_err(SensorError::Bus)?;
        let now = self.driver.timestamp_micros();
        if !raw.is_finite() {
            return Err(SensorError::InvalidSample);
        }

        let previous = self.last_timestamp.replace(now);
        let elapsed = match previous {
            None => return Err(SensorError::NotReady),
            Some(previous) => now.wrapping_sub(previous),
        };
        if elapsed == 0 {
            return Err(SensorError::Stale);
        }

        let corrected = if self.offsets_enabled {
            self.offsets.apply(&raw)
        } else {
            raw
        };

        Ok(SensorSample {
            accelerometer: corrected.accelerometer,
            gyroscope: corrected.gyroscope,
            magnetometer: corrected.magnetometer,
            delta_time: elapsed as f32 * 1e-6,
        })
    }

    /// Re-initialise the driver and restart the time base
    pub fn reinitialise(&mut self) -> Result<(), SensorError<D::Error>> {
        self.last_timestamp = None;
        self.driver.reinitialise().map_err(SensorError::Bus)
    }

    pub fn zero_offsets(&self) -> &ZeroOffsets {
        &self.offsets
    }

    pub fn set_zero_offsets(&mut self, offsets: ZeroOffsets) {
        self.offsets = offsets;
    }

    /// Enable or disable zero-offset subtraction
    pub fn set_offsets_enabled(&mut self, enabled: bool) {
        self.offsets_enabled = enabled;
    }

    pub fn offsets_enabled(&self) -> bool {
        self.offsets_enabled
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }
}
