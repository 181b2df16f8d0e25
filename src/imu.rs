//! Control loop
//!
//! [`Imu`] owns the sensor adapter, estimator, calibration engine and
//! parameter store and runs them from a single cooperative loop. Each call to
//! [`Imu::cycle`] reads the sensors once and then runs either the calibration
//! engine or the estimator, never both.
//!
//! Exclusive access goes through `&mut self`; the loop must not be driven from
//! interrupt context.

use crate::calibration::{Calibration, CalibrationEvent};
use crate::ekf::Ekf;
use crate::error::{FilterFault, SensorError};
use crate::offset::ZeroOffsets;
use crate::sensors::{SensorDriver, Sensors};
use crate::store::{PageStorage, ParameterStore, Slot};
use crate::types::{CalibrationProgress, FilterHealth, ImuSettings};
use nalgebra::Vector3;

/// What one control cycle did
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Cycle {
    /// The estimator predicted and corrected
    Estimated,
    /// The estimator faulted; see [`Ekf::health`]
    Faulted(FilterFault),
    /// The calibration engine ran, possibly with something to report
    Calibrating(Option<CalibrationEvent>),
    /// No usable time step yet
    Skipped,
    /// Sensor read failed or returned garbage; the driver was re-initialised
    SensorFault,
}

/// Snapshot for display and telemetry consumers
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Telemetry {
    /// Roll, pitch, yaw in degrees
    pub euler_degrees: Vector3<f32>,
    pub calibration: CalibrationProgress,
    pub zero_offsets: ZeroOffsets,
    pub health: FilterHealth,
}

/// IMU firmware core
///
/// # Example
/// ```
/// use nalgebra::Vector3;
/// use imu_ekf::{Cycle, Imu, ImuSettings, RawSample, SensorDriver};
/// use imu_ekf::store::RamPage;
///
/// struct Level(u32);
///
/// impl SensorDriver for Level {
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
/// let mut imu = Imu::new(Level(0), RamPage::new(), ImuSettings::default());
/// assert_eq!(imu.cycle(), Cycle::Skipped); // first read starts the clock
/// assert_eq!(imu.cycle(), Cycle::Estimated);
/// assert!(imu.telemetry().euler_degrees.norm() < 1e-3);
/// ```
pub struct Imu<D: SensorDriver, S: PageStorage> {
    settings: ImuSettings,
    sensors: Sensors<D>,
    ekf: Ekf,
    calibration: Calibration,
    store: ParameterStore<S>,
    reset_pending: bool,
}

impl<D: SensorDriver, S: PageStorage> Imu<D, S> {
    /// Wire the components together and load stored zero offsets
    ///
    /// An unreadable parameter page is logged and treated as empty.
    pub fn new(driver: D, storage: S, settings: ImuSettings) -> Self {
        let mut store = ParameterStore::new(storage);
        if store.reload().is_err() {
            log_warn!("parameter page unreadable, using zero offsets");
        }

        let ranges = settings.calibration.storage;
        let mut offsets = ZeroOffsets::zero();
        if let Some(accelerometer) = store.load(Slot::AccelerometerZero, ranges.accelerometer) {
            offsets.accelerometer = accelerometer;
        }
        if let Some(magnetometer) = store.load(Slot::MagnetometerZero, ranges.magnetometer) {
            offsets.magnetometer = magnetometer;
        }

        let mut sensors = Sensors::new(driver);
        sensors.set_zero_offsets(offsets);

        Self {
            settings,
            sensors,
            ekf: Ekf::with_settings(settings.ekf),
            calibration: Calibration::new(settings.calibration),
            store,
            reset_pending: false,
        }
    }

    /// Run one control cycle
    pub fn cycle(&mut self) -> Cycle {
        if self.reset_pending {
            self.reset_pending = false;
            self.ekf.initialise();
            log_info!("estimator reset");
        }

        let sample = match self.sensors.sample() {
            Ok(sample) => sample,
            Err(SensorError::NotReady | SensorError::Stale) => return Cycle::Skipped,
            Err(_) => {
                log_warn!("sensor fault, re-initialising");
                if self.sensors.reinitialise().is_err() {
                    log_warn!("sensor re-initialisation failed");
                }
                return Cycle::SensorFault;
            }
        };

        if self.calibration.is_active() {
            let event = self.calibration.step(&sample, &mut self.store);
            if let Some(CalibrationEvent::OffsetSolved { sensor, offset, .. }) = event {
                let mut offsets = *self.sensors.zero_offsets();
                offsets.set(sensor, offset);
                self.sensors.set_zero_offsets(offsets);
            }
            if !self.calibration.is_active() {
                self.sensors.set_offsets_enabled(true);
            }
            return Cycle::Calibrating(event);
        }

        match self.ekf.update(&sample) {
            Ok(()) => Cycle::Estimated,
            Err(fault) => Cycle::Faulted(fault),
        }
    }

    /// Re-initialise the estimator at the start of the next cycle
    pub fn request_reset(&mut self) {
        self.reset_pending = true;
    }

    /// Start a calibration pass; raw readings are used until it ends
    pub fn start_calibration(&mut self) {
        self.calibration.start();
        self.sensors.set_offsets_enabled(false);
    }

    /// Abandon the calibration pass and return to estimating
    pub fn abort_calibration(&mut self) {
        self.calibration.abort();
        self.sensors.set_offsets_enabled(true);
    }

    pub fn telemetry(&self) -> Telemetry {
        Telemetry {
            euler_degrees: self.ekf.euler_degrees(),
            calibration: self.calibration.progress(),
            zero_offsets: *self.sensors.zero_offsets(),
            health: self.ekf.health(),
        }
    }

    pub fn settings(&self) -> &ImuSettings {
        &self.settings
    }

    pub fn ekf(&self) -> &Ekf {
        &self.ekf
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn sensors(&self) -> &Sensors<D> {
        &self.sensors
    }

    pub fn sensors_mut(&mut self) -> &mut Sensors<D> {
        &mut self.sensors
    }

    pub fn store(&self) -> &ParameterStore<S> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ParameterStore<S> {
        &mut self.store
    }
}
