use imu_ekf::calibration::pose_direction;
use imu_ekf::{
    CalibrationEvent, CalibrationSensor, CalibrationState, Cycle, GRAVITY, Imu, ImuSettings,
    MAGNETIC_REFERENCE, POSE_COUNT, ParameterStore, RamPage, RawSample, SensorDriver, Slot,
};
use nalgebra::{UnitQuaternion, Vector3};

#[derive(Debug, Clone, Copy, PartialEq)]
struct BusError;

/// Driver returning a fixed sample on a counter advancing `step` µs per read
struct MockDriver {
    now: u32,
    step: u32,
    sample: RawSample,
    fail_reads: u32,
    reinitialisations: u32,
}

impl MockDriver {
    fn new(sample: RawSample) -> Self {
        Self {
            now: 0,
            step: 10_000,
            sample,
            fail_reads: 0,
            reinitialisations: 0,
        }
    }
}

impl SensorDriver for MockDriver {
    type Error = BusError;

    fn read(&mut self) -> Result<RawSample, BusError> {
        if self.fail_reads > 0 {
            self.fail_reads -= 1;
            return Err(BusError);
        }
        self.now = self.now.wrapping_add(self.step);
        Ok(self.sample)
    }

    fn timestamp_micros(&self) -> u32 {
        self.now
    }

    fn reinitialise(&mut self) -> Result<(), BusError> {
        self.reinitialisations += 1;
        Ok(())
    }
}

fn accelerometer_zero() -> Vector3<f32> {
    Vector3::new(0.31, -0.17, 0.42)
}

fn magnetometer_zero() -> Vector3<f32> {
    Vector3::new(12.3, -7.9, 25.4)
}

fn magnetic_reference() -> Vector3<f32> {
    Vector3::from(MAGNETIC_REFERENCE)
}

/// Reading of a resting device at `orientation`, offsets added
fn resting(orientation: &UnitQuaternion<f32>, biased: bool) -> RawSample {
    let (accelerometer_bias, magnetometer_bias) = if biased {
        (accelerometer_zero(), magnetometer_zero())
    } else {
        (Vector3::zeros(), Vector3::zeros())
    };
    RawSample {
        accelerometer: orientation.inverse_transform_vector(&Vector3::new(0.0, 0.0, GRAVITY))
            + accelerometer_bias,
        gyroscope: Vector3::zeros(),
        magnetometer: orientation.inverse_transform_vector(&magnetic_reference())
            + magnetometer_bias,
    }
}

/// Biased reading for calibration pose `index`
fn pose_sample(index: usize) -> RawSample {
    let d = pose_direction(index);
    RawSample {
        accelerometer: d * GRAVITY + accelerometer_zero(),
        gyroscope: Vector3::zeros(),
        magnetometer: Vector3::new(d.y, d.z, d.x) * magnetic_reference().norm()
            + magnetometer_zero(),
    }
}

fn level_imu(storage: RamPage) -> Imu<MockDriver, RamPage> {
    let driver = MockDriver::new(resting(&UnitQuaternion::identity(), true));
    Imu::new(driver, storage, ImuSettings::default())
}

/// Run cycles until a calibration event comes out
fn next_event(imu: &mut Imu<MockDriver, RamPage>, max_cycles: usize) -> Option<CalibrationEvent> {
    (0..max_cycles).find_map(|_| match imu.cycle() {
        Cycle::Calibrating(event) => event,
        other => panic!("unexpected cycle {:?}", other),
    })
}

/// Walk the device through every pose and return the two solver results
fn calibrate(imu: &mut Imu<MockDriver, RamPage>) -> [CalibrationEvent; 2] {
    imu.start_calibration();
    for pose in 0..POSE_COUNT {
        imu.sensors_mut().driver_mut().sample = pose_sample(pose);
        assert_eq!(
            next_event(imu, 2000),
            Some(CalibrationEvent::PoseAccepted { pose })
        );
    }
    let accelerometer = next_event(imu, 1000).unwrap();
    let magnetometer = next_event(imu, 1000).unwrap();
    [accelerometer, magnetometer]
}

#[test]
fn test_stored_offsets_loaded_at_startup() {
    let ranges = ImuSettings::default().calibration.storage;
    let mut store = ParameterStore::new(RamPage::new());
    store
        .store(&accelerometer_zero(), Slot::AccelerometerZero, ranges.accelerometer)
        .unwrap();
    store
        .store(&magnetometer_zero(), Slot::MagnetometerZero, ranges.magnetometer)
        .unwrap();

    let mut imu = level_imu(RamPage::with_contents(*store.page()));
    let offsets = imu.telemetry().zero_offsets;
    assert!((offsets.accelerometer - accelerometer_zero()).amax() < 1e-3);
    assert!((offsets.magnetometer - magnetometer_zero()).amax() < 0.02);

    assert_eq!(imu.cycle(), Cycle::Skipped);
    for _ in 0..200 {
        assert_eq!(imu.cycle(), Cycle::Estimated);
    }
    assert!(imu.telemetry().euler_degrees.amax() < 0.1);
}

#[test]
fn test_bus_fault_reinitialises_driver() {
    let mut imu = level_imu(RamPage::new());
    imu.sensors_mut().driver_mut().fail_reads = 1;

    assert_eq!(imu.cycle(), Cycle::SensorFault);
    assert_eq!(imu.sensors().driver().reinitialisations, 1);
    assert_eq!(imu.cycle(), Cycle::Skipped);
    assert_eq!(imu.cycle(), Cycle::Estimated);
    assert!(imu.telemetry().health.is_healthy());
}

#[test]
fn test_invalid_sample_is_sensor_fault() {
    let mut imu = level_imu(RamPage::new());
    imu.sensors_mut().driver_mut().sample.gyroscope.y = f32::NAN;

    assert_eq!(imu.cycle(), Cycle::SensorFault);
    assert_eq!(imu.sensors().driver().reinitialisations, 1);
    assert_eq!(imu.ekf().bootstrap_factor(), 1000.0);
}

#[test]
fn test_stale_counter_skips_cycle() {
    let mut imu = level_imu(RamPage::new());
    assert_eq!(imu.cycle(), Cycle::Skipped);

    imu.sensors_mut().driver_mut().step = 0;
    assert_eq!(imu.cycle(), Cycle::Skipped);
    assert_eq!(imu.ekf().bootstrap_factor(), 1000.0);
}

#[test]
fn test_elapsed_time_across_counter_wrap() {
    let mut imu = level_imu(RamPage::new());
    {
        let driver = imu.sensors_mut().driver_mut();
        driver.now = u32::MAX - 1500;
        driver.step = 1000;
    }

    assert_eq!(imu.cycle(), Cycle::Skipped);
    assert_eq!(imu.cycle(), Cycle::Estimated);
    assert_eq!(imu.sensors().driver().now, 499);

    // One 1 ms step at a 2 s time constant
    let bootstrap = imu.ekf().bootstrap_factor();
    assert!((bootstrap - 999.5005).abs() < 1e-2, "{}", bootstrap);
}

#[test]
fn test_calibration_through_control_loop() {
    let mut imu = level_imu(RamPage::new());
    assert_eq!(imu.cycle(), Cycle::Skipped);

    let [accelerometer, magnetometer] = calibrate(&mut imu);
    match accelerometer {
        CalibrationEvent::OffsetSolved { sensor, offset, stored, .. } => {
            assert_eq!(sensor, CalibrationSensor::Accelerometer);
            assert!((offset - accelerometer_zero()).amax() < 0.01);
            assert!(stored);
        }
        other => panic!("unexpected {:?}", other),
    }
    match magnetometer {
        CalibrationEvent::OffsetSolved { sensor, offset, stored, .. } => {
            assert_eq!(sensor, CalibrationSensor::Magnetometer);
            assert!((offset - magnetometer_zero()).amax() < 0.1);
            assert!(stored);
        }
        other => panic!("unexpected {:?}", other),
    }

    let telemetry = imu.telemetry();
    assert_eq!(telemetry.calibration.state, CalibrationState::Idle);
    assert!((telemetry.zero_offsets.accelerometer - accelerometer_zero()).amax() < 0.01);
    assert!(imu.sensors().offsets_enabled());
    assert_eq!(imu.store().storage().write_count(), 2);

    let ranges = imu.settings().calibration.storage;
    assert!(imu.store().contains(Slot::AccelerometerZero));
    assert!(imu.store().load(Slot::MagnetometerZero, ranges.magnetometer).is_some());

    imu.sensors_mut().driver_mut().sample = resting(&UnitQuaternion::identity(), true);
    for _ in 0..500 {
        assert_eq!(imu.cycle(), Cycle::Estimated);
    }
    assert!(imu.telemetry().euler_degrees.amax() < 1.0);
}

#[test]
fn test_failed_write_keeps_previous_parameters() {
    let ranges = ImuSettings::default().calibration.storage;
    let previous = Vector3::new(0.05, 0.05, -0.05);
    let mut store = ParameterStore::new(RamPage::new());
    store
        .store(&previous, Slot::AccelerometerZero, ranges.accelerometer)
        .unwrap();
    let page = *store.page();

    let mut imu = level_imu(RamPage::with_contents(page));
    imu.store_mut().storage_mut().set_write_failure(true);
    assert_eq!(imu.cycle(), Cycle::Skipped);

    for event in calibrate(&mut imu) {
        assert!(matches!(event, CalibrationEvent::OffsetSolved { stored: false, .. }));
    }

    // Session uses the new offsets, storage keeps the old ones
    let offsets = imu.telemetry().zero_offsets;
    assert!((offsets.accelerometer - accelerometer_zero()).amax() < 0.01);
    assert!((offsets.magnetometer - magnetometer_zero()).amax() < 0.1);

    assert_eq!(imu.store().storage().words(), &page);
    assert_eq!(imu.store().page(), &page);
    let loaded = imu
        .store()
        .load(Slot::AccelerometerZero, ranges.accelerometer)
        .unwrap();
    assert!((loaded - previous).amax() < 1e-3);
    assert!(!imu.store().contains(Slot::MagnetometerZero));
}

#[test]
fn test_reset_applies_at_next_cycle() {
    let tilted = UnitQuaternion::from_euler_angles(0.5, -0.3, 1.0);
    let mut imu = level_imu(RamPage::new());
    imu.sensors_mut().driver_mut().sample = resting(&tilted, false);

    assert_eq!(imu.cycle(), Cycle::Skipped);
    for _ in 0..300 {
        imu.cycle();
    }
    assert!(imu.telemetry().euler_degrees.norm() > 10.0);

    imu.sensors_mut().driver_mut().sample = resting(&UnitQuaternion::identity(), false);
    imu.request_reset();
    assert!(imu.telemetry().euler_degrees.norm() > 10.0);

    assert_eq!(imu.cycle(), Cycle::Estimated);
    assert!(imu.telemetry().euler_degrees.norm() < 1e-3);
}

#[test]
fn test_abort_calibration_resumes_estimation() {
    let mut imu = level_imu(RamPage::new());
    assert_eq!(imu.cycle(), Cycle::Skipped);

    imu.start_calibration();
    assert!(!imu.sensors().offsets_enabled());
    assert_eq!(imu.cycle(), Cycle::Calibrating(None));

    imu.abort_calibration();
    assert!(imu.sensors().offsets_enabled());
    assert_eq!(imu.cycle(), Cycle::Estimated);
}
