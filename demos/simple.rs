use imu_ekf::{Cycle, GRAVITY, Imu, ImuSettings, MAGNETIC_REFERENCE, RamPage, RawSample, SensorDriver};
use nalgebra::{UnitQuaternion, Vector3};

const SAMPLE_PERIOD_MICROS: u32 = 10_000; // 10 ms sample period
const YAW_RATE: f32 = 0.2; // rad/s

/// Simulated sensor board turning slowly about the vertical axis
struct SimulatedBoard {
    micros: u32,
}

impl SensorDriver for SimulatedBoard {
    type Error = ();

    fn read(&mut self) -> Result<RawSample, ()> {
        // replace this with the actual bus reads
        self.micros = self.micros.wrapping_add(SAMPLE_PERIOD_MICROS);
        let time = self.micros as f32 * 1e-6;
        let orientation = UnitQuaternion::from_euler_angles(0.0, 0.0, YAW_RATE * time);

        Ok(RawSample {
            accelerometer: orientation.inverse_transform_vector(&Vector3::new(0.0, 0.0, GRAVITY)),
            gyroscope: Vector3::new(0.0, 0.0, YAW_RATE),
            magnetometer: orientation.inverse_transform_vector(&Vector3::from(MAGNETIC_REFERENCE)),
        })
    }

    fn timestamp_micros(&self) -> u32 {
        self.micros
    }

    fn reinitialise(&mut self) -> Result<(), ()> {
        Ok(())
    }
}

fn main() {
    let mut imu = Imu::new(
        SimulatedBoard { micros: 0 },
        RamPage::new(),
        ImuSettings::default(),
    );

    for i in 0..500 {
        // this loop should repeat each time new sensor data is available
        match imu.cycle() {
            Cycle::Estimated => {}
            other => println!("cycle {}: {:?}", i, other),
        }

        if i % 50 == 0 {
            let euler = imu.telemetry().euler_degrees;
            println!(
                "Roll: {:.2}, Pitch: {:.2}, Yaw: {:.2}",
                euler.x, euler.y, euler.z
            );
        }
    }
}
