//! Quaternion Extended Kalman Filter with gyroscope bias estimation

use crate::error::FilterFault;
use crate::math::{QuaternionExt, add_block, add_diagonal, invert_in_place, low_pass, product};
use crate::types::{EkfSettings, FilterHealth, SensorSample};
use nalgebra::{
    ComplexField, Matrix3x4, Matrix4, Matrix4x3, Quaternion, SMatrix, SVector, Vector3, Vector4,
};

/// Number of filter states: quaternion (4), quaternion derivative (4), gyroscope bias (3)
pub const STATE_SIZE: usize = 11;

/// Number of measured scalars: accelerometer (3), gyroscope (3), magnetometer (3)
pub const MEASUREMENT_SIZE: usize = 9;

/// Filter state vector
pub type State = SVector<f32, STATE_SIZE>;

/// State covariance
pub type Covariance = SMatrix<f32, STATE_SIZE, STATE_SIZE>;

/// Stacked accelerometer, gyroscope and magnetometer reading
pub type Measurement = SVector<f32, MEASUREMENT_SIZE>;

type Observation = SMatrix<f32, MEASUREMENT_SIZE, STATE_SIZE>;
type Gain = SMatrix<f32, STATE_SIZE, MEASUREMENT_SIZE>;

const QUATERNION: usize = 0;
const DERIVATIVE: usize = 4;
const BIAS: usize = 8;

/// Attitude estimator
///
/// State layout:
///
/// ```text
/// X = [q0 q1 q2 q3 | dq0 dq1 dq2 dq3 | b0 b1 b2]
/// ```
///
/// `q` is the body-to-earth orientation, `dq` its rate of change and `b` the
/// gyroscope bias in rad/s. Each cycle predicts `X` from the bias-corrected
/// angular rate and corrects it against gravity, the measured rate and the
/// earth magnetic field.
///
/// The quaternion is never normalised explicitly. The transition matrix
/// carries a gain that maps the propagated quaternion back onto the unit
/// sphere every predict step.
pub struct Ekf {
    /// Filter settings
    settings: EkfSettings,
    /// Diagonal of the process noise matrix
    process_noise: SVector<f32, STATE_SIZE>,
    /// Diagonal of the measurement noise matrix
    measurement_noise: SVector<f32, MEASUREMENT_SIZE>,
    state: State,
    covariance: Covariance,
    /// Process noise multiplier, decays toward 1 after initialisation
    bootstrap: f32,
    /// Roll, pitch, yaw in degrees, derived after each predict
    euler: Vector3<f32>,
    health: FilterHealth,
}

impl Ekf {
    /// Create a new filter with default settings
    pub fn new() -> Self {
        Self::with_settings(EkfSettings::default())
    }

    /// Create a new filter with specified settings
    pub fn with_settings(settings: EkfSettings) -> Self {
        let mut ekf = Ekf {
            settings,
            process_noise: SVector::zeros(),
            measurement_noise: SVector::zeros(),
            state: State::zeros(),
            covariance: Covariance::zeros(),
            bootstrap: 0.0,
            euler: Vector3::zeros(),
            health: FilterHealth::default(),
        };

        ekf.process_settings();
        ekf.initialise();
        ekf
    }

    /// Reset to the identity orientation
    ///
    /// Clears derivative, bias and covariance and restores the bootstrap
    /// factor. Health counters are cleared as well.
    pub fn initialise(&mut self) {
        self.state = State::zeros();
        self.state[QUATERNION] = 1.0;
        self.covariance = Covariance::zeros();
        self.bootstrap = self.settings.bootstrap_factor;
        self.euler = Vector3::zeros();
        self.health = FilterHealth::default();
        log_debug!("ekf initialised");
    }

    /// Reset the filter (alias for initialise)
    pub fn reset(&mut self) {
        self.initialise();
    }

    /// Update filter settings; the state is kept
    pub fn set_settings(&mut self, settings: EkfSettings) {
        self.settings = settings;
        self.process_settings();
    }

    /// Get current filter settings
    pub fn settings(&self) -> EkfSettings {
        self.settings
    }

    /// Run one full cycle: predict with the gyroscope, then correct with all sensors
    ///
    /// Updates [`health`](Self::health). A non-finite reading of any sensor
    /// is rejected before anything changes. When the correction faults the
    /// prediction is kept; when the prediction faults nothing changes.
    ///
    /// # Example
    /// ```
    /// use nalgebra::Vector3;
    /// use imu_ekf::{Ekf, SensorSample};
    ///
    /// let mut ekf = Ekf::new();
    /// let sample = SensorSample {
    ///     accelerometer: Vector3::new(0.0, 0.0, 9.81),
    ///     gyroscope: Vector3::zeros(),
    ///     magnetometer: Vector3::new(-20.74, 0.0, 43.23),
    ///     delta_time: 0.01,
    /// };
    ///
    /// ekf.update(&sample).unwrap();
    /// assert!(ekf.euler_degrees().norm() < 1e-3);
    /// ```
    pub fn update(&mut self, sample: &SensorSample) -> Result<(), FilterFault> {
        let measurement = Measurement::from_iterator(
            sample
                .accelerometer
                .iter()
                .chain(sample.gyroscope.iter())
                .chain(sample.magnetometer.iter())
                .copied(),
        );

        if !is_finite(&measurement) {
            return self.record(Err(FilterFault::InvalidMeasurement));
        }

        let result = self
            .predict(&sample.gyroscope, sample.delta_time)
            .and_then(|()| self.correct(&measurement));
        self.record(result)
    }

    /// Propagate state and covariance over `delta_time` seconds
    ///
    /// `X ← A·X`, `P ← A·P·Aᵀ + Q·bootstrap`, then refresh the Euler angles.
    ///
    /// # Errors
    /// - [`FilterFault::InvalidTimeStep`] if `delta_time` is not finite and positive
    /// - [`FilterFault::InvalidMeasurement`] if the gyroscope reading is not finite
    /// - [`FilterFault::NonFinite`] if the result would not be finite
    pub fn predict(&mut self, gyroscope: &Vector3<f32>, delta_time: f32) -> Result<(), FilterFault> {
        if !(delta_time.is_finite() && delta_time > 0.0) {
            return Err(FilterFault::InvalidTimeStep);
        }
        if !gyroscope.iter().all(|v| v.is_finite()) {
            return Err(FilterFault::InvalidMeasurement);
        }

        let mut bootstrap = self.bootstrap;
        low_pass(
            &mut bootstrap,
            1.0,
            self.settings.bootstrap_time_constant,
            delta_time,
        );

        let a = self.transition(gyroscope, delta_time);

        let mut state = State::zeros();
        product(&mut state, &a, false, &self.state, false);

        let mut ap = Covariance::zeros();
        product(&mut ap, &a, false, &self.covariance, false);
        let mut covariance = Covariance::zeros();
        product(&mut covariance, &ap, false, &a, true);
        add_diagonal(&mut covariance, &self.process_noise, bootstrap, 0, 0);

        if !is_finite(&state) || !is_finite(&covariance) {
            return Err(FilterFault::NonFinite);
        }

        self.state = state;
        self.covariance = covariance;
        self.bootstrap = bootstrap;
        self.euler = self.quaternion().to_cardan_degrees();
        Ok(())
    }

    /// Correct the state with a stacked measurement
    ///
    /// Standard EKF update with `H = H(X)`:
    /// `S = H·P·Hᵀ + R`, `K = P·Hᵀ·S⁻¹`, `X ← X + K·(Y − H·X)`, `P ← (I − K·H)·P`.
    ///
    /// # Errors
    /// - [`FilterFault::InvalidMeasurement`] if `measurement` is not finite
    /// - [`FilterFault::SingularInnovation`] if `S` cannot be inverted
    /// - [`FilterFault::NonFinite`] if the result would not be finite
    pub fn correct(&mut self, measurement: &Measurement) -> Result<(), FilterFault> {
        if !is_finite(measurement) {
            return Err(FilterFault::InvalidMeasurement);
        }

        let h = self.observation();

        let mut hp = Observation::zeros();
        product(&mut hp, &h, false, &self.covariance, false);
        let mut innovation_covariance = SMatrix::<f32, MEASUREMENT_SIZE, MEASUREMENT_SIZE>::zeros();
        product(&mut innovation_covariance, &hp, false, &h, true);
        add_diagonal(&mut innovation_covariance, &self.measurement_noise, 1.0, 0, 0);
        invert_in_place(&mut innovation_covariance).map_err(|_| FilterFault::SingularInnovation)?;

        let mut pht = Gain::zeros();
        product(&mut pht, &self.covariance, false, &h, true);
        let mut gain = Gain::zeros();
        product(&mut gain, &pht, false, &innovation_covariance, false);

        let mut predicted = Measurement::zeros();
        product(&mut predicted, &h, false, &self.state, false);
        let innovation = measurement - predicted;

        let mut correction = State::zeros();
        product(&mut correction, &gain, false, &innovation, false);
        let state = self.state + correction;

        let mut kh = Covariance::zeros();
        product(&mut kh, &gain, false, &h, false);
        let mut contraction = Covariance::identity();
        add_block(&mut contraction, 1.0, &kh, -1.0, 0, 0);
        let mut covariance = Covariance::zeros();
        product(&mut covariance, &contraction, false, &self.covariance, false);

        if !is_finite(&state) || !is_finite(&covariance) {
            return Err(FilterFault::NonFinite);
        }

        self.state = state;
        self.covariance = covariance;
        Ok(())
    }

    /// Orientation quaternion (body to earth) as held in the state
    pub fn quaternion(&self) -> Quaternion<f32> {
        let q = self.quaternion_vector();
        Quaternion::new(q[0], q[1], q[2], q[3])
    }

    /// Quaternion derivative states
    pub fn quaternion_derivative(&self) -> Vector4<f32> {
        self.state.fixed_rows::<4>(DERIVATIVE).into_owned()
    }

    /// Estimated gyroscope bias in rad/s
    pub fn gyroscope_bias(&self) -> Vector3<f32> {
        self.state.fixed_rows::<3>(BIAS).into_owned()
    }

    /// Roll, pitch and yaw in degrees as of the last predict
    pub fn euler_degrees(&self) -> Vector3<f32> {
        self.euler
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn covariance(&self) -> &Covariance {
        &self.covariance
    }

    /// Current process noise multiplier
    pub fn bootstrap_factor(&self) -> f32 {
        self.bootstrap
    }

    pub fn health(&self) -> FilterHealth {
        self.health
    }

    /// Gravity as the accelerometer should currently measure it
    pub fn predicted_gravity(&self) -> Vector3<f32> {
        let (_, _, tz) = projections(&self.quaternion_vector());
        tz * self.quaternion_vector() * self.settings.gravity
    }

    /// Earth magnetic field as the magnetometer should currently measure it
    pub fn predicted_magnetic(&self) -> Vector3<f32> {
        self.magnetic_projection() * self.quaternion_vector()
    }

    /// Rebuild the noise diagonals from the settings
    fn process_settings(&mut self) {
        let s = &self.settings;
        self.process_noise = SVector::from_fn(|i, _| match i {
            QUATERNION..DERIVATIVE => s.quaternion_noise,
            DERIVATIVE..BIAS => s.derivative_noise,
            _ => s.bias_noise,
        });
        self.measurement_noise = SVector::from_fn(|i, _| match i / 3 {
            0 => s.accelerometer_noise,
            1 => s.gyroscope_noise,
            _ => s.magnetometer_noise,
        });
    }

    fn record(&mut self, result: Result<(), FilterFault>) -> Result<(), FilterFault> {
        match result {
            Ok(()) => self.health.consecutive_faults = 0,
            Err(fault) => {
                self.health.last_fault = Some(fault);
                self.health.consecutive_faults = self.health.consecutive_faults.saturating_add(1);
                log_warn!("ekf fault: {}", fault);
            }
        }
        result
    }

    fn quaternion_vector(&self) -> Vector4<f32> {
        self.state.fixed_rows::<4>(QUATERNION).into_owned()
    }

    /// Transition matrix `A` for one predict step
    ///
    /// ```text
    ///       | g·I + (g·dt/2)·Ω   0   −(g·dt/2)·Ξ |
    /// A  =  | (g/2)·Ω            0   −(g/2)·Ξ    |
    ///       | 0                  0   I           |
    /// ```
    ///
    /// with `Ω` the quaternion rate matrix of the measured rate and `Ξ(q)`
    /// its counterpart with `Ω(w)·q = Ξ(q)·w`, so `A·X` integrates the
    /// bias-corrected rate `ω = gyro − b` and the bias columns couple the
    /// attitude to `b` in the covariance.
    /// `g = 1 / sqrt(‖q‖² · (1 + (dt/2)²·‖ω‖²))`. Because `Ξ(q)·ω ⟂ q`,
    /// `‖q + (dt/2)·Ξ(q)·ω‖² = ‖q‖²·(1 + (dt/2)²·‖ω‖²)` and `g` maps the
    /// propagated quaternion exactly onto the unit sphere.
    fn transition(&self, gyroscope: &Vector3<f32>, delta_time: f32) -> Covariance {
        let q = self.quaternion_vector();
        let rate = gyroscope - self.gyroscope_bias();
        let half_dt = delta_time * 0.5;
        let norm_squared = q.norm_squared() * (1.0 + half_dt * half_dt * rate.norm_squared());
        let g = 1.0 / norm_squared.sqrt();

        let omega = rate_matrix(gyroscope);
        let coupling = bias_coupling(&q);
        let mut a = Covariance::zeros();
        add_block(&mut a, 0.0, &Matrix4::identity(), g, QUATERNION, QUATERNION);
        add_block(&mut a, 1.0, &omega, g * half_dt, QUATERNION, QUATERNION);
        add_block(&mut a, 0.0, &coupling, -g * half_dt, QUATERNION, BIAS);
        add_block(&mut a, 0.0, &omega, g * 0.5, DERIVATIVE, QUATERNION);
        add_block(&mut a, 0.0, &coupling, -g * 0.5, DERIVATIVE, BIAS);
        add_diagonal(&mut a, &Vector3::repeat(1.0), 1.0, BIAS, BIAS);
        a
    }

    /// Observation matrix `H(X)`
    ///
    /// Gravity and magnetic rows project the quaternion through the rows of
    /// its rotation matrix (`Tz·q` is the earth Z axis seen in the body frame).
    /// Gyroscope rows are `2·Tω·dq + b`.
    fn observation(&self) -> Observation {
        let q = self.quaternion_vector();
        let (_, _, tz) = projections(&q);
        let tw = rate_projection(&q);

        let mut h = Observation::zeros();
        add_block(&mut h, 0.0, &tz, self.settings.gravity, 0, QUATERNION);
        add_block(&mut h, 0.0, &tw, 2.0, 3, DERIVATIVE);
        add_diagonal(&mut h, &Vector3::repeat(1.0), 1.0, 3, BIAS);
        add_block(&mut h, 0.0, &self.magnetic_projection(), 1.0, 6, QUATERNION);
        h
    }

    /// `mx·Tx + my·Ty + mz·Tz` for the magnetic reference `m`
    fn magnetic_projection(&self) -> Matrix3x4<f32> {
        let (tx, ty, tz) = projections(&self.quaternion_vector());
        let m = &self.settings.magnetic_reference;
        tx * m.x + ty * m.y + tz * m.z
    }
}

impl Default for Ekf {
    fn default() -> Self {
        Self::new()
    }
}

fn is_finite<const R: usize, const C: usize>(m: &SMatrix<f32, R, C>) -> bool {
    m.iter().all(|v| v.is_finite())
}

/// Quaternion rate matrix: `dq/dt = ½·Ω(ω)·q`
fn rate_matrix(w: &Vector3<f32>) -> Matrix4<f32> {
    Matrix4::new(
        0.0, -w.x, -w.y, -w.z, //
        w.x, 0.0, w.z, -w.y, //
        w.y, -w.z, 0.0, w.x, //
        w.z, w.y, -w.x, 0.0,
    )
}

/// `Ξ(q)` with `Ω(w)·q = Ξ(q)·w`
fn bias_coupling(q: &Vector4<f32>) -> Matrix4x3<f32> {
    let (q0, q1, q2, q3) = (q[0], q[1], q[2], q[3]);
    Matrix4x3::new(
        -q1, -q2, -q3, //
        q0, -q3, q2, //
        q3, q0, -q1, //
        -q2, q1, q0,
    )
}

/// Matrices `Tx`, `Ty`, `Tz` with `Tk(q)·q = Rᵀ·e_k`
fn projections(q: &Vector4<f32>) -> (Matrix3x4<f32>, Matrix3x4<f32>, Matrix3x4<f32>) {
    let (q0, q1, q2, q3) = (q[0], q[1], q[2], q[3]);
    let tx = Matrix3x4::new(
        q0, q1, -q2, -q3, //
        -q3, q2, q1, -q0, //
        q2, q3, q0, q1,
    );
    let ty = Matrix3x4::new(
        q3, q2, q1, q0, //
        q0, -q1, q2, -q3, //
        -q1, -q0, q3, q2,
    );
    let tz = Matrix3x4::new(
        -q2, q3, -q0, q1, //
        q1, q0, q3, q2, //
        q0, -q1, -q2, q3,
    );
    (tx, ty, tz)
}

/// Matrix `Tω` with `2·Tω(q)·dq` the body angular rate for a unit `q`
fn rate_projection(q: &Vector4<f32>) -> Matrix3x4<f32> {
    let (q0, q1, q2, q3) = (q[0], q[1], q[2], q[3]);
    Matrix3x4::new(
        -q1, q0, q3, -q2, //
        -q2, -q3, q0, q1, //
        -q3, q2, -q1, q0,
    )
}
