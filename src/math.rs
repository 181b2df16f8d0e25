//! Vector and matrix toolkit for the IMU estimator
//!
//! Fixed-size linear algebra on nalgebra's stack-allocated matrices. Every
//! shape is a const generic; where two shapes have to agree (inner dimension
//! of a product, a block that must fit its target) the caller guarantees it
//! and only debug builds check.

use crate::error::SingularMatrix;
use nalgebra::{ComplexField, Quaternion, RealField, SMatrix, SVector, Vector3};

/// Mathematical constants
pub const DEG_TO_RAD: f32 = core::f32::consts::PI / 180.0;
pub const RAD_TO_DEG: f32 = 180.0 / core::f32::consts::PI;

/// Add a scaled block into a larger matrix
///
/// Over the region covered by `b` placed at (`row`, `col`):
/// `a[row + i, col + j] = fa * a[row + i, col + j] + fb * b[i, j]`.
/// Entries of `a` outside the block are untouched.
///
/// # Example
/// ```
/// use nalgebra::{Matrix2, Matrix4};
/// use imu_ekf::math::add_block;
///
/// let mut a = Matrix4::<f32>::identity();
/// add_block(&mut a, 0.0, &Matrix2::repeat(1.0), 3.0, 2, 2);
/// assert_eq!(a[(2, 3)], 3.0);
/// assert_eq!(a[(0, 0)], 1.0);
/// ```
pub fn add_block<const R: usize, const C: usize, const BR: usize, const BC: usize>(
    a: &mut SMatrix<f32, R, C>,
    fa: f32,
    b: &SMatrix<f32, BR, BC>,
    fb: f32,
    row: usize,
    col: usize,
) {
    debug_assert!(row + BR <= R && col + BC <= C, "block does not fit");
    for i in 0..BR {
        for j in 0..BC {
            let target = &mut a[(row + i, col + j)];
            *target = *target * fa + b[(i, j)] * fb;
        }
    }
}

/// Add a scaled diagonal starting at (`row`, `col`)
///
/// `a[row + i, col + i] += fd * d[i]` for every element of `d`.
pub fn add_diagonal<const R: usize, const C: usize, const N: usize>(
    a: &mut SMatrix<f32, R, C>,
    d: &SVector<f32, N>,
    fd: f32,
    row: usize,
    col: usize,
) {
    debug_assert!(row + N <= R && col + N <= C, "diagonal does not fit");
    for i in 0..N {
        a[(row + i, col + i)] += d[i] * fd;
    }
}

/// Matrix product with optional transposition of either operand
///
/// Computes `c = op(a) * op(b)` where `op` transposes when the matching flag
/// is set. Transposition is an index remapping, no transposed copy is built.
/// The inner dimensions of `op(a)` and `op(b)` must agree and the result
/// must have the shape of `c`.
///
/// # Example
/// ```
/// use nalgebra::{Matrix2x3, Matrix2};
/// use imu_ekf::math::product;
///
/// let a = Matrix2x3::new(1.0, 2.0, 3.0, 4.0, 5.0, 6.0);
/// let mut c = Matrix2::<f32>::zeros();
/// product(&mut c, &a, false, &a, true); // a * aᵀ
/// assert_eq!(c, a * a.transpose());
/// ```
pub fn product<
    const M: usize,
    const P: usize,
    const AR: usize,
    const AC: usize,
    const BR: usize,
    const BC: usize,
>(
    c: &mut SMatrix<f32, M, P>,
    a: &SMatrix<f32, AR, AC>,
    transpose_a: bool,
    b: &SMatrix<f32, BR, BC>,
    transpose_b: bool,
) {
    let (a_rows, inner) = if transpose_a { (AC, AR) } else { (AR, AC) };
    let (b_inner, b_cols) = if transpose_b { (BC, BR) } else { (BR, BC) };
    debug_assert!(a_rows == M && b_cols == P, "result shape mismatch");
    debug_assert!(inner == b_inner, "inner dimension mismatch");

    for i in 0..M {
        for j in 0..P {
            let mut sum = 0.0;
            for k in 0..inner {
                let a_ik = if transpose_a { a[(k, i)] } else { a[(i, k)] };
                let b_kj = if transpose_b { b[(j, k)] } else { b[(k, j)] };
                sum += a_ik * b_kj;
            }
            c[(i, j)] = sum;
        }
    }
}

/// Invert a square matrix in place (Gauss-Jordan, partial pivoting)
///
/// The pivot of each column is its largest-magnitude entry on or below the
/// diagonal. Row swaps are recorded and undone as column swaps once the
/// elimination is finished.
///
/// # Errors
/// Returns [`SingularMatrix`] when a pivot is exactly zero or not finite.
/// The contents of `a` are then unspecified and must be discarded.
///
/// # Example
/// ```
/// use nalgebra::Matrix2;
/// use imu_ekf::math::invert_in_place;
///
/// let mut a = Matrix2::new(0.0f32, 2.0, 4.0, 0.0);
/// invert_in_place(&mut a).unwrap();
/// assert_eq!(a, Matrix2::new(0.0, 0.25, 0.5, 0.0));
///
/// let mut singular = Matrix2::new(1.0f32, 2.0, 0.0, 0.0);
/// assert!(invert_in_place(&mut singular).is_err());
/// ```
pub fn invert_in_place<const N: usize>(a: &mut SMatrix<f32, N, N>) -> Result<(), SingularMatrix> {
    let mut pivot_rows = [0usize; N];

    for k in 0..N {
        let mut pivot_row = k;
        let mut largest = 0.0;
        for i in k..N {
            let magnitude = a[(i, k)].abs();
            if magnitude > largest {
                largest = magnitude;
                pivot_row = i;
            }
        }

        let pivot = a[(pivot_row, k)];
        if pivot == 0.0 || !pivot.is_finite() {
            return Err(SingularMatrix);
        }

        if pivot_row != k {
            a.swap_rows(k, pivot_row);
        }
        pivot_rows[k] = pivot_row;

        let scale = 1.0 / a[(k, k)];
        a[(k, k)] = 1.0;
        for j in 0..N {
            a[(k, j)] *= scale;
        }

        for i in 0..N {
            if i != k {
                let factor = a[(i, k)];
                a[(i, k)] = 0.0;
                for j in 0..N {
                    a[(i, j)] -= a[(k, j)] * factor;
                }
            }
        }
    }

    for k in (0..N).rev() {
        if pivot_rows[k] != k {
            a.swap_columns(k, pivot_rows[k]);
        }
    }

    Ok(())
}

/// Second-order-accurate cosine for small angles: `1 - x²/2 + x⁴/24`
pub fn small_angle_cos(x: f32) -> f32 {
    let x2 = x * x;
    1.0 - x2 / 2.0 + x2 * x2 / 24.0
}

/// First-order low-pass filter step
///
/// Moves `value` toward `target` by `dt / time_constant` (clamped to [0, 1]).
/// A zero time constant jumps straight to the target.
pub fn low_pass(value: &mut f32, target: f32, time_constant: f32, delta_time: f32) {
    if time_constant == 0.0 {
        *value = target;
    } else {
        let factor = (delta_time / time_constant).clamp(0.0, 1.0);
        *value = target * factor + *value * (1.0 - factor);
    }
}

/// Map `value` in [-range, range] onto `bits`-wide unsigned levels
///
/// Both ends of the interval are representable. Out-of-range values saturate.
pub fn quantize(value: f32, range: f32, bits: u8) -> u16 {
    debug_assert!((1..=16).contains(&bits));
    let levels = ((1u32 << bits) - 1) as f32;
    let clamped = value.max(-range).min(range);
    let scaled = (clamped + range) / (2.0 * range) * levels;
    (scaled + 0.5) as u16
}

/// Inverse of [`quantize`]; exact to within `range / (2^bits - 1)`
pub fn dequantize(word: u16, range: f32, bits: u8) -> f32 {
    debug_assert!((1..=16).contains(&bits));
    let levels = ((1u32 << bits) - 1) as f32;
    word as f32 / levels * 2.0 * range - range
}

/// Direction helpers used by the pose gate
pub trait Vector3Ext {
    /// Rotate about a unit `axis` by the angle whose cosine and sine are given (Rodrigues)
    fn rotate_about(&self, axis: &Vector3<f32>, cos: f32, sin: f32) -> Vector3<f32>;

    /// Angle to `other` in degrees; 180 when either vector is zero
    fn deviation_degrees(&self, other: &Vector3<f32>) -> f32;
}

impl Vector3Ext for Vector3<f32> {
    fn rotate_about(&self, axis: &Vector3<f32>, cos: f32, sin: f32) -> Vector3<f32> {
        self * cos + axis * ((1.0 - cos) * axis.dot(self)) + axis.cross(self) * sin
    }

    fn deviation_degrees(&self, other: &Vector3<f32>) -> f32 {
        let denominator = self.norm() * other.norm();
        if denominator > 0.0 {
            (self.dot(other) / denominator).clamp(-1.0, 1.0).acos() * RAD_TO_DEG
        } else {
            180.0
        }
    }
}

/// Extension trait for Quaternion operations
pub trait QuaternionExt {
    /// Cardan angles (roll, pitch, yaw) in radians, Z-Y-X sequence
    fn to_cardan(&self) -> Vector3<f32>;

    /// Cardan angles (roll, pitch, yaw) in degrees
    fn to_cardan_degrees(&self) -> Vector3<f32>;
}

impl QuaternionExt for Quaternion<f32> {
    fn to_cardan(&self) -> Vector3<f32> {
        let (q0, q1, q2, q3) = (self.w, self.i, self.j, self.k);
        let roll = (2.0 * (q0 * q1 + q2 * q3)).atan2(1.0 - 2.0 * (q1 * q1 + q2 * q2));
        let pitch = (2.0 * (q0 * q2 - q1 * q3)).clamp(-1.0, 1.0).asin();
        let yaw = (2.0 * (q1 * q2 + q0 * q3)).atan2(1.0 - 2.0 * (q2 * q2 + q3 * q3));
        Vector3::new(roll, pitch, yaw)
    }

    fn to_cardan_degrees(&self) -> Vector3<f32> {
        self.to_cardan() * RAD_TO_DEG
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Matrix3, UnitQuaternion};

    #[test]
    fn test_product_transpositions() {
        let a = Matrix3::new(1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 10.0);
        let b = Matrix3::new(2.0, 0.0, 1.0, -1.0, 3.0, 0.5, 0.0, 1.0, 4.0);
        let mut c = Matrix3::zeros();

        product(&mut c, &a, false, &b, false);
        assert_eq!(c, a * b);
        product(&mut c, &a, true, &b, false);
        assert_eq!(c, a.transpose() * b);
        product(&mut c, &a, false, &b, true);
        assert_eq!(c, a * b.transpose());
        product(&mut c, &a, true, &b, true);
        assert_eq!(c, a.transpose() * b.transpose());
    }

    #[test]
    fn test_inversion_with_pivoting() {
        // Zero on the first diagonal entry forces a row swap
        let original = Matrix3::new(0.0, 1.0, 2.0, 1.0, 0.0, 3.0, 4.0, -3.0, 8.0);
        let mut inverse = original;
        invert_in_place(&mut inverse).unwrap();

        let identity = original * inverse;
        assert!((identity - Matrix3::identity()).abs().max() < 1e-5);
    }

    #[test]
    fn test_inversion_detects_zero_row() {
        let mut a = Matrix3::new(1.0, 2.0, 3.0, 0.0, 0.0, 0.0, 4.0, 5.0, 6.0);
        assert_eq!(invert_in_place(&mut a), Err(SingularMatrix));
    }

    #[test]
    fn test_inversion_detects_non_finite() {
        let mut a = Matrix3::identity() * f32::NAN;
        assert!(invert_in_place(&mut a).is_err());
    }

    #[test]
    fn test_add_block_and_diagonal() {
        let mut a = SMatrix::<f32, 4, 5>::repeat(1.0);
        add_block(&mut a, 2.0, &Matrix3::identity(), 5.0, 1, 2);
        assert_eq!(a[(1, 2)], 7.0);
        assert_eq!(a[(1, 3)], 2.0);
        assert_eq!(a[(0, 0)], 1.0);

        add_diagonal(&mut a, &Vector3::new(1.0, 2.0, 3.0), 0.5, 0, 0);
        assert_eq!(a[(0, 0)], 1.5);
        assert_eq!(a[(2, 2)], 2.5);
        assert_eq!(a[(2, 3)], 7.0 + 1.5);
    }

    #[test]
    fn test_rotate_about_quarter_turn() {
        let v = Vector3::new(1.0f32, 0.0, 0.0);
        let rotated = v.rotate_about(&Vector3::z(), 0.0, 1.0);
        assert!((rotated - Vector3::new(0.0, 1.0, 0.0)).norm() < 1e-6);

        let up = Vector3::new(0.0f32, 0.0, 1.0);
        let half = core::f32::consts::FRAC_1_SQRT_2;
        let tilted = up.rotate_about(&Vector3::x(), half, half);
        assert!((tilted - Vector3::new(0.0, -half, half)).norm() < 1e-6);
    }

    #[test]
    fn test_deviation_degrees() {
        let a = Vector3::new(0.0f32, 0.0, 9.81);
        let b = Vector3::new(1.0f32, 0.0, 1.0);
        assert!((a.deviation_degrees(&b) - 45.0).abs() < 1e-4);
        assert_eq!(a.deviation_degrees(&Vector3::zeros()), 180.0);
    }

    #[test]
    fn test_small_angle_cos() {
        let angle = 10.0 * DEG_TO_RAD;
        assert!((small_angle_cos(angle) - angle.cos()).abs() < 1e-5);
        assert_eq!(small_angle_cos(0.0), 1.0);
    }

    #[test]
    fn test_low_pass() {
        let mut value = 1000.0;
        low_pass(&mut value, 1.0, 2.0, 0.5);
        assert!((value - (1.0 * 0.25 + 1000.0 * 0.75)).abs() < 1e-3);

        low_pass(&mut value, 1.0, 2.0, 10.0); // factor clamps to 1
        assert_eq!(value, 1.0);

        let mut jump = 5.0;
        low_pass(&mut jump, 2.0, 0.0, 0.01);
        assert_eq!(jump, 2.0);
    }

    #[test]
    fn test_quantize_endpoints() {
        assert_eq!(quantize(-10.0, 10.0, 16), 0);
        assert_eq!(quantize(10.0, 10.0, 16), u16::MAX);
        assert_eq!(quantize(25.0, 10.0, 16), u16::MAX);
        assert_eq!(dequantize(0, 10.0, 16), -10.0);
        assert!((dequantize(u16::MAX, 10.0, 16) - 10.0).abs() < 1e-5);
    }

    #[test]
    fn test_quaternion_cardan_conversion() {
        let (roll, pitch, yaw) = (30.0 * DEG_TO_RAD, -20.0 * DEG_TO_RAD, 45.0 * DEG_TO_RAD);
        let quat = UnitQuaternion::from_euler_angles(roll, pitch, yaw);
        let recovered = quat.quaternion().to_cardan_degrees();

        assert!((recovered - Vector3::new(30.0, -20.0, 45.0)).norm() < 1e-4);
    }
}
