//! Uniform B-spline basis and recursive prefilter
//!
//! - Basis weights of degree `n` (0 to 9) at a fractional offset, with derivatives
//! - Poles of the interpolating prefilter for each degree
//! - In-place prefilter of one line: causal/anticausal recursion for repeat and
//!   mirror, a banded collocation solve for clamp
//! - Optional kernel lookup table (`kernel-table` feature)

use crate::math::{self, BorderMode};
use crate::Real;

/// Highest supported spline degree.
pub const MAX_DEGREE: usize = 9;

/// Largest number of taps of any kernel.
pub const MAX_KERNEL_SIZE: usize = MAX_DEGREE + 1;

/// Kernel half-width in samples for a spline of degree `n`.
#[inline]
pub fn kernel_half_width(degree: usize) -> usize {
    (degree + 2) / 2
}

/// Offset added before flooring so that even degrees center on the nearest sample.
#[inline]
pub fn sample_offset<F: Real>(degree: usize) -> F {
    if (degree + 1) & 1 == 1 {
        F::from_f64(0.5)
    } else {
        F::zero()
    }
}

/// First tap of the kernel relative to `floor(x + sample_offset)`.
#[inline]
pub fn first_tap(degree: usize) -> i32 {
    -((degree >> 1) as i32)
}

/// Basis weights for `degree + 1` consecutive taps.
///
/// `t` is the fraction in `[0, 1)` obtained from `floor(x + sample_offset(degree))`.
/// The weight for tap `j` (0-based, starting at [`first_tap`]) is the centered
/// B-spline evaluated at the distance between `x` and that tap.
pub fn interpolation_weights<F: Real>(weights: &mut [F], t: F, degree: usize) {
    debug_assert!(degree <= MAX_DEGREE && weights.len() > degree);
    weights[0] = F::one();
    for d in 1..=degree {
        basis_step(weights, t, d);
    }
}

/// Basis weights and their derivatives with respect to `x`.
pub fn interpolation_weights_with_derivative<F: Real>(
    weights: &mut [F],
    derivatives: &mut [F],
    t: F,
    degree: usize,
) {
    debug_assert!(degree <= MAX_DEGREE && weights.len() > degree && derivatives.len() > degree);
    if degree == 0 {
        weights[0] = F::one();
        derivatives[0] = F::zero();
        return;
    }
    weights[0] = F::one();
    for d in 1..degree {
        basis_step(weights, t, d);
    }
    // derivative of degree n from the basis of degree n - 1
    for j in 0..=degree {
        let left = if j > 0 { weights[j - 1] } else { F::zero() };
        let right = if j < degree { weights[j] } else { F::zero() };
        derivatives[j] = left - right;
    }
    basis_step(weights, t, degree);
}

// raise `w[0..d]` (degree d - 1) to `w[0..=d]` (degree d)
#[inline]
fn basis_step<F: Real>(w: &mut [F], t: F, d: usize) {
    let df = F::from_f64(d as f64);
    let inv = F::one() / df;
    let mut prev = F::zero();
    for j in 0..=d {
        let cur = if j < d { w[j] } else { F::zero() };
        let jf = F::from_f64(j as f64);
        w[j] = ((t + df - jf) * prev + (jf + F::one() - t) * cur) * inv;
        prev = cur;
    }
}

/// Poles of the interpolating prefilter (all in `(-1, 0)`).
pub fn poles(degree: usize) -> Vec<f64> {
    match degree {
        0 | 1 => Vec::new(),
        2 => vec![8f64.sqrt() - 3.0],
        3 => vec![3f64.sqrt() - 2.0],
        4 => vec![
            (664.0 - 438976f64.sqrt()).sqrt() + 304f64.sqrt() - 19.0,
            (664.0 + 438976f64.sqrt()).sqrt() - 304f64.sqrt() - 19.0,
        ],
        5 => vec![
            (135.0 / 2.0 - (17745.0f64 / 4.0).sqrt()).sqrt() + (105.0f64 / 4.0).sqrt() - 13.0 / 2.0,
            (135.0 / 2.0 + (17745.0f64 / 4.0).sqrt()).sqrt() - (105.0f64 / 4.0).sqrt() - 13.0 / 2.0,
        ],
        6 => vec![
            -0.488_294_589_303_044_755_13,
            -0.081_679_271_076_237_512_597,
            -0.001_414_151_808_325_817_751_0,
        ],
        7 => vec![
            -0.535_280_430_796_438_165_54,
            -0.122_554_615_192_326_690_51,
            -0.009_148_694_809_608_276_928_5,
        ],
        8 => vec![
            -0.574_686_909_248_765_430_53,
            -0.163_035_269_297_280_935_24,
            -0.023_632_294_694_844_850_023,
            -0.000_153_821_310_641_690_911_73,
        ],
        _ => vec![
            -0.607_997_389_168_625_779_00,
            -0.201_750_520_193_153_238_79,
            -0.043_222_608_540_481_752_133,
            -0.002_121_306_903_180_818_420_3,
        ],
    }
}

/// Convert one line of samples into B-spline coefficients, in place.
///
/// `tolerance` bounds the truncation error of the mirror initialisation.
pub fn prefilter_line(line: &mut [f64], degree: usize, border: BorderMode, tolerance: f64) {
    if line.len() < 2 || degree < 2 {
        return;
    }
    match border {
        BorderMode::Clamp => solve_clamped(line, degree),
        BorderMode::Repeat => recursive_filter(line, degree, true, tolerance),
        BorderMode::Mirror => recursive_filter(line, degree, false, tolerance),
    }
}

fn recursive_filter(line: &mut [f64], degree: usize, periodic: bool, tolerance: f64) {
    let n = line.len();
    let poles = poles(degree);

    let gain: f64 = poles.iter().map(|&z| (1.0 - z) * (1.0 - 1.0 / z)).product();
    for v in line.iter_mut() {
        *v *= gain;
    }

    for &z in &poles {
        line[0] = causal_init(line, z, periodic, tolerance);
        for k in 1..n {
            line[k] += z * line[k - 1];
        }
        line[n - 1] = anticausal_init(line, z, periodic);
        for k in (0..n - 1).rev() {
            line[k] = z * (line[k + 1] - line[k]);
        }
    }
}

/// Clamped coefficients: solve the banded collocation system directly.
///
/// Row `i` holds the kernel weights at sample `i` with every tap clamped into
/// the line, so evaluating the result with clamped taps reproduces the
/// samples. The matrix is totally positive and needs no pivoting.
fn solve_clamped(line: &mut [f64], degree: usize) {
    let n = line.len();
    let (_, t) = math::floor(sample_offset::<f64>(degree));
    let mut w = [0.0f64; MAX_KERNEL_SIZE];
    interpolation_weights(&mut w, t, degree);
    let first = first_tap(degree);

    // band[i * width + h + k - i] is the entry at row i, column k
    let h = degree - degree / 2;
    let width = 2 * h + 1;
    let mut band = vec![0.0f64; n * width];
    for i in 0..n {
        for (j, &wj) in w[..=degree].iter().enumerate() {
            let k = math::clamp(i as i32 + first + j as i32, 0, n as i32 - 1);
            band[i * width + h + k - i] += wj;
        }
    }

    for k in 0..n {
        let pivot = band[k * width + h];
        let end = (k + h + 1).min(n);
        for i in k + 1..end {
            let f = band[i * width + h + k - i] / pivot;
            if f == 0.0 {
                continue;
            }
            for col in k..end {
                band[i * width + h + col - i] -= f * band[k * width + h + col - k];
            }
            line[i] -= f * line[k];
        }
    }

    for i in (0..n).rev() {
        let end = (i + h + 1).min(n);
        let mut sum = line[i];
        for col in i + 1..end {
            sum -= band[i * width + h + col - i] * line[col];
        }
        line[i] = sum / band[i * width + h];
    }
}

fn causal_init(c: &[f64], z: f64, periodic: bool, tolerance: f64) -> f64 {
    let n = c.len();
    if periodic {
        let mut zk = z;
        let mut sum = c[0];
        for k in 1..n {
            sum += zk * c[n - k];
            zk *= z;
        }
        // zk == z^n
        return sum / (1.0 - zk);
    }
    let horizon = (tolerance.ln() / z.abs().ln()).ceil();
    if horizon.is_finite() && (horizon as usize) < n {
        let mut zk = z;
        let mut sum = c[0];
        for &v in c.iter().take(horizon as usize).skip(1) {
            sum += zk * v;
            zk *= z;
        }
        sum
    } else {
        let zn = z.powi(n as i32 - 1);
        let iz = 1.0 / z;
        let mut z1 = z;
        let mut z2 = zn * zn * iz;
        let mut sum = c[0] + zn * c[n - 1];
        for &v in c.iter().take(n - 1).skip(1) {
            sum += (z1 + z2) * v;
            z1 *= z;
            z2 *= iz;
        }
        sum / (1.0 - zn * zn)
    }
}

fn anticausal_init(c: &[f64], z: f64, periodic: bool) -> f64 {
    let n = c.len();
    if periodic {
        let mut zk = 1.0;
        let mut sum = 0.0;
        for k in 0..n {
            sum += zk * c[(n - 1 + k) % n];
            zk *= z;
        }
        -z / (1.0 - zk) * sum
    } else {
        (z / (z * z - 1.0)) * (z * c[n - 2] + c[n - 1])
    }
}

// =============================================================================
// Kernel lookup table
// =============================================================================

/// Number of table bins per unit distance.
#[cfg(feature = "kernel-table")]
pub const KERNEL_TABLE_DIVISIONS: usize = 256;

/// Half of the symmetric B-spline kernel sampled at `1 / 256` steps.
///
/// Owned by the interpolator that built it; rebuilt whenever its degree changes.
#[cfg(feature = "kernel-table")]
#[derive(Debug, Clone)]
pub struct KernelTable {
    degree: usize,
    values: Vec<f32>,
}

#[cfg(feature = "kernel-table")]
impl KernelTable {
    pub fn new(degree: usize) -> Self {
        let p = KERNEL_TABLE_DIVISIONS;
        let half = kernel_half_width(degree);
        let size = p * half + 1;
        let values = (0..size)
            .map(|i| centered_bspline(i as f64 / p as f64, degree) as f32)
            .collect();
        Self { degree, values }
    }

    #[inline]
    pub fn degree(&self) -> usize {
        self.degree
    }

    /// Same contract as [`interpolation_weights`], read from the table.
    pub fn weights<F: Real>(&self, weights: &mut [F], t: F) {
        let n = self.degree;
        if n == 0 {
            weights[0] = F::one();
            return;
        }
        let p = KERNEL_TABLE_DIVISIONS as f64;
        // distance from x to the first tap
        let x0 = t.as_f64() - sample_offset::<f64>(n) - first_tap(n) as f64;
        for (j, w) in weights.iter_mut().take(n + 1).enumerate() {
            let d = (x0 - j as f64).abs() * p;
            let i = d as usize;
            let f = d - i as f64;
            let v0 = self.values.get(i).copied().unwrap_or(0.0) as f64;
            let v1 = self.values.get(i + 1).copied().unwrap_or(0.0) as f64;
            *w = F::from_f64((1.0 - f) * v0 + f * v1);
        }
    }
}

/// Centered B-spline of degree `n` evaluated at `x`.
pub fn centered_bspline(x: f64, degree: usize) -> f64 {
    let half = (degree as f64 + 1.0) / 2.0;
    let x = x.abs();
    if x >= half {
        return 0.0;
    }
    // shift into the cardinal frame and reuse the recursive weights
    let q = x + half;
    let s = q.floor();
    let t = q - s;
    let mut w = [0.0f64; MAX_KERNEL_SIZE];
    interpolation_weights(&mut w, t, degree);
    // the taps are s - n .. s, and tap k carries weight w[k - (s - n)] for distance q - k
    let j = degree as i64 - s as i64;
    if j >= 0 && (j as usize) <= degree {
        w[j as usize]
    } else {
        0.0
    }
}
