//! Index arithmetic shared by every interpolation kernel
//!
//! Continuous coordinates are split into an integer index and a fraction with
//! a small tolerance, so that values a hair below an integer land on it.
//! The border functions map an arbitrary integer index into the zero-based
//! range `[0, hi - lo]` of an inclusive extent `[lo, hi]`.

use serde::{Deserialize, Serialize};

use crate::Real;

/// Tolerance added before flooring (2^-17).
pub const FLOOR_TOLERANCE: f64 = 7.62939453125e-06;

/// Policy for indices that fall outside a grid's extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BorderMode {
    /// Repeat the edge sample.
    #[default]
    Clamp,
    /// Periodic continuation (also called wrap).
    Repeat,
    /// Reflect back and forth across the extent.
    Mirror,
}

impl BorderMode {
    /// Map `a` into `[0, hi - lo]` with this policy.
    #[inline]
    pub fn map(self, a: i32, lo: i32, hi: i32) -> usize {
        match self {
            BorderMode::Clamp => clamp(a, lo, hi),
            BorderMode::Repeat => wrap(a, lo, hi),
            BorderMode::Mirror => mirror(a, lo, hi),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BorderMode::Clamp => "Clamp",
            BorderMode::Repeat => "Repeat",
            BorderMode::Mirror => "Mirror",
        }
    }
}

/// Split `x` into `(floor(x), x - floor(x))`.
///
/// The tolerance is applied before flooring; the returned fraction is never
/// negative.
#[inline]
pub fn floor<F: Real>(x: F) -> (i32, F) {
    let y = (x + F::from_f64(FLOOR_TOLERANCE)).floor();
    let f = x - y;
    let f = if f < F::zero() { F::zero() } else { f };
    (y.as_f64() as i32, f)
}

/// Nearest integer, rounding halves up, with the same tolerance bias as [`floor`].
#[inline]
pub fn round<F: Real>(x: F) -> i32 {
    (x.as_f64() + 0.5 + FLOOR_TOLERANCE).floor() as i32
}

/// Round for `f64` values, used by the scalar converters.
#[inline]
pub fn round_f64(x: f64) -> f64 {
    (x + 0.5 + FLOOR_TOLERANCE).floor()
}

/// Clamp `a` into `[lo, hi]` and return the offset from `lo`.
#[inline]
pub fn clamp(a: i32, lo: i32, hi: i32) -> usize {
    let a = a.min(hi) as i64 - lo as i64;
    a.max(0) as usize
}

/// Periodic wrap of `a` into `[lo, hi]`, returned as an offset from `lo`.
#[inline]
pub fn wrap(a: i32, lo: i32, hi: i32) -> usize {
    let range = hi as i64 - lo as i64 + 1;
    let a = (a as i64 - lo as i64) % range;
    (if a < 0 { a + range } else { a }) as usize
}

/// Triangle-wave reflection of `a` into `[lo, hi]`, returned as an offset from `lo`.
///
/// `mirror(lo - 1, lo, hi) == mirror(lo + 1, lo, hi)`: the edge sample is not repeated.
#[inline]
pub fn mirror(a: i32, lo: i32, hi: i32) -> usize {
    let range = hi as i64 - lo as i64;
    // single-sample extents would otherwise divide by zero
    let range2 = 2 * range + (range == 0) as i64;
    let a = (a as i64 - lo as i64).abs() % range2;
    (if a <= range { a } else { range2 - a }) as usize
}
