//! Value conversion, slab compositing and background pixels

use crate::image::{Scalar, ScalarType};

use super::config::SlabMode;

// =============================================================================
// Conversion
// =============================================================================

/// Whether interpolated values must be clamped to the output type.
///
/// Float outputs never clamp. Otherwise clamping is forced for kernels that
/// overshoot and for slab sums, and is required whenever the shifted and
/// scaled input range does not fit the output range.
pub fn needs_clamping(
    input: ScalarType,
    output: ScalarType,
    shift: f64,
    scale: f64,
    force: bool,
) -> bool {
    if output.is_float() {
        return false;
    }
    if force {
        return true;
    }
    let a = (input.min_value() + shift) * scale;
    let b = (input.max_value() + shift) * scale;
    let (lo, hi) = if a > b { (b, a) } else { (a, b) };
    lo < output.min_value() || hi > output.max_value()
}

/// `(v + shift) * scale` in place.
#[inline]
pub fn rescale(values: &mut [f64], shift: f64, scale: f64) {
    for v in values {
        *v = (*v + shift) * scale;
    }
}

/// Store interpolated values, clamping or plainly rounding.
#[inline]
pub fn store<O: Scalar>(src: &[f64], dst: &mut [O], clamp: bool) {
    if clamp {
        for (d, &s) in dst.iter_mut().zip(src) {
            *d = O::from_double_clamp(s);
        }
    } else {
        for (d, &s) in dst.iter_mut().zip(src) {
            *d = O::from_double_round(s);
        }
    }
}

/// Background pixel: the first four components from `color` (clamped to the
/// type), any further components zero.
pub fn background_pixel<O: Scalar>(color: [f64; 4], components: usize) -> Vec<O> {
    (0..components)
        .map(|c| {
            if c < 4 {
                O::from_double_clamp(color[c])
            } else {
                O::default()
            }
        })
        .collect()
}

/// Repeat `pixel` over `dst`.
#[inline]
pub fn fill<O: Scalar>(dst: &mut [O], pixel: &[O]) {
    for px in dst.chunks_exact_mut(pixel.len()) {
        px.copy_from_slice(pixel);
    }
}

// =============================================================================
// Slab compositing
// =============================================================================

/// Combines `n` samples into one value per component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compositor {
    pub mode: SlabMode,
    pub trapezoid: bool,
}

impl Compositor {
    pub fn new(mode: SlabMode, trapezoid: bool) -> Self {
        Self { mode, trapezoid }
    }

    fn trapezoid_applies(&self) -> bool {
        self.trapezoid && matches!(self.mode, SlabMode::Mean | SlabMode::Sum)
    }

    /// Fold sample `i` of `n` (a whole row of values) into `acc`.
    ///
    /// `n` must be at least two; sample 0 initialises `acc` and sample
    /// `n - 1` finalises a mean.
    pub fn accumulate(&self, acc: &mut [f64], sample: &[f64], i: usize, n: usize) {
        let trap = self.trapezoid_applies();
        let last = i + 1 == n;
        if i == 0 {
            let w = if trap { 0.5 } else { 1.0 };
            for (a, &s) in acc.iter_mut().zip(sample) {
                *a = w * s;
            }
            return;
        }
        match self.mode {
            SlabMode::Min => {
                for (a, &s) in acc.iter_mut().zip(sample) {
                    *a = a.min(s);
                }
            }
            SlabMode::Max => {
                for (a, &s) in acc.iter_mut().zip(sample) {
                    *a = a.max(s);
                }
            }
            SlabMode::Sum | SlabMode::Mean => {
                let w = if trap && last { 0.5 } else { 1.0 };
                for (a, &s) in acc.iter_mut().zip(sample) {
                    *a += w * s;
                }
                if last && self.mode == SlabMode::Mean {
                    let f = if trap {
                        1.0 / (n - 1) as f64
                    } else {
                        1.0 / n as f64
                    };
                    for a in acc.iter_mut() {
                        *a *= f;
                    }
                }
            }
        }
    }

    /// Composite `n` consecutive pixels of `components` values, stored in
    /// `samples`, into `samples[..components]`.
    pub fn composite(&self, samples: &mut [f64], components: usize, n: usize) {
        if n < 2 {
            return;
        }
        let (head, tail) = samples.split_at_mut(components);
        if self.trapezoid_applies() {
            for v in head.iter_mut() {
                *v *= 0.5;
            }
        }
        for (i, sample) in tail.chunks_exact(components).take(n - 1).enumerate() {
            self.accumulate(head, sample, i + 1, n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_clamping_decision() {
        // u8 into i16 always fits
        assert!(!needs_clamping(ScalarType::U8, ScalarType::I16, 0.0, 1.0, false));
        // i16 into u8 does not
        assert!(needs_clamping(ScalarType::I16, ScalarType::U8, 0.0, 1.0, false));
        // shift and scale bring u16 into u8 range
        assert!(!needs_clamping(ScalarType::U16, ScalarType::U8, 0.0, 255.0 / 65535.0, false));
        assert!(needs_clamping(ScalarType::U16, ScalarType::U8, 1.0, 255.0 / 65535.0, false));
        // negative scale flips the range
        assert!(needs_clamping(ScalarType::U8, ScalarType::U8, 0.0, -1.0, false));
        assert!(!needs_clamping(ScalarType::U8, ScalarType::I16, 0.0, -1.0, false));
        assert!(needs_clamping(ScalarType::U8, ScalarType::U8, 0.0, 1.0, true));
        assert!(!needs_clamping(ScalarType::F64, ScalarType::F32, 0.0, 1.0, true));
    }

    #[test]
    fn test_store_and_background() {
        let mut out = [0u8; 3];
        store(&[-3.0, 12.4, 300.0], &mut out, true);
        assert_eq!(out, [0, 12, 255]);
        let bg: Vec<i16> = background_pixel([1.0, -40000.0, 2.6, 4.0], 6);
        assert_eq!(bg, vec![1, -32768, 3, 4, 0, 0]);
        let mut row = [0i16; 6];
        fill(&mut row, &bg[..2]);
        assert_eq!(row, [1, -32768, 1, -32768, 1, -32768]);
    }

    #[test]
    fn test_composite_modes() {
        let samples = [1.0, 10.0, 3.0, 30.0, 2.0, 20.0, 6.0, 60.0];
        let run = |mode, trap| {
            let mut s = samples;
            Compositor::new(mode, trap).composite(&mut s, 2, 4);
            [s[0], s[1]]
        };
        assert_eq!(run(SlabMode::Min, false), [1.0, 10.0]);
        assert_eq!(run(SlabMode::Max, true), [6.0, 60.0]);
        assert_relative_eq!(run(SlabMode::Sum, false)[0], 12.0);
        assert_relative_eq!(run(SlabMode::Mean, false)[1], 30.0);
        // 0.5 + 3 + 2 + 3
        assert_relative_eq!(run(SlabMode::Sum, true)[0], 8.5);
        assert_relative_eq!(run(SlabMode::Mean, true)[0], 8.5 / 3.0);
    }

    #[test]
    fn test_row_accumulation_matches_composite() {
        let rows = [[1.0, -2.0], [4.0, 0.5], [2.0, 2.0]];
        for mode in [SlabMode::Min, SlabMode::Max, SlabMode::Mean, SlabMode::Sum] {
            for trap in [false, true] {
                let c = Compositor::new(mode, trap);
                let mut acc = [0.0; 2];
                for (i, row) in rows.iter().enumerate() {
                    c.accumulate(&mut acc, row, i, 3);
                }
                for x in 0..2 {
                    let mut s = [rows[0][x], rows[1][x], rows[2][x]];
                    c.composite(&mut s, 1, 3);
                    assert_relative_eq!(acc[x], s[0], epsilon = 1e-12);
                }
            }
        }
    }
}
