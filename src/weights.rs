//! Precomputed per-axis interpolation tables
//!
//! When the sampling lattice is related to the input grid by a permutation,
//! scale and translation, every output row shares the same per-axis tap
//! positions and weights. [`InterpolationWeights`] stores those tables for one
//! output sub-extent. It is created by
//! [`BoundInterpolator::precompute_weights`](crate::interpolator::BoundInterpolator::precompute_weights)
//! and released by dropping it.

use crate::image::Extent;
use crate::Real;

/// Per-axis `(position, weight)` tables covering an output extent.
///
/// For output axis `j` and output index `i`, the taps are stored at
/// `[(i - weight_extent.min(j)) * kernel_size[j] ..][.. kernel_size[j]]`.
/// Positions are element offsets into the input slice (already multiplied by
/// the input increment of the mapped axis). Nearest-neighbour tables carry no
/// weights.
#[derive(Debug, Clone)]
pub struct InterpolationWeights<F> {
    pub positions: [Vec<isize>; 3],
    pub weights: [Vec<F>; 3],
    pub kernel_size: [usize; 3],
    pub weight_extent: Extent,
}

impl<F: Real> InterpolationWeights<F> {
    pub(crate) fn with_capacity(extent: Extent, kernel_size: [usize; 3], nearest: bool) -> Self {
        let alloc = |axis: usize| extent.len(axis) * kernel_size[axis];
        Self {
            positions: [
                vec![0; alloc(0)],
                vec![0; alloc(1)],
                vec![0; alloc(2)],
            ],
            weights: if nearest {
                [Vec::new(), Vec::new(), Vec::new()]
            } else {
                [
                    vec![F::zero(); alloc(0)],
                    vec![F::zero(); alloc(1)],
                    vec![F::zero(); alloc(2)],
                ]
            },
            kernel_size,
            weight_extent: extent,
        }
    }

    /// Start of the taps for output index `index` along `axis`.
    #[inline]
    pub fn start(&self, axis: usize, index: i32) -> usize {
        (index - self.weight_extent.min(axis)) as usize * self.kernel_size[axis]
    }

    /// Tap positions for output index `index` along `axis`.
    #[inline]
    pub fn taps(&self, axis: usize, index: i32) -> &[isize] {
        let s = self.start(axis, index);
        &self.positions[axis][s..s + self.kernel_size[axis]]
    }

    /// Tap weights for output index `index` along `axis` (empty for nearest).
    #[inline]
    pub fn tap_weights(&self, axis: usize, index: i32) -> &[F] {
        if self.weights[axis].is_empty() {
            return &[];
        }
        let s = self.start(axis, index);
        &self.weights[axis][s..s + self.kernel_size[axis]]
    }

    pub fn has_weights(&self) -> bool {
        !self.weights[0].is_empty()
    }
}
