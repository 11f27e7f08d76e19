//! Permutation reslice loop
//!
//! When the index matrix only permutes, scales and translates axes, every
//! output axis reads from a single input axis and the kernel taps can be
//! tabulated once per axis. Rows are then produced from the tables with no
//! per-voxel coordinate arithmetic.

use crate::image::{Extent, ImageData, Scalar};
use crate::interpolator::Kernel;

use super::convert::fill;
use super::{for_each_row, Pass};

pub(super) fn execute<T: Scalar, O: Scalar>(
    pass: &Pass<'_, T>,
    background: &[O],
    output: &mut ImageData<O>,
    runs: &mut [Vec<(i32, i32)>],
) {
    let nc = pass.components;
    let n = pass.slab_samples;
    let out_ext = pass.out_ext;

    // slab samples become extra output slices, centred on each slice
    let mut matrix = pass.matrix;
    let mut sample_ext = out_ext;
    if n > 1 {
        let half = 0.5 * (n - 1) as f64;
        for i in 0..3 {
            matrix.m[i][3] -= half * matrix.m[i][2];
        }
        sample_ext.0[5] += n as i32 - 1;
    }

    let (weights, clip) = pass.bound.precompute_weights::<f64>(&matrix, sample_ext);
    let iter = (!clip.is_empty()).then(|| {
        Extent::new(
            clip.min(0),
            clip.max(0),
            clip.min(1),
            clip.max(1),
            (clip.min(2) - (n as i32 - 1)).max(out_ext.min(2)),
            clip.max(2).min(out_ext.max(2)),
        )
    });
    let copy = pass.kernel == Kernel::Nearest && pass.same_type && !pass.rescale && n == 1;
    tracing::trace!(copy, ?clip, "permute reslice");

    let width = out_ext.len(0);
    let slab_len = if n > 1 { width * nc } else { 0 };
    for_each_row(output, runs, (width * nc, slab_len), |scratch, y, z, row, row_runs| {
        let Some(it) = iter.filter(|it| it.contains([it.min(0), y, z])) else {
            fill(row, background);
            pass.counter.row_done();
            return;
        };
        fill(pass.range(row, out_ext.min(0), it.min(0) - 1), background);
        fill(pass.range(row, it.max(0) + 1, out_ext.max(0)), background);

        // samples of this slab that map inside the input
        let lower = (clip.min(2) - z).max(0);
        let upper = (z + n as i32 - 1 - clip.max(2)).max(0);
        let count = (n as i32 - lower - upper) as usize;

        for (s0, s1, inside) in pass.spans(y, z, it.min(0), it.max(0)) {
            let dst = pass.range(row, s0, s1);
            if !inside {
                fill(dst, background);
                continue;
            }
            if copy {
                pass.bound.copy_row(&weights, [s0, y, z], dst);
            } else {
                let len = dst.len();
                let values = &mut scratch.values[..len];
                if count > 1 {
                    let sample = &mut scratch.slab[..len];
                    for i in 0..count {
                        let zi = z + lower + i as i32;
                        pass.bound.interpolate_row(&weights, [s0, y, zi], sample);
                        pass.compositor.accumulate(values, sample, i, count);
                    }
                } else {
                    pass.bound.interpolate_row(&weights, [s0, y, z + lower], values);
                }
                pass.write(values, dst);
            }
            if pass.generate_stencil {
                row_runs.push((s0, s1));
            }
        }
        pass.counter.row_done();
    });
}
