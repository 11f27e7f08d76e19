//! Generic reslice loop
//!
//! Each output voxel is mapped on its own: index matrix (with perspective
//! divide), then the nonlinear transform if there is one. Consecutive voxels
//! that all land inside or all outside the input are converted or filled as a
//! single run.

use crate::image::{ImageData, Scalar};
use crate::interpolator::Kernel;
use crate::math::{self, BorderMode};

use super::convert::fill;
use super::{for_each_row, Pass, Scratch};

pub(super) fn execute<T: Scalar, O: Scalar>(
    pass: &Pass<'_, T>,
    background: &[O],
    output: &mut ImageData<O>,
    runs: &mut [Vec<(i32, i32)>],
) {
    let nc = pass.components;
    let width = pass.out_ext.len(0);
    let optimize_nearest = pass.optimization
        && pass.kernel == Kernel::Nearest
        && pass.bound.border_mode() == BorderMode::Clamp
        && pass.transform.is_none()
        && !pass.matrix.has_perspective()
        && !pass.rescale
        && pass.same_type
        && pass.border
        && pass.slab_samples <= 1;
    tracing::trace!(optimize_nearest, "generic reslice");

    let m = &pass.matrix.m;
    for_each_row(
        output,
        runs,
        (width * nc, pass.slab_samples * nc),
        |scratch, y, z, row, row_runs| {
            let base: [f64; 4] =
                std::array::from_fn(|i| m[i][3] + z as f64 * m[i][2] + y as f64 * m[i][1]);
            let (x0, x1) = (pass.out_ext.min(0), pass.out_ext.max(0));
            for (s0, s1, inside) in pass.spans(y, z, x0, x1) {
                let dst = pass.range(row, s0, s1);
                if !inside {
                    fill(dst, background);
                } else if optimize_nearest {
                    nearest_run(pass, &base, s0, s1, dst, background, row_runs);
                } else {
                    sample_run(pass, scratch, &base, s0, s1, dst, background, row_runs);
                }
            }
            pass.counter.row_done();
        },
    );
}

/// Straight copy of the nearest input voxel; indices are clamped by the
/// extent test rather than by the border mode.
fn nearest_run<T: Scalar, O: Scalar>(
    pass: &Pass<'_, T>,
    base: &[f64; 4],
    s0: i32,
    s1: i32,
    dst: &mut [O],
    background: &[O],
    runs: &mut Vec<(i32, i32)>,
) {
    let nc = pass.components;
    let m = &pass.matrix.m;
    let mut first = None;
    let mut last = s0 - 1;
    for x in s0..=s1 {
        let index: [i32; 3] = std::array::from_fn(|i| math::round(base[i] + x as f64 * m[i][0]));
        let offset = (x - s0) as usize * nc;
        if pass.bound.copy_voxel(index, &mut dst[offset..offset + nc]) {
            first.get_or_insert(x);
            last = x;
        } else if first.is_some() {
            // a line crosses a convex extent once
            break;
        }
    }
    let start = first.unwrap_or(s1 + 1);
    fill(&mut dst[..(start - s0) as usize * nc], background);
    fill(&mut dst[(last - s0 + 1) as usize * nc..], background);
    if first.is_some() && pass.generate_stencil {
        runs.push((start, last));
    }
}

#[allow(clippy::too_many_arguments)]
fn sample_run<T: Scalar, O: Scalar>(
    pass: &Pass<'_, T>,
    scratch: &mut Scratch,
    base: &[f64; 4],
    s0: i32,
    s1: i32,
    dst: &mut [O],
    background: &[O],
    runs: &mut Vec<(i32, i32)>,
) {
    let nc = pass.components;
    let Scratch { values, slab } = scratch;
    let mut run_start = s0;
    let mut run_inside = false;
    for x in s0..=s1 {
        let offset = (x - s0) as usize * nc;
        let inside = sample_voxel(pass, base, x, slab, &mut values[offset..offset + nc]);
        if x == s0 {
            run_inside = inside;
        } else if inside != run_inside {
            flush(pass, values, s0, (run_start, x - 1), run_inside, dst, background, runs);
            run_start = x;
            run_inside = inside;
        }
    }
    flush(pass, values, s0, (run_start, s1), run_inside, dst, background, runs);
}

/// Interpolate every slab sample of voxel `x` and composite them into `out`.
///
/// Returns `false` when no sample fell inside the input bounds.
fn sample_voxel<T: Scalar>(
    pass: &Pass<'_, T>,
    base: &[f64; 4],
    x: i32,
    slab: &mut [f64],
    out: &mut [f64],
) -> bool {
    let nc = pass.components;
    let n = pass.slab_samples;
    let m = &pass.matrix.m;
    let perspective = pass.matrix.has_perspective();
    let p: [f64; 4] = std::array::from_fn(|i| base[i] + x as f64 * m[i][0]);

    let mut count = 0;
    for sample in 0..n {
        let mut q = p;
        if n > 1 {
            let s = (sample as f64 - 0.5 * (n - 1) as f64) * pass.slab_spacing;
            for (i, v) in q.iter_mut().enumerate() {
                *v += s * m[i][2];
            }
        }
        let mut point = [q[0], q[1], q[2]];
        if perspective {
            let f = 1.0 / q[3];
            point = point.map(|v| v * f);
        }
        if let Some(transform) = pass.transform {
            point = pass.in_geometry.world_to_index(transform.transform_point(point));
        }
        if pass.bound.check_bounds_ijk(point) {
            pass.bound
                .interpolate_ijk(point, &mut slab[count * nc..(count + 1) * nc]);
            count += 1;
        }
    }
    if count == 0 {
        return false;
    }
    pass.compositor.composite(slab, nc, count);
    out.copy_from_slice(&slab[..nc]);
    true
}

#[allow(clippy::too_many_arguments)]
fn flush<T: Scalar, O: Scalar>(
    pass: &Pass<'_, T>,
    values: &mut [f64],
    s0: i32,
    (a, b): (i32, i32),
    inside: bool,
    dst: &mut [O],
    background: &[O],
    runs: &mut Vec<(i32, i32)>,
) {
    let nc = pass.components;
    let range = (a - s0) as usize * nc..(b - s0 + 1) as usize * nc;
    if inside {
        pass.write(&mut values[range.clone()], &mut dst[range]);
        if pass.generate_stencil {
            runs.push((a, b));
        }
    } else {
        fill(&mut dst[range], background);
    }
}
