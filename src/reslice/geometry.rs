//! Output placement and the index matrix
//!
//! The index matrix takes an output voxel index to an input voxel index. It
//! is composed from the output grid placement, the reslice axes, any linear
//! transform and the input grid placement. A nonlinear transform cannot be
//! folded in; the matrix then stops at world coordinates and the engine
//! applies the transform per sample.

use crate::error::{ResliceError, Result};
use crate::image::{Extent, Geometry};
use crate::math;
use crate::transform::Transform;
use crate::Matrix4;

use super::config::ResliceConfig;

/// Output spacing, origin and extent for `input` resliced through `axes`.
pub fn output_geometry(
    config: &ResliceConfig,
    axes: &Matrix4,
    transform: Option<&dyn Transform>,
    input: &Geometry,
) -> Result<Geometry> {
    let inverse = axes
        .invert()
        .ok_or_else(|| ResliceError::singular("reslice axes cannot be inverted"))?;
    let bounds = if config.auto_crop_output {
        Some(auto_crop_bounds(&inverse, transform, input))
    } else {
        None
    };

    let m = &axes.m;
    let im = &inverse.m;
    let in_ext = input.extent;
    let center: [f64; 3] = std::array::from_fn(|j| {
        input.origin[j] + 0.5 * (in_ext.min(j) + in_ext.max(j)) as f64 * input.spacing[j]
    });

    let mut extent = [0i32; 6];
    let mut origin = [0.0; 3];
    let mut spacing = [0.0; 3];
    for i in 0..3 {
        // default spacing, linear size, extent start and centre along output axis i
        let (s, mut d, e, c) = if config.transform_input_sampling {
            let (mut s, mut d, mut e, mut c, mut r) = (0.0, 0.0, 0.0, 0.0, 0.0);
            for j in 0..3 {
                c += im[i][j] * (center[j] - m[j][3]);
                let tmp = m[j][i] * m[j][i];
                s += tmp * input.spacing[j].abs();
                d += tmp * (in_ext.max(j) - in_ext.min(j)) as f64 * input.spacing[j].abs();
                e += tmp * in_ext.min(j) as f64;
                r += tmp;
            }
            (s / r, d / (r * r.sqrt()), e / r, c)
        } else {
            let s = input.spacing[i];
            (s, (in_ext.max(i) - in_ext.min(i)) as f64 * s, in_ext.min(i) as f64, center[i])
        };

        spacing[i] = config.output_spacing.map_or(s, |sp| sp[i]);

        if i >= config.output_dimensionality {
            extent[2 * i] = 0;
            extent[2 * i + 1] = 0;
        } else if let Some(ext) = config.output_extent {
            extent[2 * i] = ext.min(i);
            extent[2 * i + 1] = ext.max(i);
        } else {
            if let Some(b) = &bounds {
                d = b[2 * i + 1] - b[2 * i];
            }
            let lo = math::round(e);
            extent[2 * i] = lo;
            extent[2 * i + 1] = math::round(lo as f64 + (d / spacing[i]).abs());
        }

        origin[i] = if i >= config.output_dimensionality {
            0.0
        } else if let Some(o) = config.output_origin {
            o[i]
        } else if let Some(b) = &bounds {
            // edge of the extent on the edge of the bounds
            b[2 * i] - extent[2 * i] as f64 * spacing[i]
        } else {
            // centre the output over the input
            c - 0.5 * (extent[2 * i] + extent[2 * i + 1]) as f64 * spacing[i]
        };
    }

    Ok(Geometry::new(Extent(extent), origin, spacing))
}

/// Bounds of the input corners mapped back into the reslice frame.
fn auto_crop_bounds(axes_inverse: &Matrix4, transform: Option<&dyn Transform>, input: &Geometry) -> [f64; 6] {
    let mut bounds = [f64::MAX, f64::MIN, f64::MAX, f64::MIN, f64::MAX, f64::MIN];
    let e = input.extent;
    for corner in 0..8 {
        let index = [
            e.0[corner % 2] as f64,
            e.0[2 + (corner / 2) % 2] as f64,
            e.0[4 + (corner / 4) % 2] as f64,
        ];
        let mut p = input.index_to_world(index);
        if let Some(t) = transform {
            p = t.inverse_transform_point(p).point;
        }
        let q = axes_inverse.transform_point(p);
        for j in 0..3 {
            bounds[2 * j] = bounds[2 * j].min(q[j]);
            bounds[2 * j + 1] = bounds[2 * j + 1].max(q[j]);
        }
    }
    bounds
}

/// Compose the index matrix.
///
/// Returns the matrix and the part of `transform` that could not be folded
/// into it. With a nonlinear transform the matrix maps output indices to
/// world coordinates.
pub fn index_matrix<'a>(
    axes: &Matrix4,
    transform: Option<&'a dyn Transform>,
    input: &Geometry,
    output: &Geometry,
) -> (Matrix4, Option<&'a dyn Transform>) {
    let (mut matrix, nonlinear) = match transform {
        Some(t) => match t.as_matrix() {
            Some(linear) => (linear.multiply(axes), None),
            None => (*axes, Some(t)),
        },
        None => (*axes, None),
    };

    let mut identity = matrix.is_identity();
    let mut in_matrix = Matrix4::identity();
    let mut out_matrix = Matrix4::identity();
    for i in 0..3 {
        let differs = match nonlinear {
            None => input.spacing[i] != output.spacing[i] || input.origin[i] != output.origin[i],
            Some(_) => output.spacing[i] != 1.0 || output.origin[i] != 0.0,
        };
        if differs {
            identity = false;
        }
        in_matrix.m[i][i] = 1.0 / input.spacing[i];
        in_matrix.m[i][3] = -input.origin[i] / input.spacing[i];
        out_matrix.m[i][i] = output.spacing[i];
        out_matrix.m[i][3] = output.origin[i];
    }

    if !identity {
        matrix = matrix.multiply(&out_matrix);
        if nonlinear.is_none() {
            matrix = in_matrix.multiply(&matrix);
        }
    }
    (matrix, nonlinear)
}

/// True when a permutation matrix lands every output voxel of `out_ext` on
/// an input voxel, so nearest-neighbour sampling is exact.
pub fn can_use_nearest(matrix: &Matrix4, out_ext: Extent) -> bool {
    let m = &matrix.m;
    for row in m.iter().take(3) {
        let Some(j) = (0..3).find(|&j| row[j] != 0.0) else {
            return false;
        };
        let mut x = row[j];
        let mut y = row[3];
        if out_ext.min(j) == out_ext.max(j) {
            y += x * out_ext.min(j) as f64;
            x = 0.0;
        }
        if math::floor(x).1 != 0.0 || math::floor(y).1 != 0.0 {
            return false;
        }
    }
    true
}

/// Input extent needed to compute `out_ext`, and whether it overlaps the input at all.
///
/// The eight output corners are mapped through `matrix` and expanded by the
/// kernel support. With wrap or mirror borders any partial overlap requires
/// the whole input along that axis.
pub fn required_input_extent(
    matrix: &Matrix4,
    support: [usize; 3],
    out_ext: Extent,
    slab_samples: usize,
    whole: Extent,
    wrap: bool,
) -> (Extent, bool) {
    let mut out_ext = out_ext;
    if slab_samples > 1 {
        let pad = (slab_samples as i32 + 1) / 2;
        out_ext.0[4] -= pad;
        out_ext.0[5] += pad;
    }

    let mut ext = [i32::MAX, i32::MIN, i32::MAX, i32::MIN, i32::MAX, i32::MIN];
    for corner in 0..8 {
        let id = [
            out_ext.0[corner % 2] as f64,
            out_ext.0[2 + (corner / 2) % 2] as f64,
            out_ext.0[4 + (corner / 4) % 2] as f64,
        ];
        let point = matrix.transform_point(id);
        for j in 0..3 {
            let kernel = support[j] as i32;
            let extra = (kernel + 1) / 2 - 1;
            let (lo, hi) = if kernel % 2 == 0 {
                let (k, f) = math::floor(point[j]);
                (k - extra, k + (f != 0.0) as i32 + extra)
            } else {
                let k = math::round(point[j]);
                (k - extra, k + extra)
            };
            ext[2 * j] = ext[2 * j].min(lo);
            ext[2 * j + 1] = ext[2 * j + 1].max(hi);
        }
    }

    let mut hit = true;
    for k in 0..3 {
        let (wlo, whi) = (whole.min(k), whole.max(k));
        if ext[2 * k] < wlo {
            ext[2 * k] = wlo;
            if wrap {
                ext[2 * k + 1] = whi;
            } else if ext[2 * k + 1] < wlo {
                ext[2 * k + 1] = wlo;
                hit = false;
            }
        }
        if ext[2 * k + 1] > whi {
            ext[2 * k + 1] = whi;
            if wrap {
                ext[2 * k] = wlo;
            } else if ext[2 * k] > whi {
                ext[2 * k] = whi.max(wlo);
                hit = false;
            }
        }
    }
    (Extent(ext), hit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::LinearTransform;
    use approx::assert_relative_eq;

    fn volume() -> Geometry {
        Geometry::new(Extent::from_dims([10, 20, 5]), [-4.0, 2.0, 1.0], [1.0, 2.0, 3.0])
    }

    #[test]
    fn test_default_geometry_is_the_input() {
        let g = output_geometry(&ResliceConfig::default(), &Matrix4::identity(), None, &volume()).unwrap();
        assert_eq!(g.extent, volume().extent);
        assert_eq!(g.spacing, volume().spacing);
        for i in 0..3 {
            assert_relative_eq!(g.origin[i], volume().origin[i], epsilon = 1e-12);
        }
        let (m, nonlinear) = index_matrix(&Matrix4::identity(), None, &volume(), &g);
        assert!(nonlinear.is_none());
        assert!(m.is_identity());
    }

    #[test]
    fn test_rotated_axes_swap_spacing_and_extent() {
        // quarter turn about z, with exact zeros
        let axes = Matrix4::from_axes([0.0, 1.0, 0.0], [-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0; 3]);
        let g = output_geometry(&ResliceConfig::default(), &axes, None, &volume()).unwrap();
        assert_relative_eq!(g.spacing[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(g.spacing[1], 1.0, epsilon = 1e-12);
        assert_eq!(g.extent, Extent::new(0, 19, 0, 9, 0, 4));

        // output centre lands on the input centre
        let (m, _) = index_matrix(&axes, None, &volume(), &g);
        let c = m.transform_point([9.5, 4.5, 2.0]);
        assert_relative_eq!(c[0], 4.5, epsilon = 1e-9);
        assert_relative_eq!(c[1], 9.5, epsilon = 1e-9);
        assert_relative_eq!(c[2], 2.0, epsilon = 1e-9);
        assert!(m.is_permutation());
    }

    #[test]
    fn test_dimensionality_and_overrides() {
        let config = ResliceConfig {
            output_dimensionality: 2,
            output_spacing: Some([0.5, 0.5, 0.5]),
            output_origin: Some([0.0, 0.0, 7.0]),
            ..ResliceConfig::default()
        };
        let g = output_geometry(&config, &Matrix4::identity(), None, &volume()).unwrap();
        assert_eq!(g.extent, Extent::new(0, 18, 0, 76, 0, 0));
        assert_eq!(g.origin, [0.0, 0.0, 0.0]);
        assert_eq!(g.spacing, [0.5, 0.5, 0.5]);
    }

    #[test]
    fn test_auto_crop_covers_the_input() {
        let config = ResliceConfig {
            auto_crop_output: true,
            ..ResliceConfig::default()
        };
        let axes = Matrix4::rotate_z(0.25);
        let g = output_geometry(&config, &axes, None, &volume()).unwrap();
        let inverse = axes.invert().unwrap();
        let input = volume();
        for corner in [[0.0, 0.0, 0.0], [9.0, 19.0, 4.0], [9.0, 0.0, 0.0], [0.0, 19.0, 4.0]] {
            let p = inverse.transform_point(input.index_to_world(corner));
            let q = g.world_to_index(p);
            for i in 0..3 {
                assert!(q[i] >= g.extent.min(i) as f64 - 1e-9);
                assert!(q[i] <= g.extent.max(i) as f64 + 1.0);
            }
        }
    }

    #[test]
    fn test_linear_transform_is_folded() {
        let t = LinearTransform::new(Matrix4::translation(3.0, 0.0, 0.0)).unwrap();
        let input = volume();
        let (m, nonlinear) = index_matrix(&Matrix4::identity(), Some(&t), &input, &input);
        assert!(nonlinear.is_none());
        assert_eq!(m.transform_point([0.0, 0.0, 0.0]), [3.0, 0.0, 0.0]);
    }

    #[test]
    fn test_can_use_nearest() {
        let ext = Extent::from_dims([4, 4, 1]);
        assert!(can_use_nearest(&Matrix4::translation(2.0, -1.0, 0.0), ext));
        assert!(!can_use_nearest(&Matrix4::translation(0.5, 0.0, 0.0), ext));
        assert!(!can_use_nearest(&Matrix4::scale(0.5, 1.0, 1.0), ext));
        // a fractional scale on a single-slice axis only matters through the offset
        let m = Matrix4::scale(1.0, 1.0, 0.5);
        assert!(can_use_nearest(&m, ext));
        assert!(!can_use_nearest(&m, Extent::new(0, 3, 0, 3, 1, 1)));
    }

    #[test]
    fn test_required_input_extent() {
        let whole = Extent::from_dims([10, 10, 10]);
        let out = Extent::new(2, 5, 0, 9, 3, 3);
        let (ext, hit) = required_input_extent(&Matrix4::identity(), [1, 1, 1], out, 1, whole, false);
        assert!(hit);
        assert_eq!(ext, out);

        // linear sampling at half-voxel offsets needs one more sample
        let half = Matrix4::translation(0.5, 0.0, 0.0);
        let (ext, _) = required_input_extent(&half, [2, 1, 1], out, 1, whole, false);
        assert_eq!(ext, Extent::new(2, 6, 0, 9, 3, 3));

        // cubic pads by one on either side, slabs pad along z
        let (ext, _) = required_input_extent(&half, [4, 4, 4], out, 3, whole, false);
        assert_eq!(ext, Extent::new(1, 7, 0, 9, 0, 6));

        let far = Matrix4::translation(50.0, 0.0, 0.0);
        let (_, hit) = required_input_extent(&far, [1, 1, 1], out, 1, whole, false);
        assert!(!hit);
        let (ext, hit) = required_input_extent(&far, [1, 1, 1], out, 1, whole, true);
        assert!(hit);
        assert_eq!(ext.min(0), 0);
        assert_eq!(ext.max(0), 9);
    }
}
