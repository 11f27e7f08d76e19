//! Sampling a transform onto a displacement grid
//!
//! [`TransformToGrid`] evaluates `T(p) - p` at every node of a regular grid.
//! The result can back a [`GridTransform`] directly, or be prefiltered into
//! coefficients for a [`BSplineTransform`](crate::transform::bspline::BSplineTransform),
//! giving a fast approximation of an expensive transform.
//!
//! For integer storage the displacement range is measured over the whole grid
//! first and mapped onto the full range of the type through a scale and shift.

use serde::{Deserialize, Serialize};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::coefficients::BSplineCoefficients;
use crate::error::{ResliceError, Result};
use crate::image::{AnyImage, Extent, Geometry, ImageData, Scalar, ScalarType};
use crate::math::BorderMode;
use crate::transform::grid::GridTransform;
use crate::transform::Transform;

/// Grid geometry and storage type for sampling a transform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformToGrid {
    pub extent: Extent,
    pub origin: [f64; 3],
    pub spacing: [f64; 3],
    pub scalar_type: ScalarType,
}

impl Default for TransformToGrid {
    fn default() -> Self {
        Self {
            extent: Extent::from_dims([1, 1, 1]),
            origin: [0.0; 3],
            spacing: [1.0; 3],
            scalar_type: ScalarType::F32,
        }
    }
}

/// A sampled displacement field and the mapping from stored values to
/// displacement (`value * scale + shift`).
#[derive(Debug, Clone)]
pub struct DisplacementGrid {
    pub image: AnyImage,
    pub scale: f64,
    pub shift: f64,
}

impl DisplacementGrid {
    /// Grid transform over this field, with linear interpolation.
    pub fn into_transform(self) -> Result<GridTransform> {
        let mut transform = GridTransform::with_grid(self.image)?;
        transform.set_displacement_scale(self.scale);
        transform.set_displacement_shift(self.shift);
        Ok(transform)
    }
}

impl TransformToGrid {
    pub fn new(extent: Extent, origin: [f64; 3], spacing: [f64; 3], scalar_type: ScalarType) -> Self {
        Self {
            extent,
            origin,
            spacing,
            scalar_type,
        }
    }

    pub fn geometry(&self) -> Geometry {
        Geometry::new(self.extent, self.origin, self.spacing)
    }

    fn validate(&self) -> Result<()> {
        let err = if self.extent.is_empty() {
            Some(ResliceError::empty_extent(format!("grid extent {:?}", self.extent)))
        } else if self.spacing.iter().any(|&s| s == 0.0 || !s.is_finite()) {
            Some(ResliceError::config(format!(
                "grid spacing must be finite and non-zero, got {:?}",
                self.spacing
            )))
        } else if matches!(
            self.scalar_type,
            ScalarType::I32 | ScalarType::U32 | ScalarType::F16
        ) {
            Some(ResliceError::UnsupportedScalarType {
                context: "displacement grid",
                actual: self.scalar_type,
            })
        } else {
            None
        };
        match err {
            Some(e) => {
                tracing::error!("cannot sample transform onto grid: {}", e);
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Sample `transform` at every node.
    pub fn generate(&self, transform: &dyn Transform) -> Result<DisplacementGrid> {
        self.validate()?;
        let values = self.sample(transform);

        let (scale, shift) = if self.scalar_type.is_float() {
            (1.0, 0.0)
        } else {
            // exhaustive min/max so the integer range is fully used
            let (lo, hi) = values
                .iter()
                .fold((f64::MAX, f64::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
            integer_scale_shift(lo, hi, self.scalar_type)
        };
        tracing::debug!(
            scale,
            shift,
            "sampled transform onto {:?} grid {:?}",
            self.scalar_type,
            self.extent
        );

        let geometry = self.geometry();
        let image = match self.scalar_type {
            ScalarType::I8 => AnyImage::I8(store(&values, geometry, scale, shift)?),
            ScalarType::U8 => AnyImage::U8(store(&values, geometry, scale, shift)?),
            ScalarType::I16 => AnyImage::I16(store(&values, geometry, scale, shift)?),
            ScalarType::U16 => AnyImage::U16(store(&values, geometry, scale, shift)?),
            ScalarType::F32 => AnyImage::F32(store(&values, geometry, scale, shift)?),
            _ => AnyImage::F64(store(&values, geometry, scale, shift)?),
        };
        Ok(DisplacementGrid {
            image,
            scale,
            shift,
        })
    }

    /// Sample `transform` and prefilter the samples into B-spline coefficients
    /// of `degree`, stored as `F64` (or `F32` when that is the grid type).
    pub fn generate_coefficients(&self, transform: &dyn Transform, degree: usize) -> Result<AnyImage> {
        self.validate()?;
        let values = self.sample(transform);
        let samples = store::<f64>(&values, self.geometry(), 1.0, 0.0)?;
        let output_type = if self.scalar_type == ScalarType::F32 {
            ScalarType::F32
        } else {
            ScalarType::F64
        };
        BSplineCoefficients::new(degree, BorderMode::Clamp, output_type)?.compute(&samples.into())
    }

    // displacement at every node, x fastest, three values per node
    fn sample(&self, transform: &dyn Transform) -> Vec<f64> {
        let [nx, ny, nz] = self.extent.dims();
        let slice_len = nx * ny * 3;
        let mut values = vec![0.0; slice_len * nz];
        let geometry = self.geometry();
        let extent = self.extent;

        let fill_slice = |z: usize, slice: &mut [f64]| {
            let k = extent.min(2) + z as i32;
            for (y, row) in slice.chunks_mut(nx * 3).enumerate() {
                let j = extent.min(1) + y as i32;
                for (x, node) in row.chunks_mut(3).enumerate() {
                    let i = extent.min(0) + x as i32;
                    let p = geometry.index_to_world([i as f64, j as f64, k as f64]);
                    let q = transform.transform_point(p);
                    node[0] = q[0] - p[0];
                    node[1] = q[1] - p[1];
                    node[2] = q[2] - p[2];
                }
            }
        };

        #[cfg(feature = "parallel")]
        values
            .par_chunks_mut(slice_len)
            .enumerate()
            .for_each(|(z, slice)| fill_slice(z, slice));

        #[cfg(not(feature = "parallel"))]
        values
            .chunks_mut(slice_len)
            .enumerate()
            .for_each(|(z, slice)| fill_slice(z, slice));

        values
    }
}

/// Scale and shift mapping `[lo, hi]` onto the full range of an integer type.
fn integer_scale_shift(lo: f64, hi: f64, scalar_type: ScalarType) -> (f64, f64) {
    let type_min = scalar_type.min_value();
    let type_max = scalar_type.max_value();
    let mut scale = (hi - lo) / (type_max - type_min);
    let shift = (type_min * hi - type_max * lo) / (type_min - type_max);
    if scale == 0.0 {
        scale = 1.0;
    }
    (scale, shift)
}

fn store<T: Scalar>(values: &[f64], geometry: Geometry, scale: f64, shift: f64) -> Result<ImageData<T>> {
    let inv = 1.0 / scale;
    let data = values
        .iter()
        .map(|&v| T::from_double_clamp((v - shift) * inv))
        .collect();
    Ok(ImageData::from_vec(geometry.extent, 3, data)?
        .with_origin(geometry.origin)
        .with_spacing(geometry.spacing))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::bspline::BSplineTransform;
    use crate::transform::LinearTransform;
    use crate::Matrix4;
    use approx::assert_relative_eq;

    fn stretch() -> LinearTransform {
        LinearTransform::new(Matrix4::scale(1.1, 0.9, 1.0).multiply(&Matrix4::translation(0.5, 0.0, -0.25)))
            .unwrap()
    }

    fn sampler(scalar_type: ScalarType) -> TransformToGrid {
        TransformToGrid::new(Extent::new(-2, 5, 0, 4, 1, 3), [1.0, -1.0, 0.0], [0.5, 1.0, 2.0], scalar_type)
    }

    #[test]
    fn test_identity_gives_zero_field() {
        let grid = sampler(ScalarType::F64).generate(&LinearTransform::new(Matrix4::identity()).unwrap()).unwrap();
        assert_eq!(grid.scale, 1.0);
        assert_eq!(grid.shift, 0.0);
        let e = grid.image.extent();
        assert_eq!(e, Extent::new(-2, 5, 0, 4, 1, 3));
        for c in 0..3 {
            assert_eq!(grid.image.get([3, 2, 2], c), Some(0.0));
        }
    }

    #[test]
    fn test_float_grid_reproduces_transform() {
        let t = stretch();
        let grid_transform = sampler(ScalarType::F32).generate(&t).unwrap().into_transform().unwrap();
        // linear kernels reproduce an affine displacement everywhere inside
        for p in [[0.3, -0.5, 2.0], [2.9, 2.5, 5.5], [0.0, 0.0, 3.0]] {
            let a = t.transform_point(p);
            let b = grid_transform.transform_point(p);
            for i in 0..3 {
                assert_relative_eq!(a[i], b[i], epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_integer_grid_uses_full_range() {
        let t = stretch();
        for scalar_type in [ScalarType::U8, ScalarType::I8, ScalarType::I16, ScalarType::U16] {
            let grid = sampler(scalar_type).generate(&t).unwrap();
            let mut stored_min = f64::MAX;
            let mut stored_max = f64::MIN;
            let e = grid.image.extent();
            for k in e.min(2)..=e.max(2) {
                for j in e.min(1)..=e.max(1) {
                    for i in e.min(0)..=e.max(0) {
                        for c in 0..3 {
                            let v = grid.image.get([i, j, k], c).unwrap();
                            stored_min = stored_min.min(v);
                            stored_max = stored_max.max(v);
                        }
                    }
                }
            }
            assert_eq!(stored_min, scalar_type.min_value());
            assert_eq!(stored_max, scalar_type.max_value());

            let scale = grid.scale;
            let transform = grid.into_transform().unwrap();
            let p = sampler(scalar_type).geometry().index_to_world([1.0, 3.0, 2.0]);
            let a = t.transform_point(p);
            let b = transform.transform_point(p);
            for i in 0..3 {
                assert!((a[i] - b[i]).abs() <= 0.5 * scale + 1e-9);
            }
        }
    }

    #[test]
    fn test_coefficients_back_a_bspline_transform() {
        let t = stretch();
        let s = sampler(ScalarType::F64);
        let e = s.extent;
        for degree in [2, 3, 5] {
            let coefficients = s.generate_coefficients(&t, degree).unwrap();
            assert_eq!(coefficients.scalar_type(), ScalarType::F64);
            let mut spline = BSplineTransform::with_coefficients(coefficients).unwrap();
            spline.set_degree(degree).unwrap();
            // the spline interpolates the sampled field at every node, edges and corners included
            for k in e.min(2)..=e.max(2) {
                for j in e.min(1)..=e.max(1) {
                    for i in e.min(0)..=e.max(0) {
                        let p = s.geometry().index_to_world([i as f64, j as f64, k as f64]);
                        let a = t.transform_point(p);
                        let b = spline.transform_point(p);
                        for c in 0..3 {
                            assert_relative_eq!(a[c], b[c], epsilon = 1e-8);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_rejects_bad_geometry() {
        let t = stretch();
        let mut s = sampler(ScalarType::F32);
        s.spacing[1] = 0.0;
        assert!(matches!(s.generate(&t), Err(ResliceError::InvalidConfiguration(_))));
        let s = TransformToGrid {
            extent: Extent::default(),
            ..TransformToGrid::default()
        };
        assert!(matches!(s.generate(&t), Err(ResliceError::EmptyExtent(_))));
        let s = sampler(ScalarType::I32);
        assert!(s.generate(&t).is_err());
    }
}
