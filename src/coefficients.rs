//! B-spline coefficient generation
//!
//! [`BSplineCoefficients::compute`] turns sampled data into spline
//! coefficients by running the recursive prefilter along x, then y, then z.
//! Evaluating the spline of the same degree and border mode at the grid nodes
//! then reproduces the input samples.

use serde::{Deserialize, Serialize};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::bspline::{self, MAX_DEGREE, MAX_KERNEL_SIZE};
use crate::error::{ResliceError, Result};
use crate::image::{AnyImage, ImageData, Scalar, ScalarType};
use crate::math::{self, BorderMode};
use crate::with_image;

/// Truncation tolerance of the mirror-boundary initialisation.
const PREFILTER_TOLERANCE: f64 = 1e-12;

/// Prefilter settings: spline degree, boundary condition and output storage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BSplineCoefficients {
    degree: usize,
    border_mode: BorderMode,
    output_type: ScalarType,
}

impl Default for BSplineCoefficients {
    fn default() -> Self {
        Self {
            degree: 3,
            border_mode: BorderMode::Clamp,
            output_type: ScalarType::F32,
        }
    }
}

impl BSplineCoefficients {
    pub fn new(degree: usize, border_mode: BorderMode, output_type: ScalarType) -> Result<Self> {
        let mut out = Self {
            border_mode,
            ..Self::default()
        };
        out.set_degree(degree)?;
        out.set_output_type(output_type)?;
        Ok(out)
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    pub fn set_degree(&mut self, degree: usize) -> Result<()> {
        if degree > MAX_DEGREE {
            tracing::error!("spline degree {} is out of range", degree);
            return Err(ResliceError::InvalidSplineDegree(degree));
        }
        self.degree = degree;
        Ok(())
    }

    pub fn border_mode(&self) -> BorderMode {
        self.border_mode
    }

    pub fn set_border_mode(&mut self, mode: BorderMode) {
        self.border_mode = mode;
    }

    pub fn output_type(&self) -> ScalarType {
        self.output_type
    }

    /// Only `F32` and `F64` are accepted.
    pub fn set_output_type(&mut self, scalar_type: ScalarType) -> Result<()> {
        if !matches!(scalar_type, ScalarType::F32 | ScalarType::F64) {
            tracing::error!("coefficient output type must be F32 or F64, got {:?}", scalar_type);
            return Err(ResliceError::UnsupportedScalarType {
                context: "B-spline coefficients",
                actual: scalar_type,
            });
        }
        self.output_type = scalar_type;
        Ok(())
    }

    /// Prefilter `image` into a coefficient image with the same geometry and
    /// component count.
    pub fn compute(&self, image: &AnyImage) -> Result<AnyImage> {
        if image.extent().is_empty() {
            let err = ResliceError::empty_extent(format!("{:?}", image.extent()));
            tracing::error!("cannot compute B-spline coefficients: {}", err);
            return Err(err);
        }
        let mut work = image.to_f64();
        for axis in 0..3 {
            prefilter_axis(&mut work, axis, self.degree, self.border_mode);
        }
        tracing::debug!(
            degree = self.degree,
            border = self.border_mode.as_str(),
            "computed B-spline coefficients for extent {:?}",
            work.extent()
        );

        let geometry = work.geometry();
        Ok(match self.output_type {
            ScalarType::F64 => AnyImage::F64(work),
            _ => {
                let data = work.into_array().mapv(|v| v as f32);
                AnyImage::F32(
                    ImageData::from_array(data, geometry.extent)?
                        .with_origin(geometry.origin)
                        .with_spacing(geometry.spacing),
                )
            }
        })
    }

    /// Evaluate the spline over `coefficients` at a world point.
    ///
    /// `out` receives one value per component.
    pub fn evaluate(&self, coefficients: &AnyImage, point: [f64; 3], out: &mut [f64]) {
        let index = coefficients.geometry().world_to_index(point);
        let border = self.border_mode;
        with_image!(coefficients, img => {
            sample_spline(img, self.degree, index, |i, lo, hi| Some(border.map(i, lo, hi)), out, None)
        });
    }

    /// Like [`evaluate`](Self::evaluate), also filling the spatial gradient of
    /// every component in world units.
    pub fn evaluate_with_derivative(
        &self,
        coefficients: &AnyImage,
        point: [f64; 3],
        out: &mut [f64],
        derivative: &mut [[f64; 3]],
    ) {
        let geometry = coefficients.geometry();
        let index = geometry.world_to_index(point);
        let border = self.border_mode;
        with_image!(coefficients, img => {
            sample_spline(
                img,
                self.degree,
                index,
                |i, lo, hi| Some(border.map(i, lo, hi)),
                out,
                Some(&mut *derivative),
            )
        });
        for row in derivative.iter_mut() {
            for (v, s) in row.iter_mut().zip(geometry.spacing.iter()) {
                *v /= s;
            }
        }
    }

    /// True when `point` lies within the world bounds of the coefficient extent.
    pub fn check_bounds(&self, coefficients: &AnyImage, point: [f64; 3]) -> bool {
        let geometry = coefficients.geometry();
        let index = geometry.world_to_index(point);
        let e = geometry.extent;
        (0..3).all(|axis| {
            index[axis] >= e.min(axis) as f64 - math::FLOOR_TOLERANCE
                && index[axis] <= e.max(axis) as f64 + math::FLOOR_TOLERANCE
        })
    }
}

fn prefilter_axis(image: &mut ImageData<f64>, axis: usize, degree: usize, border: BorderMode) {
    let n = image.extent().len(axis);
    if n < 2 || degree < 2 {
        return;
    }
    let dims = image.extent().dims();
    let inc = image.increments();
    let nc = image.components();
    let stride = inc[axis] as usize;

    // start offset of every line running along `axis`
    let (a1, a2) = match axis {
        0 => (1, 2),
        1 => (0, 2),
        _ => (0, 1),
    };
    let mut starts = Vec::with_capacity(dims[a1] * dims[a2] * nc);
    for j in 0..dims[a2] {
        for i in 0..dims[a1] {
            let base = i * inc[a1] as usize + j * inc[a2] as usize;
            starts.extend((0..nc).map(|c| base + c));
        }
    }

    let data = image.as_slice_mut();
    let mut lines: Vec<Vec<f64>> = starts
        .iter()
        .map(|&s| (0..n).map(|k| data[s + k * stride]).collect())
        .collect();

    #[cfg(feature = "parallel")]
    lines
        .par_iter_mut()
        .for_each(|line| bspline::prefilter_line(line, degree, border, PREFILTER_TOLERANCE));

    #[cfg(not(feature = "parallel"))]
    lines
        .iter_mut()
        .for_each(|line| bspline::prefilter_line(line, degree, border, PREFILTER_TOLERANCE));

    for (&s, line) in starts.iter().zip(lines.iter()) {
        for (k, &v) in line.iter().enumerate() {
            data[s + k * stride] = v;
        }
    }
}

/// Evaluate a spline of `degree` over every component of `img` at a
/// continuous index.
///
/// `map_tap(i, lo, hi)` maps a tap index on an axis with extent `[lo, hi]` to
/// a zero-based sample, or `None` to drop the tap. Single-sample axes always
/// use one tap with unit weight. When `derivative` is given, entry `c`
/// receives the gradient of component `c` with respect to the index.
pub(crate) fn sample_spline<T, M>(
    img: &ImageData<T>,
    degree: usize,
    index: [f64; 3],
    map_tap: M,
    out: &mut [f64],
    derivative: Option<&mut [[f64; 3]]>,
) where
    T: Scalar,
    M: Fn(i32, i32, i32) -> Option<usize>,
{
    let extent = img.extent();
    let inc = img.increments();
    let data = img.as_slice();
    let nc = img.components().min(out.len());
    let offset = bspline::sample_offset::<f64>(degree);
    let first = bspline::first_tap(degree);

    let mut fact = [[0isize; MAX_KERNEL_SIZE]; 3];
    let mut valid = [[false; MAX_KERNEL_SIZE]; 3];
    let mut w = [[0.0f64; MAX_KERNEL_SIZE]; 3];
    let mut dw = [[0.0f64; MAX_KERNEL_SIZE]; 3];
    let mut taps = [1usize; 3];

    for axis in 0..3 {
        let (lo, hi) = (extent.min(axis), extent.max(axis));
        if lo == hi {
            fact[axis][0] = 0;
            valid[axis][0] = true;
            w[axis][0] = 1.0;
            continue;
        }
        let (i, t) = math::floor(index[axis] + offset);
        if derivative.is_some() {
            bspline::interpolation_weights_with_derivative(&mut w[axis], &mut dw[axis], t, degree);
        } else {
            bspline::interpolation_weights(&mut w[axis], t, degree);
        }
        for l in 0..=degree {
            if let Some(o) = map_tap(i + first + l as i32, lo, hi) {
                fact[axis][l] = o as isize * inc[axis];
                valid[axis][l] = true;
            }
        }
        taps[axis] = degree + 1;
    }

    out[..nc].fill(0.0);
    let want = derivative.is_some();
    let mut grad = if want { vec![[0.0f64; 3]; nc] } else { Vec::new() };

    for k in (0..taps[2]).filter(|&k| valid[2][k]) {
        for j in (0..taps[1]).filter(|&j| valid[1][j]) {
            let row = fact[2][k] + fact[1][j];
            let wzy = w[2][k] * w[1][j];
            for l in (0..taps[0]).filter(|&l| valid[0][l]) {
                let base = (row + fact[0][l]) as usize;
                let weight = w[0][l] * wzy;
                if want {
                    let g = [
                        dw[0][l] * wzy,
                        w[0][l] * dw[1][j] * w[2][k],
                        w[0][l] * w[1][j] * dw[2][k],
                    ];
                    for c in 0..nc {
                        let v = data[base + c].to_double();
                        out[c] += weight * v;
                        for a in 0..3 {
                            grad[c][a] += g[a] * v;
                        }
                    }
                } else {
                    for c in 0..nc {
                        out[c] += weight * data[base + c].to_double();
                    }
                }
            }
        }
    }

    if let Some(d) = derivative {
        for (row, g) in d.iter_mut().zip(grad.iter()) {
            *row = *g;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Extent;
    use approx::assert_relative_eq;

    fn ramp() -> ImageData<f64> {
        ImageData::from_fn(Extent::from_dims([9, 7, 5]), 1, |x, y, z, _| {
            ((x * 7 + y * 3 + z * 11) % 13) as f64 - 0.5 * y as f64
        })
        .with_origin([1.0, -2.0, 0.5])
        .with_spacing([0.5, 1.5, 2.0])
    }

    #[test]
    fn test_roundtrip_all_degrees() {
        let input = ramp();
        let any = AnyImage::from(input.clone());
        let g = input.geometry();
        for border in [BorderMode::Clamp, BorderMode::Mirror, BorderMode::Repeat] {
            for degree in 0..=MAX_DEGREE {
                let c = BSplineCoefficients::new(degree, border, ScalarType::F64).unwrap();
                let coeffs = c.compute(&any).unwrap();
                // every node, edges and corners included
                for z in 0..5 {
                    for y in 0..7 {
                        for x in 0..9 {
                            let p = g.index_to_world([x as f64, y as f64, z as f64]);
                            let mut out = [0.0];
                            c.evaluate(&coeffs, p, &mut out);
                            let expected = input.get([x, y, z], 0).unwrap();
                            assert_relative_eq!(out[0], expected, epsilon = 1e-6, max_relative = 1e-6);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_clamp_preserves_constants() {
        let input = ImageData::<u8>::from_fn(Extent::from_dims([6, 6, 1]), 2, |_, _, _, c| 7 + c as u8);
        let c = BSplineCoefficients::default();
        let coeffs = c.compute(&AnyImage::from(input)).unwrap();
        assert_eq!(coeffs.scalar_type(), ScalarType::F32);
        assert_eq!(coeffs.components(), 2);
        let mut out = [0.0; 2];
        let mut d = [[0.0; 3]; 2];
        c.evaluate_with_derivative(&coeffs, [2.3, 4.9, 0.0], &mut out, &mut d);
        assert_relative_eq!(out[0], 7.0, epsilon = 1e-5);
        assert_relative_eq!(out[1], 8.0, epsilon = 1e-5);
        for row in d {
            for v in row {
                assert_relative_eq!(v, 0.0, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let input = AnyImage::from(ramp());
        let c = BSplineCoefficients::new(3, BorderMode::Mirror, ScalarType::F64).unwrap();
        let coeffs = c.compute(&input).unwrap();
        let p = [2.7, 1.1, 4.3];
        let mut out = [0.0];
        let mut d = [[0.0; 3]];
        c.evaluate_with_derivative(&coeffs, p, &mut out, &mut d);
        let h = 1e-6;
        for a in 0..3 {
            let mut p1 = p;
            let mut p0 = p;
            p1[a] += h;
            p0[a] -= h;
            let (mut v1, mut v0) = ([0.0], [0.0]);
            c.evaluate(&coeffs, p1, &mut v1);
            c.evaluate(&coeffs, p0, &mut v0);
            assert_relative_eq!(d[0][a], (v1[0] - v0[0]) / (2.0 * h), epsilon = 1e-5);
        }
    }

    #[test]
    fn test_invalid_settings() {
        assert!(matches!(
            BSplineCoefficients::new(10, BorderMode::Clamp, ScalarType::F32),
            Err(ResliceError::InvalidSplineDegree(10))
        ));
        assert!(matches!(
            BSplineCoefficients::new(3, BorderMode::Clamp, ScalarType::U8),
            Err(ResliceError::UnsupportedScalarType { .. })
        ));
        let empty = AnyImage::from(ImageData::<f32>::new(Extent::default(), 1));
        assert!(BSplineCoefficients::default().compute(&empty).is_err());
    }

    #[test]
    fn test_check_bounds() {
        let coeffs = AnyImage::from(ramp());
        let c = BSplineCoefficients::default();
        assert!(c.check_bounds(&coeffs, [1.0, -2.0, 0.5]));
        assert!(c.check_bounds(&coeffs, [5.0, 7.0, 8.5]));
        assert!(!c.check_bounds(&coeffs, [5.1, 0.0, 1.0]));
        assert!(!c.check_bounds(&coeffs, [1.0, -2.5, 1.0]));
    }

    #[test]
    fn test_dropped_taps_decay_to_zero() {
        let img = ImageData::<f32>::from_fn(Extent::from_dims([4, 4, 4]), 1, |_, _, _, _| 1.0);
        let inside = |i: i32, lo: i32, hi: i32| (i >= lo && i <= hi).then(|| (i - lo) as usize);
        let mut out = [0.0];
        sample_spline(&img, 3, [1.5, 1.5, 1.5], inside, &mut out, None);
        assert_relative_eq!(out[0], 1.0, epsilon = 1e-12);
        // one node past the edge only the last sample contributes, with weight 1/6
        sample_spline(&img, 3, [4.0, 1.5, 1.5], inside, &mut out, None);
        assert_relative_eq!(out[0], 1.0 / 6.0, epsilon = 1e-12);
        sample_spline(&img, 3, [5.0, 1.5, 1.5], inside, &mut out, None);
        assert_eq!(out[0], 0.0);
    }
}
