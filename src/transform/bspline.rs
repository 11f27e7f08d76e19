//! B-spline displacement transform
//!
//! The displacement at a point is a B-spline of degree 0 to 9 over a
//! three-component coefficient grid (usually produced by
//! [`BSplineCoefficients`](crate::coefficients::BSplineCoefficients) or
//! [`TransformToGrid::generate_coefficients`](crate::grid_gen::TransformToGrid::generate_coefficients)).
//! Outside the grid the spline is extended by a [`BSplineBorder`] policy.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bspline::MAX_DEGREE;
use crate::coefficients::sample_spline;
use crate::error::{ResliceError, Result};
use crate::image::{AnyImage, ScalarType};
use crate::math::BorderMode;
use crate::with_image;

use super::{
    forward, forward_with_derivative, invert3, newton_inverse, validate_field, DisplacementField,
    InverseResult, Jacobian, NewtonSettings, Transform, IDENTITY3,
};

/// Extension of the coefficient grid beyond its extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BSplineBorder {
    /// Repeat the edge coefficients.
    #[default]
    Edge,
    /// Periodic coefficients.
    Repeat,
    /// Coefficients reflected at the edge.
    Mirror,
    /// Coefficients are zero outside the grid; the displacement fades out
    /// smoothly over about two node spacings.
    Zero,
    /// Edge extension multiplied by a linear ramp that reaches zero one node
    /// spacing past the outermost node.
    ZeroAtBorder,
}

impl BSplineBorder {
    pub fn as_str(self) -> &'static str {
        match self {
            BSplineBorder::Edge => "Edge",
            BSplineBorder::Repeat => "Repeat",
            BSplineBorder::Mirror => "Mirror",
            BSplineBorder::Zero => "Zero",
            BSplineBorder::ZeroAtBorder => "ZeroAtBorder",
        }
    }
}

/// Nonlinear transform defined by B-spline displacement coefficients.
///
/// Without coefficients the transform is the identity.
#[derive(Debug, Clone)]
pub struct BSplineTransform {
    coefficients: Option<Arc<AnyImage>>,
    degree: usize,
    border: BSplineBorder,
    displacement_scale: f64,
    newton: NewtonSettings,
}

impl Default for BSplineTransform {
    fn default() -> Self {
        Self {
            coefficients: None,
            degree: 3,
            border: BSplineBorder::Edge,
            displacement_scale: 1.0,
            newton: NewtonSettings::default(),
        }
    }
}

impl BSplineTransform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_coefficients(coefficients: impl Into<Arc<AnyImage>>) -> Result<Self> {
        let mut out = Self::default();
        out.set_coefficients(coefficients)?;
        Ok(out)
    }

    /// Replace the coefficient grid (three components, `F32` or `F64`).
    pub fn set_coefficients(&mut self, coefficients: impl Into<Arc<AnyImage>>) -> Result<()> {
        let coefficients = coefficients.into();
        match validate_field(
            &coefficients,
            &[ScalarType::F32, ScalarType::F64],
            "B-spline coefficients",
        ) {
            Ok(()) => {
                self.coefficients = Some(coefficients);
                Ok(())
            }
            Err(e) => {
                self.coefficients = None;
                Err(e)
            }
        }
    }

    pub fn coefficients(&self) -> Option<&AnyImage> {
        self.coefficients.as_deref()
    }

    pub fn has_coefficients(&self) -> bool {
        self.coefficients.is_some()
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

    pub fn border(&self) -> BSplineBorder {
        self.border
    }

    pub fn set_border(&mut self, border: BSplineBorder) {
        self.border = border;
    }

    pub fn displacement_scale(&self) -> f64 {
        self.displacement_scale
    }

    pub fn set_displacement_scale(&mut self, scale: f64) {
        self.displacement_scale = scale;
    }

    pub fn newton_settings(&self) -> NewtonSettings {
        self.newton
    }

    pub fn set_newton_settings(&mut self, settings: NewtonSettings) {
        self.newton = settings;
    }

    fn field(&self) -> Option<SplineField<'_>> {
        self.coefficients.as_deref().map(|image| SplineField {
            image,
            degree: self.degree,
            border: self.border,
            scale: self.displacement_scale,
        })
    }
}

impl Transform for BSplineTransform {
    fn transform_point(&self, point: [f64; 3]) -> [f64; 3] {
        match self.field() {
            Some(field) => forward(&field, point),
            None => point,
        }
    }

    fn transform_point_with_derivative(&self, point: [f64; 3]) -> ([f64; 3], Jacobian) {
        match self.field() {
            Some(field) => forward_with_derivative(&field, point),
            None => (point, IDENTITY3),
        }
    }

    fn inverse_transform_point(&self, point: [f64; 3]) -> InverseResult {
        match self.field() {
            Some(field) => newton_inverse(&field, point, &self.newton).0,
            None => InverseResult::exact(point),
        }
    }

    fn inverse_transform_with_derivative(&self, point: [f64; 3]) -> (InverseResult, Jacobian) {
        let Some(field) = self.field() else {
            return (InverseResult::exact(point), IDENTITY3);
        };
        let (result, jacobian) = newton_inverse(&field, point, &self.newton);
        let jacobian = if result.converged {
            jacobian
        } else {
            forward_with_derivative(&field, result.point).1
        };
        (result, invert3(&jacobian).unwrap_or(IDENTITY3))
    }
}

struct SplineField<'a> {
    image: &'a AnyImage,
    degree: usize,
    border: BSplineBorder,
    scale: f64,
}

impl SplineField<'_> {
    fn evaluate(&self, index: [f64; 3], out: &mut [f64; 3], derivative: Option<&mut Jacobian>) {
        let (image, degree) = (self.image, self.degree);
        let derivative = derivative.map(|d| &mut d[..]);
        macro_rules! run {
            ($map:expr) => {
                with_image!(image, img => sample_spline(img, degree, index, $map, out, derivative))
            };
        }
        match self.border {
            BSplineBorder::Edge | BSplineBorder::ZeroAtBorder => {
                run!(|i, lo, hi| Some(BorderMode::Clamp.map(i, lo, hi)))
            }
            BSplineBorder::Repeat => run!(|i, lo, hi| Some(BorderMode::Repeat.map(i, lo, hi))),
            BSplineBorder::Mirror => run!(|i, lo, hi| Some(BorderMode::Mirror.map(i, lo, hi))),
            BSplineBorder::Zero => {
                run!(|i: i32, lo: i32, hi: i32| (i >= lo && i <= hi).then(|| (i - lo) as usize))
            }
        }
    }
}

/// Linear fall-off outside `[lo, hi]` reaching zero one node past the edge,
/// with its derivative.
#[inline]
fn border_ramp(x: f64, lo: i32, hi: i32) -> (f64, f64) {
    let below = lo as f64 - x;
    let above = x - hi as f64;
    if below > 0.0 {
        if below < 1.0 {
            (1.0 - below, 1.0)
        } else {
            (0.0, 0.0)
        }
    } else if above > 0.0 {
        if above < 1.0 {
            (1.0 - above, -1.0)
        } else {
            (0.0, 0.0)
        }
    } else {
        (1.0, 0.0)
    }
}

impl DisplacementField for SplineField<'_> {
    fn origin(&self) -> [f64; 3] {
        self.image.geometry().origin
    }

    fn spacing(&self) -> [f64; 3] {
        self.image.geometry().spacing
    }

    fn displacement(&self, index: [f64; 3], mut derivative: Option<&mut Jacobian>) -> [f64; 3] {
        let mut value = [0.0; 3];
        self.evaluate(index, &mut value, derivative.as_deref_mut());

        if self.border == BSplineBorder::ZeroAtBorder {
            let extent = self.image.extent();
            let ramps: [(f64, f64); 3] =
                std::array::from_fn(|a| border_ramp(index[a], extent.min(a), extent.max(a)));
            let r = ramps[0].0 * ramps[1].0 * ramps[2].0;
            if let Some(d) = derivative.as_deref_mut() {
                for a in 0..3 {
                    let others: f64 = (0..3).filter(|&b| b != a).map(|b| ramps[b].0).product();
                    let dr = ramps[a].1 * others;
                    for c in 0..3 {
                        d[c][a] = d[c][a] * r + value[c] * dr;
                    }
                }
            }
            for v in value.iter_mut() {
                *v *= r;
            }
        }

        if let Some(d) = derivative {
            for row in d.iter_mut() {
                for v in row.iter_mut() {
                    *v *= self.scale;
                }
            }
        }
        [
            value[0] * self.scale,
            value[1] * self.scale,
            value[2] * self.scale,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coefficients::BSplineCoefficients;
    use crate::image::{Extent, ImageData};
    use approx::assert_relative_eq;

    fn constant(value: [f64; 3]) -> AnyImage {
        ImageData::<f64>::from_fn(Extent::from_dims([5, 5, 5]), 3, |_, _, _, c| value[c]).into()
    }

    fn smooth_coefficients() -> AnyImage {
        let samples = ImageData::<f64>::from_fn(Extent::from_dims([10, 10, 10]), 3, |x, y, z, c| {
            let (x, y, z) = (x as f64, y as f64, z as f64);
            match c {
                0 => 0.3 * (0.4 * y).sin(),
                1 => 0.2 * (0.3 * z).cos(),
                _ => 0.25 * (0.35 * x).sin(),
            }
        })
        .with_origin([-5.0, -5.0, -5.0]);
        BSplineCoefficients::new(3, BorderMode::Clamp, ScalarType::F64)
            .unwrap()
            .compute(&samples.into())
            .unwrap()
    }

    #[test]
    fn test_zero_coefficients_identity() {
        let t = BSplineTransform::with_coefficients(constant([0.0; 3])).unwrap();
        let p = [1.5, -2.0, 7.0];
        assert_eq!(t.transform_point(p), p);
        let inv = t.inverse_transform_point(p);
        assert!(inv.converged);
        for i in 0..3 {
            assert_relative_eq!(inv.point[i], p[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_constant_field_translates() {
        let mut t = BSplineTransform::with_coefficients(constant([0.5, -1.0, 0.25])).unwrap();
        for degree in [0, 1, 2, 3, 5, 9] {
            t.set_degree(degree).unwrap();
            let q = t.transform_point([2.2, 1.7, 3.1]);
            assert_relative_eq!(q[0], 2.7, epsilon = 1e-12);
            assert_relative_eq!(q[1], 0.7, epsilon = 1e-12);
            assert_relative_eq!(q[2], 3.35, epsilon = 1e-12);
            let inv = t.inverse_transform_point(q);
            assert!(inv.converged);
            assert_relative_eq!(inv.point[1], 1.7, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_border_policies_outside_grid() {
        let coeffs = constant([1.0, 0.0, 0.0]);
        let mut t = BSplineTransform::with_coefficients(coeffs).unwrap();
        // grid spans 0..4 on every axis
        let far = [12.0, 2.0, 2.0];
        let half = [4.5, 2.0, 2.0];

        t.set_border(BSplineBorder::Edge);
        assert_relative_eq!(t.transform_point(far)[0], 13.0, epsilon = 1e-12);

        t.set_border(BSplineBorder::Zero);
        assert_relative_eq!(t.transform_point(far)[0], 12.0, epsilon = 1e-12);
        let q = t.transform_point(half)[0] - 4.5;
        assert!(q > 0.0 && q < 1.0);

        t.set_border(BSplineBorder::ZeroAtBorder);
        assert_relative_eq!(t.transform_point(half)[0], 5.0, epsilon = 1e-12);
        assert_relative_eq!(t.transform_point([5.0, 2.0, 2.0])[0], 5.0, epsilon = 1e-12);
        assert_relative_eq!(t.transform_point([4.0, 2.0, 2.0])[0], 5.0, epsilon = 1e-12);
    }

    #[test]
    fn test_derivative_matches_finite_difference() {
        let coeffs = smooth_coefficients();
        for border in [
            BSplineBorder::Edge,
            BSplineBorder::Repeat,
            BSplineBorder::Mirror,
            BSplineBorder::Zero,
            BSplineBorder::ZeroAtBorder,
        ] {
            let mut t = BSplineTransform::with_coefficients(coeffs.clone()).unwrap();
            t.set_border(border);
            t.set_displacement_scale(1.5);
            // the last point lies in the ramp region past x = 4
            for p in [[-1.3, 0.6, 2.2], [4.3, 0.6, -2.2]] {
                let (_, d) = t.transform_point_with_derivative(p);
                let h = 1e-6;
                for j in 0..3 {
                    let mut a = p;
                    let mut b = p;
                    a[j] += h;
                    b[j] -= h;
                    let fa = t.transform_point(a);
                    let fb = t.transform_point(b);
                    for i in 0..3 {
                        assert_relative_eq!(d[i][j], (fa[i] - fb[i]) / (2.0 * h), epsilon = 1e-5);
                    }
                }
            }
        }
    }

    #[test]
    fn test_inverse_of_forward() {
        let mut t = BSplineTransform::with_coefficients(smooth_coefficients()).unwrap();
        t.set_newton_settings(NewtonSettings {
            tolerance: 1e-8,
            max_iterations: 100,
        });
        for p in [[0.0, 0.0, 0.0], [-3.2, 2.5, 1.0], [2.0, -1.0, -4.0]] {
            let q = t.transform_point(p);
            let inv = t.inverse_transform_point(q);
            assert!(inv.converged);
            for i in 0..3 {
                assert_relative_eq!(inv.point[i], p[i], epsilon = 1e-7);
            }
        }
    }

    #[test]
    fn test_rejects_bad_input() {
        let mut t = BSplineTransform::new();
        assert!(matches!(t.set_degree(12), Err(ResliceError::InvalidSplineDegree(12))));
        assert_eq!(t.degree(), 3);

        let ints = ImageData::<i16>::new(Extent::from_dims([3, 3, 3]), 3);
        assert!(t.set_coefficients(AnyImage::from(ints)).is_err());
        assert!(!t.has_coefficients());
        assert_eq!(t.transform_point([1.0, 2.0, 3.0]), [1.0, 2.0, 3.0]);
    }
}
