//! Coordinate transforms
//!
//! [`Transform`] is the abstraction the reslice engine applies, in world
//! coordinates, for the part of the output-to-input mapping that is not a
//! matrix. Linear transforms report themselves through
//! [`Transform::as_matrix`] so they can be folded into the index matrix.
//!
//! The two warp transforms ([`grid::GridTransform`] and
//! [`bspline::BSplineTransform`]) share the displacement-field machinery in
//! this module: forward evaluation, Jacobians, and the damped Newton inverse.

pub mod bspline;
pub mod grid;

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::error::{ResliceError, Result};
use crate::image::{AnyImage, ScalarType};
use crate::{solve3x3, Matrix4};

pub type Jacobian = [[f64; 3]; 3];

const IDENTITY3: Jacobian = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

/// Outcome of an inverse mapping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InverseResult {
    pub point: [f64; 3],
    /// False when the iteration cap was reached; `point` is then the best estimate.
    pub converged: bool,
    pub iterations: usize,
    /// Length of the last Newton step, in world units.
    pub error: f64,
}

impl InverseResult {
    /// Result of a closed-form inverse.
    pub fn exact(point: [f64; 3]) -> Self {
        Self {
            point,
            converged: true,
            iterations: 0,
            error: 0.0,
        }
    }
}

/// A mapping between world coordinates.
pub trait Transform: Send + Sync + Debug {
    fn transform_point(&self, point: [f64; 3]) -> [f64; 3];

    /// Transformed point and the Jacobian `d output_i / d input_j`.
    fn transform_point_with_derivative(&self, point: [f64; 3]) -> ([f64; 3], Jacobian);

    fn inverse_transform_point(&self, point: [f64; 3]) -> InverseResult;

    /// Inverse point and the Jacobian of the inverse mapping there.
    fn inverse_transform_with_derivative(&self, point: [f64; 3]) -> (InverseResult, Jacobian) {
        let result = self.inverse_transform_point(point);
        let (_, forward) = self.transform_point_with_derivative(result.point);
        (result, invert3(&forward).unwrap_or(IDENTITY3))
    }

    /// The equivalent homogeneous matrix, for transforms that have one.
    fn as_matrix(&self) -> Option<Matrix4> {
        None
    }

    fn is_linear(&self) -> bool {
        self.as_matrix().is_some()
    }
}

pub(crate) fn invert3(m: &Jacobian) -> Option<Jacobian> {
    let mut out = [[0.0; 3]; 3];
    for c in 0..3 {
        let mut e = [0.0; 3];
        e[c] = 1.0;
        let col = solve3x3(m, &e)?;
        for r in 0..3 {
            out[r][c] = col[r];
        }
    }
    Some(out)
}

// =============================================================================
// Linear transform
// =============================================================================

/// Homogeneous 4x4 transform, possibly with perspective.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearTransform {
    matrix: Matrix4,
    inverse: Matrix4,
}

impl LinearTransform {
    pub fn new(matrix: Matrix4) -> Result<Self> {
        let inverse = matrix
            .invert()
            .ok_or_else(|| ResliceError::singular("linear transform matrix"))?;
        Ok(Self { matrix, inverse })
    }

    pub fn matrix(&self) -> &Matrix4 {
        &self.matrix
    }

    pub fn inverse_matrix(&self) -> &Matrix4 {
        &self.inverse
    }

    fn derivative_of(m: &Matrix4, point: [f64; 3]) -> ([f64; 3], Jacobian) {
        let q = m.multiply_point([point[0], point[1], point[2], 1.0]);
        let w = q[3];
        let out = [q[0] / w, q[1] / w, q[2] / w];
        let mut d = [[0.0; 3]; 3];
        for i in 0..3 {
            for j in 0..3 {
                d[i][j] = (m.m[i][j] - out[i] * m.m[3][j]) / w;
            }
        }
        (out, d)
    }
}

impl Transform for LinearTransform {
    fn transform_point(&self, point: [f64; 3]) -> [f64; 3] {
        self.matrix.transform_point(point)
    }

    fn transform_point_with_derivative(&self, point: [f64; 3]) -> ([f64; 3], Jacobian) {
        Self::derivative_of(&self.matrix, point)
    }

    fn inverse_transform_point(&self, point: [f64; 3]) -> InverseResult {
        InverseResult::exact(self.inverse.transform_point(point))
    }

    fn inverse_transform_with_derivative(&self, point: [f64; 3]) -> (InverseResult, Jacobian) {
        let (p, d) = Self::derivative_of(&self.inverse, point);
        (InverseResult::exact(p), d)
    }

    fn as_matrix(&self) -> Option<Matrix4> {
        Some(self.matrix)
    }
}

// =============================================================================
// Displacement fields and the Newton inverse
// =============================================================================

/// Stopping rules for the iterative inverse.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewtonSettings {
    /// Convergence tolerance, in world units.
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            tolerance: 0.01,
            max_iterations: 500,
        }
    }
}

/// Check that `image` can back a displacement field: three components, a
/// non-empty extent and one of the `allowed` storage types.
pub(crate) fn validate_field(
    image: &AnyImage,
    allowed: &[ScalarType],
    context: &'static str,
) -> Result<()> {
    let err = if image.components() != 3 {
        Some(ResliceError::ComponentMismatch {
            expected: 3,
            actual: image.components(),
        })
    } else if image.extent().is_empty() {
        Some(ResliceError::empty_extent(format!("{context} {:?}", image.extent())))
    } else if !allowed.contains(&image.scalar_type()) {
        Some(ResliceError::UnsupportedScalarType {
            context,
            actual: image.scalar_type(),
        })
    } else {
        None
    };
    match err {
        Some(e) => {
            tracing::error!("rejected {}: {}", context, e);
            Err(e)
        }
        None => Ok(()),
    }
}

/// A displacement field sampled on a regular lattice.
pub(crate) trait DisplacementField {
    fn origin(&self) -> [f64; 3];

    fn spacing(&self) -> [f64; 3];

    /// Displacement in world units at a continuous lattice index. When
    /// `derivative` is given it receives `d displacement_i / d index_j`.
    fn displacement(&self, index: [f64; 3], derivative: Option<&mut Jacobian>) -> [f64; 3];
}

pub(crate) fn forward<D: DisplacementField + ?Sized>(field: &D, point: [f64; 3]) -> [f64; 3] {
    let origin = field.origin();
    let spacing = field.spacing();
    let index = std::array::from_fn(|i| (point[i] - origin[i]) / spacing[i]);
    let d = field.displacement(index, None);
    [point[0] + d[0], point[1] + d[1], point[2] + d[2]]
}

pub(crate) fn forward_with_derivative<D: DisplacementField + ?Sized>(
    field: &D,
    point: [f64; 3],
) -> ([f64; 3], Jacobian) {
    let origin = field.origin();
    let spacing = field.spacing();
    let index = std::array::from_fn(|i| (point[i] - origin[i]) / spacing[i]);
    let mut derivative = [[0.0; 3]; 3];
    let d = field.displacement(index, Some(&mut derivative));
    to_world_jacobian(&mut derivative, &spacing);
    ([point[0] + d[0], point[1] + d[1], point[2] + d[2]], derivative)
}

#[inline]
fn to_world_jacobian(derivative: &mut Jacobian, spacing: &[f64; 3]) {
    for (i, row) in derivative.iter_mut().enumerate() {
        for (j, v) in row.iter_mut().enumerate() {
            *v /= spacing[j];
        }
        row[i] += 1.0;
    }
}

/// Damped Newton inversion of `x -> x + displacement(x)`.
///
/// The iteration runs in lattice index space. A full Newton step is taken
/// while the squared residual decreases; otherwise the step is shortened by a
/// quadratic line search with the fraction clamped to `[0.1, 0.5]`.
pub(crate) fn newton_inverse<D: DisplacementField + ?Sized>(
    field: &D,
    target: [f64; 3],
    settings: &NewtonSettings,
) -> (InverseResult, Jacobian) {
    let origin = field.origin();
    let spacing = field.spacing();
    let inv_spacing = [1.0 / spacing[0], 1.0 / spacing[1], 1.0 / spacing[2]];

    let point: [f64; 3] = std::array::from_fn(|i| (target[i] - origin[i]) * inv_spacing[i]);

    // first guess: subtract the displacement at the target
    let d = field.displacement(point, None);
    let mut inverse: [f64; 3] = std::array::from_fn(|i| point[i] - d[i] * inv_spacing[i]);
    let mut last_inverse = inverse;

    let tolerance_squared = settings.tolerance * settings.tolerance;
    let mut last_function_value = f64::MAX;
    let mut function_derivative = 0.0;
    let mut error_squared = 0.0;
    let mut delta_i = [0.0; 3];
    let mut derivative = IDENTITY3;
    let mut f = 1.0;
    let mut converged = false;
    let mut iterations = 0;

    while iterations < settings.max_iterations {
        let mut jac = [[0.0; 3]; 3];
        let d = field.displacement(inverse, Some(&mut jac));
        let delta_p: [f64; 3] = std::array::from_fn(|i| (inverse[i] - point[i]) * spacing[i] + d[i]);
        to_world_jacobian(&mut jac, &spacing);
        derivative = jac;

        let function_value = delta_p.iter().map(|v| v * v).sum::<f64>();

        if iterations == 0 || function_value < last_function_value || f < 1.0 {
            let Some(step) = solve3x3(&derivative, &delta_p) else {
                tracing::debug!("singular Jacobian during inverse iteration");
                break;
            };
            delta_i = step;
            error_squared = delta_i.iter().map(|v| v * v).sum();

            if error_squared < tolerance_squared && function_value < tolerance_squared {
                converged = true;
                iterations += 1;
                break;
            }

            last_inverse = inverse;
            last_function_value = function_value;

            // slope of the squared residual along the step
            function_derivative = 2.0
                * (delta_p[0] * derivative[0][0] * delta_i[0]
                    + delta_p[1] * derivative[1][1] * delta_i[1]
                    + delta_p[2] * derivative[2][2] * delta_i[2]);

            for i in 0..3 {
                inverse[i] -= delta_i[i] * inv_spacing[i];
            }
            f = 1.0;
            iterations += 1;
            continue;
        }

        // residual increased: take a partial step from the last good point
        let a = -function_derivative
            / (2.0 * (function_value - last_function_value - function_derivative));
        f *= if a.is_nan() { 0.1 } else { a.clamp(0.1, 0.5) };
        for i in 0..3 {
            inverse[i] = last_inverse[i] - f * delta_i[i] * inv_spacing[i];
        }
        iterations += 1;
    }

    if !converged {
        inverse = last_inverse;
        tracing::warn!(
            "inverse transform did not converge at ({}, {}, {}): error = {} after {} iterations",
            target[0],
            target[1],
            target[2],
            error_squared.sqrt(),
            iterations
        );
    }

    let out = std::array::from_fn(|i| inverse[i] * spacing[i] + origin[i]);
    (
        InverseResult {
            point: out,
            converged,
            iterations,
            error: error_squared.sqrt(),
        },
        derivative,
    )
}
