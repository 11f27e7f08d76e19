//! Volumetric resampling under linear and nonlinear transforms
//!
//! This crate resamples structured 3D images through an index matrix and an
//! optional nonlinear transform, with a family of separable interpolation
//! kernels and three border policies.
//!
//! # Features
//!
//! - **Kernels**: nearest, trilinear, tricubic and B-spline of degree 0 to 9
//! - **Border policies**: clamp, repeat (wrap) and mirror
//! - **Transforms**: displacement-grid and B-spline transforms with Newton inversion
//! - **Reslice engine**: generic and axis-permutation fast paths, slab compositing,
//!   stencils, type conversion with clamping
//! - **Parallel execution**: output tiles are processed with rayon
//!
//! # Example
//!
//! ```rust
//! use reslice3d::{Extent, ImageData, Matrix4, Reslice, ResliceConfig, InterpolationMode};
//!
//! # fn main() -> reslice3d::Result<()> {
//! let input = ImageData::<f32>::from_fn(Extent::from_dims([16, 16, 16]), 1, |x, y, z, _| {
//!     (x + y + z) as f32
//! });
//!
//! let mut reslice = Reslice::new(ResliceConfig {
//!     interpolation_mode: InterpolationMode::Linear,
//!     ..ResliceConfig::default()
//! });
//! reslice.set_reslice_axes(Matrix4::rotate_z(0.3));
//!
//! let output = reslice.execute(&input.into())?;
//! assert_eq!(output.image.extent().dims()[2], 16);
//! # Ok(())
//! # }
//! ```

pub mod bspline;
pub mod coefficients;
pub mod error;
pub mod grid_gen;
pub mod image;
pub mod interpolator;
pub mod math;
pub mod reslice;
pub mod stencil;
pub mod transform;
pub mod weights;

#[cfg(feature = "python")]
mod python;

use std::fmt::Debug;
use std::ops::{AddAssign, MulAssign};

pub use half::f16;
use serde::{Deserialize, Serialize};

pub use coefficients::BSplineCoefficients;
pub use error::{ResliceError, Result};
pub use grid_gen::{DisplacementGrid, TransformToGrid};
pub use image::{AnyImage, Extent, Geometry, GridView, ImageData, Scalar, ScalarType};
pub use interpolator::{BoundInterpolator, InterpolationMode, Interpolator, Kernel};
pub use math::BorderMode;
pub use reslice::{Reslice, ResliceConfig, ResliceOutput, SlabMode};
pub use stencil::ImageStencil;
pub use transform::bspline::{BSplineBorder, BSplineTransform};
pub use transform::grid::GridTransform;
pub use transform::{InverseResult, LinearTransform, NewtonSettings, Transform};
pub use weights::InterpolationWeights;

/// 4x4 homogeneous matrix (row-major)
///
/// Points are column vectors:
/// ```text
/// [x']   [m00 m01 m02 m03] [x]
/// [y'] = [m10 m11 m12 m13] [y]
/// [z']   [m20 m21 m22 m23] [z]
/// [w']   [m30 m31 m32 m33] [1]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Matrix4 {
    pub m: [[f64; 4]; 4],
}

impl Matrix4 {
    /// Create a new matrix from a 4x4 array
    #[inline]
    pub fn new(m: [[f64; 4]; 4]) -> Self {
        Self { m }
    }

    /// Create an identity matrix
    #[inline]
    pub fn identity() -> Self {
        Self {
            m: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
                [0.0, 0.0, 0.0, 1.0],
            ],
        }
    }

    /// Create a translation matrix
    #[inline]
    pub fn translation(tx: f64, ty: f64, tz: f64) -> Self {
        let mut out = Self::identity();
        out.m[0][3] = tx;
        out.m[1][3] = ty;
        out.m[2][3] = tz;
        out
    }

    /// Create a scaling matrix
    #[inline]
    pub fn scale(sx: f64, sy: f64, sz: f64) -> Self {
        let mut out = Self::identity();
        out.m[0][0] = sx;
        out.m[1][1] = sy;
        out.m[2][2] = sz;
        out
    }

    /// Create a rotation matrix around the Z axis (in radians)
    #[inline]
    pub fn rotate_z(angle: f64) -> Self {
        let (s, c) = angle.sin_cos();
        let mut out = Self::identity();
        out.m[0][0] = c;
        out.m[0][1] = -s;
        out.m[1][0] = s;
        out.m[1][1] = c;
        out
    }

    /// Create a rotation matrix around the Y axis (in radians)
    #[inline]
    pub fn rotate_y(angle: f64) -> Self {
        let (s, c) = angle.sin_cos();
        let mut out = Self::identity();
        out.m[0][0] = c;
        out.m[0][2] = s;
        out.m[2][0] = -s;
        out.m[2][2] = c;
        out
    }

    /// Create a rotation matrix around the X axis (in radians)
    #[inline]
    pub fn rotate_x(angle: f64) -> Self {
        let (s, c) = angle.sin_cos();
        let mut out = Self::identity();
        out.m[1][1] = c;
        out.m[1][2] = -s;
        out.m[2][1] = s;
        out.m[2][2] = c;
        out
    }

    /// Axes matrix from three direction cosines (columns) and an origin
    pub fn from_axes(x: [f64; 3], y: [f64; 3], z: [f64; 3], origin: [f64; 3]) -> Self {
        let mut out = Self::identity();
        for i in 0..3 {
            out.m[i][0] = x[i];
            out.m[i][1] = y[i];
            out.m[i][2] = z[i];
            out.m[i][3] = origin[i];
        }
        out
    }

    /// Matrix product `self * other` (apply `other` first)
    pub fn multiply(&self, other: &Matrix4) -> Matrix4 {
        let mut out = [[0.0; 4]; 4];
        for (i, row) in out.iter_mut().enumerate() {
            for (j, v) in row.iter_mut().enumerate() {
                *v = (0..4).map(|k| self.m[i][k] * other.m[k][j]).sum();
            }
        }
        Matrix4 { m: out }
    }

    /// Inverse by Gauss-Jordan elimination with partial pivoting
    pub fn invert(&self) -> Option<Matrix4> {
        let mut a = self.m;
        let mut inv = Self::identity().m;
        for col in 0..4 {
            let pivot = (col..4).max_by(|&r1, &r2| {
                a[r1][col]
                    .abs()
                    .partial_cmp(&a[r2][col].abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })?;
            if a[pivot][col].abs() < 1e-300 {
                return None;
            }
            a.swap(col, pivot);
            inv.swap(col, pivot);
            let d = 1.0 / a[col][col];
            for j in 0..4 {
                a[col][j] *= d;
                inv[col][j] *= d;
            }
            for r in 0..4 {
                if r != col {
                    let f = a[r][col];
                    if f != 0.0 {
                        for j in 0..4 {
                            a[r][j] -= f * a[col][j];
                            inv[r][j] -= f * inv[col][j];
                        }
                    }
                }
            }
        }
        Some(Matrix4 { m: inv })
    }

    /// Multiply a homogeneous point
    #[inline]
    pub fn multiply_point(&self, p: [f64; 4]) -> [f64; 4] {
        let m = &self.m;
        [
            m[0][0] * p[0] + m[0][1] * p[1] + m[0][2] * p[2] + m[0][3] * p[3],
            m[1][0] * p[0] + m[1][1] * p[1] + m[1][2] * p[2] + m[1][3] * p[3],
            m[2][0] * p[0] + m[2][1] * p[1] + m[2][2] * p[2] + m[2][3] * p[3],
            m[3][0] * p[0] + m[3][1] * p[1] + m[3][2] * p[2] + m[3][3] * p[3],
        ]
    }

    /// Transform a 3D point, including the perspective divide
    #[inline]
    pub fn transform_point(&self, p: [f64; 3]) -> [f64; 3] {
        let q = self.multiply_point([p[0], p[1], p[2], 1.0]);
        if q[3] != 1.0 {
            let f = 1.0 / q[3];
            [q[0] * f, q[1] * f, q[2] * f]
        } else {
            [q[0], q[1], q[2]]
        }
    }

    /// Upper-left 3x3 block
    #[inline]
    pub fn linear_part(&self) -> [[f64; 3]; 3] {
        let m = &self.m;
        [
            [m[0][0], m[0][1], m[0][2]],
            [m[1][0], m[1][1], m[1][2]],
            [m[2][0], m[2][1], m[2][2]],
        ]
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::identity()
    }

    pub fn has_perspective(&self) -> bool {
        self.m[3][0] != 0.0 || self.m[3][1] != 0.0 || self.m[3][2] != 0.0 || self.m[3][3] != 1.0
    }

    /// True for permutation + scale + translation matrices: each of the first
    /// three columns has exactly one non-zero entry and the last row is `[0, 0, 0, 1]`.
    pub fn is_permutation(&self) -> bool {
        if self.has_perspective() {
            return false;
        }
        (0..3).all(|j| (0..3).filter(|&i| self.m[i][j] != 0.0).count() == 1)
    }

    /// Get the flat row-major representation
    #[inline]
    pub fn as_flat(&self) -> [f64; 16] {
        let mut out = [0.0; 16];
        for i in 0..4 {
            out[4 * i..4 * i + 4].copy_from_slice(&self.m[i]);
        }
        out
    }
}

impl Default for Matrix4 {
    fn default() -> Self {
        Self::identity()
    }
}

/// Floating-point type used for interpolation arithmetic (`f32` or `f64`)
pub trait Real:
    num_traits::Float + AddAssign + MulAssign + Send + Sync + Default + Debug + 'static
{
    fn from_f64(v: f64) -> Self;
    fn as_f64(self) -> f64;
}

impl Real for f32 {
    #[inline]
    fn from_f64(v: f64) -> Self {
        v as f32
    }
    #[inline]
    fn as_f64(self) -> f64 {
        self as f64
    }
}

impl Real for f64 {
    #[inline]
    fn from_f64(v: f64) -> Self {
        v
    }
    #[inline]
    fn as_f64(self) -> f64 {
        self
    }
}

/// Solve the 3x3 system `a * x = b` with partial pivoting.
///
/// Returns `None` when `a` is singular.
pub fn solve3x3(a: &[[f64; 3]; 3], b: &[f64; 3]) -> Option<[f64; 3]> {
    let mut m = [
        [a[0][0], a[0][1], a[0][2], b[0]],
        [a[1][0], a[1][1], a[1][2], b[1]],
        [a[2][0], a[2][1], a[2][2], b[2]],
    ];
    for col in 0..3 {
        let mut pivot = col;
        for r in col + 1..3 {
            if m[r][col].abs() > m[pivot][col].abs() {
                pivot = r;
            }
        }
        if m[pivot][col] == 0.0 || !m[pivot][col].is_finite() {
            return None;
        }
        m.swap(col, pivot);
        for r in col + 1..3 {
            let f = m[r][col] / m[col][col];
            for j in col..4 {
                m[r][j] -= f * m[col][j];
            }
        }
    }
    let mut x = [0.0; 3];
    for i in (0..3).rev() {
        let s: f64 = (i + 1..3).map(|j| m[i][j] * x[j]).sum();
        x[i] = (m[i][3] - s) / m[i][i];
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_matrix_constructors() {
        let identity = Matrix4::identity();
        assert!(identity.is_identity());
        assert!(identity.is_permutation());

        let scale = Matrix4::scale(2.0, 3.0, 4.0);
        assert_eq!(scale.m[0][0], 2.0);
        assert_eq!(scale.m[1][1], 3.0);
        assert_eq!(scale.m[2][2], 4.0);
        assert!(scale.is_permutation());
        assert!(!scale.is_identity());

        assert!(!Matrix4::rotate_z(0.1).is_permutation());
        assert!(Matrix4::rotate_z(std::f64::consts::FRAC_PI_2).linear_part()[0][0].abs() < 1e-15);
    }

    #[test]
    fn test_matrix_inverse_roundtrip() {
        let m = Matrix4::rotate_x(0.3)
            .multiply(&Matrix4::translation(1.0, -2.0, 5.0))
            .multiply(&Matrix4::scale(2.0, 0.5, 3.0));
        let inv = m.invert().unwrap();
        let p = [0.3, -1.2, 4.5];
        let q = inv.transform_point(m.transform_point(p));
        for i in 0..3 {
            assert_relative_eq!(q[i], p[i], epsilon = 1e-12);
        }
        let mut singular = Matrix4::identity();
        singular.m[1][1] = 0.0;
        assert!(singular.invert().is_none());
    }

    #[test]
    fn test_permutation_detection() {
        let mut swap = Matrix4::new([
            [0.0, 2.0, 0.0, 1.0],
            [0.0, 0.0, -1.0, 0.5],
            [3.0, 0.0, 0.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ]);
        assert!(swap.is_permutation());
        swap.m[3][0] = 0.1;
        assert!(!swap.is_permutation());
        assert!(swap.has_perspective());
    }

    #[test]
    fn test_solve3x3() {
        let a = [[2.0, 1.0, 0.0], [1.0, 3.0, 1.0], [0.0, 1.0, 4.0]];
        let x = [1.0, -2.0, 0.5];
        let b = [
            a[0][0] * x[0] + a[0][1] * x[1] + a[0][2] * x[2],
            a[1][0] * x[0] + a[1][1] * x[1] + a[1][2] * x[2],
            a[2][0] * x[0] + a[2][1] * x[1] + a[2][2] * x[2],
        ];
        let solved = solve3x3(&a, &b).unwrap();
        for i in 0..3 {
            assert_relative_eq!(solved[i], x[i], epsilon = 1e-12);
        }
        assert!(solve3x3(&[[1.0, 2.0, 3.0], [2.0, 4.0, 6.0], [0.0, 0.0, 1.0]], &b).is_none());
    }
}
