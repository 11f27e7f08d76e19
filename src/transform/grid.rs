//! Displacement-grid transform
//!
//! A [`GridTransform`] maps a world point `p` to `p + scale * d(p) + shift`,
//! where `d` is a three-component displacement grid interpolated with a
//! nearest, trilinear or tricubic kernel. The inverse is found with the damped
//! Newton iteration in [`super::newton_inverse`].
//!
//! # Features
//!
//! - **Storage types**: `i8`, `u8`, `i16`, `u16`, `f32` and `f64` grids
//! - **Kernels with derivatives**: every kernel also yields `d displacement / d index`
//! - **Borders**: clamp lowers the cubic order near the edge; repeat and mirror
//!   keep the full four-tap kernel with border-mapped taps
//! - **Shared grids**: the grid is held by `Arc` and never copied

use std::sync::Arc;

use crate::error::Result;
use crate::image::{AnyImage, ImageData, Scalar, ScalarType};
use crate::interpolator::InterpolationMode;
use crate::math::{self, BorderMode};
use crate::with_image;

use super::{
    forward, forward_with_derivative, invert3, newton_inverse, validate_field, DisplacementField,
    InverseResult, Jacobian, NewtonSettings, Transform,
};

const GRID_TYPES: [ScalarType; 6] = [
    ScalarType::I8,
    ScalarType::U8,
    ScalarType::I16,
    ScalarType::U16,
    ScalarType::F32,
    ScalarType::F64,
];

/// Nonlinear transform defined by a displacement grid.
///
/// Without a grid (or after a grid was rejected) the transform is the identity.
#[derive(Debug, Clone)]
pub struct GridTransform {
    grid: Option<Arc<AnyImage>>,
    interpolation_mode: InterpolationMode,
    border_mode: BorderMode,
    displacement_scale: f64,
    displacement_shift: f64,
    newton: NewtonSettings,
}

impl Default for GridTransform {
    fn default() -> Self {
        Self {
            grid: None,
            interpolation_mode: InterpolationMode::Linear,
            border_mode: BorderMode::Clamp,
            displacement_scale: 1.0,
            displacement_shift: 0.0,
            newton: NewtonSettings::default(),
        }
    }
}

impl GridTransform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transform backed by `grid`, with linear interpolation and clamped borders.
    pub fn with_grid(grid: impl Into<Arc<AnyImage>>) -> Result<Self> {
        let mut out = Self::default();
        out.set_displacement_grid(grid)?;
        Ok(out)
    }

    /// Replace the displacement grid.
    ///
    /// A grid without exactly three components, with an empty extent, or with
    /// an unsupported storage type is rejected and the transform reverts to
    /// the identity.
    pub fn set_displacement_grid(&mut self, grid: impl Into<Arc<AnyImage>>) -> Result<()> {
        let grid = grid.into();
        match validate_field(&grid, &GRID_TYPES, "displacement grid") {
            Ok(()) => {
                self.grid = Some(grid);
                Ok(())
            }
            Err(e) => {
                self.grid = None;
                Err(e)
            }
        }
    }

    pub fn clear_displacement_grid(&mut self) {
        self.grid = None;
    }

    pub fn displacement_grid(&self) -> Option<&AnyImage> {
        self.grid.as_deref()
    }

    pub fn has_grid(&self) -> bool {
        self.grid.is_some()
    }

    pub fn interpolation_mode(&self) -> InterpolationMode {
        self.interpolation_mode
    }

    pub fn set_interpolation_mode(&mut self, mode: InterpolationMode) {
        self.interpolation_mode = mode;
    }

    pub fn border_mode(&self) -> BorderMode {
        self.border_mode
    }

    pub fn set_border_mode(&mut self, mode: BorderMode) {
        self.border_mode = mode;
    }

    pub fn displacement_scale(&self) -> f64 {
        self.displacement_scale
    }

    pub fn set_displacement_scale(&mut self, scale: f64) {
        self.displacement_scale = scale;
    }

    pub fn displacement_shift(&self) -> f64 {
        self.displacement_shift
    }

    pub fn set_displacement_shift(&mut self, shift: f64) {
        self.displacement_shift = shift;
    }

    pub fn newton_settings(&self) -> NewtonSettings {
        self.newton
    }

    pub fn set_newton_settings(&mut self, settings: NewtonSettings) {
        self.newton = settings;
    }

    fn field(&self) -> Option<GridField<'_>> {
        self.grid.as_deref().map(|image| GridField {
            image,
            mode: self.interpolation_mode,
            border: self.border_mode,
            scale: self.displacement_scale,
            shift: self.displacement_shift,
        })
    }
}

impl Transform for GridTransform {
    fn transform_point(&self, point: [f64; 3]) -> [f64; 3] {
        match self.field() {
            Some(field) => forward(&field, point),
            None => point,
        }
    }

    fn transform_point_with_derivative(&self, point: [f64; 3]) -> ([f64; 3], Jacobian) {
        match self.field() {
            Some(field) => forward_with_derivative(&field, point),
            None => (point, super::IDENTITY3),
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
            return (InverseResult::exact(point), super::IDENTITY3);
        };
        let (result, jacobian) = newton_inverse(&field, point, &self.newton);
        let jacobian = if result.converged {
            jacobian
        } else {
            forward_with_derivative(&field, result.point).1
        };
        (result, invert3(&jacobian).unwrap_or(super::IDENTITY3))
    }
}

// =============================================================================
// Kernels
// =============================================================================

struct GridField<'a> {
    image: &'a AnyImage,
    mode: InterpolationMode,
    border: BorderMode,
    scale: f64,
    shift: f64,
}

impl DisplacementField for GridField<'_> {
    fn origin(&self) -> [f64; 3] {
        self.image.geometry().origin
    }

    fn spacing(&self) -> [f64; 3] {
        self.image.geometry().spacing
    }

    fn displacement(&self, index: [f64; 3], derivative: Option<&mut Jacobian>) -> [f64; 3] {
        let mut raw_derivative = [[0.0; 3]; 3];
        let want = derivative.is_some();
        let raw = with_image!(self.image, img => {
            sample(img, self.mode, self.border, index, want.then_some(&mut raw_derivative))
        });
        if let Some(d) = derivative {
            for (row, raw_row) in d.iter_mut().zip(raw_derivative.iter()) {
                for (v, r) in row.iter_mut().zip(raw_row.iter()) {
                    *v = r * self.scale;
                }
            }
        }
        [
            raw[0] * self.scale + self.shift,
            raw[1] * self.scale + self.shift,
            raw[2] * self.scale + self.shift,
        ]
    }
}

/// Up to four taps along one axis, with value and derivative coefficients.
#[derive(Debug, Clone, Copy, Default)]
struct AxisTaps {
    offsets: [isize; 4],
    f: [f64; 4],
    g: [f64; 4],
    lo: usize,
    hi: usize,
}

fn sample<T: Scalar>(
    img: &ImageData<T>,
    mode: InterpolationMode,
    border: BorderMode,
    index: [f64; 3],
    derivative: Option<&mut Jacobian>,
) -> [f64; 3] {
    let extent = img.extent();
    let inc = img.increments();
    let data = img.as_slice();

    if mode == InterpolationMode::Nearest {
        return nearest(data, extent, inc, border, index, derivative);
    }

    let taps: [AxisTaps; 3] = std::array::from_fn(|axis| {
        let (lo, hi) = (extent.min(axis), extent.max(axis));
        match mode {
            InterpolationMode::Cubic => cubic_taps(index[axis], lo, hi, inc[axis], border),
            _ => linear_taps(index[axis], lo, hi, inc[axis], border),
        }
    });
    accumulate(data, &taps, derivative)
}

fn nearest<T: Scalar>(
    data: &[T],
    extent: crate::image::Extent,
    inc: [isize; 3],
    border: BorderMode,
    index: [f64; 3],
    derivative: Option<&mut Jacobian>,
) -> [f64; 3] {
    let mut id0 = [0isize; 3];
    let mut id1 = [0isize; 3];
    let mut id = [0isize; 3];
    for axis in 0..3 {
        let (lo, hi) = (extent.min(axis), extent.max(axis));
        let (i, f) = math::floor(index[axis]);
        id0[axis] = border.map(i, lo, hi) as isize * inc[axis];
        id1[axis] = border.map(i + 1, lo, hi) as isize * inc[axis];
        id[axis] = if f < 0.5 { id0[axis] } else { id1[axis] };
    }
    let at = |x: isize, y: isize, z: isize| -> [f64; 3] {
        let base = (x + y + z) as usize;
        [
            data[base].to_double(),
            data[base + 1].to_double(),
            data[base + 2].to_double(),
        ]
    };
    if let Some(d) = derivative {
        let pairs = [
            (at(id0[0], id[1], id[2]), at(id1[0], id[1], id[2])),
            (at(id[0], id0[1], id[2]), at(id[0], id1[1], id[2])),
            (at(id[0], id[1], id0[2]), at(id[0], id[1], id1[2])),
        ];
        for (axis, (v0, v1)) in pairs.iter().enumerate() {
            for c in 0..3 {
                d[c][axis] = v1[c] - v0[c];
            }
        }
    }
    at(id[0], id[1], id[2])
}

fn linear_taps(x: f64, lo: i32, hi: i32, inc: isize, border: BorderMode) -> AxisTaps {
    let (i, f) = math::floor(x);
    AxisTaps {
        offsets: [
            border.map(i, lo, hi) as isize * inc,
            border.map(i + 1, lo, hi) as isize * inc,
            0,
            0,
        ],
        f: [1.0 - f, f, 0.0, 0.0],
        g: [-1.0, 1.0, 0.0, 0.0],
        lo: 0,
        hi: 2,
    }
}

fn cubic_taps(x: f64, lo: i32, hi: i32, inc: isize, border: BorderMode) -> AxisTaps {
    let (i, mut f) = math::floor(x);
    let mut taps = AxisTaps::default();

    if border != BorderMode::Clamp {
        let (fc, gc) = cubic_coefficients(f, 7);
        taps.f = fc;
        taps.g = gc;
        taps.hi = 4;
        for l in 0..4 {
            taps.offsets[l] = border.map(i - 1 + l as i32, lo, hi) as isize * inc;
        }
        return taps;
    }

    // near the edge the kernel drops to quadratic, linear or constant
    let ext = hi - lo;
    let mut id0 = i - lo;
    let mut id1 = id0 + 1;
    let mut interp = 1;
    if id0 < 0 {
        id0 = 0;
        id1 = 0;
        interp = 0;
        f = 0.0;
    } else if id1 > ext {
        id0 = ext;
        id1 = ext;
        interp = 0;
        f = 0.0;
    }
    let mode = (((id0 > 0) as u8) << 2) | (((id1 < ext) as u8) << 1) | interp;
    let (fc, gc) = cubic_coefficients(f, mode);
    let (l0, l1) = match mode {
        7 => (0, 4),
        1 => (1, 3),
        3 => (1, 4),
        5 => (0, 3),
        _ => (1, 2),
    };
    taps.f = fc;
    taps.g = gc;
    taps.lo = l0;
    taps.hi = l1;
    for l in l0..l1 {
        taps.offsets[l] = (id0 - 1 + l as i32) as isize * inc;
    }
    taps
}

/// Value and derivative coefficients of the edge-aware cubic.
///
/// Bit 2 of `mode` is set when there is a sample before the interval, bit 1
/// when there is one after it, bit 0 when interpolation is needed at all.
fn cubic_coefficients(f: f64, mode: u8) -> ([f64; 4], [f64; 4]) {
    let fm1 = f - 1.0;
    match mode {
        7 => (
            [
                -f * fm1 * fm1 / 2.0,
                ((3.0 * f - 2.0) * f - 2.0) * fm1 / 2.0,
                -((3.0 * f - 4.0) * f - 1.0) * f / 2.0,
                f * f * fm1 / 2.0,
            ],
            [
                -((3.0 * f - 4.0) * f + 1.0) / 2.0,
                (9.0 * f - 10.0) * f / 2.0,
                -((9.0 * f - 8.0) * f - 1.0) / 2.0,
                (3.0 * f - 2.0) * f / 2.0,
            ],
        ),
        1 => ([0.0, 1.0 - f, f, 0.0], [0.0, -1.0, 1.0, 0.0]),
        3 => {
            let fm2 = fm1 - 1.0;
            (
                [0.0, fm1 * fm2 / 2.0, -f * fm2, f * fm1 / 2.0],
                [0.0, f - 1.5, 2.0 - 2.0 * f, f - 0.5],
            )
        }
        5 => {
            let fp1 = f + 1.0;
            (
                [f * fm1 / 2.0, -fp1 * fm1, fp1 * f / 2.0, 0.0],
                [f - 0.5, -2.0 * f, f + 0.5, 0.0],
            )
        }
        _ => ([0.0, 1.0, 0.0, 0.0], [0.0; 4]),
    }
}

fn accumulate<T: Scalar>(
    data: &[T],
    taps: &[AxisTaps; 3],
    derivative: Option<&mut Jacobian>,
) -> [f64; 3] {
    let [tx, ty, tz] = taps;
    let want = derivative.is_some();
    let mut disp = [0.0; 3];
    let mut d = [[0.0; 3]; 3];

    for j in tz.lo..tz.hi {
        for k in ty.lo..ty.hi {
            let row = tz.offsets[j] + ty.offsets[k];
            let fyz = ty.f[k] * tz.f[j];
            for l in tx.lo..tx.hi {
                let base = (row + tx.offsets[l]) as usize;
                let w = tx.f[l] * fyz;
                if want {
                    let gff = tx.g[l] * fyz;
                    let fgf = tx.f[l] * ty.g[k] * tz.f[j];
                    let ffg = tx.f[l] * ty.f[k] * tz.g[j];
                    for c in 0..3 {
                        let v = data[base + c].to_double();
                        disp[c] += v * w;
                        d[c][0] += v * gff;
                        d[c][1] += v * fgf;
                        d[c][2] += v * ffg;
                    }
                } else {
                    for c in 0..3 {
                        disp[c] += data[base + c].to_double() * w;
                    }
                }
            }
        }
    }
    if let Some(out) = derivative {
        *out = d;
    }
    disp
}
