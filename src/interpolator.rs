//! Image interpolators
//!
//! An [`Interpolator`] holds the kernel choice and sampling policy. Binding it
//! to an image with [`Interpolator::bind`] validates the parameters, rebuilds
//! any per-instance cache and returns a [`BoundInterpolator`], a read-only view
//! that can be shared by every worker thread of a resampling pass.
//!
//! # Features
//!
//! - **Kernels**: nearest, trilinear, 4-tap cubic and B-spline of degree 0 to 9
//! - **Border policies**: clamp, repeat and mirror applied per tap
//! - **Thin axes**: an axis with a single sample always collapses to one tap
//! - **Row interpolation**: separable weight tables for permutation matrices

#[cfg(feature = "kernel-table")]
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bspline::{self, MAX_DEGREE, MAX_KERNEL_SIZE};
#[cfg(feature = "kernel-table")]
use crate::bspline::KernelTable;
use crate::image::{Extent, Geometry, GridView, ImageData, Scalar};
use crate::math::{self, BorderMode, FLOOR_TOLERANCE};
use crate::weights::InterpolationWeights;
use crate::{Matrix4, Real};

// =============================================================================
// Kernel selection
// =============================================================================

/// Interpolation modes understood by the reslice engine and the grid transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterpolationMode {
    #[default]
    Nearest,
    Linear,
    Cubic,
}

impl InterpolationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            InterpolationMode::Nearest => "Nearest",
            InterpolationMode::Linear => "Linear",
            InterpolationMode::Cubic => "Cubic",
        }
    }
}

/// Closed set of separable interpolation kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Kernel {
    Nearest,
    Linear,
    Cubic,
    BSpline { degree: usize },
}

impl Default for Kernel {
    fn default() -> Self {
        Kernel::Linear
    }
}

impl From<InterpolationMode> for Kernel {
    fn from(mode: InterpolationMode) -> Self {
        match mode {
            InterpolationMode::Nearest => Kernel::Nearest,
            InterpolationMode::Linear => Kernel::Linear,
            InterpolationMode::Cubic => Kernel::Cubic,
        }
    }
}

impl Kernel {
    /// B-spline kernel with the degree clamped to `0..=9`.
    pub fn bspline(degree: usize) -> Self {
        Kernel::BSpline {
            degree: degree.min(MAX_DEGREE),
        }
    }

    /// Number of taps per axis.
    #[inline]
    pub fn size(self) -> usize {
        match self {
            Kernel::Nearest => 1,
            Kernel::Linear => 2,
            Kernel::Cubic => 4,
            Kernel::BSpline { degree } => degree + 1,
        }
    }

    /// Closest plain interpolation mode; B-splines overshoot like cubics.
    pub fn mode(self) -> InterpolationMode {
        match self {
            Kernel::Nearest => InterpolationMode::Nearest,
            Kernel::Linear => InterpolationMode::Linear,
            Kernel::Cubic | Kernel::BSpline { .. } => InterpolationMode::Cubic,
        }
    }

    /// Every kernel in this crate is a product of 1D kernels.
    pub fn is_separable(self) -> bool {
        true
    }

    fn normalized(self) -> Self {
        match self {
            Kernel::BSpline { degree } => Kernel::bspline(degree),
            other => other,
        }
    }
}

/// 4-tap cubic (Catmull-Rom) weights for taps `-1, 0, 1, 2`.
#[inline]
pub fn cubic_weights<F: Real>(f: F) -> [F; 4] {
    let half = F::from_f64(0.5);
    let two = F::from_f64(2.0);
    let three = F::from_f64(3.0);
    let four = F::from_f64(4.0);
    let fm1 = f - F::one();
    let fd2 = f * half;
    let ft3 = f * three;
    [
        -fd2 * fm1 * fm1,
        ((ft3 - two) * fd2 - F::one()) * fm1,
        -((ft3 - four) * f - F::one()) * fd2,
        f * fd2 * fm1,
    ]
}

// =============================================================================
// Interpolator
// =============================================================================

/// Sampling policy shared by all kernels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpolatorSettings {
    pub kernel: Kernel,
    pub border_mode: BorderMode,
    /// How far outside the extent (in index units) a point still counts as inside.
    pub tolerance: f64,
    /// Value written by [`BoundInterpolator::interpolate`] for points outside the bounds.
    pub out_value: f64,
    pub component_offset: usize,
    /// Number of components to produce; `None` means all after the offset.
    pub component_count: Option<usize>,
}

impl Default for InterpolatorSettings {
    fn default() -> Self {
        Self {
            kernel: Kernel::Linear,
            border_mode: BorderMode::Clamp,
            tolerance: FLOOR_TOLERANCE,
            out_value: 0.0,
            component_offset: 0,
            component_count: None,
        }
    }
}

/// Interpolator configuration plus its instance-owned caches.
#[derive(Debug, Clone, Default)]
pub struct Interpolator {
    settings: InterpolatorSettings,
    #[cfg(feature = "kernel-table")]
    table: Option<Arc<KernelTable>>,
}

impl Interpolator {
    pub fn new(settings: InterpolatorSettings) -> Self {
        let mut settings = settings;
        settings.kernel = settings.kernel.normalized();
        Self {
            settings,
            #[cfg(feature = "kernel-table")]
            table: None,
        }
    }

    pub fn with_kernel(kernel: Kernel) -> Self {
        Self::new(InterpolatorSettings {
            kernel,
            ..InterpolatorSettings::default()
        })
    }

    pub fn settings(&self) -> &InterpolatorSettings {
        &self.settings
    }

    pub fn kernel(&self) -> Kernel {
        self.settings.kernel
    }

    pub fn set_kernel(&mut self, kernel: Kernel) {
        self.settings.kernel = kernel.normalized();
    }

    pub fn set_interpolation_mode(&mut self, mode: InterpolationMode) {
        self.settings.kernel = mode.into();
    }

    /// Switch to a B-spline kernel; degrees above 9 are clamped.
    pub fn set_spline_degree(&mut self, degree: usize) {
        if degree > MAX_DEGREE {
            tracing::warn!(degree, max = MAX_DEGREE, "spline degree clamped");
        }
        self.settings.kernel = Kernel::bspline(degree);
    }

    pub fn border_mode(&self) -> BorderMode {
        self.settings.border_mode
    }

    pub fn set_border_mode(&mut self, mode: BorderMode) {
        self.settings.border_mode = mode;
    }

    pub fn tolerance(&self) -> f64 {
        self.settings.tolerance
    }

    pub fn set_tolerance(&mut self, tolerance: f64) {
        self.settings.tolerance = tolerance.max(0.0);
    }

    pub fn set_out_value(&mut self, value: f64) {
        self.settings.out_value = value;
    }

    pub fn set_component_offset(&mut self, offset: usize) {
        self.settings.component_offset = offset;
    }

    pub fn set_component_count(&mut self, count: Option<usize>) {
        self.settings.component_count = count;
    }

    pub fn is_separable(&self) -> bool {
        self.settings.kernel.is_separable()
    }

    /// Kernel width along each input axis for sampling through `matrix`.
    ///
    /// For the plain kernels, a row of the index matrix whose linear part is
    /// integral needs no support beyond one tap. B-spline kernels always use
    /// their full width because the image holds coefficients, not samples.
    pub fn compute_support_size(&self, matrix: Option<&Matrix4>) -> [usize; 3] {
        let s = self.settings.kernel.size();
        let mut size = [s; 3];
        if matches!(self.settings.kernel, Kernel::BSpline { .. }) {
            return size;
        }
        let Some(matrix) = matrix else {
            return size;
        };
        if matrix.has_perspective() {
            return size;
        }
        for (i, row) in matrix.m.iter().take(3).enumerate() {
            let integer_row = row[..3].iter().all(|&x| math::floor(x).1 == 0.0);
            if integer_row {
                size[i] = 1;
            }
        }
        size
    }

    /// Rebuild caches that depend on the parameters.
    fn update(&mut self) {
        #[cfg(feature = "kernel-table")]
        {
            if let Kernel::BSpline { degree } = self.settings.kernel {
                let stale = self.table.as_ref().map_or(true, |t| t.degree() != degree);
                if stale {
                    tracing::debug!(degree, "building B-spline kernel table");
                    self.table = Some(Arc::new(KernelTable::new(degree)));
                }
            }
        }
    }

    /// Prepare to sample `image`.
    ///
    /// Must be called once, before any worker thread starts; the returned view
    /// is immutable and `Sync`.
    pub fn bind<'a, T: Scalar>(&mut self, image: &'a ImageData<T>) -> BoundInterpolator<'a, T> {
        self.update();

        let grid = image.view();
        let extent = grid.extent;
        let total = grid.components.max(1);
        let component_offset = self.settings.component_offset.min(total - 1);
        let components = self
            .settings
            .component_count
            .unwrap_or(total)
            .clamp(1, total - component_offset);

        let tol = self.settings.tolerance;
        let mut bounds = [0.0; 6];
        for axis in 0..3 {
            // single-slice axes accept half a voxel on either side
            let t = if extent.min(axis) == extent.max(axis) {
                tol.max(0.5)
            } else {
                tol
            };
            bounds[2 * axis] = extent.min(axis) as f64 - t;
            bounds[2 * axis + 1] = extent.max(axis) as f64 + t;
        }

        BoundInterpolator {
            grid,
            geometry: image.geometry(),
            kernel: self.settings.kernel,
            border_mode: self.settings.border_mode,
            out_value: self.settings.out_value,
            component_offset,
            components,
            bounds,
            #[cfg(feature = "kernel-table")]
            table: self.table.clone(),
        }
    }
}

// =============================================================================
// Bound interpolator
// =============================================================================

/// An interpolator attached to one image.
#[derive(Debug, Clone)]
pub struct BoundInterpolator<'a, T> {
    grid: GridView<'a, T>,
    geometry: Geometry,
    kernel: Kernel,
    border_mode: BorderMode,
    out_value: f64,
    component_offset: usize,
    components: usize,
    bounds: [f64; 6],
    #[cfg(feature = "kernel-table")]
    table: Option<Arc<KernelTable>>,
}

impl<'a, T: Scalar> BoundInterpolator<'a, T> {
    #[inline]
    pub fn kernel(&self) -> Kernel {
        self.kernel
    }

    #[inline]
    pub fn border_mode(&self) -> BorderMode {
        self.border_mode
    }

    #[inline]
    pub fn extent(&self) -> Extent {
        self.grid.extent
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Number of components written per sample.
    #[inline]
    pub fn number_of_components(&self) -> usize {
        self.components
    }

    /// Extent expanded by the tolerance, as `[xmin, xmax, ymin, ymax, zmin, zmax]`.
    pub fn structured_bounds(&self) -> [f64; 6] {
        self.bounds
    }

    /// True when a continuous index lies within the tolerance-expanded extent.
    #[inline]
    pub fn check_bounds_ijk(&self, p: [f64; 3]) -> bool {
        let b = &self.bounds;
        p[0] >= b[0] && p[0] <= b[1] && p[1] >= b[2] && p[1] <= b[3] && p[2] >= b[4] && p[2] <= b[5]
    }

    /// Interpolate at a world point.
    ///
    /// Returns `false` and writes the out value when the point is outside the
    /// bounds.
    pub fn interpolate(&self, point: [f64; 3], out: &mut [f64]) -> bool {
        let p = self.geometry.world_to_index(point);
        if self.check_bounds_ijk(p) {
            self.interpolate_ijk(p, out);
            true
        } else {
            for v in out.iter_mut().take(self.components) {
                *v = self.out_value;
            }
            false
        }
    }

    /// Interpolate one component at a world point; the out value when outside.
    pub fn interpolate_component(&self, point: [f64; 3], component: usize) -> f64 {
        let total = self.grid.components;
        let mut single = self.clone();
        single.component_offset = (self.component_offset + component).min(total - 1);
        single.components = 1;
        let mut v = [0.0];
        single.interpolate(point, &mut v);
        v[0]
    }

    /// Interpolate at a continuous index, without a bounds check.
    ///
    /// `out` must hold at least [`number_of_components`](Self::number_of_components) values.
    #[inline]
    pub fn interpolate_ijk<F: Real>(&self, p: [F; 3], out: &mut [F]) {
        match self.kernel {
            Kernel::Nearest => self.nearest(p, out),
            Kernel::Linear => self.trilinear(p, out),
            Kernel::Cubic => self.tricubic(p, out),
            Kernel::BSpline { degree } => self.bspline(p, out, degree),
        }
    }

    #[inline]
    fn map(&self, i: i32, axis: usize) -> isize {
        let e = &self.grid.extent;
        self.border_mode.map(i, e.min(axis), e.max(axis)) as isize * self.grid.increments[axis]
    }

    #[inline]
    fn sample<F: Real>(&self, offset: isize) -> F {
        F::from_f64(self.grid.at(offset))
    }

    fn nearest<F: Real>(&self, p: [F; 3], out: &mut [F]) {
        let offset = self.component_offset as isize
            + self.map(math::round(p[0]), 0)
            + self.map(math::round(p[1]), 1)
            + self.map(math::round(p[2]), 2);
        for (c, v) in out.iter_mut().take(self.components).enumerate() {
            *v = self.sample(offset + c as isize);
        }
    }

    fn trilinear<F: Real>(&self, p: [F; 3], out: &mut [F]) {
        let (ix, fx) = math::floor(p[0]);
        let (iy, fy) = math::floor(p[1]);
        let (iz, fz) = math::floor(p[2]);

        let x0 = self.map(ix, 0);
        let x1 = self.map(ix + (fx != F::zero()) as i32, 0);
        let y0 = self.map(iy, 1);
        let y1 = self.map(iy + (fy != F::zero()) as i32, 1);
        let z0 = self.map(iz, 2);
        let z1 = self.map(iz + (fz != F::zero()) as i32, 2);

        let i00 = y0 + z0;
        let i01 = y0 + z1;
        let i10 = y1 + z0;
        let i11 = y1 + z1;

        let rx = F::one() - fx;
        let ry = F::one() - fy;
        let rz = F::one() - fz;
        let ryrz = ry * rz;
        let ryfz = ry * fz;
        let fyrz = fy * rz;
        let fyfz = fy * fz;

        let base = self.component_offset as isize;
        for (c, v) in out.iter_mut().take(self.components).enumerate() {
            let p0 = base + c as isize + x0;
            let p1 = base + c as isize + x1;
            *v = rx
                * (ryrz * self.sample(p0 + i00)
                    + ryfz * self.sample(p0 + i01)
                    + fyrz * self.sample(p0 + i10)
                    + fyfz * self.sample(p0 + i11))
                + fx * (ryrz * self.sample(p1 + i00)
                    + ryfz * self.sample(p1 + i01)
                    + fyrz * self.sample(p1 + i10)
                    + fyfz * self.sample(p1 + i11));
        }
    }

    fn tricubic<F: Real>(&self, p: [F; 3], out: &mut [F]) {
        let (ix, fx) = math::floor(p[0]);
        let (iy, fy) = math::floor(p[1]);
        let (iz, fz) = math::floor(p[2]);

        let mut fact = [[0isize; 4]; 3];
        for (l, d) in (-1..=2).enumerate() {
            fact[0][l] = self.map(ix + d, 0);
            fact[1][l] = self.map(iy + d, 1);
            fact[2][l] = self.map(iz + d, 2);
        }

        let wx = cubic_weights(fx);
        let mut wy = cubic_weights(fy);
        let mut wz = cubic_weights(fz);

        // only the centre tap when the axis is a single slice or the fraction is zero
        let e = &self.grid.extent;
        let multiple_y = e.min(1) != e.max(1) && fy != F::zero();
        let multiple_z = e.min(2) != e.max(2) && fz != F::zero();
        let (j1, j2) = if multiple_y { (0, 3) } else { (1, 1) };
        let (k1, k2) = if multiple_z { (0, 3) } else { (1, 1) };
        if !multiple_y {
            wy[1] = F::one();
        }
        if !multiple_z {
            wz[1] = F::one();
        }

        let base = self.component_offset as isize;
        for (c, v) in out.iter_mut().take(self.components).enumerate() {
            let ptr = base + c as isize;
            let mut val = F::zero();
            for k in k1..=k2 {
                for j in j1..=j2 {
                    let fzy = wz[k] * wy[j];
                    let row = ptr + fact[2][k] + fact[1][j];
                    val += fzy
                        * (wx[0] * self.sample(row + fact[0][0])
                            + wx[1] * self.sample(row + fact[0][1])
                            + wx[2] * self.sample(row + fact[0][2])
                            + wx[3] * self.sample(row + fact[0][3]));
                }
            }
            *v = val;
        }
    }

    fn bspline<F: Real>(&self, p: [F; 3], out: &mut [F], degree: usize) {
        let offset = bspline::sample_offset::<F>(degree);
        let first = bspline::first_tap(degree);
        let e = self.grid.extent;

        let mut fact = [[0isize; MAX_KERNEL_SIZE]; 3];
        let mut w = [[F::zero(); MAX_KERNEL_SIZE]; 3];
        let mut taps = [1usize; 3];
        for axis in 0..3 {
            if e.min(axis) == e.max(axis) {
                fact[axis][0] = 0;
                w[axis][0] = F::one();
                continue;
            }
            let (i, t) = math::floor(p[axis] + offset);
            for l in 0..=degree {
                fact[axis][l] = self.map(i + first + l as i32, axis);
            }
            self.basis_weights(&mut w[axis], t, degree);
            taps[axis] = degree + 1;
        }

        let base = self.component_offset as isize;
        for (c, v) in out.iter_mut().take(self.components).enumerate() {
            let ptr = base + c as isize;
            let mut val = F::zero();
            for k in 0..taps[2] {
                for j in 0..taps[1] {
                    let fzy = w[2][k] * w[1][j];
                    let row = ptr + fact[2][k] + fact[1][j];
                    let mut vx = F::zero();
                    for l in 0..taps[0] {
                        vx += w[0][l] * self.sample(row + fact[0][l]);
                    }
                    val += fzy * vx;
                }
            }
            *v = val;
        }
    }

    #[inline]
    fn basis_weights<F: Real>(&self, w: &mut [F], t: F, degree: usize) {
        #[cfg(feature = "kernel-table")]
        {
            if let Some(table) = &self.table {
                table.weights(w, t);
                return;
            }
        }
        bspline::interpolation_weights(w, t, degree);
    }

    // =========================================================================
    // Weight precomputation
    // =========================================================================

    /// Per-axis weight tables for an output extent sampled through `matrix`.
    ///
    /// `matrix` must be a permutation, scale and translation matrix. The second
    /// return value is the part of `out_ext` whose samples fall inside the
    /// bounds; when no sample does, it is empty (`max = min - 1` on every axis).
    pub fn precompute_weights<F: Real>(
        &self,
        matrix: &Matrix4,
        out_ext: Extent,
    ) -> (InterpolationWeights<F>, Extent) {
        let m = &matrix.m;
        let e = self.grid.extent;

        // input axis feeding each output axis
        let mut input_axis = [0usize; 3];
        let mut kernel_size = [1usize; 3];
        for j in 0..3 {
            let k = (0..3).find(|&k| m[k][j] != 0.0).unwrap_or(j);
            input_axis[j] = k;
            let in_count = e.len(k);
            kernel_size[j] = match self.kernel {
                Kernel::BSpline { degree } => (degree + 1).min(in_count),
                kernel => {
                    let step = kernel.size().min(in_count);
                    // output samples land exactly on input samples
                    if math::floor(m[k][j]).1 == 0.0 && math::floor(m[k][3]).1 == 0.0 {
                        1
                    } else {
                        step
                    }
                }
            };
        }

        let nearest = self.kernel == Kernel::Nearest;
        let mut weights = InterpolationWeights::<F>::with_capacity(out_ext, kernel_size, nearest);
        let mut clip = out_ext;
        let mut valid = true;

        for j in 0..3 {
            let k = input_axis[j];
            let step = kernel_size[j];
            let (min_ext, max_ext) = (e.min(k), e.max(k));
            let in_count = e.len(k);
            let inc = self.grid.increments[k];
            let (min_bound, max_bound) = (self.bounds[2 * k], self.bounds[2 * k + 1]);

            let mut region = 0;
            for i in out_ext.min(j)..=out_ext.max(j) {
                let point = m[k][3] + i as f64 * m[k][j];
                let s = weights.start(j, i);
                let positions = &mut weights.positions[j][s..s + step];
                let constants: &mut [F] = if nearest {
                    &mut []
                } else {
                    &mut weights.weights[j][s..s + step]
                };

                match self.kernel {
                    Kernel::Nearest => {
                        positions[0] = self.border_mode.map(math::round(point), min_ext, max_ext)
                            as isize
                            * inc;
                    }
                    Kernel::Linear => {
                        let (i0, f) = math::floor(point);
                        positions[0] = self.border_mode.map(i0, min_ext, max_ext) as isize * inc;
                        constants[0] = F::one();
                        if step > 1 {
                            positions[1] =
                                self.border_mode.map(i0 + 1, min_ext, max_ext) as isize * inc;
                            constants[0] = F::from_f64(1.0 - f);
                            constants[1] = F::from_f64(f);
                        }
                    }
                    Kernel::Cubic => {
                        let (i0, f) = math::floor(point);
                        if step == 1 {
                            positions[0] =
                                self.border_mode.map(i0, min_ext, max_ext) as isize * inc;
                            constants[0] = F::one();
                        } else {
                            let g = cubic_weights(F::from_f64(f));
                            let ids: [usize; 4] = std::array::from_fn(|l| {
                                self.border_mode.map(i0 - 1 + l as i32, min_ext, max_ext)
                            });
                            if step == 4 {
                                for l in 0..4 {
                                    positions[l] = ids[l] as isize * inc;
                                    constants[l] = g[l];
                                }
                            } else {
                                // fewer than four samples: fold the taps onto the ones that exist
                                let mut gg = [F::zero(); 4];
                                for l in 0..4 {
                                    gg[ids[l]] += g[l];
                                }
                                for jj in 0..step {
                                    positions[jj] = jj as isize * inc;
                                    constants[jj] = gg[jj];
                                }
                            }
                        }
                    }
                    Kernel::BSpline { degree } => {
                        if in_count == 1 {
                            positions[0] = 0;
                            constants[0] = F::one();
                        } else {
                            let taps = degree + 1;
                            let (idx, t) =
                                math::floor(F::from_f64(point) + bspline::sample_offset::<F>(degree));
                            let idx = idx + bspline::first_tap(degree);
                            let mut g = [F::zero(); MAX_KERNEL_SIZE];
                            self.basis_weights(&mut g, t, degree);
                            let mut ids = [0usize; MAX_KERNEL_SIZE];
                            for (l, id) in ids.iter_mut().take(taps).enumerate() {
                                *id = self.border_mode.map(idx + l as i32, min_ext, max_ext);
                            }
                            if step == taps {
                                for l in 0..taps {
                                    positions[l] = ids[l] as isize * inc;
                                    constants[l] = g[l];
                                }
                            } else {
                                let mut gg = [F::zero(); MAX_KERNEL_SIZE];
                                for l in 0..taps {
                                    gg[ids[l]] += g[l];
                                }
                                for l in 0..step {
                                    positions[l] = l as isize * inc;
                                    constants[l] = gg[l];
                                }
                            }
                        }
                    }
                }

                if point >= min_bound && point <= max_bound {
                    if region == 0 {
                        region = 1;
                        clip.0[2 * j] = i;
                    }
                } else if region == 1 {
                    region = 2;
                    clip.0[2 * j + 1] = i - 1;
                }
            }

            if region == 0 || clip.min(j) > clip.max(j) {
                valid = false;
            }
        }

        if !valid {
            for j in 0..3 {
                clip.0[2 * j] = out_ext.min(j);
                clip.0[2 * j + 1] = out_ext.min(j) - 1;
            }
        }

        (weights, clip)
    }

    /// Interpolate `out.len() / components` consecutive samples along output x,
    /// starting at output index `id`, from precomputed weights.
    pub fn interpolate_row<F: Real>(&self, weights: &InterpolationWeights<F>, id: [i32; 3], out: &mut [F]) {
        let nc = self.components;
        let base = self.component_offset as isize;
        let iy = weights.taps(1, id[1]);
        let iz = weights.taps(2, id[2]);

        if !weights.has_weights() {
            let row = base + iy[0] + iz[0];
            for (i, px) in out.chunks_exact_mut(nc).enumerate() {
                let x = weights.taps(0, id[0] + i as i32)[0];
                for (c, v) in px.iter_mut().enumerate() {
                    *v = self.sample(row + x + c as isize);
                }
            }
            return;
        }

        // combine the y and z taps once for the whole row
        let fy = weights.tap_weights(1, id[1]);
        let fz = weights.tap_weights(2, id[2]);
        let mut yz = [(0isize, F::zero()); MAX_KERNEL_SIZE * MAX_KERNEL_SIZE];
        let mut count = 0;
        for (&pz, &wz) in iz.iter().zip(fz) {
            if wz == F::zero() {
                continue;
            }
            for (&py, &wy) in iy.iter().zip(fy) {
                yz[count] = (pz + py, wz * wy);
                count += 1;
            }
        }
        let yz = &yz[..count];

        for (i, px) in out.chunks_exact_mut(nc).enumerate() {
            let xi = id[0] + i as i32;
            let ix = weights.taps(0, xi);
            let fx = weights.tap_weights(0, xi);
            for (c, v) in px.iter_mut().enumerate() {
                let ptr = base + c as isize;
                let mut acc = F::zero();
                for &(off, wzy) in yz {
                    let row = ptr + off;
                    let mut vx = F::zero();
                    for (&p, &wx) in ix.iter().zip(fx) {
                        vx += wx * self.sample(row + p);
                    }
                    acc += wzy * vx;
                }
                *v = acc;
            }
        }
    }

    /// Copy `out.len() / components` samples straight from nearest-neighbour
    /// tables, with no floating-point staging.
    pub fn copy_row<F: Real, O: Scalar>(&self, weights: &InterpolationWeights<F>, id: [i32; 3], out: &mut [O]) {
        let nc = self.components;
        let row = self.component_offset as isize + weights.taps(1, id[1])[0] + weights.taps(2, id[2])[0];
        for (i, px) in out.chunks_exact_mut(nc).enumerate() {
            let x = weights.taps(0, id[0] + i as i32)[0];
            for (c, v) in px.iter_mut().enumerate() {
                *v = O::from_double_round(self.grid.at(row + x + c as isize));
            }
        }
    }

    /// Copy the voxel at an integer index, ignoring the border mode.
    ///
    /// Returns `false` when the index is outside the extent.
    #[inline]
    pub fn copy_voxel<O: Scalar>(&self, index: [i32; 3], out: &mut [O]) -> bool {
        let e = &self.grid.extent;
        if !e.contains(index) {
            return false;
        }
        let inc = &self.grid.increments;
        let offset = self.component_offset as isize
            + (index[0] - e.min(0)) as isize * inc[0]
            + (index[1] - e.min(1)) as isize * inc[1]
            + (index[2] - e.min(2)) as isize * inc[2];
        for (c, v) in out.iter_mut().take(self.components).enumerate() {
            *v = O::from_double_round(self.grid.at(offset + c as isize));
        }
        true
    }
}
