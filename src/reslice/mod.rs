//! Reslice engine
//!
//! [`Reslice`] resamples an image onto a new grid. Every output voxel index
//! is mapped to an input index through the index matrix (output placement,
//! reslice axes, linear transform, input placement) and, when one is set, a
//! nonlinear [`Transform`] applied in world coordinates.
//!
//! # Features
//!
//! - **Generic path**: per-voxel mapping with perspective, nonlinear
//!   transforms and thick slabs; out-of-bounds runs filled in one go
//! - **Permute path**: precomputed per-axis weights when the index matrix is
//!   a permutation, scale and translation
//! - **Copy paths**: nearest-neighbour sampling without float staging
//! - **Stencils**: excluded runs become background; an output stencil records
//!   the voxels that came from the input
//! - **Conversion**: scalar shift/scale, clamping only when overflow is possible
//! - **Parallel execution**: output rows are independent tiles, run with rayon

pub mod config;
pub mod convert;
mod generic;
pub mod geometry;
mod permute;
pub mod progress;

use std::sync::Arc;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::error::{ResliceError, Result};
use crate::image::{AnyImage, Extent, Geometry, ImageData, Scalar, ScalarType};
use crate::interpolator::{BoundInterpolator, Interpolator, Kernel};
use crate::math::{BorderMode, FLOOR_TOLERANCE};
use crate::stencil::ImageStencil;
use crate::transform::Transform;
use crate::{with_image, Matrix4};

pub use config::{ResliceConfig, SlabMode};
pub use progress::{LogProgress, ProgressObserver};

use convert::Compositor;
use progress::RowCounter;

/// Which loop produced the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutePath {
    /// The output does not overlap the input; everything is background.
    Clear,
    Generic,
    Permute,
}

/// Result of a reslice pass.
#[derive(Debug, Clone)]
pub struct ResliceOutput {
    pub image: AnyImage,
    /// Voxels interpolated from the input, when stencil output was requested.
    pub stencil: Option<ImageStencil>,
    pub hit_input_extent: bool,
    pub path: ExecutePath,
    pub index_matrix: Matrix4,
}

/// Image reslicing filter.
#[derive(Debug, Clone)]
pub struct Reslice {
    config: ResliceConfig,
    axes: Matrix4,
    transform: Option<Arc<dyn Transform>>,
    interpolator: Interpolator,
    user_kernel: Option<Kernel>,
    stencil: Option<ImageStencil>,
    progress: Option<Arc<dyn ProgressObserver>>,
}

impl Default for Reslice {
    fn default() -> Self {
        Self::new(ResliceConfig::default())
    }
}

impl Reslice {
    pub fn new(config: ResliceConfig) -> Self {
        Self {
            config,
            axes: Matrix4::identity(),
            transform: None,
            interpolator: Interpolator::default(),
            user_kernel: None,
            stencil: None,
            progress: None,
        }
    }

    pub fn config(&self) -> &ResliceConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ResliceConfig {
        &mut self.config
    }

    pub fn reslice_axes(&self) -> &Matrix4 {
        &self.axes
    }

    /// Axes of the output frame: columns are the direction cosines, the last
    /// column the origin, all in input world coordinates.
    pub fn set_reslice_axes(&mut self, axes: Matrix4) {
        self.axes = axes;
    }

    pub fn set_reslice_axes_direction_cosines(&mut self, x: [f64; 3], y: [f64; 3], z: [f64; 3]) {
        for i in 0..3 {
            self.axes.m[i][0] = x[i];
            self.axes.m[i][1] = y[i];
            self.axes.m[i][2] = z[i];
        }
    }

    pub fn set_reslice_axes_origin(&mut self, origin: [f64; 3]) {
        for (i, &o) in origin.iter().enumerate() {
            self.axes.m[i][3] = o;
        }
    }

    pub fn reslice_transform(&self) -> Option<&Arc<dyn Transform>> {
        self.transform.as_ref()
    }

    /// Transform from the reslice frame to input world coordinates.
    pub fn set_reslice_transform(&mut self, transform: Option<Arc<dyn Transform>>) {
        self.transform = transform;
    }

    /// Use `interpolator`'s kernel and component selection. The border mode
    /// and tolerance still come from the configuration.
    pub fn set_interpolator(&mut self, interpolator: Interpolator) {
        self.user_kernel = Some(interpolator.kernel());
        self.interpolator = interpolator;
    }

    pub fn interpolator(&self) -> &Interpolator {
        &self.interpolator
    }

    pub fn set_stencil(&mut self, stencil: Option<ImageStencil>) {
        self.stencil = stencil;
    }

    pub fn stencil(&self) -> Option<&ImageStencil> {
        self.stencil.as_ref()
    }

    pub fn set_progress_observer(&mut self, observer: Option<Arc<dyn ProgressObserver>>) {
        self.progress = observer;
    }

    /// Output placement for an input with geometry `input`.
    pub fn output_geometry(&self, input: &Geometry) -> Result<Geometry> {
        self.config.validate()?;
        geometry::output_geometry(&self.config, &self.axes, self.transform.as_deref(), input)
    }

    /// Input extent needed to compute the output, and whether the output
    /// overlaps the input at all.
    pub fn required_input_extent(&self, input: &Geometry) -> Result<(Extent, bool)> {
        let output = self.output_geometry(input)?;
        let (matrix, nonlinear) =
            geometry::index_matrix(&self.axes, self.transform.as_deref(), input, &output);
        let (kernel, _) = self.choose_kernel(&matrix, nonlinear.is_some(), output.extent);
        Ok(self.update_extent(&matrix, nonlinear.is_some(), kernel, output.extent, input.extent))
    }

    // kernel to use and whether the permutation path applies
    fn choose_kernel(&self, matrix: &Matrix4, nonlinear: bool, out_ext: Extent) -> (Kernel, bool) {
        let mut kernel = self
            .user_kernel
            .unwrap_or_else(|| self.config.interpolation_mode.into());
        let permute = self.config.optimization
            && !nonlinear
            && self.config.slab_slice_spacing_fraction == 1.0
            && kernel.is_separable()
            && matrix.is_permutation();
        // B-spline images hold coefficients, so they are never promoted
        if permute
            && !matches!(kernel, Kernel::BSpline { .. })
            && geometry::can_use_nearest(matrix, out_ext)
        {
            kernel = Kernel::Nearest;
        }
        (kernel, permute)
    }

    fn update_extent(
        &self,
        matrix: &Matrix4,
        nonlinear: bool,
        kernel: Kernel,
        out_ext: Extent,
        whole: Extent,
    ) -> (Extent, bool) {
        if nonlinear {
            return (whole, true);
        }
        let support = Interpolator::with_kernel(kernel).compute_support_size(Some(matrix));
        geometry::required_input_extent(
            matrix,
            support,
            out_ext,
            self.config.slab_samples(),
            whole,
            self.config.border_mode != BorderMode::Clamp,
        )
    }

    /// Resample `input`.
    pub fn execute(&mut self, input: &AnyImage) -> Result<ResliceOutput> {
        self.config.validate()?;
        let in_geometry = input.geometry();
        if in_geometry.extent.is_empty() {
            let err = ResliceError::empty_extent(format!("reslice input {:?}", in_geometry.extent));
            tracing::error!("{}", err);
            return Err(err);
        }
        let out_geometry = self.output_geometry(&in_geometry)?;

        let transform = self.transform.as_deref();
        let (matrix, nonlinear) =
            geometry::index_matrix(&self.axes, transform, &in_geometry, &out_geometry);
        let (kernel, permute) = self.choose_kernel(&matrix, nonlinear.is_some(), out_geometry.extent);
        let (_, hit) = self.update_extent(
            &matrix,
            nonlinear.is_some(),
            kernel,
            out_geometry.extent,
            in_geometry.extent,
        );
        let path = if !hit {
            ExecutePath::Clear
        } else if permute {
            ExecutePath::Permute
        } else {
            ExecutePath::Generic
        };

        // wrap and mirror accept any point
        let border_mode = self.config.border_mode;
        let tolerance = if border_mode != BorderMode::Clamp {
            2.0 * i32::MAX as f64
        } else if self.config.border {
            self.config.border_thickness
        } else {
            0.0
        };
        self.interpolator.set_kernel(kernel);
        self.interpolator.set_border_mode(border_mode);
        self.interpolator.set_tolerance(tolerance.max(FLOOR_TOLERANCE));

        let output_type = self.config.output_scalar_type.unwrap_or(input.scalar_type());
        tracing::debug!(
            ?path,
            ?kernel,
            ?output_type,
            slab = self.config.slab_samples(),
            "reslicing {:?} into {:?}",
            in_geometry.extent,
            out_geometry.extent
        );

        let plan = Plan {
            config: &self.config,
            matrix,
            transform: nonlinear,
            input: in_geometry,
            output: out_geometry,
            output_type,
            kernel,
            path,
            stencil: self.stencil.as_ref(),
            progress: self.progress.as_deref(),
        };
        let interpolator = &mut self.interpolator;
        let (image, stencil) = with_image!(input, img => run_typed(interpolator, img, &plan));

        Ok(ResliceOutput {
            image,
            stencil,
            hit_input_extent: hit,
            path,
            index_matrix: matrix,
        })
    }
}

// =============================================================================
// Pass state
// =============================================================================

/// Everything a pass needs besides the typed images.
struct Plan<'a> {
    config: &'a ResliceConfig,
    matrix: Matrix4,
    transform: Option<&'a dyn Transform>,
    input: Geometry,
    output: Geometry,
    output_type: ScalarType,
    kernel: Kernel,
    path: ExecutePath,
    stencil: Option<&'a ImageStencil>,
    progress: Option<&'a dyn ProgressObserver>,
}

/// Read-only state shared by all rows of a typed pass.
struct Pass<'a, T> {
    bound: BoundInterpolator<'a, T>,
    kernel: Kernel,
    matrix: Matrix4,
    transform: Option<&'a dyn Transform>,
    in_geometry: Geometry,
    out_ext: Extent,
    components: usize,
    slab_samples: usize,
    slab_spacing: f64,
    compositor: Compositor,
    shift: f64,
    scale: f64,
    rescale: bool,
    clamp: bool,
    border: bool,
    optimization: bool,
    same_type: bool,
    stencil: Option<&'a ImageStencil>,
    generate_stencil: bool,
    counter: RowCounter<'a>,
}

impl<'a, T: Scalar> Pass<'a, T> {
    /// `(start, end, inside)` spans of `[x0, x1]` on row `(y, z)`.
    fn spans(&self, y: i32, z: i32, x0: i32, x1: i32) -> Vec<(i32, i32, bool)> {
        match self.stencil {
            Some(stencil) => stencil.spans(y, z, x0, x1),
            None => vec![(x0, x1, true)],
        }
    }

    /// Rescale and store interpolated values.
    #[inline]
    fn write<O: Scalar>(&self, values: &mut [f64], dst: &mut [O]) {
        if self.rescale {
            convert::rescale(values, self.shift, self.scale);
        }
        convert::store(values, dst, self.clamp);
    }

    /// Output slice of `row` covering `[a, b]`.
    #[inline]
    fn range<'r, O>(&self, row: &'r mut [O], a: i32, b: i32) -> &'r mut [O] {
        let x0 = self.out_ext.min(0);
        let nc = self.components;
        &mut row[(a - x0) as usize * nc..(b - x0 + 1) as usize * nc]
    }
}

/// Per-worker float buffers.
struct Scratch {
    values: Vec<f64>,
    slab: Vec<f64>,
}

/// Call `row_fn(scratch, y, z, row, runs)` for every output row.
///
/// Rows are the unit of parallelism; a row is never split, so each row's
/// output-stencil runs are produced in x order by a single worker.
fn for_each_row<O, G>(
    output: &mut ImageData<O>,
    runs: &mut [Vec<(i32, i32)>],
    scratch_len: (usize, usize),
    row_fn: G,
) where
    O: Scalar,
    G: Fn(&mut Scratch, i32, i32, &mut [O], &mut Vec<(i32, i32)>) + Sync + Send,
{
    let e = output.extent();
    let row_len = e.len(0) * output.components();
    if row_len == 0 || e.is_empty() {
        return;
    }
    let ny = e.len(1);
    let (y0, z0) = (e.min(1), e.min(2));
    let init = || Scratch {
        values: vec![0.0; scratch_len.0],
        slab: vec![0.0; scratch_len.1],
    };

    #[cfg(feature = "parallel")]
    output
        .as_slice_mut()
        .par_chunks_mut(row_len)
        .zip(runs.par_iter_mut())
        .enumerate()
        .for_each_init(init, |scratch, (r, (row, row_runs))| {
            row_fn(scratch, y0 + (r % ny) as i32, z0 + (r / ny) as i32, row, row_runs)
        });

    #[cfg(not(feature = "parallel"))]
    {
        let mut scratch = init();
        for (r, (row, row_runs)) in output
            .as_slice_mut()
            .chunks_mut(row_len)
            .zip(runs.iter_mut())
            .enumerate()
        {
            row_fn(&mut scratch, y0 + (r % ny) as i32, z0 + (r / ny) as i32, row, row_runs);
        }
    }
}

fn run_typed<T: Scalar>(
    interpolator: &mut Interpolator,
    input: &ImageData<T>,
    plan: &Plan<'_>,
) -> (AnyImage, Option<ImageStencil>) {
    let bound = interpolator.bind(input);
    match plan.output_type {
        ScalarType::I8 => run_into::<T, i8>(bound, plan),
        ScalarType::U8 => run_into::<T, u8>(bound, plan),
        ScalarType::I16 => run_into::<T, i16>(bound, plan),
        ScalarType::U16 => run_into::<T, u16>(bound, plan),
        ScalarType::I32 => run_into::<T, i32>(bound, plan),
        ScalarType::U32 => run_into::<T, u32>(bound, plan),
        ScalarType::F16 => run_into::<T, half::f16>(bound, plan),
        ScalarType::F32 => run_into::<T, f32>(bound, plan),
        ScalarType::F64 => run_into::<T, f64>(bound, plan),
    }
}

fn run_into<T: Scalar, O: Scalar>(bound: BoundInterpolator<'_, T>, plan: &Plan<'_>) -> (AnyImage, Option<ImageStencil>)
where
    AnyImage: From<ImageData<O>>,
{
    let config = plan.config;
    let components = bound.number_of_components();
    let out_ext = plan.output.extent;
    let mut output = ImageData::<O>::new(out_ext, components)
        .with_origin(plan.output.origin)
        .with_spacing(plan.output.spacing);
    let background = convert::background_pixel::<O>(config.background_color, components);
    let [_, ny, nz] = out_ext.dims();
    let mut runs = vec![Vec::new(); ny * nz];

    let slab_samples = config.slab_samples();
    let force_clamp = matches!(plan.kernel, Kernel::Cubic | Kernel::BSpline { .. })
        || (slab_samples > 1 && config.slab_mode == SlabMode::Sum);
    let clamp = convert::needs_clamping(
        T::SCALAR_TYPE,
        O::SCALAR_TYPE,
        config.scalar_shift,
        config.scalar_scale,
        force_clamp,
    );
    if clamp {
        tracing::trace!("clamping {:?} output", O::SCALAR_TYPE);
    }

    let pass = Pass {
        bound,
        kernel: plan.kernel,
        matrix: plan.matrix,
        transform: plan.transform,
        in_geometry: plan.input,
        out_ext,
        components,
        slab_samples,
        slab_spacing: config.slab_slice_spacing_fraction,
        compositor: Compositor::new(config.slab_mode, config.slab_trapezoid_integration),
        shift: config.scalar_shift,
        scale: config.scalar_scale,
        rescale: config.scalar_shift != 0.0 || config.scalar_scale != 1.0,
        clamp,
        border: config.border,
        optimization: config.optimization,
        same_type: T::SCALAR_TYPE == O::SCALAR_TYPE,
        stencil: plan.stencil,
        generate_stencil: config.generate_stencil_output,
        counter: RowCounter::new(plan.progress, ny * nz),
    };

    match plan.path {
        ExecutePath::Clear => for_each_row(&mut output, &mut runs, (0, 0), |_, _, _, row, _| {
            convert::fill(row, &background);
            pass.counter.row_done();
        }),
        ExecutePath::Generic => generic::execute(&pass, &background, &mut output, &mut runs),
        ExecutePath::Permute => permute::execute(&pass, &background, &mut output, &mut runs),
    }

    let stencil = config.generate_stencil_output.then(|| {
        let mut stencil = ImageStencil::new(out_ext);
        for (r, row_runs) in runs.into_iter().enumerate() {
            let y = out_ext.min(1) + (r % ny) as i32;
            let z = out_ext.min(2) + (r / ny) as i32;
            stencil.set_row(y, z, row_runs);
        }
        stencil
    });
    (output.into(), stencil)
}
