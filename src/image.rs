//! Structured scalar grids
//!
//! An [`ImageData`] owns a dense `[z, y, x, component]` array together with an
//! inclusive index [`Extent`], a physical origin and per-axis spacing.
//! Coordinates are always given in `(x, y, z)` order; the array is stored with
//! `x` varying fastest, so the element increments are
//! `[components, components * nx, components * nx * ny]`.
//!
//! [`AnyImage`] erases the storage type so that callers can dispatch once, at the
//! outermost loop, to code that is generic over [`Scalar`].

use std::fmt::Debug;

use half::f16;
use ndarray::{Array4, ArrayView4};
use num_traits::{Bounded, NumCast};
use serde::{Deserialize, Serialize};

use crate::error::{ResliceError, Result};
use crate::math;

// =============================================================================
// Extent
// =============================================================================

/// Inclusive index bounds `[xmin, xmax, ymin, ymax, zmin, zmax]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent(pub [i32; 6]);

impl Extent {
    #[inline]
    pub fn new(x0: i32, x1: i32, y0: i32, y1: i32, z0: i32, z1: i32) -> Self {
        Self([x0, x1, y0, y1, z0, z1])
    }

    /// Extent starting at zero with the given sample counts `[nx, ny, nz]`.
    pub fn from_dims(dims: [usize; 3]) -> Self {
        Self([
            0,
            dims[0] as i32 - 1,
            0,
            dims[1] as i32 - 1,
            0,
            dims[2] as i32 - 1,
        ])
    }

    #[inline]
    pub fn min(&self, axis: usize) -> i32 {
        self.0[2 * axis]
    }

    #[inline]
    pub fn max(&self, axis: usize) -> i32 {
        self.0[2 * axis + 1]
    }

    /// Number of samples along `axis` (zero when the axis is empty).
    #[inline]
    pub fn len(&self, axis: usize) -> usize {
        (self.max(axis) as i64 - self.min(axis) as i64 + 1).max(0) as usize
    }

    pub fn dims(&self) -> [usize; 3] {
        [self.len(0), self.len(1), self.len(2)]
    }

    pub fn is_empty(&self) -> bool {
        (0..3).any(|axis| self.max(axis) < self.min(axis))
    }

    pub fn num_points(&self) -> usize {
        self.dims().iter().product()
    }

    pub fn contains(&self, index: [i32; 3]) -> bool {
        (0..3).all(|axis| index[axis] >= self.min(axis) && index[axis] <= self.max(axis))
    }

    /// Overlap of two extents; may be empty.
    pub fn intersect(&self, other: &Extent) -> Extent {
        let mut out = [0; 6];
        for axis in 0..3 {
            out[2 * axis] = self.min(axis).max(other.min(axis));
            out[2 * axis + 1] = self.max(axis).min(other.max(axis));
        }
        Extent(out)
    }

    /// Same extent with the `z` range replaced.
    pub fn with_z(&self, z0: i32, z1: i32) -> Extent {
        let mut e = self.0;
        e[4] = z0;
        e[5] = z1;
        Extent(e)
    }

    /// Same extent with the `y` range replaced.
    pub fn with_y(&self, y0: i32, y1: i32) -> Extent {
        let mut e = self.0;
        e[2] = y0;
        e[3] = y1;
        Extent(e)
    }
}

impl Default for Extent {
    fn default() -> Self {
        Self([0, -1, 0, -1, 0, -1])
    }
}

// =============================================================================
// Scalar types
// =============================================================================

/// Storage type tag for image samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F16,
    F32,
    F64,
}

impl ScalarType {
    pub fn is_float(self) -> bool {
        matches!(self, ScalarType::F16 | ScalarType::F32 | ScalarType::F64)
    }

    /// Smallest representable value, as `f64`.
    pub fn min_value(self) -> f64 {
        match self {
            ScalarType::I8 => i8::MIN as f64,
            ScalarType::U8 => 0.0,
            ScalarType::I16 => i16::MIN as f64,
            ScalarType::U16 => 0.0,
            ScalarType::I32 => i32::MIN as f64,
            ScalarType::U32 => 0.0,
            ScalarType::F16 => f16::MIN.to_f64(),
            ScalarType::F32 => f32::MIN as f64,
            ScalarType::F64 => f64::MIN,
        }
    }

    /// Largest representable value, as `f64`.
    pub fn max_value(self) -> f64 {
        match self {
            ScalarType::I8 => i8::MAX as f64,
            ScalarType::U8 => u8::MAX as f64,
            ScalarType::I16 => i16::MAX as f64,
            ScalarType::U16 => u16::MAX as f64,
            ScalarType::I32 => i32::MAX as f64,
            ScalarType::U32 => u32::MAX as f64,
            ScalarType::F16 => f16::MAX.to_f64(),
            ScalarType::F32 => f32::MAX as f64,
            ScalarType::F64 => f64::MAX,
        }
    }

    pub fn size_of(self) -> usize {
        match self {
            ScalarType::I8 | ScalarType::U8 => 1,
            ScalarType::I16 | ScalarType::U16 | ScalarType::F16 => 2,
            ScalarType::I32 | ScalarType::U32 | ScalarType::F32 => 4,
            ScalarType::F64 => 8,
        }
    }
}

/// A storage type that images can hold.
///
/// Values are read into `f64` for arithmetic and written back either with a
/// plain round-and-store (`from_double_round`, saturating on overflow) or with
/// an explicit clamp to the type's range (`from_double_clamp`).
pub trait Scalar:
    Copy + Send + Sync + Default + PartialOrd + Debug + NumCast + Bounded + 'static
{
    const SCALAR_TYPE: ScalarType;

    fn to_double(self) -> f64;

    fn from_double_round(v: f64) -> Self;

    fn from_double_clamp(v: f64) -> Self;
}

macro_rules! impl_integer_scalar {
    ($t:ty, $tag:ident) => {
        impl Scalar for $t {
            const SCALAR_TYPE: ScalarType = ScalarType::$tag;

            #[inline]
            fn to_double(self) -> f64 {
                self as f64
            }

            #[inline]
            fn from_double_round(v: f64) -> Self {
                math::round_f64(v) as $t
            }

            #[inline]
            fn from_double_clamp(v: f64) -> Self {
                let v = v.max(<$t>::MIN as f64).min(<$t>::MAX as f64);
                math::round_f64(v) as $t
            }
        }
    };
}

impl_integer_scalar!(i8, I8);
impl_integer_scalar!(u8, U8);
impl_integer_scalar!(i16, I16);
impl_integer_scalar!(u16, U16);
impl_integer_scalar!(i32, I32);
impl_integer_scalar!(u32, U32);

impl Scalar for f16 {
    const SCALAR_TYPE: ScalarType = ScalarType::F16;

    #[inline]
    fn to_double(self) -> f64 {
        self.to_f64()
    }

    #[inline]
    fn from_double_round(v: f64) -> Self {
        f16::from_f64(v)
    }

    #[inline]
    fn from_double_clamp(v: f64) -> Self {
        f16::from_f64(v)
    }
}

impl Scalar for f32 {
    const SCALAR_TYPE: ScalarType = ScalarType::F32;

    #[inline]
    fn to_double(self) -> f64 {
        self as f64
    }

    #[inline]
    fn from_double_round(v: f64) -> Self {
        v as f32
    }

    #[inline]
    fn from_double_clamp(v: f64) -> Self {
        v as f32
    }
}

impl Scalar for f64 {
    const SCALAR_TYPE: ScalarType = ScalarType::F64;

    #[inline]
    fn to_double(self) -> f64 {
        self
    }

    #[inline]
    fn from_double_round(v: f64) -> Self {
        v
    }

    #[inline]
    fn from_double_clamp(v: f64) -> Self {
        v
    }
}

// =============================================================================
// ImageData
// =============================================================================

/// Physical placement of a structured grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub extent: Extent,
    pub origin: [f64; 3],
    pub spacing: [f64; 3],
}

impl Geometry {
    pub fn new(extent: Extent, origin: [f64; 3], spacing: [f64; 3]) -> Self {
        Self {
            extent,
            origin,
            spacing,
        }
    }

    /// Continuous index of a world point.
    #[inline]
    pub fn world_to_index(&self, p: [f64; 3]) -> [f64; 3] {
        [
            (p[0] - self.origin[0]) / self.spacing[0],
            (p[1] - self.origin[1]) / self.spacing[1],
            (p[2] - self.origin[2]) / self.spacing[2],
        ]
    }

    /// World position of a continuous index.
    #[inline]
    pub fn index_to_world(&self, i: [f64; 3]) -> [f64; 3] {
        [
            i[0] * self.spacing[0] + self.origin[0],
            i[1] * self.spacing[1] + self.origin[1],
            i[2] * self.spacing[2] + self.origin[2],
        ]
    }
}

/// Dense 3D image with one or more components per voxel.
#[derive(Debug, Clone)]
pub struct ImageData<T> {
    data: Array4<T>,
    geometry: Geometry,
}

impl<T: Scalar> ImageData<T> {
    /// Image filled with `T::default()`.
    pub fn new(extent: Extent, components: usize) -> Self {
        let [nx, ny, nz] = extent.dims();
        Self {
            data: Array4::from_elem((nz, ny, nx, components.max(1)), T::default()),
            geometry: Geometry::new(extent, [0.0; 3], [1.0; 3]),
        }
    }

    /// Wrap an existing `[z, y, x, component]` array, placed at `extent`.
    pub fn from_array(data: Array4<T>, extent: Extent) -> Result<Self> {
        let (nz, ny, nx, _) = data.dim();
        let dims = extent.dims();
        if dims != [nx, ny, nz] {
            return Err(ResliceError::ShapeMismatch {
                expected: vec![dims[2], dims[1], dims[0]],
                actual: vec![nz, ny, nx],
            });
        }
        let data = if data.is_standard_layout() {
            data
        } else {
            data.as_standard_layout().to_owned()
        };
        Ok(Self {
            data,
            geometry: Geometry::new(extent, [0.0; 3], [1.0; 3]),
        })
    }

    /// Build from a flat, x-fastest sample vector.
    pub fn from_vec(extent: Extent, components: usize, values: Vec<T>) -> Result<Self> {
        let [nx, ny, nz] = extent.dims();
        let expected = nx * ny * nz * components;
        if values.len() != expected {
            return Err(ResliceError::ShapeMismatch {
                expected: vec![expected],
                actual: vec![values.len()],
            });
        }
        let data = Array4::from_shape_vec((nz, ny, nx, components), values).map_err(|_| {
            ResliceError::ShapeMismatch {
                expected: vec![nz, ny, nx, components],
                actual: vec![expected],
            }
        })?;
        Ok(Self {
            data,
            geometry: Geometry::new(extent, [0.0; 3], [1.0; 3]),
        })
    }

    /// Image whose value at index `(x, y, z)` and component `c` is `f(x, y, z, c)`.
    pub fn from_fn<G>(extent: Extent, components: usize, mut f: G) -> Self
    where
        G: FnMut(i32, i32, i32, usize) -> T,
    {
        let [nx, ny, nz] = extent.dims();
        let data = Array4::from_shape_fn((nz, ny, nx, components), |(z, y, x, c)| {
            f(
                x as i32 + extent.min(0),
                y as i32 + extent.min(1),
                z as i32 + extent.min(2),
                c,
            )
        });
        Self {
            data,
            geometry: Geometry::new(extent, [0.0; 3], [1.0; 3]),
        }
    }

    pub fn with_origin(mut self, origin: [f64; 3]) -> Self {
        self.geometry.origin = origin;
        self
    }

    pub fn with_spacing(mut self, spacing: [f64; 3]) -> Self {
        self.geometry.spacing = spacing;
        self
    }

    #[inline]
    pub fn extent(&self) -> Extent {
        self.geometry.extent
    }

    #[inline]
    pub fn origin(&self) -> [f64; 3] {
        self.geometry.origin
    }

    #[inline]
    pub fn spacing(&self) -> [f64; 3] {
        self.geometry.spacing
    }

    #[inline]
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    #[inline]
    pub fn components(&self) -> usize {
        self.data.dim().3
    }

    /// Element increments along x, y and z.
    #[inline]
    pub fn increments(&self) -> [isize; 3] {
        let (_, ny, nx, nc) = self.data.dim();
        [nc as isize, (nc * nx) as isize, (nc * nx * ny) as isize]
    }

    pub fn array(&self) -> ArrayView4<'_, T> {
        self.data.view()
    }

    pub fn into_array(self) -> Array4<T> {
        self.data
    }

    /// Flat x-fastest sample slice.
    pub fn as_slice(&self) -> &[T] {
        // standard layout is enforced by every constructor
        self.data.as_slice().unwrap_or(&[])
    }

    pub fn as_slice_mut(&mut self) -> &mut [T] {
        self.data.as_slice_mut().unwrap_or(&mut [])
    }

    /// Sample at an absolute index inside the extent.
    pub fn get(&self, index: [i32; 3], component: usize) -> Option<T> {
        if !self.extent().contains(index) || component >= self.components() {
            return None;
        }
        let e = self.extent();
        Some(
            self.data[[
                (index[2] - e.min(2)) as usize,
                (index[1] - e.min(1)) as usize,
                (index[0] - e.min(0)) as usize,
                component,
            ]],
        )
    }

    pub fn set(&mut self, index: [i32; 3], component: usize, value: T) {
        if self.extent().contains(index) && component < self.components() {
            let e = self.extent();
            self.data[[
                (index[2] - e.min(2)) as usize,
                (index[1] - e.min(1)) as usize,
                (index[0] - e.min(0)) as usize,
                component,
            ]] = value;
        }
    }

    /// Borrowed view used by the interpolation kernels.
    pub fn view(&self) -> GridView<'_, T> {
        GridView {
            data: self.as_slice(),
            extent: self.extent(),
            increments: self.increments(),
            components: self.components(),
        }
    }
}

/// Non-owning description of a grid: samples, extent and increments.
#[derive(Debug, Clone, Copy)]
pub struct GridView<'a, T> {
    pub data: &'a [T],
    pub extent: Extent,
    pub increments: [isize; 3],
    pub components: usize,
}

impl<'a, T: Scalar> GridView<'a, T> {
    /// Sample at zero-based per-axis offsets.
    #[inline]
    pub fn at(&self, offset: isize) -> f64 {
        debug_assert!(offset >= 0 && (offset as usize) < self.data.len());
        self.data[offset as usize].to_double()
    }
}

// =============================================================================
// Type-erased image
// =============================================================================

/// An image of any supported storage type.
#[derive(Debug, Clone)]
pub enum AnyImage {
    I8(ImageData<i8>),
    U8(ImageData<u8>),
    I16(ImageData<i16>),
    U16(ImageData<u16>),
    I32(ImageData<i32>),
    U32(ImageData<u32>),
    F16(ImageData<f16>),
    F32(ImageData<f32>),
    F64(ImageData<f64>),
}

/// Run `$body` with `$img` bound to the typed [`ImageData`] inside an [`AnyImage`].
#[macro_export]
macro_rules! with_image {
    ($any:expr, $img:ident => $body:expr) => {
        match $any {
            $crate::image::AnyImage::I8($img) => $body,
            $crate::image::AnyImage::U8($img) => $body,
            $crate::image::AnyImage::I16($img) => $body,
            $crate::image::AnyImage::U16($img) => $body,
            $crate::image::AnyImage::I32($img) => $body,
            $crate::image::AnyImage::U32($img) => $body,
            $crate::image::AnyImage::F16($img) => $body,
            $crate::image::AnyImage::F32($img) => $body,
            $crate::image::AnyImage::F64($img) => $body,
        }
    };
}

impl AnyImage {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            AnyImage::I8(_) => ScalarType::I8,
            AnyImage::U8(_) => ScalarType::U8,
            AnyImage::I16(_) => ScalarType::I16,
            AnyImage::U16(_) => ScalarType::U16,
            AnyImage::I32(_) => ScalarType::I32,
            AnyImage::U32(_) => ScalarType::U32,
            AnyImage::F16(_) => ScalarType::F16,
            AnyImage::F32(_) => ScalarType::F32,
            AnyImage::F64(_) => ScalarType::F64,
        }
    }

    pub fn extent(&self) -> Extent {
        with_image!(self, img => img.extent())
    }

    pub fn geometry(&self) -> Geometry {
        with_image!(self, img => img.geometry())
    }

    pub fn components(&self) -> usize {
        with_image!(self, img => img.components())
    }

    /// Sample as `f64`.
    pub fn get(&self, index: [i32; 3], component: usize) -> Option<f64> {
        with_image!(self, img => img.get(index, component).map(Scalar::to_double))
    }

    /// Copy of the samples converted to `f64`.
    pub fn to_f64(&self) -> ImageData<f64> {
        with_image!(self, img => {
            let data = img.array().mapv(|v| v.to_double());
            ImageData {
                data,
                geometry: img.geometry(),
            }
        })
    }

    /// Zero-filled image of the requested storage type.
    pub fn zeros(scalar_type: ScalarType, geometry: Geometry, components: usize) -> AnyImage {
        fn make<T: Scalar>(geometry: Geometry, components: usize) -> ImageData<T> {
            ImageData::new(geometry.extent, components)
                .with_origin(geometry.origin)
                .with_spacing(geometry.spacing)
        }
        match scalar_type {
            ScalarType::I8 => AnyImage::I8(make(geometry, components)),
            ScalarType::U8 => AnyImage::U8(make(geometry, components)),
            ScalarType::I16 => AnyImage::I16(make(geometry, components)),
            ScalarType::U16 => AnyImage::U16(make(geometry, components)),
            ScalarType::I32 => AnyImage::I32(make(geometry, components)),
            ScalarType::U32 => AnyImage::U32(make(geometry, components)),
            ScalarType::F16 => AnyImage::F16(make(geometry, components)),
            ScalarType::F32 => AnyImage::F32(make(geometry, components)),
            ScalarType::F64 => AnyImage::F64(make(geometry, components)),
        }
    }
}

macro_rules! impl_from_image {
    ($t:ty, $variant:ident) => {
        impl From<ImageData<$t>> for AnyImage {
            fn from(img: ImageData<$t>) -> Self {
                AnyImage::$variant(img)
            }
        }
    };
}

impl_from_image!(i8, I8);
impl_from_image!(u8, U8);
impl_from_image!(i16, I16);
impl_from_image!(u16, U16);
impl_from_image!(i32, I32);
impl_from_image!(u32, U32);
impl_from_image!(f16, F16);
impl_from_image!(f32, F32);
impl_from_image!(f64, F64);
