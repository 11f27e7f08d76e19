//! Python bindings using PyO3

use std::sync::Arc;

use ndarray::{Axis, Ix4};
use numpy::{IntoPyArray, PyReadonlyArray2, PyReadonlyArrayDyn, PyUntypedArrayMethods};
use pyo3::exceptions::{PyTypeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::{
    AnyImage, Extent, GridTransform, ImageData, Matrix4, Reslice, ResliceConfig, ResliceError, Scalar,
};

// =============================================================================
// Helper functions
// =============================================================================

fn to_py_err(e: ResliceError) -> PyErr {
    PyValueError::new_err(e.to_string())
}

/// Convert any numpy array to a C-ordered float64 array
fn to_float64<'py>(py: Python<'py>, array: &Bound<'py, PyAny>) -> PyResult<Bound<'py, PyAny>> {
    let numpy = py.import("numpy")?;
    let kwargs = PyDict::new(py);
    kwargs.set_item("dtype", numpy.getattr("float64")?)?;
    kwargs.set_item("order", "C")?;
    numpy.call_method("asarray", (array,), Some(&kwargs))
}

/// Get the dtype name from a numpy array
fn get_dtype_name(array: &Bound<'_, PyAny>) -> PyResult<String> {
    let dtype = array.getattr("dtype")?;
    let name = dtype.getattr("name")?;
    name.extract()
}

/// `(z, y, x)` or `(z, y, x, c)` array as an image placed at `origin` with `spacing`.
fn extract_volume<'py, T>(
    array: &Bound<'py, PyAny>,
    origin: [f64; 3],
    spacing: [f64; 3],
) -> PyResult<ImageData<T>>
where
    T: Scalar + numpy::Element,
{
    let array: PyReadonlyArrayDyn<'py, T> = array
        .extract()
        .map_err(|e| PyTypeError::new_err(format!("Failed to extract volume: {}", e)))?;
    let view = array.as_array();
    let data = match view.ndim() {
        3 => view.insert_axis(Axis(3)).to_owned(),
        4 => view.to_owned(),
        n => {
            return Err(PyValueError::new_err(format!(
                "Volume must be (z, y, x) or (z, y, x, c), got {} dimensions",
                n
            )))
        }
    };
    let data = data
        .into_dimensionality::<Ix4>()
        .map_err(|e| PyValueError::new_err(e.to_string()))?;
    let (nz, ny, nx, _) = data.dim();
    let image = ImageData::from_array(data, Extent::from_dims([nx, ny, nz])).map_err(to_py_err)?;
    Ok(image.with_origin(origin).with_spacing(spacing))
}

fn volume(array: &Bound<'_, PyAny>, origin: [f64; 3], spacing: [f64; 3]) -> PyResult<AnyImage> {
    Ok(match get_dtype_name(array)?.as_str() {
        "int8" => extract_volume::<i8>(array, origin, spacing)?.into(),
        "uint8" => extract_volume::<u8>(array, origin, spacing)?.into(),
        "int16" => extract_volume::<i16>(array, origin, spacing)?.into(),
        "uint16" => extract_volume::<u16>(array, origin, spacing)?.into(),
        "int32" => extract_volume::<i32>(array, origin, spacing)?.into(),
        "uint32" => extract_volume::<u32>(array, origin, spacing)?.into(),
        "float32" => extract_volume::<f32>(array, origin, spacing)?.into(),
        "float64" => extract_volume::<f64>(array, origin, spacing)?.into(),
        other => {
            return Err(PyTypeError::new_err(format!(
                "Unsupported dtype '{}', expected an integer or float32/float64 volume",
                other
            )))
        }
    })
}

/// Image samples as a numpy array; the component axis is dropped for scalar images.
fn to_numpy(py: Python<'_>, image: &AnyImage) -> Py<PyAny> {
    fn array<T: Scalar + numpy::Element>(py: Python<'_>, img: &ImageData<T>) -> Py<PyAny> {
        let data = img.array();
        let data = if img.components() == 1 {
            data.index_axis(Axis(3), 0).to_owned().into_dyn()
        } else {
            data.to_owned().into_dyn()
        };
        data.into_pyarray(py).into_any().unbind()
    }
    match image {
        AnyImage::I8(img) => array(py, img),
        AnyImage::U8(img) => array(py, img),
        AnyImage::I16(img) => array(py, img),
        AnyImage::U16(img) => array(py, img),
        AnyImage::I32(img) => array(py, img),
        AnyImage::U32(img) => array(py, img),
        // numpy has no half-precision element here; widen
        AnyImage::F16(_) => array(py, &image.to_f64()),
        AnyImage::F32(img) => array(py, img),
        AnyImage::F64(img) => array(py, img),
    }
}

fn xyz(v: Option<(f64, f64, f64)>, default: f64) -> [f64; 3] {
    v.map(|(x, y, z)| [x, y, z]).unwrap_or([default; 3])
}

// =============================================================================
// Build Info
// =============================================================================

/// Get build and runtime information
///
/// Returns a dictionary with:
/// - version: Package version
/// - parallel: Whether parallel processing is enabled
/// - num_threads: Worker threads available to a reslice pass
/// - kernel_table: Whether B-spline weights come from a lookup table
#[pyfunction]
fn build_info(py: Python<'_>) -> PyResult<Bound<'_, PyDict>> {
    let info = PyDict::new(py);
    info.set_item("version", env!("CARGO_PKG_VERSION"))?;

    #[cfg(feature = "parallel")]
    {
        info.set_item("parallel", true)?;
        info.set_item("num_threads", rayon::current_num_threads())?;
    }
    #[cfg(not(feature = "parallel"))]
    {
        info.set_item("parallel", false)?;
        info.set_item("num_threads", 1)?;
    }

    info.set_item("kernel_table", cfg!(feature = "kernel-table"))?;
    Ok(info)
}

// =============================================================================
// Reslice
// =============================================================================

/// Resample a volume onto a new grid
///
/// Args:
///     input: numpy volume shaped (z, y, x) or (z, y, x, c); any integer dtype,
///         float32 or float64
///     axes: Optional 4x4 reslice axes in (x, y, z) order. The first three
///         columns are the output axis directions and the last column the
///         output frame origin, in input world coordinates.
///     config: Optional engine configuration as a JSON string (interpolation
///         mode, border mode, slab settings, output extent/spacing/origin,
///         output scalar type, ...). Missing fields take their defaults.
///     spacing: Input voxel spacing (x, y, z), default 1
///     origin: Input origin (x, y, z), default 0
///     displacement: Optional displacement field shaped (z, y, x, 3), applied
///         as a grid transform in world coordinates
///     grid_spacing: Displacement grid spacing (x, y, z), default 1
///     grid_origin: Displacement grid origin (x, y, z), default 0
///
/// Returns:
///     The resampled volume, shaped like the output extent.
#[pyfunction]
#[pyo3(signature = (
    input,
    axes=None,
    config=None,
    spacing=None,
    origin=None,
    displacement=None,
    grid_spacing=None,
    grid_origin=None
))]
#[allow(clippy::too_many_arguments)]
fn reslice<'py>(
    py: Python<'py>,
    input: &Bound<'py, PyAny>,
    axes: Option<&Bound<'py, PyAny>>,
    config: Option<&str>,
    spacing: Option<(f64, f64, f64)>,
    origin: Option<(f64, f64, f64)>,
    displacement: Option<&Bound<'py, PyAny>>,
    grid_spacing: Option<(f64, f64, f64)>,
    grid_origin: Option<(f64, f64, f64)>,
) -> PyResult<Py<PyAny>> {
    let image = volume(input, xyz(origin, 0.0), xyz(spacing, 1.0))?;
    let config = match config {
        Some(json) => ResliceConfig::from_json(json).map_err(to_py_err)?,
        None => ResliceConfig::default(),
    };
    let mut engine = Reslice::new(config);

    if let Some(axes) = axes {
        let converted = to_float64(py, axes)?;
        let matrix: PyReadonlyArray2<'py, f64> = converted
            .extract()
            .map_err(|e| PyTypeError::new_err(format!("Failed to convert axes to float64: {}", e)))?;
        if matrix.shape() != [4, 4] {
            return Err(PyValueError::new_err("Axes must be a 4x4 homogeneous matrix"));
        }
        let m = matrix.as_array();
        engine.set_reslice_axes(Matrix4::new(std::array::from_fn(|i| {
            std::array::from_fn(|j| m[[i, j]])
        })));
    }

    if let Some(field) = displacement {
        let converted = to_float64(py, field)?;
        let grid = extract_volume::<f64>(&converted, xyz(grid_origin, 0.0), xyz(grid_spacing, 1.0))?;
        let transform = GridTransform::with_grid(AnyImage::from(grid)).map_err(to_py_err)?;
        engine.set_reslice_transform(Some(Arc::new(transform)));
    }

    let output = py
        .allow_threads(|| engine.execute(&image))
        .map_err(to_py_err)?;
    Ok(to_numpy(py, &output.image))
}

// =============================================================================
// Module registration
// =============================================================================

/// Volumetric resampling with linear, grid and B-spline transforms
///
/// - reslice(): resample a numpy volume through reslice axes and an optional
///   displacement field
/// - build_info(): build and runtime information
#[pymodule]
fn reslice3d(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(reslice, m)?)?;
    m.add_function(wrap_pyfunction!(build_info, m)?)?;
    Ok(())
}
