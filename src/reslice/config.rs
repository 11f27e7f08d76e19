//! Reslice engine options

use serde::{Deserialize, Serialize};

use crate::error::{ResliceError, Result};
use crate::image::{Extent, ScalarType};
use crate::interpolator::InterpolationMode;
use crate::math::BorderMode;

/// How the samples of a thick slab are combined into one output voxel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlabMode {
    Min,
    Max,
    #[default]
    Mean,
    Sum,
}

impl SlabMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SlabMode::Min => "Min",
            SlabMode::Max => "Max",
            SlabMode::Mean => "Mean",
            SlabMode::Sum => "Sum",
        }
    }
}

/// Options of a [`Reslice`](super::Reslice) pass.
///
/// `None` for the output spacing, origin and extent means "derive from the
/// input", following the reslice axes when `transform_input_sampling` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResliceConfig {
    pub interpolation_mode: InterpolationMode,
    /// Clamp, wrap (repeat) or mirror lookups past the input extent.
    pub border_mode: BorderMode,
    /// Accept samples up to `border_thickness` voxels outside the input.
    pub border: bool,
    pub border_thickness: f64,
    /// Per-component fill for voxels that map outside the input (first four components).
    pub background_color: [f64; 4],
    pub slab_number_of_slices: usize,
    pub slab_mode: SlabMode,
    pub slab_trapezoid_integration: bool,
    /// Distance between slab samples as a fraction of the output z spacing.
    pub slab_slice_spacing_fraction: f64,
    /// Allow the permutation fast path and the nearest-neighbour copy path.
    pub optimization: bool,
    /// 1, 2 or 3; collapsed axes get a single slice at index 0.
    pub output_dimensionality: usize,
    pub transform_input_sampling: bool,
    /// Size the output to the bounds of the transformed input.
    pub auto_crop_output: bool,
    pub output_spacing: Option<[f64; 3]>,
    pub output_origin: Option<[f64; 3]>,
    pub output_extent: Option<Extent>,
    pub output_scalar_type: Option<ScalarType>,
    /// Interpolated values become `(value + shift) * scale` before conversion.
    pub scalar_shift: f64,
    pub scalar_scale: f64,
    pub generate_stencil_output: bool,
}

impl Default for ResliceConfig {
    fn default() -> Self {
        Self {
            interpolation_mode: InterpolationMode::Nearest,
            border_mode: BorderMode::Clamp,
            border: true,
            border_thickness: 0.5,
            background_color: [0.0; 4],
            slab_number_of_slices: 1,
            slab_mode: SlabMode::Mean,
            slab_trapezoid_integration: false,
            slab_slice_spacing_fraction: 1.0,
            optimization: true,
            output_dimensionality: 3,
            transform_input_sampling: true,
            auto_crop_output: false,
            output_spacing: None,
            output_origin: None,
            output_extent: None,
            output_scalar_type: None,
            scalar_shift: 0.0,
            scalar_scale: 1.0,
            generate_stencil_output: false,
        }
    }
}

impl ResliceConfig {
    /// Load from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Number of slab samples, never below one.
    #[inline]
    pub fn slab_samples(&self) -> usize {
        self.slab_number_of_slices.max(1)
    }

    /// Check option ranges.
    pub fn validate(&self) -> Result<()> {
        let err = if !(1..=3).contains(&self.output_dimensionality) {
            Some(format!(
                "output dimensionality must be 1, 2 or 3, got {}",
                self.output_dimensionality
            ))
        } else if !(self.border_thickness >= 0.0) {
            Some(format!("border thickness must be >= 0, got {}", self.border_thickness))
        } else if !(self.slab_slice_spacing_fraction > 0.0) {
            Some(format!(
                "slab spacing fraction must be > 0, got {}",
                self.slab_slice_spacing_fraction
            ))
        } else if self
            .output_spacing
            .is_some_and(|s| s.iter().any(|&v| v == 0.0 || !v.is_finite()))
        {
            Some(format!(
                "output spacing must be finite and non-zero, got {:?}",
                self.output_spacing
            ))
        } else if self.output_extent.is_some_and(|e| e.is_empty()) {
            Some(format!("output extent {:?} is empty", self.output_extent))
        } else if !self.scalar_scale.is_finite() || !self.scalar_shift.is_finite() {
            Some("scalar shift and scale must be finite".to_string())
        } else {
            None
        };
        match err {
            Some(msg) => {
                tracing::error!("invalid reslice configuration: {}", msg);
                Err(ResliceError::config(msg))
            }
            None => Ok(()),
        }
    }
}
