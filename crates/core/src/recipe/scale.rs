//! Scale estimation and per-slot scale storage.
//!
//! The scale for a reference amax `a` is chosen so that `a * scale` lands on
//! `2^-margin * fp8_max`:
//!
//! ```text
//! scale = (2^-margin * fp8_max) / a
//! ```
//!
//! Degenerate references never produce a non-finite scale:
//! - `a == 0` (nothing observed yet) gives [`DEFAULT_SCALE`]
//! - `a` NaN or infinite keeps the previous scale, or [`DEFAULT_SCALE`] when the
//!   previous scale is unusable
//! - a finite `a` so small that the division overflows saturates at `f32::MAX`
//! - a quotient that underflows (huge `a` or margin) saturates at
//!   `f32::MIN_POSITIVE`, so `1 / scale` stays finite

use candle_core::{DType, Device, Tensor};

use crate::error::{RecipeError, Result};

/// Scale used when no finite, non-zero amax has been observed.
pub const DEFAULT_SCALE: f32 = 1.0;

/// Inputs of the scale formula besides the reference amax.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleOptions {
    /// Largest finite magnitude of the target format.
    pub fp8_max: f32,
    /// Power-of-two backoff.
    pub margin: f32,
    /// Round the scale down to a power of two.
    pub force_pow_2: bool,
    /// Lower bound on the reference amax; zero disables it.
    pub amax_epsilon: f32,
}

impl ScaleOptions {
    pub fn new(fp8_max: f32, margin: f32) -> Self {
        Self {
            fp8_max,
            margin,
            force_pow_2: false,
            amax_epsilon: 0.0,
        }
    }

    pub fn with_pow_2(mut self, force_pow_2: bool) -> Self {
        self.force_pow_2 = force_pow_2;
        self
    }

    pub fn with_epsilon(mut self, amax_epsilon: f32) -> Self {
        self.amax_epsilon = amax_epsilon;
        self
    }

    /// The value `reference_amax * scale` should hit.
    pub fn target(&self) -> f32 {
        self.fp8_max * (-self.margin).exp2()
    }
}

/// Why a fallback scale was used instead of the formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    /// Reference amax was zero.
    Unobserved,
    /// Reference amax was NaN or infinite.
    NonFinite,
}

/// Result of one scale estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleEstimate {
    pub scale: f32,
    pub fallback: Option<Fallback>,
}

/// Estimate a scale from a reduced amax.
///
/// `previous` is the scale currently held by the slot; it is only consulted for
/// non-finite references.
pub fn estimate_scale(reference_amax: f32, previous: f32, opts: &ScaleOptions) -> ScaleEstimate {
    if !reference_amax.is_finite() {
        let scale = if previous.is_finite() && previous > 0.0 {
            previous
        } else {
            DEFAULT_SCALE
        };
        return ScaleEstimate {
            scale,
            fallback: Some(Fallback::NonFinite),
        };
    }

    let amax = if opts.amax_epsilon > 0.0 {
        reference_amax.max(opts.amax_epsilon)
    } else {
        reference_amax
    };

    if amax <= 0.0 {
        return ScaleEstimate {
            scale: DEFAULT_SCALE,
            fallback: Some(Fallback::Unobserved),
        };
    }

    let mut scale = (opts.target() / amax).clamp(f32::MIN_POSITIVE, f32::MAX);
    if opts.force_pow_2 {
        scale = pow_2_floor(scale);
    }

    ScaleEstimate {
        scale,
        fallback: None,
    }
}

/// Largest power of two not above a positive normal `x`. Exact, unlike
/// `log2`, which rounds up to 128 near `f32::MAX`.
#[inline]
fn pow_2_floor(x: f32) -> f32 {
    f32::from_bits(x.to_bits() & 0x7f80_0000)
}

/// Per-slot scale factors: an F32 tensor of shape `[num_scales]`.
///
/// Clones share storage, so an update through one clone is visible through all
/// of them.
#[derive(Debug, Clone)]
pub struct ScaleFactor {
    data: Tensor,
}

impl ScaleFactor {
    /// Wrap an existing `[num_scales]` F32 tensor.
    pub fn from_tensor(data: Tensor) -> Result<Self> {
        if data.rank() != 1 {
            return Err(RecipeError::shape("scale", &[data.elem_count()], data.dims()));
        }
        if data.dtype() != DType::F32 {
            return Err(RecipeError::unsupported(format!(
                "scale must be f32, got {:?}",
                data.dtype()
            )));
        }
        if !data.is_contiguous() {
            return Err(RecipeError::unsupported("scale must be contiguous"));
        }
        Ok(Self { data })
    }

    /// `num_scales` slots initialised to [`DEFAULT_SCALE`].
    pub fn ones(num_scales: usize, device: &Device) -> Result<Self> {
        Self::from_tensor(Tensor::ones(num_scales, DType::F32, device)?)
    }

    pub fn from_slice(values: &[f32], device: &Device) -> Result<Self> {
        Self::from_tensor(Tensor::from_slice(values, values.len(), device)?)
    }

    pub fn num_scales(&self) -> usize {
        self.data.elem_count()
    }

    pub fn tensor(&self) -> &Tensor {
        &self.data
    }

    pub fn to_vec(&self) -> Result<Vec<f32>> {
        Ok(self.data.to_vec1::<f32>()?)
    }

    /// Dequantization factors `1 / scale`.
    pub fn inverse(&self) -> Result<Tensor> {
        Ok(self.data.recip()?)
    }
}
