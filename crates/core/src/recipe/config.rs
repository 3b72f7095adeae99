//! Recipe configuration types.
//!
//! - `DelayedScalingConfig` - history-based scaling for the next step
//! - `CurrentScalingConfig` - scale from the current step's amax
//! - `BlockScalingConfig` - per-block amax and scale on 2-D tensors

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::format::Fp8Format;
use super::scale::ScaleOptions;
use crate::error::{RecipeError, Result};

/// Default amax history length for delayed scaling.
pub const DEFAULT_AMAX_HISTORY_LEN: usize = 1024;

/// Default block edge for block scaling.
pub const DEFAULT_BLOCK_LEN: usize = 128;

/// How the amax history is reduced to one reference value per scale slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum AmaxComputeAlgo {
    /// Maximum over the whole history window.
    #[default]
    Max,
    /// Newest observation only.
    MostRecent,
}

impl fmt::Display for AmaxComputeAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Max => write!(f, "max"),
            Self::MostRecent => write!(f, "most_recent"),
        }
    }
}

impl FromStr for AmaxComputeAlgo {
    type Err = RecipeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "max" => Ok(Self::Max),
            "most_recent" => Ok(Self::MostRecent),
            other => Err(RecipeError::unsupported(format!(
                "unknown amax_compute_algo: {other}"
            ))),
        }
    }
}

impl TryFrom<String> for AmaxComputeAlgo {
    type Error = RecipeError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

fn check_margin(margin: f32) -> Result<()> {
    if margin.is_finite() && margin >= 0.0 {
        Ok(())
    } else {
        Err(RecipeError::unsupported(format!(
            "margin must be finite and non-negative, got {margin}"
        )))
    }
}

fn check_epsilon(amax_epsilon: f32) -> Result<()> {
    if amax_epsilon.is_finite() && amax_epsilon >= 0.0 {
        Ok(())
    } else {
        Err(RecipeError::unsupported(format!(
            "amax_epsilon must be finite and non-negative, got {amax_epsilon}"
        )))
    }
}

/// Delayed scaling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayedScalingConfig {
    /// Power-of-two backoff below the format maximum.
    pub margin: f32,
    pub fp8_format: Fp8Format,
    pub amax_compute_algo: AmaxComputeAlgo,
    /// Rows of history allocated per tensor.
    pub amax_history_len: usize,
}

impl Default for DelayedScalingConfig {
    fn default() -> Self {
        Self {
            margin: 0.0,
            fp8_format: Fp8Format::E4M3,
            amax_compute_algo: AmaxComputeAlgo::Max,
            amax_history_len: DEFAULT_AMAX_HISTORY_LEN,
        }
    }
}

impl DelayedScalingConfig {
    pub fn with_algo(mut self, algo: AmaxComputeAlgo) -> Self {
        self.amax_compute_algo = algo;
        self
    }

    pub fn with_margin(mut self, margin: f32) -> Self {
        self.margin = margin;
        self
    }

    pub fn with_format(mut self, fp8_format: Fp8Format) -> Self {
        self.fp8_format = fp8_format;
        self
    }

    pub fn with_history_len(mut self, len: usize) -> Self {
        self.amax_history_len = len;
        self
    }

    pub fn validate(&self) -> Result<()> {
        check_margin(self.margin)?;
        if self.amax_history_len == 0 {
            return Err(RecipeError::unsupported("amax_history_len must be non-zero"));
        }
        Ok(())
    }

    /// Delayed scaling applies the margin only, without epsilon or pow2 rounding.
    pub(crate) fn scale_options(&self) -> ScaleOptions {
        ScaleOptions::new(self.fp8_format.max_value(), self.margin)
    }
}

/// Current scaling parameters. The format comes from the target tensor.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CurrentScalingConfig {
    pub margin: f32,
    /// Round scales down to a power of two.
    pub force_pow_2_scales: bool,
    /// Lower bound applied to amax before division. Zero disables it.
    pub amax_epsilon: f32,
}

impl CurrentScalingConfig {
    pub fn validate(&self) -> Result<()> {
        check_margin(self.margin)?;
        check_epsilon(self.amax_epsilon)
    }

    pub(crate) fn scale_options(&self, fp8_format: Fp8Format) -> ScaleOptions {
        ScaleOptions::new(fp8_format.max_value(), self.margin)
            .with_pow_2(self.force_pow_2_scales)
            .with_epsilon(self.amax_epsilon)
    }
}

/// Block scaling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockScalingConfig {
    /// Edge length of the square blocks.
    pub block_len: usize,
    pub fp8_format: Fp8Format,
    pub margin: f32,
    pub force_pow_2_scales: bool,
    pub amax_epsilon: f32,
}

impl Default for BlockScalingConfig {
    fn default() -> Self {
        Self {
            block_len: DEFAULT_BLOCK_LEN,
            fp8_format: Fp8Format::E4M3,
            margin: 0.0,
            force_pow_2_scales: true,
            amax_epsilon: 0.0,
        }
    }
}

impl BlockScalingConfig {
    pub fn with_block_len(mut self, block_len: usize) -> Self {
        self.block_len = block_len;
        self
    }

    pub fn validate(&self) -> Result<()> {
        check_margin(self.margin)?;
        check_epsilon(self.amax_epsilon)?;
        if self.block_len == 0 {
            return Err(RecipeError::unsupported("block_len must be non-zero"));
        }
        Ok(())
    }

    pub(crate) fn scale_options(&self) -> ScaleOptions {
        ScaleOptions::new(self.fp8_format.max_value(), self.margin)
            .with_pow_2(self.force_pow_2_scales)
            .with_epsilon(self.amax_epsilon)
    }
}
