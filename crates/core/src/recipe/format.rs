//! FP8 format descriptors.
//!
//! | Format | Exponent | Mantissa | Max finite |
//! |--------|----------|----------|------------|
//! | E4M3   | 4        | 3        | 448        |
//! | E5M2   | 5        | 2        | 57344      |
//!
//! Encoded values are stored one byte per element (`DType::U8`).

use std::fmt;
use std::str::FromStr;

use float8::{F8E4M3, F8E5M2};
use serde::{Deserialize, Serialize};

use crate::error::RecipeError;

/// Largest finite E4M3 magnitude.
pub const FP8_E4M3_MAX: f32 = 448.0;

/// Largest finite E5M2 magnitude.
pub const FP8_E5M2_MAX: f32 = 57344.0;

/// An 8-bit floating point encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fp8Format {
    /// 4 exponent bits, 3 mantissa bits. More precision, less range.
    #[default]
    E4M3,
    /// 5 exponent bits, 2 mantissa bits. More range, less precision.
    E5M2,
}

impl Fp8Format {
    /// Largest finite magnitude representable in this format.
    pub fn max_value(&self) -> f32 {
        match self {
            Self::E4M3 => FP8_E4M3_MAX,
            Self::E5M2 => FP8_E5M2_MAX,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::E4M3 => "e4m3",
            Self::E5M2 => "e5m2",
        }
    }

    /// Encode `x` to the nearest representable value, saturating at ±max.
    #[inline]
    pub fn quantize(&self, x: f32) -> u8 {
        let max = self.max_value();
        let clamped = x.clamp(-max, max);
        match self {
            Self::E4M3 => F8E4M3::from_f32(clamped).to_bits(),
            Self::E5M2 => F8E5M2::from_f32(clamped).to_bits(),
        }
    }

    /// Decode a byte produced by [`Fp8Format::quantize`].
    #[inline]
    pub fn dequantize(&self, bits: u8) -> f32 {
        match self {
            Self::E4M3 => F8E4M3::from_bits(bits).to_f32(),
            Self::E5M2 => F8E5M2::from_bits(bits).to_f32(),
        }
    }
}

impl fmt::Display for Fp8Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Fp8Format {
    type Err = RecipeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "e4m3" => Ok(Self::E4M3),
            "e5m2" => Ok(Self::E5M2),
            other => Err(RecipeError::unsupported(format!(
                "unknown fp8 format: {other}"
            ))),
        }
    }
}

/// Format pairing for a training recipe.
///
/// `Hybrid` keeps forward activations and weights in E4M3 and gradients in E5M2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fp8Recipe {
    E4M3,
    E5M2,
    #[default]
    Hybrid,
}

impl Fp8Recipe {
    pub fn forward_format(&self) -> Fp8Format {
        match self {
            Self::E4M3 | Self::Hybrid => Fp8Format::E4M3,
            Self::E5M2 => Fp8Format::E5M2,
        }
    }

    pub fn backward_format(&self) -> Fp8Format {
        match self {
            Self::E4M3 => Fp8Format::E4M3,
            Self::E5M2 | Self::Hybrid => Fp8Format::E5M2,
        }
    }
}

impl FromStr for Fp8Recipe {
    type Err = RecipeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "e4m3" => Ok(Self::E4M3),
            "e5m2" => Ok(Self::E5M2),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(RecipeError::unsupported(format!(
                "unknown fp8 recipe: {other}"
            ))),
        }
    }
}
