//! Current scaling: scale from this step's own amax, no history.
//!
//! Amax computation and scale derivation are separate calls so the amax pass
//! can be fused with other work over the same input.

use candle_core::{CpuStorage, DType, Device, InplaceOp2, Layout, Shape, Tensor};
use tracing::debug;

use super::config::CurrentScalingConfig;
use super::cpu::{ensure_distinct, f32_slice, f32_slice_mut, float_values, max_abs};
use super::delayed::log_fallback;
use super::format::Fp8Format;
use super::scale::{estimate_scale, ScaleOptions, DEFAULT_SCALE};
use crate::error::{RecipeError, Result};
use crate::queue::ExecutionQueue;

/// How an FP8 tensor's scale metadata is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingMode {
    /// One amax and one scale for the whole tensor.
    PerTensor,
    /// One scale per output channel.
    PerChannel,
    /// One scale per `block_len x block_len` block.
    Block { block_len: usize },
}

/// FP8 tensor with scaling metadata.
///
/// `data` holds encoded bytes (`U8`). For [`ScalingMode::PerTensor`] the
/// `amax`, `scale` and `scale_inv` tensors are F32 with shape `[1]`.
#[derive(Debug, Clone)]
pub struct Fp8Tensor {
    pub data: Tensor,
    pub format: Fp8Format,
    pub mode: ScalingMode,
    pub amax: Tensor,
    pub scale: Tensor,
    pub scale_inv: Tensor,
}

impl Fp8Tensor {
    /// Zeroed per-tensor-scaled FP8 tensor with unit scale.
    pub fn per_tensor<S: Into<Shape>>(shape: S, format: Fp8Format, device: &Device) -> Result<Self> {
        Ok(Self {
            data: Tensor::zeros(shape, DType::U8, device)?,
            format,
            mode: ScalingMode::PerTensor,
            amax: Tensor::zeros(1, DType::F32, device)?,
            scale: Tensor::ones(1, DType::F32, device)?,
            scale_inv: Tensor::ones(1, DType::F32, device)?,
        })
    }

    pub fn with_mode(mut self, mode: ScalingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn amax_value(&self) -> Result<f32> {
        Ok(self.amax.to_vec1::<f32>()?[0])
    }

    pub fn scale_value(&self) -> Result<f32> {
        Ok(self.scale.to_vec1::<f32>()?[0])
    }

    pub fn scale_inv_value(&self) -> Result<f32> {
        Ok(self.scale_inv.to_vec1::<f32>()?[0])
    }

    fn ensure_per_tensor(&self, op: &str) -> Result<()> {
        if self.mode != ScalingMode::PerTensor {
            return Err(RecipeError::unsupported(format!(
                "{op} requires per-tensor scaling, got {:?}",
                self.mode
            )));
        }
        for (what, t) in [
            ("amax", &self.amax),
            ("scale", &self.scale),
            ("scale_inv", &self.scale_inv),
        ] {
            if t.elem_count() != 1 {
                return Err(RecipeError::shape(what, &[1], t.dims()));
            }
            if t.dtype() != DType::F32 || !t.is_contiguous() {
                return Err(RecipeError::unsupported(format!(
                    "{what} must be a contiguous f32 tensor"
                )));
            }
        }
        ensure_distinct(&self.scale, &self.amax, "scale and amax")?;
        ensure_distinct(&self.scale_inv, &self.scale, "scale_inv and scale")
    }
}

/// Current-scaling operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct CurrentScalingUpdater;

impl CurrentScalingUpdater {
    pub fn new() -> Self {
        Self
    }

    /// Write `max(|input|)` into `output.amax`.
    pub fn compute_amax(
        &self,
        input: &Tensor,
        output: &Fp8Tensor,
        queue: &ExecutionQueue,
    ) -> Result<()> {
        output.ensure_per_tensor("compute_amax")?;
        if !matches!(input.dtype(), DType::F32 | DType::F16 | DType::BF16) {
            return Err(RecipeError::unsupported(format!(
                "compute_amax input must be unquantized, got {:?}",
                input.dtype()
            )));
        }
        if input.elem_count() != output.data.elem_count() {
            return Err(RecipeError::shape(
                "compute_amax input",
                output.data.dims(),
                input.dims(),
            ));
        }
        ensure_distinct(&output.amax, input, "amax and input")?;
        queue.admit(&[input, &output.amax])?;

        let input = input.contiguous()?;
        debug!(elems = input.elem_count(), "computing tensor amax");
        output.amax.inplace_op2(&input, &AmaxKernel)?;
        Ok(())
    }

    /// Derive `output.scale` (and `output.scale_inv`) from `output.amax`.
    ///
    /// The target format is the tensor's own.
    pub fn compute_scale_from_amax(
        &self,
        output: &Fp8Tensor,
        config: &CurrentScalingConfig,
        queue: &ExecutionQueue,
    ) -> Result<()> {
        output.ensure_per_tensor("compute_scale_from_amax")?;
        config.validate()?;
        queue.admit(&[&output.amax, &output.scale, &output.scale_inv])?;

        output.scale.inplace_op2(
            &output.amax,
            &ScaleFromAmax {
                opts: config.scale_options(output.format),
            },
        )?;
        output.scale_inv.inplace_op2(&output.scale, &Reciprocal)?;
        Ok(())
    }
}

/// amax (mut, `[1]`) from an unquantized input.
struct AmaxKernel;

impl InplaceOp2 for AmaxKernel {
    fn name(&self) -> &'static str {
        "current_scaling_amax"
    }

    fn cpu_fwd(
        &self,
        amax: &mut CpuStorage,
        amax_l: &Layout,
        input: &CpuStorage,
        input_l: &Layout,
    ) -> candle_core::Result<()> {
        let values = float_values(input, input_l, "input")?;
        let amax = f32_slice_mut(amax, amax_l, "amax")?;
        amax[0] = max_abs(&values);
        Ok(())
    }
}

/// scale (mut, `[1]`) from amax (`[1]`).
struct ScaleFromAmax {
    opts: ScaleOptions,
}

impl InplaceOp2 for ScaleFromAmax {
    fn name(&self) -> &'static str {
        "current_scaling_scale"
    }

    fn cpu_fwd(
        &self,
        scale: &mut CpuStorage,
        scale_l: &Layout,
        amax: &CpuStorage,
        amax_l: &Layout,
    ) -> candle_core::Result<()> {
        let amax = f32_slice(amax, amax_l, "amax")?[0];
        let scale = f32_slice_mut(scale, scale_l, "scale")?;
        let est = estimate_scale(amax, scale[0], &self.opts);
        if let Some(fallback) = est.fallback {
            log_fallback(fallback, 0, amax, est.scale);
        }
        scale[0] = est.scale;
        Ok(())
    }
}

/// scale_inv (mut) = 1 / scale.
struct Reciprocal;

impl InplaceOp2 for Reciprocal {
    fn name(&self) -> &'static str {
        "scale_reciprocal"
    }

    fn cpu_fwd(
        &self,
        inv: &mut CpuStorage,
        inv_l: &Layout,
        scale: &CpuStorage,
        scale_l: &Layout,
    ) -> candle_core::Result<()> {
        let scale = f32_slice(scale, scale_l, "scale")?;
        let inv = f32_slice_mut(inv, inv_l, "scale_inv")?;
        for (dst, &s) in inv.iter_mut().zip(scale) {
            *dst = if s > 0.0 && s.is_finite() {
                1.0 / s
            } else {
                DEFAULT_SCALE
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu() -> ExecutionQueue {
        ExecutionQueue::cpu()
    }

    #[test]
    fn test_compute_amax() {
        let input = Tensor::new(&[[1.0f32, -6.0], [3.0, 2.5]], &Device::Cpu).unwrap();
        let out = Fp8Tensor::per_tensor((2, 2), Fp8Format::E4M3, &Device::Cpu).unwrap();
        CurrentScalingUpdater::new()
            .compute_amax(&input, &out, &cpu())
            .unwrap();
        assert_eq!(out.amax_value().unwrap(), 6.0);
    }

    #[test]
    fn test_compute_amax_half_input() {
        let input = Tensor::new(&[0.5f32, -2.0, 1.0], &Device::Cpu)
            .unwrap()
            .to_dtype(DType::BF16)
            .unwrap();
        let out = Fp8Tensor::per_tensor(3, Fp8Format::E4M3, &Device::Cpu).unwrap();
        CurrentScalingUpdater::new()
            .compute_amax(&input, &out, &cpu())
            .unwrap();
        assert_eq!(out.amax_value().unwrap(), 2.0);
    }

    #[test]
    fn test_compute_amax_overwrites_previous() {
        let out = Fp8Tensor::per_tensor(2, Fp8Format::E4M3, &Device::Cpu).unwrap();
        let updater = CurrentScalingUpdater::new();
        let big = Tensor::new(&[100.0f32, 1.0], &Device::Cpu).unwrap();
        let small = Tensor::new(&[0.25f32, -0.5], &Device::Cpu).unwrap();
        updater.compute_amax(&big, &out, &cpu()).unwrap();
        updater.compute_amax(&small, &out, &cpu()).unwrap();
        assert_eq!(out.amax_value().unwrap(), 0.5);
    }

    #[test]
    fn test_compute_amax_rejects_quantized_input() {
        let input = Tensor::zeros(4, DType::U8, &Device::Cpu).unwrap();
        let out = Fp8Tensor::per_tensor(4, Fp8Format::E4M3, &Device::Cpu).unwrap();
        let err = CurrentScalingUpdater::new()
            .compute_amax(&input, &out, &cpu())
            .unwrap_err();
        assert!(matches!(err, RecipeError::UnsupportedConfiguration(_)));
    }

    #[test]
    fn test_scale_from_amax() {
        let input = Tensor::new(&[2.0f32, -8.0], &Device::Cpu).unwrap();
        let out = Fp8Tensor::per_tensor(2, Fp8Format::E4M3, &Device::Cpu).unwrap();
        let updater = CurrentScalingUpdater::new();
        updater.compute_amax(&input, &out, &cpu()).unwrap();
        updater
            .compute_scale_from_amax(&out, &CurrentScalingConfig::default(), &cpu())
            .unwrap();
        assert_eq!(out.scale_value().unwrap(), 56.0);
        assert!((out.scale_inv_value().unwrap() - 1.0 / 56.0).abs() < 1e-9);
    }

    #[test]
    fn test_scale_from_amax_uses_tensor_format() {
        let input = Tensor::new(&[1.0f32], &Device::Cpu).unwrap();
        let out = Fp8Tensor::per_tensor(1, Fp8Format::E5M2, &Device::Cpu).unwrap();
        let updater = CurrentScalingUpdater::new();
        updater.compute_amax(&input, &out, &cpu()).unwrap();
        let config = CurrentScalingConfig {
            margin: 1.0,
            ..Default::default()
        };
        updater.compute_scale_from_amax(&out, &config, &cpu()).unwrap();
        assert_eq!(out.scale_value().unwrap(), 28672.0);
    }

    #[test]
    fn test_scale_from_zero_amax_is_default() {
        let out = Fp8Tensor::per_tensor(4, Fp8Format::E4M3, &Device::Cpu).unwrap();
        CurrentScalingUpdater::new()
            .compute_scale_from_amax(&out, &CurrentScalingConfig::default(), &cpu())
            .unwrap();
        assert_eq!(out.scale_value().unwrap(), DEFAULT_SCALE);
        assert_eq!(out.scale_inv_value().unwrap(), 1.0);
    }

    #[test]
    fn test_scale_from_inf_amax_keeps_previous() {
        let input = Tensor::new(&[f32::INFINITY, 1.0], &Device::Cpu).unwrap();
        let mut out = Fp8Tensor::per_tensor(2, Fp8Format::E4M3, &Device::Cpu).unwrap();
        out.scale = Tensor::new(&[4.0f32], &Device::Cpu).unwrap();
        let updater = CurrentScalingUpdater::new();
        updater.compute_amax(&input, &out, &cpu()).unwrap();
        assert!(out.amax_value().unwrap().is_infinite());
        updater
            .compute_scale_from_amax(&out, &CurrentScalingConfig::default(), &cpu())
            .unwrap();
        assert_eq!(out.scale_value().unwrap(), 4.0);
    }

    #[test]
    fn test_pow_2_option() {
        let input = Tensor::new(&[3.0f32], &Device::Cpu).unwrap();
        let out = Fp8Tensor::per_tensor(1, Fp8Format::E4M3, &Device::Cpu).unwrap();
        let updater = CurrentScalingUpdater::new();
        updater.compute_amax(&input, &out, &cpu()).unwrap();
        let config = CurrentScalingConfig {
            force_pow_2_scales: true,
            ..Default::default()
        };
        updater.compute_scale_from_amax(&out, &config, &cpu()).unwrap();
        assert_eq!(out.scale_value().unwrap(), 128.0);
    }

    #[test]
    fn test_rejects_non_per_tensor_modes() {
        let updater = CurrentScalingUpdater::new();
        for mode in [ScalingMode::PerChannel, ScalingMode::Block { block_len: 128 }] {
            let out = Fp8Tensor::per_tensor(4, Fp8Format::E4M3, &Device::Cpu)
                .unwrap()
                .with_mode(mode);
            let err = updater
                .compute_scale_from_amax(&out, &CurrentScalingConfig::default(), &cpu())
                .unwrap_err();
            assert!(matches!(err, RecipeError::UnsupportedConfiguration(_)));
            assert_eq!(out.scale_value().unwrap(), 1.0);
        }
    }

    #[test]
    fn test_huge_margin_keeps_scale_pair_consistent() {
        let input = Tensor::new(&[1000.0f32, -3.0], &Device::Cpu).unwrap();
        let out = Fp8Tensor::per_tensor(2, Fp8Format::E4M3, &Device::Cpu).unwrap();
        let updater = CurrentScalingUpdater::new();
        updater.compute_amax(&input, &out, &cpu()).unwrap();
        let config = CurrentScalingConfig {
            margin: 160.0,
            ..Default::default()
        };
        updater.compute_scale_from_amax(&out, &config, &cpu()).unwrap();
        let scale = out.scale_value().unwrap();
        let scale_inv = out.scale_inv_value().unwrap();
        assert_eq!(scale, f32::MIN_POSITIVE);
        assert!(scale_inv.is_finite());
        assert_eq!(scale_inv, 1.0 / scale);
    }

    #[test]
    fn test_rejects_scale_sharing_amax_storage() {
        let mut out = Fp8Tensor::per_tensor(2, Fp8Format::E4M3, &Device::Cpu).unwrap();
        out.scale = out.amax.reshape(1).unwrap();
        let err = CurrentScalingUpdater::new()
            .compute_scale_from_amax(&out, &CurrentScalingConfig::default(), &cpu())
            .unwrap_err();
        assert!(matches!(err, RecipeError::UnsupportedConfiguration(_)));
    }
}
