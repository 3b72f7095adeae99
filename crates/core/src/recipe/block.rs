//! Block scaling: one amax and one scale per `block_len x block_len` block.
//!
//! The three passes (partial amax, scale derivation, partial cast) are separate
//! so a large tensor can be streamed in contiguous shards: every shard
//! contributes a partial amax grid, the caller max-reduces the grids, derives
//! scales once, then casts each shard against the shared scale grid.
//!
//! Grids are addressed through [`GridStrides`], so they may be transposed,
//! padded, or embedded in a larger buffer.

use std::ops::Range;

use candle_core::{CpuStorage, DType, InplaceOp2, InplaceOp3, Layout, Tensor};
use tracing::{debug, trace};

use super::config::BlockScalingConfig;
use super::cpu::{
    ensure_distinct, f32_slice, f32_slice_mut, float_values, max_abs, nan_max, u8_slice_mut,
};
use super::delayed::log_fallback;
use super::format::Fp8Format;
use super::scale::{estimate_scale, ScaleOptions};
use crate::error::{RecipeError, Result};
use crate::queue::ExecutionQueue;

/// Row-major `rows x cols` tensor cut into square blocks.
///
/// Edge blocks are ragged when `block_len` does not divide the dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    rows: usize,
    cols: usize,
    block_len: usize,
}

impl BlockLayout {
    pub fn new(rows: usize, cols: usize, block_len: usize) -> Result<Self> {
        if block_len == 0 {
            return Err(RecipeError::unsupported("block_len must be non-zero"));
        }
        if rows == 0 || cols == 0 || rows.checked_mul(cols).is_none() {
            return Err(RecipeError::shape("block tensor", &[1, 1], &[rows, cols]));
        }
        Ok(Self {
            rows,
            cols,
            block_len,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn block_len(&self) -> usize {
        self.block_len
    }

    pub fn numel(&self) -> usize {
        self.rows * self.cols
    }

    /// Number of blocks along each dimension.
    pub fn grid_dims(&self) -> (usize, usize) {
        (
            self.rows.div_ceil(self.block_len),
            self.cols.div_ceil(self.block_len),
        )
    }

    pub fn num_blocks(&self) -> usize {
        let (gh, gw) = self.grid_dims();
        gh * gw
    }

    /// Block coordinates of the element at flat index `flat`.
    pub fn block_of(&self, flat: usize) -> (usize, usize) {
        (
            flat / self.cols / self.block_len,
            flat % self.cols / self.block_len,
        )
    }

    /// In-bounds row and column ranges of block `(bi, bj)`.
    pub fn block_extent(&self, bi: usize, bj: usize) -> (Range<usize>, Range<usize>) {
        let r0 = bi * self.block_len;
        let c0 = bj * self.block_len;
        (
            r0..(r0 + self.block_len).min(self.rows),
            c0..(c0 + self.block_len).min(self.cols),
        )
    }

    /// Split the shard `[start, start + len)` into runs that stay inside one
    /// row of one block. The callback receives the block coordinates and the
    /// run as a range relative to `start`.
    fn visit_runs(&self, start: usize, len: usize, mut f: impl FnMut(usize, usize, Range<usize>)) {
        let end = start + len;
        let mut flat = start;
        while flat < end {
            let row = flat / self.cols;
            let col = flat % self.cols;
            let bj = col / self.block_len;
            let run_end_col = ((bj + 1) * self.block_len).min(self.cols);
            let run_end = (row * self.cols + run_end_col).min(end);
            f(row / self.block_len, bj, (flat - start)..(run_end - start));
            flat = run_end;
        }
    }

    fn check_shard(&self, start_offset: usize, len: usize) -> Result<()> {
        match start_offset.checked_add(len) {
            Some(end) if end <= self.numel() => Ok(()),
            _ => Err(RecipeError::shape(
                "block shard",
                &[self.numel()],
                &[start_offset, len],
            )),
        }
    }
}

/// Element strides used to address a block grid: block `(bi, bj)` lives at
/// `bi * stride_h + bj * stride_w`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridStrides {
    pub stride_h: usize,
    pub stride_w: usize,
}

impl GridStrides {
    pub fn new(stride_h: usize, stride_w: usize) -> Self {
        Self { stride_h, stride_w }
    }

    /// Dense row-major grid for `layout`.
    pub fn row_major(layout: &BlockLayout) -> Self {
        let (_, gw) = layout.grid_dims();
        Self::new(gw, 1)
    }

    #[inline]
    pub fn index(&self, bi: usize, bj: usize) -> usize {
        bi * self.stride_h + bj * self.stride_w
    }

    /// [`Self::index`], or `None` if it does not fit in `usize`.
    pub fn checked_index(&self, bi: usize, bj: usize) -> Option<usize> {
        bi.checked_mul(self.stride_h)?
            .checked_add(bj.checked_mul(self.stride_w)?)
    }

    fn check(&self, layout: &BlockLayout, grid: &Tensor, what: &'static str) -> Result<()> {
        if grid.dtype() != DType::F32 || !grid.is_contiguous() {
            return Err(RecipeError::unsupported(format!(
                "{what} must be a contiguous f32 tensor"
            )));
        }
        // Indices grow with (bi, bj), so bounding the last block bounds them all.
        let (gh, gw) = layout.grid_dims();
        match self.checked_index(gh - 1, gw - 1) {
            Some(last) if last < grid.elem_count() => Ok(()),
            Some(last) => Err(RecipeError::shape(what, &[last + 1], grid.dims())),
            None => Err(RecipeError::shape(
                what,
                &[gh, gw],
                &[self.stride_h, self.stride_w],
            )),
        }
    }
}

/// Block-granular amax, scale, and cast.
#[derive(Debug, Clone)]
pub struct BlockScalingEngine {
    config: BlockScalingConfig,
}

impl BlockScalingEngine {
    pub fn new(config: BlockScalingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &BlockScalingConfig {
        &self.config
    }

    /// Layout of a `rows x cols` tensor with the configured block length.
    pub fn layout(&self, rows: usize, cols: usize) -> Result<BlockLayout> {
        BlockLayout::new(rows, cols, self.config.block_len)
    }

    /// Write one partial amax per block for the shard `input`, which holds
    /// flat elements `[start_offset, start_offset + input.elem_count())`.
    ///
    /// Every block in the grid is written; blocks with no element in the shard
    /// receive 0.
    pub fn compute_partial_amax(
        &self,
        input: &Tensor,
        amax_grid: &Tensor,
        layout: &BlockLayout,
        strides: GridStrides,
        start_offset: usize,
        queue: &ExecutionQueue,
    ) -> Result<()> {
        check_input(input)?;
        layout.check_shard(start_offset, input.elem_count())?;
        strides.check(layout, amax_grid, "amax grid")?;
        ensure_distinct(amax_grid, input, "amax grid and block input")?;
        queue.admit(&[input, amax_grid])?;

        let input = input.contiguous()?;
        debug!(
            rows = layout.rows,
            cols = layout.cols,
            block_len = layout.block_len,
            start_offset,
            len = input.elem_count(),
            "block partial amax"
        );
        amax_grid.inplace_op2(
            &input,
            &PartialAmax {
                layout: *layout,
                strides,
                start: start_offset,
            },
        )?;
        Ok(())
    }

    /// Derive one scale per block from a (fully reduced) amax grid.
    ///
    /// Degenerate amaxes follow the per-tensor policy, using the value already
    /// in `scale_grid` as the previous scale.
    pub fn compute_scales(
        &self,
        amax_grid: &Tensor,
        amax_strides: GridStrides,
        scale_grid: &Tensor,
        scale_strides: GridStrides,
        layout: &BlockLayout,
        queue: &ExecutionQueue,
    ) -> Result<()> {
        amax_strides.check(layout, amax_grid, "amax grid")?;
        scale_strides.check(layout, scale_grid, "scale grid")?;
        ensure_distinct(scale_grid, amax_grid, "amax grid and scale grid")?;
        queue.admit(&[amax_grid, scale_grid])?;

        scale_grid.inplace_op2(
            amax_grid,
            &BlockScales {
                layout: *layout,
                amax_strides,
                scale_strides,
                opts: self.config.scale_options(),
            },
        )?;
        Ok(())
    }

    /// Cast the shard `input` into `output` (U8, same element count) using the
    /// configured format and each element's block scale.
    #[allow(clippy::too_many_arguments)]
    pub fn partial_cast(
        &self,
        input: &Tensor,
        output: &Tensor,
        scale_grid: &Tensor,
        layout: &BlockLayout,
        strides: GridStrides,
        start_offset: usize,
        queue: &ExecutionQueue,
    ) -> Result<()> {
        check_input(input)?;
        layout.check_shard(start_offset, input.elem_count())?;
        strides.check(layout, scale_grid, "scale grid")?;
        if output.dtype() != DType::U8 || !output.is_contiguous() {
            return Err(RecipeError::unsupported(
                "cast output must be a contiguous u8 tensor",
            ));
        }
        if output.elem_count() != input.elem_count() {
            return Err(RecipeError::shape("cast output", input.dims(), output.dims()));
        }
        ensure_distinct(scale_grid, input, "scale grid and block input")?;
        queue.admit(&[input, output, scale_grid])?;

        let input = input.contiguous()?;
        debug!(
            format = %self.config.fp8_format,
            start_offset,
            len = input.elem_count(),
            "block partial cast"
        );
        output.inplace_op3(
            &input,
            scale_grid,
            &PartialCast {
                layout: *layout,
                strides,
                start: start_offset,
                format: self.config.fp8_format,
            },
        )?;
        Ok(())
    }
}

fn check_input(input: &Tensor) -> Result<()> {
    if matches!(input.dtype(), DType::F32 | DType::F16 | DType::BF16) {
        Ok(())
    } else {
        Err(RecipeError::unsupported(format!(
            "block input must be unquantized, got {:?}",
            input.dtype()
        )))
    }
}

/// amax grid (mut) from one input shard.
struct PartialAmax {
    layout: BlockLayout,
    strides: GridStrides,
    start: usize,
}

impl InplaceOp2 for PartialAmax {
    fn name(&self) -> &'static str {
        "block_partial_amax"
    }

    fn cpu_fwd(
        &self,
        grid: &mut CpuStorage,
        grid_l: &Layout,
        input: &CpuStorage,
        input_l: &Layout,
    ) -> candle_core::Result<()> {
        let values = float_values(input, input_l, "block input")?;
        let grid = f32_slice_mut(grid, grid_l, "amax grid")?;

        let (gh, gw) = self.layout.grid_dims();
        let mut partial = vec![0.0f32; gh * gw];
        self.layout.visit_runs(self.start, values.len(), |bi, bj, run| {
            let slot = &mut partial[bi * gw + bj];
            *slot = nan_max(*slot, max_abs(&values[run]));
        });

        for bi in 0..gh {
            for bj in 0..gw {
                grid[self.strides.index(bi, bj)] = partial[bi * gw + bj];
            }
        }
        trace!(blocks = gh * gw, "partial amax written");
        Ok(())
    }
}

/// scale grid (mut) from amax grid.
struct BlockScales {
    layout: BlockLayout,
    amax_strides: GridStrides,
    scale_strides: GridStrides,
    opts: ScaleOptions,
}

impl InplaceOp2 for BlockScales {
    fn name(&self) -> &'static str {
        "block_scales"
    }

    fn cpu_fwd(
        &self,
        scales: &mut CpuStorage,
        scales_l: &Layout,
        amax: &CpuStorage,
        amax_l: &Layout,
    ) -> candle_core::Result<()> {
        let amax = f32_slice(amax, amax_l, "amax grid")?;
        let scales = f32_slice_mut(scales, scales_l, "scale grid")?;

        let (gh, gw) = self.layout.grid_dims();
        for bi in 0..gh {
            for bj in 0..gw {
                let reference = amax[self.amax_strides.index(bi, bj)];
                let dst = &mut scales[self.scale_strides.index(bi, bj)];
                let est = estimate_scale(reference, *dst, &self.opts);
                if let Some(fallback) = est.fallback {
                    log_fallback(fallback, bi * gw + bj, reference, est.scale);
                }
                *dst = est.scale;
            }
        }
        Ok(())
    }
}

/// Encoded output (mut) from an input shard and a scale grid.
struct PartialCast {
    layout: BlockLayout,
    strides: GridStrides,
    start: usize,
    format: Fp8Format,
}

impl InplaceOp3 for PartialCast {
    fn name(&self) -> &'static str {
        "block_partial_cast"
    }

    fn cpu_fwd(
        &self,
        out: &mut CpuStorage,
        out_l: &Layout,
        input: &CpuStorage,
        input_l: &Layout,
        scales: &CpuStorage,
        scales_l: &Layout,
    ) -> candle_core::Result<()> {
        let values = float_values(input, input_l, "block input")?;
        let scales = f32_slice(scales, scales_l, "scale grid")?;
        let out = u8_slice_mut(out, out_l, "cast output")?;
        if out.len() != values.len() {
            candle_core::bail!("cast output holds {} bytes for {} inputs", out.len(), values.len());
        }

        self.layout.visit_runs(self.start, values.len(), |bi, bj, run| {
            let scale = scales[self.strides.index(bi, bj)];
            for (dst, &x) in out[run.clone()].iter_mut().zip(&values[run]) {
                *dst = self.format.quantize(x * scale);
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn cpu() -> ExecutionQueue {
        ExecutionQueue::cpu()
    }

    /// 5x5 tensor whose element k is +k for even k and -k for odd k.
    fn signed_ramp(range: Range<usize>) -> Tensor {
        let values: Vec<f32> = range
            .map(|k| if k % 2 == 0 { k as f32 } else { -(k as f32) })
            .collect();
        let n = values.len();
        Tensor::from_vec(values, n, &Device::Cpu).unwrap()
    }

    fn engine() -> BlockScalingEngine {
        BlockScalingEngine::new(BlockScalingConfig::default().with_block_len(2)).unwrap()
    }

    fn grid(n: usize) -> Tensor {
        Tensor::zeros(n, DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_layout_ragged_grid() {
        let layout = BlockLayout::new(5, 5, 2).unwrap();
        assert_eq!(layout.grid_dims(), (3, 3));
        assert_eq!(layout.block_extent(2, 2), (4..5, 4..5));
        assert_eq!(layout.block_extent(0, 1), (0..2, 2..4));
        assert_eq!(layout.block_of(24), (2, 2));
        assert_eq!(layout.block_of(7), (0, 1));
    }

    #[test]
    fn test_visit_runs_covers_shard_once() {
        let layout = BlockLayout::new(5, 5, 2).unwrap();
        let mut seen = vec![0usize; 12];
        let mut runs = Vec::new();
        layout.visit_runs(13, 12, |bi, bj, run| {
            for k in run.clone() {
                seen[k] += 1;
            }
            runs.push((bi, bj, run));
        });
        assert!(seen.iter().all(|&c| c == 1));
        // Element 13 is row 2, col 3: block (1, 1), alone until the block edge.
        assert_eq!(runs[0], (1, 1, 0..1));
        assert_eq!(runs[1], (1, 2, 1..2));
    }

    #[test]
    fn test_full_amax_uses_in_bounds_elements_only() {
        let engine = engine();
        let layout = engine.layout(5, 5).unwrap();
        let amax = grid(9);
        engine
            .compute_partial_amax(
                &signed_ramp(0..25),
                &amax,
                &layout,
                GridStrides::row_major(&layout),
                0,
                &cpu(),
            )
            .unwrap();
        assert_eq!(
            amax.to_vec1::<f32>().unwrap(),
            vec![6.0, 8.0, 9.0, 16.0, 18.0, 19.0, 21.0, 23.0, 24.0]
        );
    }

    #[test]
    fn test_shards_reduce_to_full_grid() {
        let engine = engine();
        let layout = engine.layout(5, 5).unwrap();
        let strides = GridStrides::row_major(&layout);

        let full = grid(9);
        engine
            .compute_partial_amax(&signed_ramp(0..25), &full, &layout, strides, 0, &cpu())
            .unwrap();

        let first = grid(9);
        let second = grid(9);
        engine
            .compute_partial_amax(&signed_ramp(0..13), &first, &layout, strides, 0, &cpu())
            .unwrap();
        engine
            .compute_partial_amax(&signed_ramp(13..25), &second, &layout, strides, 13, &cpu())
            .unwrap();

        // Shard 13..25 starts at row 2, so the first block row is untouched.
        assert_eq!(&second.to_vec1::<f32>().unwrap()[..3], &[0.0, 0.0, 0.0]);
        let reduced = first.maximum(&second).unwrap();
        assert_eq!(
            reduced.to_vec1::<f32>().unwrap(),
            full.to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn test_transposed_and_padded_grids() {
        let engine = engine();
        let layout = engine.layout(5, 5).unwrap();
        let input = signed_ramp(0..25);

        let transposed = grid(9);
        engine
            .compute_partial_amax(&input, &transposed, &layout, GridStrides::new(1, 3), 0, &cpu())
            .unwrap();
        assert_eq!(
            transposed.to_vec1::<f32>().unwrap(),
            vec![6.0, 16.0, 21.0, 8.0, 18.0, 23.0, 9.0, 19.0, 24.0]
        );

        let padded = Tensor::from_vec(vec![-1.0f32; 12], 12, &Device::Cpu).unwrap();
        engine
            .compute_partial_amax(&input, &padded, &layout, GridStrides::new(4, 1), 0, &cpu())
            .unwrap();
        let padded = padded.to_vec1::<f32>().unwrap();
        assert_eq!(padded[3], -1.0);
        assert_eq!(padded[7], -1.0);
        assert_eq!(padded[11], -1.0);
        assert_eq!(padded[10], 24.0);
    }

    #[test]
    fn test_scales_and_cast() {
        let engine = engine();
        let layout = engine.layout(5, 5).unwrap();
        let strides = GridStrides::row_major(&layout);
        let input = signed_ramp(0..25);

        let amax = grid(9);
        let scales = grid(9);
        engine
            .compute_partial_amax(&input, &amax, &layout, strides, 0, &cpu())
            .unwrap();
        engine
            .compute_scales(&amax, strides, &scales, strides, &layout, &cpu())
            .unwrap();
        let scale_values = scales.to_vec1::<f32>().unwrap();
        // 448 / 6 rounded down to a power of two.
        assert_eq!(scale_values[0], 64.0);
        // 448 / 24 rounded down to a power of two.
        assert_eq!(scale_values[8], 16.0);

        let out = Tensor::zeros(25, DType::U8, &Device::Cpu).unwrap();
        engine
            .partial_cast(&input, &out, &scales, &layout, strides, 0, &cpu())
            .unwrap();
        let bytes = out.to_vec1::<u8>().unwrap();
        let xs = input.to_vec1::<f32>().unwrap();
        for (k, (&b, &x)) in bytes.iter().zip(&xs).enumerate() {
            let (bi, bj) = layout.block_of(k);
            let s = scale_values[bi * 3 + bj];
            assert_eq!(b, Fp8Format::E4M3.quantize(x * s), "element {k}");
        }
        assert_eq!(Fp8Format::E4M3.dequantize(bytes[6]), 384.0);
        assert_eq!(Fp8Format::E4M3.dequantize(bytes[24]), 384.0);
    }

    #[test]
    fn test_sharded_cast_matches_full_cast() {
        let engine = engine();
        let layout = engine.layout(5, 5).unwrap();
        let strides = GridStrides::row_major(&layout);
        let scales = Tensor::new(&[1.0f32, 2.0, 4.0, 8.0, 16.0, 32.0, 0.5, 0.25, 0.125], &Device::Cpu)
            .unwrap();

        let full = Tensor::zeros(25, DType::U8, &Device::Cpu).unwrap();
        engine
            .partial_cast(&signed_ramp(0..25), &full, &scales, &layout, strides, 0, &cpu())
            .unwrap();

        let tail = Tensor::zeros(12, DType::U8, &Device::Cpu).unwrap();
        engine
            .partial_cast(&signed_ramp(13..25), &tail, &scales, &layout, strides, 13, &cpu())
            .unwrap();
        assert_eq!(
            tail.to_vec1::<u8>().unwrap(),
            full.to_vec1::<u8>().unwrap()[13..].to_vec()
        );
    }

    #[test]
    fn test_zero_block_gets_default_scale() {
        let engine = engine();
        let layout = engine.layout(2, 4).unwrap();
        let strides = GridStrides::row_major(&layout);
        let amax = Tensor::new(&[0.0f32, 7.0], &Device::Cpu).unwrap();
        let scales = grid(2);
        engine
            .compute_scales(&amax, strides, &scales, strides, &layout, &cpu())
            .unwrap();
        assert_eq!(scales.to_vec1::<f32>().unwrap(), vec![1.0, 64.0]);
    }

    #[test]
    fn test_rejects_shard_past_end() {
        let engine = engine();
        let layout = engine.layout(5, 5).unwrap();
        let amax = Tensor::from_vec(vec![-1.0f32; 9], 9, &Device::Cpu).unwrap();
        let err = engine
            .compute_partial_amax(
                &signed_ramp(0..13),
                &amax,
                &layout,
                GridStrides::row_major(&layout),
                13,
                &cpu(),
            )
            .unwrap_err();
        assert!(matches!(err, RecipeError::ShapeMismatch { .. }));
        assert!(amax.to_vec1::<f32>().unwrap().iter().all(|&v| v == -1.0));
    }

    #[test]
    fn test_rejects_small_grid() {
        let engine = engine();
        let layout = engine.layout(5, 5).unwrap();
        let err = engine
            .compute_partial_amax(
                &signed_ramp(0..25),
                &grid(8),
                &layout,
                GridStrides::row_major(&layout),
                0,
                &cpu(),
            )
            .unwrap_err();
        assert!(matches!(err, RecipeError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_rejects_bad_cast_output() {
        let engine = engine();
        let layout = engine.layout(5, 5).unwrap();
        let strides = GridStrides::row_major(&layout);
        let scales = Tensor::ones(9, DType::F32, &Device::Cpu).unwrap();
        let wrong_dtype = grid(25);
        let err = engine
            .partial_cast(&signed_ramp(0..25), &wrong_dtype, &scales, &layout, strides, 0, &cpu())
            .unwrap_err();
        assert!(matches!(err, RecipeError::UnsupportedConfiguration(_)));

        let short = Tensor::zeros(24, DType::U8, &Device::Cpu).unwrap();
        let err = engine
            .partial_cast(&signed_ramp(0..25), &short, &scales, &layout, strides, 0, &cpu())
            .unwrap_err();
        assert!(matches!(err, RecipeError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_rejects_aliased_grids() {
        let engine = engine();
        let layout = engine.layout(5, 5).unwrap();
        let strides = GridStrides::row_major(&layout);
        let g = grid(9);
        let err = engine
            .compute_scales(&g, strides, &g, strides, &layout, &cpu())
            .unwrap_err();
        assert!(matches!(err, RecipeError::UnsupportedConfiguration(_)));
    }

    #[test]
    fn test_rejects_overflowing_strides() {
        let engine = engine();
        let layout = engine.layout(5, 5).unwrap();
        let amax = Tensor::from_vec(vec![-1.0f32; 9], 9, &Device::Cpu).unwrap();
        for strides in [
            GridStrides::new(usize::MAX / 2 + 1, 1),
            GridStrides::new(3, usize::MAX / 2 + 1),
            GridStrides::new(usize::MAX, usize::MAX),
        ] {
            let err = engine
                .compute_partial_amax(&signed_ramp(0..25), &amax, &layout, strides, 0, &cpu())
                .unwrap_err();
            assert!(matches!(err, RecipeError::ShapeMismatch { .. }), "{strides:?}");
        }
        assert!(amax.to_vec1::<f32>().unwrap().iter().all(|&v| v == -1.0));
        assert_eq!(GridStrides::new(usize::MAX / 2 + 1, 1).checked_index(2, 0), None);
        assert_eq!(GridStrides::new(3, 1).checked_index(2, 2), Some(8));
    }

    #[test]
    fn test_rejects_overflowing_layout() {
        assert!(matches!(
            BlockLayout::new(usize::MAX / 2, 3, 128),
            Err(RecipeError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_nan_block_keeps_previous_scale() {
        let engine = engine();
        let layout = engine.layout(2, 4).unwrap();
        let strides = GridStrides::row_major(&layout);
        let input = Tensor::new(&[1.0f32, f32::NAN, 3.0, -7.0, 0.5, 0.25, 2.0, 1.0], &Device::Cpu)
            .unwrap();

        let amax = grid(2);
        engine
            .compute_partial_amax(&input, &amax, &layout, strides, 0, &cpu())
            .unwrap();
        let amax_values = amax.to_vec1::<f32>().unwrap();
        assert!(amax_values[0].is_nan());
        assert_eq!(amax_values[1], 7.0);

        let scales = Tensor::new(&[32.0f32, 1.0], &Device::Cpu).unwrap();
        engine
            .compute_scales(&amax, strides, &scales, strides, &layout, &cpu())
            .unwrap();
        assert_eq!(scales.to_vec1::<f32>().unwrap(), vec![32.0, 64.0]);
    }

    #[test]
    fn test_rejects_grids_sharing_storage() {
        let engine = engine();
        let layout = engine.layout(2, 4).unwrap();
        let strides = GridStrides::row_major(&layout);
        let buffer = Tensor::new(&[3.0f32, 7.0, 1.0, 1.0], &Device::Cpu).unwrap();
        let amax = buffer.narrow(0, 0, 2).unwrap();
        let scales = buffer.narrow(0, 2, 2).unwrap();
        let err = engine
            .compute_scales(&amax, strides, &scales, strides, &layout, &cpu())
            .unwrap_err();
        assert!(matches!(err, RecipeError::UnsupportedConfiguration(_)));
        assert_eq!(buffer.to_vec1::<f32>().unwrap(), vec![3.0, 7.0, 1.0, 1.0]);
    }
}
