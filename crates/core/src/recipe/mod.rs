//! FP8 scaling recipes.
//!
//! Three recipes decide the scale factors used to cast tensors into FP8:
//! - **Delayed scaling**: the next scale comes from a rolling history of
//!   observed amaxes, optionally merged with a cross-worker reduction first.
//! - **Current scaling**: the scale comes from the amax of the tensor being cast.
//! - **Block scaling**: one amax and one scale per square block of a matrix.
//!
//! All three share one scale formula, `scale = 2^-margin * fp8_max / amax`,
//! with a fixed fallback for zero and non-finite amaxes (see [`estimate_scale`]).
//!
//! # Example
//!
//! ```ignore
//! use fp8_scaling_core::recipe::{update_delayed_scaling, AmaxHistory, Fp8Format, ScaleFactor};
//! use fp8_scaling_core::ExecutionQueue;
//!
//! let queue = ExecutionQueue::cpu();
//! let mut history = AmaxHistory::zeros(1024, 2, queue.device())?;
//! let scale = ScaleFactor::ones(2, queue.device())?;
//! history.record(&[3.5, 0.25])?;
//! update_delayed_scaling(&mut history, &scale, "max", Fp8Format::E4M3, 0.0, &queue)?;
//! ```

mod amax_history;
mod block;
mod config;
mod cpu;
mod current;
mod delayed;
mod format;
mod scale;

pub use amax_history::AmaxHistory;
pub use block::{BlockLayout, BlockScalingEngine, GridStrides};
pub use config::{
    AmaxComputeAlgo, BlockScalingConfig, CurrentScalingConfig, DelayedScalingConfig,
    DEFAULT_AMAX_HISTORY_LEN, DEFAULT_BLOCK_LEN,
};
pub use current::{CurrentScalingUpdater, Fp8Tensor, ScalingMode};
pub use delayed::DelayedScalingUpdater;
pub use format::{Fp8Format, Fp8Recipe, FP8_E4M3_MAX, FP8_E5M2_MAX};
pub use scale::{estimate_scale, Fallback, ScaleEstimate, ScaleFactor, ScaleOptions, DEFAULT_SCALE};

use candle_core::Tensor;

use crate::error::Result;
use crate::queue::ExecutionQueue;

fn delayed_updater(
    history_length: usize,
    amax_compute_algo: &str,
    fp8_format: Fp8Format,
    margin: f32,
) -> Result<DelayedScalingUpdater> {
    let config = DelayedScalingConfig::default()
        .with_algo(amax_compute_algo.parse()?)
        .with_format(fp8_format)
        .with_margin(margin)
        .with_history_len(history_length);
    DelayedScalingUpdater::new(config)
}

/// Delayed-scaling update of one tensor's history and scale, in place.
///
/// `amax_compute_algo` is `"max"` or `"most_recent"`.
pub fn update_delayed_scaling(
    history: &mut AmaxHistory,
    scale: &ScaleFactor,
    amax_compute_algo: &str,
    fp8_format: Fp8Format,
    margin: f32,
    queue: &ExecutionQueue,
) -> Result<()> {
    delayed_updater(history.history_length(), amax_compute_algo, fp8_format, margin)?
        .update(history, scale, queue)
}

/// Delayed-scaling update writing into separate output state.
#[allow(clippy::too_many_arguments)]
pub fn update_delayed_scaling_into(
    history_in: &AmaxHistory,
    scale_in: &ScaleFactor,
    history_out: &mut AmaxHistory,
    scale_out: &ScaleFactor,
    amax_compute_algo: &str,
    fp8_format: Fp8Format,
    margin: f32,
    queue: &ExecutionQueue,
) -> Result<()> {
    delayed_updater(history_in.history_length(), amax_compute_algo, fp8_format, margin)?
        .update_into(history_in, scale_in, history_out, scale_out, queue)
}

/// Bulk delayed-scaling update after cross-worker amax reduction.
///
/// See [`DelayedScalingUpdater::update_bulk`] for the buffer layout.
pub fn update_delayed_scaling_bulk(
    reduction: &Tensor,
    histories: &mut [AmaxHistory],
    scales: &[ScaleFactor],
    amax_compute_algo: &str,
    fp8_format: Fp8Format,
    margin: f32,
    queue: &ExecutionQueue,
) -> Result<()> {
    // History length only sizes freshly allocated state; any valid value works.
    let history_length = histories
        .first()
        .map_or(DEFAULT_AMAX_HISTORY_LEN, AmaxHistory::history_length);
    delayed_updater(history_length, amax_compute_algo, fp8_format, margin)?
        .update_bulk(reduction, histories, scales, queue)
}

/// Write `max(|input|)` into `output`'s amax slot.
pub fn compute_amax(input: &Tensor, output: &Fp8Tensor, queue: &ExecutionQueue) -> Result<()> {
    CurrentScalingUpdater::new().compute_amax(input, output, queue)
}

/// Derive `output`'s scale and inverse scale from its amax slot.
pub fn compute_scale_from_amax(
    output: &Fp8Tensor,
    config: &CurrentScalingConfig,
    queue: &ExecutionQueue,
) -> Result<()> {
    CurrentScalingUpdater::new().compute_scale_from_amax(output, config, queue)
}

fn block_engine(block_len: usize, fp8_format: Fp8Format) -> Result<BlockScalingEngine> {
    BlockScalingEngine::new(BlockScalingConfig {
        block_len,
        fp8_format,
        ..Default::default()
    })
}

/// Per-block partial amax of a contiguous shard of an `h x w` tensor.
#[allow(clippy::too_many_arguments)]
pub fn block_compute_partial_amax(
    input: &Tensor,
    amax_grid: &Tensor,
    h: usize,
    w: usize,
    amax_stride_h: usize,
    amax_stride_w: usize,
    start_offset: usize,
    block_len: usize,
    queue: &ExecutionQueue,
) -> Result<()> {
    let engine = block_engine(block_len, Fp8Format::default())?;
    let layout = engine.layout(h, w)?;
    engine.compute_partial_amax(
        input,
        amax_grid,
        &layout,
        GridStrides::new(amax_stride_h, amax_stride_w),
        start_offset,
        queue,
    )
}

/// Per-block scales from a reduced amax grid. Both grids share one stride pair.
#[allow(clippy::too_many_arguments)]
pub fn block_compute_scales(
    amax_grid: &Tensor,
    scale_grid: &Tensor,
    h: usize,
    w: usize,
    stride_h: usize,
    stride_w: usize,
    config: &BlockScalingConfig,
    queue: &ExecutionQueue,
) -> Result<()> {
    let engine = BlockScalingEngine::new(*config)?;
    let layout = engine.layout(h, w)?;
    let strides = GridStrides::new(stride_h, stride_w);
    engine.compute_scales(amax_grid, strides, scale_grid, strides, &layout, queue)
}

/// Cast a contiguous shard of an `h x w` tensor to `out_dtype` using its
/// blocks' scales.
#[allow(clippy::too_many_arguments)]
pub fn block_partial_cast(
    input: &Tensor,
    output: &Tensor,
    scale_grid: &Tensor,
    h: usize,
    w: usize,
    scale_stride_h: usize,
    scale_stride_w: usize,
    start_offset: usize,
    block_len: usize,
    out_dtype: Fp8Format,
    queue: &ExecutionQueue,
) -> Result<()> {
    let engine = block_engine(block_len, out_dtype)?;
    let layout = engine.layout(h, w)?;
    engine.partial_cast(
        input,
        output,
        scale_grid,
        &layout,
        GridStrides::new(scale_stride_h, scale_stride_w),
        start_offset,
        queue,
    )
}
