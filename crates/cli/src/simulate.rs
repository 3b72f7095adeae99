//! Drives the recipes over seeded synthetic tensors.
//!
//! Each runner returns a serializable report; `main` prints it as JSON.

use anyhow::{ensure, Context};
use candle_core::{DType, Tensor};
use fp8_scaling_core::recipe::{
    compute_amax, compute_scale_from_amax, BlockScalingConfig, BlockScalingEngine,
    CurrentScalingConfig, DelayedScalingConfig, DelayedScalingUpdater, Fp8Format, Fp8Tensor,
    GridStrides,
};
use fp8_scaling_core::ExecutionQueue;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info};

/// Parameters of a `delayed` run.
#[derive(Debug, Clone, Copy)]
pub struct DelayedRun {
    pub tensors: usize,
    pub scales: usize,
    pub steps: usize,
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DelayedReport {
    pub algo: String,
    pub format: Fp8Format,
    pub history_len: usize,
    pub steps: usize,
    /// Final scales, one row per tensor.
    pub scales: Vec<Vec<f32>>,
    /// Newest history row per tensor after the last rotation (all zero).
    pub newest: Vec<Vec<f32>>,
}

/// Simulate `steps` training steps of bulk delayed scaling.
///
/// Every step each tensor records a local amax per slot, then a synthetic
/// cross-worker reduction raises roughly half of the slots before the bulk
/// update runs.
pub fn run_delayed(
    config: DelayedScalingConfig,
    run: DelayedRun,
    queue: &ExecutionQueue,
) -> anyhow::Result<DelayedReport> {
    ensure!(run.tensors > 0 && run.scales > 0, "need at least one tensor and one scale");
    let updater = DelayedScalingUpdater::new(config)?;
    let mut rng = StdRng::seed_from_u64(run.seed);

    let mut histories = Vec::with_capacity(run.tensors);
    let mut scales = Vec::with_capacity(run.tensors);
    for _ in 0..run.tensors {
        let (history, scale) = updater.new_state(run.scales, queue)?;
        histories.push(history);
        scales.push(scale);
    }

    for step in 0..run.steps {
        // Activations drift upward over time so scales visibly shrink.
        let growth = 1.0 + step as f32 * 0.1;
        for history in histories.iter_mut() {
            let local: Vec<f32> = (0..run.scales)
                .map(|_| rng.gen_range(0.1f32..4.0) * growth)
                .collect();
            history.record(&local)?;
        }

        let reduced: Vec<f32> = (0..run.tensors * run.scales)
            .map(|_| {
                if rng.gen_bool(0.5) {
                    rng.gen_range(4.0f32..8.0) * growth
                } else {
                    0.0
                }
            })
            .collect();
        let len = reduced.len();
        let reduction = Tensor::from_vec(reduced, len, queue.device())?;

        updater
            .update_bulk(&reduction, &mut histories, &scales, queue)
            .with_context(|| format!("bulk update failed at step {step}"))?;

        let first = scales[0].to_vec()?;
        info!(step, scale_0 = first[0], "step complete");
    }

    let scales = scales
        .iter()
        .map(|s| s.to_vec())
        .collect::<fp8_scaling_core::Result<Vec<_>>>()?;
    let newest = histories
        .iter()
        .map(|h| h.newest())
        .collect::<fp8_scaling_core::Result<Vec<_>>>()?;

    Ok(DelayedReport {
        algo: config.amax_compute_algo.to_string(),
        format: config.fp8_format,
        history_len: config.amax_history_len,
        steps: run.steps,
        scales,
        newest,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct CurrentReport {
    pub format: Fp8Format,
    pub len: usize,
    pub amax: f32,
    pub scale: f32,
    pub scale_inv: f32,
}

/// Current scaling over one synthetic tensor of `len` elements.
pub fn run_current(
    config: CurrentScalingConfig,
    format: Fp8Format,
    len: usize,
    seed: u64,
    queue: &ExecutionQueue,
) -> anyhow::Result<CurrentReport> {
    ensure!(len > 0, "tensor length must be positive");
    let mut rng = StdRng::seed_from_u64(seed);
    let values: Vec<f32> = (0..len).map(|_| rng.gen_range(-3.0f32..3.0)).collect();
    let input = Tensor::from_vec(values, len, queue.device())?;

    let output = Fp8Tensor::per_tensor(len, format, queue.device())?;
    compute_amax(&input, &output, queue)?;
    compute_scale_from_amax(&output, &config, queue)?;

    let report = CurrentReport {
        format,
        len,
        amax: output.amax_value()?,
        scale: output.scale_value()?,
        scale_inv: output.scale_inv_value()?,
    };
    info!(amax = report.amax, scale = report.scale, "current scaling done");
    Ok(report)
}

/// Parameters of a `block` run.
#[derive(Debug, Clone, Copy)]
pub struct BlockRun {
    pub rows: usize,
    pub cols: usize,
    pub shards: usize,
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockReport {
    pub format: Fp8Format,
    pub block_len: usize,
    pub grid_rows: usize,
    pub grid_cols: usize,
    pub shards: usize,
    /// Reduced amax grid, row-major.
    pub amax: Vec<f32>,
    /// Scale grid, row-major.
    pub scales: Vec<f32>,
    /// Largest `|x - dequantize(cast(x)) / scale|` over all elements.
    pub max_abs_error: f32,
}

/// Two-pass block scaling over `shards` contiguous shards of a synthetic
/// `rows x cols` tensor.
pub fn run_block(
    config: BlockScalingConfig,
    run: BlockRun,
    queue: &ExecutionQueue,
) -> anyhow::Result<BlockReport> {
    let engine = BlockScalingEngine::new(config)?;
    let layout = engine.layout(run.rows, run.cols)?;
    let numel = layout.numel();
    ensure!(
        run.shards > 0 && run.shards <= numel,
        "shard count must be between 1 and {numel}"
    );
    let strides = GridStrides::row_major(&layout);
    let (grid_rows, grid_cols) = layout.grid_dims();
    let device = queue.device();

    let mut rng = StdRng::seed_from_u64(run.seed);
    let values: Vec<f32> = (0..numel)
        .map(|i| {
            // Give each block row its own magnitude so block scales differ.
            let block_row = i / run.cols / config.block_len;
            rng.gen_range(-1.0f32..1.0) * (1 << (block_row % 8)) as f32
        })
        .collect();
    let input = Tensor::from_vec(values.clone(), numel, device)?;

    let bounds: Vec<(usize, usize)> = (0..run.shards)
        .map(|s| (s * numel / run.shards, (s + 1) * numel / run.shards))
        .collect();

    // Pass 1: partial amax per shard, then the cross-shard max.
    let mut reduced: Option<Tensor> = None;
    for &(start, end) in &bounds {
        let shard = input.narrow(0, start, end - start)?;
        let partial = Tensor::zeros(layout.num_blocks(), DType::F32, device)?;
        engine.compute_partial_amax(&shard, &partial, &layout, strides, start, queue)?;
        debug!(start, end, "shard amax computed");
        reduced = Some(match reduced {
            Some(acc) => acc.maximum(&partial)?,
            None => partial,
        });
    }
    let amax = reduced.context("no shards")?;

    let scales = Tensor::zeros(layout.num_blocks(), DType::F32, device)?;
    engine.compute_scales(&amax, strides, &scales, strides, &layout, queue)?;
    let scale_values = scales.to_vec1::<f32>()?;

    // Pass 2: cast every shard against the shared scale grid.
    let mut max_abs_error = 0.0f32;
    for &(start, end) in &bounds {
        let shard = input.narrow(0, start, end - start)?;
        let out = Tensor::zeros(end - start, DType::U8, device)?;
        engine.partial_cast(&shard, &out, &scales, &layout, strides, start, queue)?;
        for (k, byte) in out.to_vec1::<u8>()?.into_iter().enumerate() {
            let flat = start + k;
            let (bi, bj) = layout.block_of(flat);
            let scale = scale_values[strides.index(bi, bj)];
            let restored = config.fp8_format.dequantize(byte) / scale;
            max_abs_error = max_abs_error.max((values[flat] - restored).abs());
        }
    }

    info!(
        blocks = layout.num_blocks(),
        shards = run.shards,
        max_abs_error,
        "block scaling done"
    );
    Ok(BlockReport {
        format: config.fp8_format,
        block_len: config.block_len,
        grid_rows,
        grid_cols,
        shards: run.shards,
        amax: amax.to_vec1::<f32>()?,
        scales: scale_values,
        max_abs_error,
    })
}
