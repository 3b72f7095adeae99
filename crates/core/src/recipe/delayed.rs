//! Delayed scaling: next-step scales from a rolling amax history.
//!
//! One update per tensor:
//! 1. (bulk only) merge the cross-worker reduced amax into the newest slot
//! 2. reduce the history to a reference amax per slot (`max` or `most_recent`)
//! 3. derive the new scale from the reference amax
//! 4. rotate the history so slot 0 is free for the next step's observation
//!
//! Step 2 reads the history before step 4 zeroes the newest slot.

use std::collections::HashSet;

use candle_core::{CpuStorage, InplaceOp2, Layout, Tensor};
use rayon::prelude::*;
use tracing::{debug, warn};

use super::amax_history::{reduce_slot, AmaxHistory};
use super::config::{AmaxComputeAlgo, DelayedScalingConfig};
use super::cpu::{
    ensure_distinct, f32_slice, f32_slice_mut, shares_storage, storage_addr, CopyF32,
};
use super::scale::{estimate_scale, Fallback, ScaleFactor, ScaleOptions};
use crate::error::{RecipeError, Result};
use crate::queue::ExecutionQueue;

/// Runs delayed-scaling updates for one recipe configuration.
#[derive(Debug, Clone)]
pub struct DelayedScalingUpdater {
    config: DelayedScalingConfig,
}

impl DelayedScalingUpdater {
    pub fn new(config: DelayedScalingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &DelayedScalingConfig {
        &self.config
    }

    /// Allocate a zeroed history and unit scales sized by this configuration.
    pub fn new_state(
        &self,
        num_scales: usize,
        queue: &ExecutionQueue,
    ) -> Result<(AmaxHistory, ScaleFactor)> {
        let history = AmaxHistory::zeros(self.config.amax_history_len, num_scales, queue.device())?;
        let scale = ScaleFactor::ones(num_scales, queue.device())?;
        Ok((history, scale))
    }

    /// Single-tensor update in place.
    pub fn update(
        &self,
        history: &mut AmaxHistory,
        scale: &ScaleFactor,
        queue: &ExecutionQueue,
    ) -> Result<()> {
        check_pair(history, scale)?;
        queue.admit(&[history.tensor(), scale.tensor()])?;
        debug!(
            history_length = history.history_length(),
            num_scales = history.num_scales(),
            algo = %self.config.amax_compute_algo,
            "delayed scaling update"
        );
        self.apply(history, scale)
    }

    /// Single-tensor update writing into separate outputs.
    ///
    /// Inputs are left untouched. Outputs must already have the input shapes.
    /// An output may be its own input (or a view of the same buffer at the same
    /// offset), which gives the in-place update; any other storage overlap is
    /// rejected.
    pub fn update_into(
        &self,
        history_in: &AmaxHistory,
        scale_in: &ScaleFactor,
        history_out: &mut AmaxHistory,
        scale_out: &ScaleFactor,
        queue: &ExecutionQueue,
    ) -> Result<()> {
        check_pair(history_in, scale_in)?;
        check_pair(history_out, scale_out)?;
        if history_out.shape() != history_in.shape() {
            return Err(RecipeError::shape(
                "updated amax history",
                &history_in.shape(),
                &history_out.shape(),
            ));
        }
        if scale_out.num_scales() != scale_in.num_scales() {
            return Err(RecipeError::shape(
                "updated scale",
                &[scale_in.num_scales()],
                &[scale_out.num_scales()],
            ));
        }
        queue.admit(&[
            history_in.tensor(),
            scale_in.tensor(),
            history_out.tensor(),
            scale_out.tensor(),
        ])?;

        let history_aliased =
            same_buffer(history_out.tensor(), history_in.tensor(), "amax history")?;
        let scale_aliased = same_buffer(scale_out.tensor(), scale_in.tensor(), "scale")?;
        ensure_distinct(
            history_out.tensor(),
            scale_in.tensor(),
            "updated history and input scale",
        )?;
        ensure_distinct(
            scale_out.tensor(),
            history_in.tensor(),
            "updated scale and input history",
        )?;

        if !history_aliased {
            history_out.tensor().inplace_op2(history_in.tensor(), &CopyF32)?;
        }
        history_out.set_head(history_in.head());
        if !scale_aliased {
            scale_out.tensor().inplace_op2(scale_in.tensor(), &CopyF32)?;
        }
        self.apply(history_out, scale_out)
    }

    /// Bulk update after cross-worker amax reduction.
    ///
    /// `reduction` is a 1-D F32 buffer holding one segment per tensor, in list
    /// order, each `num_scales` of that tensor long. A non-zero reduced value
    /// replaces the tensor's newest observation for that slot before the usual
    /// reduce / rescale / rotate. Every shape is checked before anything is
    /// written; tensors are then updated in parallel.
    pub fn update_bulk(
        &self,
        reduction: &Tensor,
        histories: &mut [AmaxHistory],
        scales: &[ScaleFactor],
        queue: &ExecutionQueue,
    ) -> Result<()> {
        if histories.len() != scales.len() {
            return Err(RecipeError::shape(
                "scale list",
                &[histories.len()],
                &[scales.len()],
            ));
        }
        let mut offsets = Vec::with_capacity(histories.len());
        let mut total = 0usize;
        for (history, scale) in histories.iter().zip(scales) {
            check_pair(history, scale)?;
            offsets.push(total);
            total += history.num_scales();
        }
        if reduction.rank() != 1 || reduction.elem_count() != total {
            return Err(RecipeError::shape(
                "amax reduction buffer",
                &[total],
                reduction.dims(),
            ));
        }
        if reduction.dtype() != candle_core::DType::F32 || !reduction.is_contiguous() {
            return Err(RecipeError::unsupported(
                "amax reduction buffer must be a contiguous f32 tensor",
            ));
        }
        let mut placed: Vec<&Tensor> = vec![reduction];
        placed.extend(histories.iter().map(|h| h.tensor()));
        placed.extend(scales.iter().map(|s| s.tensor()));
        queue.admit(&placed)?;

        // Tensors are updated concurrently, each under its own storage lock.
        let mut buffers = HashSet::with_capacity(placed.len());
        if !placed.iter().all(|t| buffers.insert(storage_addr(t))) {
            return Err(RecipeError::unsupported(
                "bulk update buffers must not share storage",
            ));
        }

        debug!(
            num_tensors = histories.len(),
            buffer_len = total,
            algo = %self.config.amax_compute_algo,
            "delayed scaling bulk update"
        );

        histories
            .par_iter_mut()
            .zip(scales.par_iter())
            .zip(offsets.par_iter())
            .try_for_each(|((history, scale), &offset)| {
                history.tensor().inplace_op2(
                    reduction,
                    &MergeReduced {
                        row: history.head(),
                        offset,
                    },
                )?;
                self.apply(history, scale)
            })
    }

    fn apply(&self, history: &mut AmaxHistory, scale: &ScaleFactor) -> Result<()> {
        scale.tensor().inplace_op2(
            history.tensor(),
            &RescaleFromHistory {
                head: history.head(),
                history_length: history.history_length(),
                algo: self.config.amax_compute_algo,
                opts: self.config.scale_options(),
            },
        )?;
        history.rotate()
    }
}

fn check_pair(history: &AmaxHistory, scale: &ScaleFactor) -> Result<()> {
    if history.num_scales() != scale.num_scales() {
        return Err(RecipeError::shape(
            "scale",
            &[history.num_scales()],
            &[scale.num_scales()],
        ));
    }
    ensure_distinct(scale.tensor(), history.tensor(), "scale and amax history")
}

/// `true` when `out` and `input` are the same buffer at the same offset,
/// `false` when they are disjoint.
fn same_buffer(out: &Tensor, input: &Tensor, what: &str) -> Result<bool> {
    if !shares_storage(out, input) {
        return Ok(false);
    }
    if out.layout().start_offset() == input.layout().start_offset() {
        Ok(true)
    } else {
        Err(RecipeError::unsupported(format!(
            "updated {what} partially overlaps its input"
        )))
    }
}

pub(crate) fn log_fallback(fallback: Fallback, slot: usize, reference: f32, scale: f32) {
    match fallback {
        Fallback::NonFinite => {
            warn!(slot, reference, scale, "non-finite amax, keeping previous scale")
        }
        Fallback::Unobserved => {
            debug!(slot, scale, "zero amax, using default scale")
        }
    }
}

/// Scale update kernel: scale (mut) from history (read).
struct RescaleFromHistory {
    head: usize,
    history_length: usize,
    algo: AmaxComputeAlgo,
    opts: ScaleOptions,
}

impl InplaceOp2 for RescaleFromHistory {
    fn name(&self) -> &'static str {
        "delayed_scaling_rescale"
    }

    fn cpu_fwd(
        &self,
        scale: &mut CpuStorage,
        scale_l: &Layout,
        history: &CpuStorage,
        history_l: &Layout,
    ) -> candle_core::Result<()> {
        let history = f32_slice(history, history_l, "amax history")?;
        let scale = f32_slice_mut(scale, scale_l, "scale")?;
        let num_scales = scale.len();
        if history.len() != self.history_length * num_scales {
            candle_core::bail!(
                "amax history holds {} values, expected {}x{}",
                history.len(),
                self.history_length,
                num_scales
            );
        }
        for (slot, s) in scale.iter_mut().enumerate() {
            let reference =
                reduce_slot(history, self.head, self.history_length, num_scales, slot, self.algo);
            let est = estimate_scale(reference, *s, &self.opts);
            if let Some(fallback) = est.fallback {
                log_fallback(fallback, slot, reference, est.scale);
            }
            *s = est.scale;
        }
        Ok(())
    }
}

/// Merge kernel: newest history row (mut) from one reduction-buffer segment.
struct MergeReduced {
    row: usize,
    offset: usize,
}

impl InplaceOp2 for MergeReduced {
    fn name(&self) -> &'static str {
        "delayed_scaling_merge_reduced"
    }

    fn cpu_fwd(
        &self,
        history: &mut CpuStorage,
        history_l: &Layout,
        reduction: &CpuStorage,
        reduction_l: &Layout,
    ) -> candle_core::Result<()> {
        let num_scales = history_l.dims()[1];
        let reduction = f32_slice(reduction, reduction_l, "amax reduction buffer")?;
        let history = f32_slice_mut(history, history_l, "amax history")?;
        let segment = &reduction[self.offset..self.offset + num_scales];
        let newest = &mut history[self.row * num_scales..(self.row + 1) * num_scales];
        for (dst, &reduced) in newest.iter_mut().zip(segment) {
            if reduced != 0.0 {
                *dst = reduced;
            }
        }
        Ok(())
    }
}
