//! Rolling amax history with circular indexing.
//!
//! Logical layout is `[history_length, num_scales]` with slot 0 holding the
//! newest observation and higher slots progressively older. Storage is never
//! shifted: `head` names the storage row holding logical slot 0, and rotating
//! moves `head` onto the oldest row and zeroes it.
//!
//! ```text
//! logical before  [n, a, b, c]      (n newest, c oldest)
//! logical after   [0, n, a, b]      (c dropped, its row reused for slot 0)
//! ```

use candle_core::{CpuStorage, DType, Device, InplaceOp1, Layout, Tensor};
use tracing::trace;

use super::config::AmaxComputeAlgo;
use super::cpu::{f32_slice_mut, nan_max, CopyF32};
use crate::error::{RecipeError, Result};

/// Amax history of one tensor (or tensor group).
#[derive(Debug)]
pub struct AmaxHistory {
    data: Tensor,
    head: usize,
}

impl AmaxHistory {
    /// Zero-filled history.
    pub fn zeros(history_length: usize, num_scales: usize, device: &Device) -> Result<Self> {
        Self::from_tensor(Tensor::zeros(
            (history_length, num_scales),
            DType::F32,
            device,
        )?)
    }

    /// Wrap a caller tensor already in logical order (slot 0 newest).
    pub fn from_tensor(data: Tensor) -> Result<Self> {
        if data.rank() != 2 {
            return Err(RecipeError::shape("amax history rank", &[2], &[data.rank()]));
        }
        if data.dtype() != DType::F32 {
            return Err(RecipeError::unsupported(format!(
                "amax history must be f32, got {:?}",
                data.dtype()
            )));
        }
        if !data.is_contiguous() {
            return Err(RecipeError::unsupported("amax history must be contiguous"));
        }
        if data.dims()[0] == 0 {
            return Err(RecipeError::shape("amax history", &[1, data.dims()[1]], data.dims()));
        }
        Ok(Self { data, head: 0 })
    }

    /// Build from row-major logical values.
    pub fn from_slice(
        values: &[f32],
        history_length: usize,
        num_scales: usize,
        device: &Device,
    ) -> Result<Self> {
        if values.len() != history_length * num_scales {
            return Err(RecipeError::shape(
                "amax history",
                &[history_length, num_scales],
                &[values.len()],
            ));
        }
        Self::from_tensor(Tensor::from_slice(
            values,
            (history_length, num_scales),
            device,
        )?)
    }

    /// Independent copy with its own storage.
    pub fn deep_copy(&self) -> Result<Self> {
        Ok(Self {
            data: self.data.copy()?,
            head: self.head,
        })
    }

    pub fn history_length(&self) -> usize {
        self.data.dims()[0]
    }

    pub fn num_scales(&self) -> usize {
        self.data.dims()[1]
    }

    pub fn shape(&self) -> [usize; 2] {
        [self.history_length(), self.num_scales()]
    }

    /// Storage row holding logical slot 0.
    pub fn head(&self) -> usize {
        self.head
    }

    /// Raw storage tensor. Row order is physical, see [`AmaxHistory::head`].
    pub fn tensor(&self) -> &Tensor {
        &self.data
    }

    pub(crate) fn set_head(&mut self, head: usize) {
        self.head = head % self.history_length();
    }

    /// Storage row for a logical slot.
    pub fn physical_row(&self, slot: usize) -> usize {
        (self.head + slot) % self.history_length()
    }

    /// Fresh tensor in logical order.
    pub fn to_logical(&self) -> Result<Tensor> {
        if self.head == 0 {
            return Ok(self.data.copy()?);
        }
        let len = self.history_length();
        let rows: Vec<u32> = (0..len).map(|i| self.physical_row(i) as u32).collect();
        let rows = Tensor::from_vec(rows, len, self.data.device())?;
        Ok(self.data.index_select(&rows, 0)?)
    }

    pub fn to_vec2(&self) -> Result<Vec<Vec<f32>>> {
        Ok(self.to_logical()?.to_vec2::<f32>()?)
    }

    /// Newest observation per slot.
    pub fn newest(&self) -> Result<Vec<f32>> {
        Ok(self.data.get(self.head)?.to_vec1::<f32>()?)
    }

    /// Reference amax per slot, reduced over the current contents.
    pub fn reference_amax(&self, algo: AmaxComputeAlgo) -> Result<Vec<f32>> {
        let flat = self.data.flatten_all()?.to_vec1::<f32>()?;
        let (len, num_scales) = (self.history_length(), self.num_scales());
        Ok((0..num_scales)
            .map(|slot| reduce_slot(&flat, self.head, len, num_scales, slot, algo))
            .collect())
    }

    /// Write this step's observation into the newest slot.
    pub fn record(&mut self, amaxes: &[f32]) -> Result<()> {
        if amaxes.len() != self.num_scales() {
            return Err(RecipeError::shape(
                "amax observation",
                &[self.num_scales()],
                &[amaxes.len()],
            ));
        }
        self.data.inplace_op1(&WriteRow {
            row: self.head,
            values: amaxes.to_vec(),
        })?;
        Ok(())
    }

    /// Shift every slot one position older, drop the oldest, zero slot 0.
    pub fn rotate(&mut self) -> Result<()> {
        let len = self.history_length();
        let new_head = (self.head + len - 1) % len;
        self.data.inplace_op1(&WriteRow {
            row: new_head,
            values: vec![0.0; self.num_scales()],
        })?;
        trace!(from = self.head, to = new_head, "amax history rotated");
        self.head = new_head;
        Ok(())
    }

    /// Re-lay storage in logical order so `head` becomes 0.
    pub fn compact(&mut self) -> Result<()> {
        if self.head == 0 {
            return Ok(());
        }
        let logical = self.to_logical()?;
        self.data.inplace_op2(&logical, &CopyF32)?;
        self.head = 0;
        Ok(())
    }
}

/// Reduce one slot column of a flattened `[len, num_scales]` history.
#[inline]
pub(crate) fn reduce_slot(
    history: &[f32],
    head: usize,
    len: usize,
    num_scales: usize,
    slot: usize,
    algo: AmaxComputeAlgo,
) -> f32 {
    match algo {
        AmaxComputeAlgo::MostRecent => history[head * num_scales + slot],
        AmaxComputeAlgo::Max => (0..len)
            .map(|row| history[row * num_scales + slot])
            .fold(0.0f32, nan_max),
    }
}

/// Overwrite one storage row.
struct WriteRow {
    row: usize,
    values: Vec<f32>,
}

impl InplaceOp1 for WriteRow {
    fn name(&self) -> &'static str {
        "amax_history_write_row"
    }

    fn cpu_fwd(&self, storage: &mut CpuStorage, layout: &Layout) -> candle_core::Result<()> {
        let data = f32_slice_mut(storage, layout, "amax history")?;
        let width = self.values.len();
        let start = self.row * width;
        if start + width > data.len() {
            candle_core::bail!("row {} out of range for amax history", self.row);
        }
        data[start..start + width].copy_from_slice(&self.values);
        Ok(())
    }
}
