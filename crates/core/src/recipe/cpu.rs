//! Storage access helpers shared by the CPU kernel bodies.

use std::borrow::Cow;

use candle_core::{CpuStorage, InplaceOp2, Layout, Result, Tensor};

use crate::error::RecipeError;

fn span(layout: &Layout, what: &str) -> Result<(usize, usize)> {
    match layout.contiguous_offsets() {
        Some(offsets) => Ok(offsets),
        None => candle_core::bail!("{what} must be contiguous"),
    }
}

/// Borrow an F32 tensor's elements.
pub(crate) fn f32_slice<'a>(
    storage: &'a CpuStorage,
    layout: &Layout,
    what: &str,
) -> Result<&'a [f32]> {
    let (start, end) = span(layout, what)?;
    match storage {
        CpuStorage::F32(data) => Ok(&data[start..end]),
        _ => candle_core::bail!("{what} must be f32"),
    }
}

/// Mutably borrow an F32 tensor's elements.
pub(crate) fn f32_slice_mut<'a>(
    storage: &'a mut CpuStorage,
    layout: &Layout,
    what: &str,
) -> Result<&'a mut [f32]> {
    let (start, end) = span(layout, what)?;
    match storage {
        CpuStorage::F32(data) => Ok(&mut data[start..end]),
        _ => candle_core::bail!("{what} must be f32"),
    }
}

/// Mutably borrow a U8 tensor's elements (encoded FP8 bytes).
pub(crate) fn u8_slice_mut<'a>(
    storage: &'a mut CpuStorage,
    layout: &Layout,
    what: &str,
) -> Result<&'a mut [u8]> {
    let (start, end) = span(layout, what)?;
    match storage {
        CpuStorage::U8(data) => Ok(&mut data[start..end]),
        _ => candle_core::bail!("{what} must be u8"),
    }
}

/// Read an unquantized float tensor as f32, widening F16/BF16.
pub(crate) fn float_values<'a>(
    storage: &'a CpuStorage,
    layout: &Layout,
    what: &str,
) -> Result<Cow<'a, [f32]>> {
    let (start, end) = span(layout, what)?;
    match storage {
        CpuStorage::F32(data) => Ok(Cow::Borrowed(&data[start..end])),
        CpuStorage::F16(data) => Ok(Cow::Owned(
            data[start..end].iter().map(|v| v.to_f32()).collect(),
        )),
        CpuStorage::BF16(data) => Ok(Cow::Owned(
            data[start..end].iter().map(|v| v.to_f32()).collect(),
        )),
        _ => candle_core::bail!("{what} must be f32, f16 or bf16"),
    }
}

/// Maximum absolute value. NaN anywhere yields NaN; an empty slice yields 0.
#[inline]
pub(crate) fn max_abs(values: &[f32]) -> f32 {
    values.iter().fold(0.0f32, |acc, &v| nan_max(acc, v.abs()))
}

/// `max` that propagates NaN instead of discarding it.
#[inline]
pub(crate) fn nan_max(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::NAN
    } else {
        a.max(b)
    }
}

/// Address of the storage buffer behind `t`. Views such as reshapes or
/// narrows carry a different tensor id but the same address.
pub(crate) fn storage_addr(t: &Tensor) -> usize {
    let (guard, _) = t.storage_and_layout();
    let ptr: *const _ = &*guard;
    ptr as usize
}

/// Whether two tensors are backed by the same storage buffer.
pub(crate) fn shares_storage(a: &Tensor, b: &Tensor) -> bool {
    // One guard at a time: a second read lock on a held lock may block.
    a.id() == b.id() || storage_addr(a) == storage_addr(b)
}

/// Reject operand pairs that share storage. In-place ops lock the written
/// operand's storage for writing and the other for reading.
pub(crate) fn ensure_distinct(
    written: &Tensor,
    read: &Tensor,
    what: &str,
) -> std::result::Result<(), RecipeError> {
    if shares_storage(written, read) {
        return Err(RecipeError::unsupported(format!(
            "{what} must not share storage"
        )));
    }
    Ok(())
}

/// Element-wise copy of one F32 tensor into another of the same size.
pub(crate) struct CopyF32;

impl InplaceOp2 for CopyF32 {
    fn name(&self) -> &'static str {
        "copy_f32"
    }

    fn cpu_fwd(&self, dst: &mut CpuStorage, dl: &Layout, src: &CpuStorage, sl: &Layout) -> Result<()> {
        let src = f32_slice(src, sl, "copy source")?;
        let dst = f32_slice_mut(dst, dl, "copy destination")?;
        if src.len() != dst.len() {
            candle_core::bail!("copy_f32: {} elements into {}", src.len(), dst.len());
        }
        dst.copy_from_slice(src);
        Ok(())
    }
}
