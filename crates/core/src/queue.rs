//! Execution queue handle passed to every recipe operation.
//!
//! Work submitted to one queue runs in submission order. The CPU queue runs each
//! kernel to completion before the call returns; device queues would enqueue and
//! return, which is why callers must treat results as available only after their
//! own synchronisation point.

use candle_core::{Device, Tensor};

use crate::error::{RecipeError, Result};

/// A logical execution queue bound to one device.
#[derive(Debug, Clone)]
pub struct ExecutionQueue {
    device: Device,
}

impl ExecutionQueue {
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    /// Queue on the host CPU.
    pub fn cpu() -> Self {
        Self::new(Device::Cpu)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Check that this queue has kernel bodies for the recipe ops.
    pub(crate) fn ensure_backend(&self) -> Result<()> {
        if self.device.is_cpu() {
            Ok(())
        } else {
            Err(RecipeError::unsupported(format!(
                "no recipe kernels for device {:?}",
                self.device.location()
            )))
        }
    }

    /// Check that `tensor` is resident on this queue's device.
    pub(crate) fn ensure_on_device(&self, tensor: &Tensor) -> Result<()> {
        if tensor.device().same_device(&self.device) {
            Ok(())
        } else {
            Err(RecipeError::DeviceMismatch {
                expected: format!("{:?}", self.device.location()),
                actual: format!("{:?}", tensor.device().location()),
            })
        }
    }

    /// Validate the backend and the placement of every tensor in one pass.
    pub(crate) fn admit(&self, tensors: &[&Tensor]) -> Result<()> {
        self.ensure_backend()?;
        tensors.iter().try_for_each(|t| self.ensure_on_device(t))
    }
}

impl Default for ExecutionQueue {
    fn default() -> Self {
        Self::cpu()
    }
}
