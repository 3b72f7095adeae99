//! Workspace facade re-exporting the recipe engine.
//!
//! Integration tests under `tests/` build against this crate.

pub use fp8_scaling_core::*;
