//! Scale-factor recipes for FP8 tensor casting.
//!
//! The [`recipe`] module holds the delayed, current, and block scaling
//! algorithms. Every operation takes an [`ExecutionQueue`] and writes into
//! caller-owned tensors; nothing here allocates state the caller has to free.

pub mod error;
pub mod queue;
pub mod recipe;

pub use error::{RecipeError, Result};
pub use queue::ExecutionQueue;
