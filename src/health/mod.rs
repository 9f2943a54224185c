//! Health state evaluation.
//!
//! Turns a noisy stream of run outcomes into a debounced status.

mod evaluator;
mod status;
mod thresholds;

pub use evaluator::*;
pub use status::*;
pub use thresholds::*;
