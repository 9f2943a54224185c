//! Incremental aggregation of probe statistics.
//!
//! All functions here are pure and operate on values, so they can be called
//! from any task without synchronization.

mod merge;
mod result;

pub use merge::*;
pub use result::*;
