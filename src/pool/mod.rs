//! Concurrency engine: admission gate and batch collector.

mod collector;
mod gate;

pub use collector::*;
pub use gate::*;
