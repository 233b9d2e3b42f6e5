//! Core data models for polyeval.
//!
//! Epistemic mapping:
//! - K_i (Knowledge): Concrete types with compile-time guarantees
//! - B_i (Beliefs): Wrapped in Result/Option
//! - I^R (Resolvable): Config parameters
//! - I^B (Bounded): Error variants with per-task or run-fatal handling

mod config;
mod entry;
mod error;
mod result;

pub use config::*;
pub use entry::*;
pub use error::*;
pub use result::*;
