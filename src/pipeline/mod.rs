//! Pipeline module - task planning and evaluation runs.

mod groups;
mod runner;

pub use groups::*;
pub use runner::*;
