//! Result persistence.

mod layout;
mod writer;

pub use layout::*;
pub use writer::*;
