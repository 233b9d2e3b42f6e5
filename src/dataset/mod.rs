//! Dataset boundary: entry files, keyword files and pair construction.

mod keywords;
mod pairing;
mod store;

pub use keywords::*;
pub use pairing::*;
pub use store::*;
