mod batcher;
mod dataset;
pub mod idx;

pub use batcher::*;
pub use dataset::*;
