pub mod builds;

pub use builds::*;
