pub mod distribution;
pub mod nucleus;

pub use distribution::{Distribution, Truncated, Weights};
