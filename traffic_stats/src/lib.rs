pub mod percentile;
pub mod sample_set;

pub use percentile::{percentile, sorted_finite};
pub use sample_set::SampleSet;
