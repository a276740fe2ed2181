pub mod stats;

pub use stats::AcceptStats;
