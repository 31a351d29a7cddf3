//! Ready-made stress runs for individual primitives.

pub mod counter;
pub mod lock;

pub use counter::{run_counter_stress, run_lossy_counter_stress, CounterReport};
pub use lock::run_lock_stress;
