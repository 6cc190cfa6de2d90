//! Request scheduling: priority queues, batch formation, and the
//! per-model runner loops that drive generation.

pub mod queue;
mod runner;
mod set;

pub use queue::{
    BatchConfig, BatchScheduler, BatchSlot, InferenceRequest, Priority, SchedulerError,
};
pub use runner::{run_batch, spawn_runner};
pub use set::SchedulerSet;
