//! Request executor
//!
//! Serializes all outbound work to the device:
//! - Three priority channels, FIFO within a channel
//! - At most one task executing at any time
//! - Block/unblock for teardown, clear to drop queued work

mod runner;
mod state;

pub use runner::{CueExecutor, CueHandle};
pub use state::{ExecutorState, ExecutorStats, Priority};
