//! State propagation
//!
//! - `StateStore`: device state tree written by the pollers
//! - `StateUpdateBuffer`: coalesces variable updates into periodic batches
//! - `PresentationLayer`: consumer of batches, status and feedback checks

mod buffer;
mod presentation;
mod store;

pub use buffer::StateUpdateBuffer;
#[cfg(test)]
pub use presentation::RecordingPresentation;
pub use presentation::{PresentationLayer, TracingPresentation};
pub use store::{InMemoryStateStore, StateKey, StateStore};
