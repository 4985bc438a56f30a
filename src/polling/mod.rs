//! Device polling
//!
//! - `DevicePoller`: one poll routine per resource, guarded against overlap
//! - `PollingTimer`: re-arms only after the previous poll returned
//! - `DeviceCatalog`: the engines, nodes, rundowns and templates last seen

mod catalog;
mod poller;
mod resource;
mod timer;

pub(crate) use catalog::PropertyRecord;
pub use catalog::{DeviceCatalog, EngineInfo, ItemInfo, NodeInfo, RundownInfo};
pub use poller::{DevicePoller, FEEDBACK_NODE_PROPERTY};
pub use resource::{format_duration, PollOutcome, Resource};
pub use timer::PollingTimer;
