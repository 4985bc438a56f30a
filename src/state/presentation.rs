//! Presentation layer seam
//!
//! The bridge reports variable changes, connection status and feedback
//! invalidations through [`PresentationLayer`] without owning the consumer.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, info};

/// Receiver of state notifications
pub trait PresentationLayer: Send + Sync {
    /// One call per buffer flush with every key changed since the last one
    fn notify_changed(&self, changes: &BTreeMap<String, Value>);

    /// Connection status text, with optional detail such as a progress value
    fn set_status(&self, text: &str, detail: Option<&str>);

    /// Ask the consumer to re-evaluate the given feedbacks
    fn check_feedbacks(&self, feedback_ids: &[&str]);
}

/// Presentation that writes everything to the log
#[derive(Debug, Default)]
pub struct TracingPresentation;

impl PresentationLayer for TracingPresentation {
    fn notify_changed(&self, changes: &BTreeMap<String, Value>) {
        debug!(count = changes.len(), "Variables changed");
        for (name, value) in changes {
            debug!(variable = %name, value = %value, "Variable");
        }
    }

    fn set_status(&self, text: &str, detail: Option<&str>) {
        match detail {
            Some(detail) => info!(status = text, detail, "Status"),
            None => info!(status = text, "Status"),
        }
    }

    fn check_feedbacks(&self, feedback_ids: &[&str]) {
        debug!(feedbacks = ?feedback_ids, "Check feedbacks");
    }
}

#[cfg(test)]
pub use recording::RecordingPresentation;
