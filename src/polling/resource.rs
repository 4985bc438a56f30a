//! Polled resources and their re-entrancy guard

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::Feature;
use crate::executor::Priority;

/// Feedback re-evaluated while engines or nodes are loading
pub const FEEDBACK_DATA_LOADING: &str = "basicDataLoading";

/// Feedback re-evaluated while rundowns or templates are loading
pub const FEEDBACK_FEATURE_DATA_LOADING: &str = "basicFeatureDataLoading";

/// A data set fetched from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Resource {
    Engines,
    Nodes,
    Rundowns,
    Templates,
}

impl Resource {
    fn index(self) -> usize {
        match self {
            Resource::Engines => 0,
            Resource::Nodes => 1,
            Resource::Rundowns => 2,
            Resource::Templates => 3,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Resource::Engines => "Engines",
            Resource::Nodes => "Nodes",
            Resource::Rundowns => "Rundowns",
            Resource::Templates => "Templates",
        }
    }

    /// Executor channel used for this resource's requests
    pub fn priority(&self) -> Priority {
        match self {
            Resource::Nodes => Priority::Low,
            _ => Priority::Medium,
        }
    }

    pub fn feedback_id(&self) -> &'static str {
        match self {
            Resource::Engines | Resource::Nodes => FEEDBACK_DATA_LOADING,
            Resource::Rundowns | Resource::Templates => FEEDBACK_FEATURE_DATA_LOADING,
        }
    }

    /// The optional feature backing this resource; engines are always on
    pub fn feature(&self) -> Option<Feature> {
        match self {
            Resource::Engines => None,
            Resource::Nodes => Some(Feature::Nodes),
            Resource::Rundowns => Some(Feature::Rundowns),
            Resource::Templates => Some(Feature::Templates),
        }
    }

    pub fn from_feature(feature: Feature) -> Self {
        match feature {
            Feature::Nodes => Resource::Nodes,
            Feature::Rundowns => Resource::Rundowns,
            Feature::Templates => Resource::Templates,
        }
    }

    pub fn progress_variable(&self) -> String {
        format!("update{}Progress", self.name())
    }

    pub fn duration_variable(&self) -> String {
        format!("update{}Duration", self.name())
    }

    /// Status text shown while the resource loads during connect
    pub fn loading_status(&self) -> String {
        format!("LOAD: {} data ...", self.name())
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of a poll request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The poll ran to the end
    Completed,
    /// Another poll of the same resource was already running
    Skipped,
}

/// One "loading" flag per resource
#[derive(Debug, Default)]
pub struct LoadingFlags {
    flags: [AtomicBool; 4],
}

impl LoadingFlags {
    /// Claim `resource`; `None` if it is already loading
    pub fn try_begin(&self, resource: Resource) -> Option<LoadingGuard<'_>> {
        let flag = &self.flags[resource.index()];
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| LoadingGuard { flag })
    }

    #[cfg(test)]
    pub fn is_loading(&self, resource: Resource) -> bool {
        self.flags[resource.index()].load(Ordering::Acquire)
    }
}

/// Clears the loading flag when dropped
#[must_use]
pub struct LoadingGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Render a poll duration: tenths of a second below 10 s, whole seconds
/// above, always rounded up ("1.3s", "13s")
pub fn format_duration(elapsed: Duration) -> String {
    let ms = elapsed.as_millis() as u64;
    if ms < 10_000 {
        let tenths = ms.div_ceil(100);
        if tenths % 10 == 0 {
            format!("{}s", tenths / 10)
        } else {
            format!("{}.{}s", tenths / 10, tenths % 10)
        }
    } else {
        format!("{}s", ms.div_ceil(1000))
    }
}
