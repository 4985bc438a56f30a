//! Queue state shared between submitters and the drain loop

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────────────
// Priority
// ─────────────────────────────────────────────────────────────────

/// Priority channel of a queued request. Higher channels always drain first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// All channels, highest first
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub(crate) fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::High
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(Error::Config(format!(
                "Unknown priority '{}'. Must be one of: high, medium, low",
                other
            ))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Public state views
// ─────────────────────────────────────────────────────────────────

/// Run/block flags of the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ExecutorState {
    /// The drain loop is (or is about to be) pulling tasks
    pub running: bool,
    /// New submissions are rejected
    pub blocked: bool,
}

/// Counters and queue depths for diagnostics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutorStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub queued_high: usize,
    pub queued_medium: usize,
    pub queued_low: usize,
    /// Id of the task currently executing
    pub in_flight: Option<u64>,
}

impl ExecutorStats {
    pub fn queued(&self) -> usize {
        self.queued_high + self.queued_medium + self.queued_low
    }
}

// ─────────────────────────────────────────────────────────────────
// Tasks and queues
// ─────────────────────────────────────────────────────────────────

pub(crate) type JobFuture = Pin<Box<dyn Future<Output = bool> + Send>>;

/// Type-erased task body. Resolves the caller's handle and reports success.
pub(crate) type Job = Box<dyn FnOnce() -> JobFuture + Send>;

pub(crate) struct CueTask {
    pub id: u64,
    pub priority: Priority,
    pub enqueued_at: Instant,
    pub job: Job,
}

/// Everything guarded by the executor lock
#[derive(Default)]
pub(crate) struct Queues {
    channels: [VecDeque<CueTask>; 3],
    pub running: bool,
    pub blocked: bool,
    /// A drain task exists. Only ever one at a time.
    pub loop_active: bool,
    pub in_flight: Option<u64>,
}

impl Queues {
    pub fn push(&mut self, task: CueTask) {
        self.channels[task.priority.index()].push_back(task);
    }

    /// Oldest task of the highest non-empty channel
    pub fn pop_next(&mut self) -> Option<CueTask> {
        self.channels.iter_mut().find_map(VecDeque::pop_front)
    }

    /// Drop queued tasks of one channel, or of all channels
    pub fn clear(&mut self, priority: Option<Priority>) -> usize {
        match priority {
            Some(p) => {
                let dropped = self.channels[p.index()].len();
                self.channels[p.index()].clear();
                dropped
            }
            None => Priority::ALL
                .into_iter()
                .map(|p| self.clear(Some(p)))
                .sum(),
        }
    }

    pub fn len(&self, priority: Priority) -> usize {
        self.channels[priority.index()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.iter().all(VecDeque::is_empty)
    }
}
