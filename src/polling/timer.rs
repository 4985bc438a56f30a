//! Self-rescheduling poll timer
//!
//! The next delay only starts once the previous poll has returned, so a
//! slow poll stretches the period instead of stacking up behind itself.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, trace};

type PollFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type PollFn = Arc<dyn Fn() -> PollFuture + Send + Sync>;

/// State of one start() .. stop() cycle
struct TimerRun {
    active: AtomicBool,
    wake: Notify,
}

pub struct PollingTimer {
    name: String,
    poll: PollFn,
    run: Mutex<Option<Arc<TimerRun>>>,
}

impl PollingTimer {
    pub fn new<F, Fut>(name: impl Into<String>, poll: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            poll: Arc::new(move || Box::pin(poll()) as PollFuture),
            run: Mutex::new(None),
        }
    }

    /// Poll every `interval`, measured from the end of the previous poll.
    /// Restarting replaces the previous schedule.
    pub fn start(&self, interval: Duration) {
        let run = Arc::new(TimerRun {
            active: AtomicBool::new(true),
            wake: Notify::new(),
        });

        if let Some(previous) = self.run.lock().replace(run.clone()) {
            deactivate(&previous);
        }

        let poll = self.poll.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sleep(interval) => {}
                    _ = run.wake.notified() => {}
                }
                if !run.active.load(Ordering::SeqCst) {
                    break;
                }

                trace!(timer = %name, "Timer fired");
                poll().await;

                if !run.active.load(Ordering::SeqCst) {
                    break;
                }
            }
            trace!(timer = %name, "Timer loop finished");
        });

        debug!(timer = %self.name, interval_ms = interval.as_millis() as u64, "Timer started");
    }

    /// Cancel the pending delay. A poll already running finishes but is not
    /// rescheduled.
    pub fn stop(&self) {
        if let Some(run) = self.run.lock().take() {
            deactivate(&run);
            debug!(timer = %self.name, "Timer stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.run
            .lock()
            .as_ref()
            .is_some_and(|run| run.active.load(Ordering::SeqCst))
    }
}

fn deactivate(run: &TimerRun) {
    run.active.store(false, Ordering::SeqCst);
    run.wake.notify_one();
}

impl Drop for PollingTimer {
    fn drop(&mut self) {
        if let Some(run) = self.run.get_mut().take() {
            deactivate(&run);
        }
    }
}
