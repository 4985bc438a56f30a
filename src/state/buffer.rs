//! Coalescing buffer for variable updates
//!
//! Writers call [`StateUpdateBuffer::append`], which only records the latest
//! value per key. A background tick hands everything accumulated since the
//! previous tick to the presentation layer in a single call.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use super::PresentationLayer;

struct Shared {
    pending: Mutex<HashMap<String, Value>>,
    presentation: Arc<dyn PresentationLayer>,
}

impl Shared {
    fn flush(&self) -> usize {
        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return 0;
        }

        let changes: BTreeMap<String, Value> = batch.into_iter().collect();
        trace!(count = changes.len(), "Flushing state updates");
        self.presentation.notify_changed(&changes);
        changes.len()
    }
}

pub struct StateUpdateBuffer {
    shared: Arc<Shared>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl StateUpdateBuffer {
    pub fn new(presentation: Arc<dyn PresentationLayer>) -> Self {
        Self {
            shared: Arc::new(Shared {
                pending: Mutex::new(HashMap::new()),
                presentation,
            }),
            ticker: Mutex::new(None),
        }
    }

    /// Record the latest value of `key`; never notifies synchronously
    pub fn append(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.shared.pending.lock().insert(key.into(), value.into());
    }

    pub fn append_all<I, K>(&self, updates: I)
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut pending = self.shared.pending.lock();
        for (key, value) in updates {
            pending.insert(key.into(), value);
        }
    }

    /// Start the flush tick. Calling it while already running does nothing.
    pub fn start(&self, period: Duration) {
        let mut ticker = self.ticker.lock();
        if ticker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let shared = self.shared.clone();
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        *ticker = Some(tokio::spawn(async move {
            loop {
                interval.tick().await;
                shared.flush();
            }
        }));
        debug!(period_ms = period.as_millis() as u64, "State buffer started");
    }

    /// Stop the tick and deliver whatever is still pending
    pub fn stop(&self) {
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
            debug!("State buffer stopped");
        }
        self.shared.flush();
    }

    /// Deliver pending updates now. Returns the number of keys delivered.
    #[cfg(test)]
    pub fn flush(&self) -> usize {
        self.shared.flush()
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.shared.pending.lock().len()
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.ticker
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for StateUpdateBuffer {
    fn drop(&mut self) {
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RecordingPresentation;
    use serde_json::json;
    use tokio::time::sleep;

    const TICK: Duration = Duration::from_millis(100);

    fn buffer() -> (StateUpdateBuffer, Arc<RecordingPresentation>) {
        let presentation = Arc::new(RecordingPresentation::default());
        (StateUpdateBuffer::new(presentation.clone()), presentation)
    }

    #[tokio::test(start_paused = true)]
    async fn test_coalesces_to_latest_value() {
        let (buffer, presentation) = buffer();
        buffer.start(TICK);

        buffer.append("k", json!("v1"));
        buffer.append("k", json!("v2"));
        assert!(presentation.batches().is_empty());

        sleep(TICK + Duration::from_millis(10)).await;

        let batches = presentation.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0]["k"], json!("v2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_notification_per_tick() {
        let (buffer, presentation) = buffer();
        buffer.start(TICK);

        buffer.append("a", json!(1));
        buffer.append("b", json!(2));
        sleep(TICK + Duration::from_millis(10)).await;

        buffer.append("a", json!(3));
        sleep(TICK).await;

        let batches = presentation.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1].len(), 1);
        assert_eq!(batches[1]["a"], json!(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_ticks_do_not_notify() {
        let (buffer, presentation) = buffer();
        buffer.start(TICK);

        sleep(TICK * 5).await;
        assert!(presentation.batches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_flushes_pending() {
        let (buffer, presentation) = buffer();
        buffer.start(TICK);
        buffer.append("updateEnginesDuration", json!("0.4s"));

        buffer.stop();
        assert!(!buffer.is_running());
        assert_eq!(buffer.pending(), 0);
        assert_eq!(presentation.batches().len(), 1);

        buffer.append("late", json!(true));
        sleep(TICK * 3).await;
        assert_eq!(presentation.batches().len(), 1);
        assert_eq!(buffer.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let (buffer, presentation) = buffer();
        buffer.start(TICK);
        buffer.start(TICK);
        assert!(buffer.is_running());

        buffer.append("x", json!(1));
        sleep(TICK + Duration::from_millis(10)).await;
        buffer.append("x", json!(2));
        sleep(TICK).await;

        let batches = presentation.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1]["x"], json!(2));
    }

    #[test]
    fn test_manual_flush_without_tick() {
        let (buffer, presentation) = buffer();
        buffer.append_all(vec![("a", json!(1)), ("b", json!(2))]);

        assert_eq!(buffer.pending(), 2);
        assert_eq!(buffer.flush(), 2);
        assert_eq!(buffer.flush(), 0);
        assert_eq!(presentation.batches().len(), 1);
    }
}
