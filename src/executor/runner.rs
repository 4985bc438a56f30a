//! Single-flight priority executor
//!
//! Every request to the device goes through one [`CueExecutor`]. Tasks are
//! queued per [`Priority`] and run one at a time by a lazily spawned drain
//! loop that re-scans from the highest channel after each task. There is no
//! aging: a steady stream of high priority work starves the low channel.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

use super::state::{CueTask, ExecutorState, ExecutorStats, Job, Priority, Queues};

struct Inner {
    queues: Mutex<Queues>,
    next_id: AtomicU64,
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
}

/// Priority queue draining at most one task at a time
#[derive(Clone)]
pub struct CueExecutor {
    inner: Arc<Inner>,
}

impl Default for CueExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl CueExecutor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(Queues::default()),
                next_id: AtomicU64::new(1),
                submitted: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                abandoned: AtomicU64::new(0),
            }),
        }
    }

    /// Queue `op` on the `priority` channel.
    ///
    /// Fails immediately with [`Error::ExecutionBlocked`] while the executor
    /// is blocked; nothing is queued in that case. The returned handle
    /// resolves with the operation's own result, or with
    /// [`Error::TaskAbandoned`] if the task is cleared before it runs.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit<F, Fut, T>(&self, priority: Priority, op: F) -> Result<CueHandle<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            Box::pin(async move {
                let result = op().await;
                let ok = result.is_ok();
                // The caller may have dropped its handle
                let _ = tx.send(result);
                ok
            })
        });

        let (task_id, spawn_loop) = {
            let mut queues = self.inner.queues.lock();
            if queues.blocked {
                return Err(Error::ExecutionBlocked);
            }

            let task_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            queues.push(CueTask {
                id: task_id,
                priority,
                enqueued_at: Instant::now(),
                job,
            });
            queues.running = true;

            let spawn_loop = !queues.loop_active;
            queues.loop_active = true;
            (task_id, spawn_loop)
        };

        self.inner.submitted.fetch_add(1, Ordering::Relaxed);
        trace!(task_id, %priority, "Task queued");

        if spawn_loop {
            tokio::spawn(drain(self.inner.clone()));
        }

        Ok(CueHandle { task_id, rx })
    }

    /// Reject new submissions and halt draining. The in-flight task finishes.
    pub fn block(&self) {
        let mut queues = self.inner.queues.lock();
        queues.blocked = true;
        queues.running = false;
        debug!("Executor blocked");
    }

    pub fn unblock(&self) {
        self.inner.queues.lock().blocked = false;
        debug!("Executor unblocked");
    }

    /// Halt draining after the in-flight task. Queued tasks stay queued
    /// until the next submission restarts the loop.
    pub fn stop(&self) {
        self.inner.queues.lock().running = false;
    }

    /// Drop queued tasks of `priority`, or of every channel when `None`.
    /// Returns how many tasks were abandoned.
    pub fn clear(&self, priority: Option<Priority>) -> usize {
        let dropped = self.inner.queues.lock().clear(priority);
        if dropped > 0 {
            self.inner
                .abandoned
                .fetch_add(dropped as u64, Ordering::Relaxed);
            debug!(dropped, channel = ?priority, "Cleared queued tasks");
        }
        dropped
    }

    pub fn state(&self) -> ExecutorState {
        let queues = self.inner.queues.lock();
        ExecutorState {
            running: queues.running,
            blocked: queues.blocked,
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        let (queued_high, queued_medium, queued_low, in_flight) = {
            let queues = self.inner.queues.lock();
            (
                queues.len(Priority::High),
                queues.len(Priority::Medium),
                queues.len(Priority::Low),
                queues.in_flight,
            )
        };

        ExecutorStats {
            submitted: self.inner.submitted.load(Ordering::Relaxed),
            completed: self.inner.completed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            abandoned: self.inner.abandoned.load(Ordering::Relaxed),
            queued_high,
            queued_medium,
            queued_low,
            in_flight,
        }
    }
}

/// The drain loop. Exactly one instance exists while `loop_active` is set.
async fn drain(inner: Arc<Inner>) {
    loop {
        let task = {
            let mut queues = inner.queues.lock();
            let next = if queues.running { queues.pop_next() } else { None };
            match next {
                Some(task) => {
                    queues.in_flight = Some(task.id);
                    task
                }
                None => {
                    if queues.is_empty() {
                        queues.running = false;
                    }
                    queues.loop_active = false;
                    queues.in_flight = None;
                    trace!("Drain loop idle");
                    return;
                }
            }
        };

        let CueTask {
            id,
            priority,
            enqueued_at,
            job,
        } = task;
        debug!(
            task_id = id,
            %priority,
            waited_ms = enqueued_at.elapsed().as_millis() as u64,
            "Running task"
        );

        // A panicking task must not take the loop down with it
        let ok = match tokio::spawn(job()).await {
            Ok(ok) => ok,
            Err(e) => {
                warn!(task_id = id, error = %e, "Task panicked");
                false
            }
        };

        if ok {
            inner.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            inner.failed.fetch_add(1, Ordering::Relaxed);
        }
        inner.queues.lock().in_flight = None;
    }
}

/// Pending result of a submitted task
#[must_use = "a CueHandle does nothing unless awaited"]
pub struct CueHandle<T> {
    task_id: u64,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> CueHandle<T> {
    pub fn task_id(&self) -> u64 {
        self.task_id
    }
}

impl<T> Future for CueHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let task_id = self.task_id;
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::TaskAbandoned { task_id })),
            Poll::Pending => Poll::Pending,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::time::sleep;
    use tokio_test::assert_ok;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    /// A task that records its name after `delay`
    fn timed(
        exec: &CueExecutor,
        priority: Priority,
        name: &'static str,
        delay: Duration,
        log: &Log,
    ) -> CueHandle<&'static str> {
        let log = log.clone();
        exec.submit(priority, move || async move {
            sleep(delay).await;
            log.lock().push(name);
            Ok(name)
        })
        .unwrap()
    }

    /// A task that signals when it starts and waits for `release`
    fn gated(
        exec: &CueExecutor,
        priority: Priority,
        name: &'static str,
        log: &Log,
    ) -> (CueHandle<&'static str>, oneshot::Receiver<()>, oneshot::Sender<()>) {
        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let log = log.clone();
        let handle = exec
            .submit(priority, move || async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
                log.lock().push(name);
                Ok(name)
            })
            .unwrap();
        (handle, started_rx, release_tx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight() {
        let exec = CueExecutor::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..12u64 {
            let active = active.clone();
            let peak = peak.clone();
            let priority = Priority::ALL[(i % 3) as usize];
            handles.push(
                exec.submit(priority, move || async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(5 + i)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(i)
                })
                .unwrap(),
            );
        }

        for handle in handles {
            assert_ok!(handle.await);
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(exec.stats().completed, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_priority_overtakes_queued_low() {
        let exec = CueExecutor::new();
        let order = log();

        let (low1, started, release) = gated(&exec, Priority::Low, "low1", &order);
        started.await.unwrap();

        let low2 = timed(&exec, Priority::Low, "low2", Duration::from_millis(1), &order);
        let high1 = timed(&exec, Priority::High, "high1", Duration::from_millis(1), &order);
        release.send(()).unwrap();

        assert_eq!(low1.await.unwrap(), "low1");
        assert_eq!(high1.await.unwrap(), "high1");
        assert_eq!(low2.await.unwrap(), "low2");
        assert_eq!(*order.lock(), vec!["low1", "high1", "low2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_ordering() {
        let exec = CueExecutor::new();
        let order = log();

        let a = timed(&exec, Priority::High, "A", Duration::from_millis(50), &order);
        let (b, b_started, b_release) = gated(&exec, Priority::Low, "B", &order);
        let c = timed(&exec, Priority::Low, "C", Duration::from_millis(10), &order);

        b_started.await.unwrap();
        assert_eq!(*order.lock(), vec!["A"]);

        let d = timed(&exec, Priority::High, "D", Duration::from_millis(10), &order);
        b_release.send(()).unwrap();

        for handle in [a, b, c, d] {
            assert_ok!(handle.await);
        }
        assert_eq!(*order.lock(), vec!["A", "B", "D", "C"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_rejects_and_keeps_queue() {
        let exec = CueExecutor::new();
        let order = log();

        let (running, started, release) = gated(&exec, Priority::High, "running", &order);
        started.await.unwrap();
        let queued = timed(&exec, Priority::Low, "queued", Duration::ZERO, &order);

        exec.block();
        assert_eq!(
            exec.state(),
            ExecutorState {
                running: false,
                blocked: true
            }
        );

        let rejected = exec.submit(Priority::High, || async { Ok(()) });
        assert!(matches!(rejected, Err(Error::ExecutionBlocked)));
        assert_eq!(exec.stats().queued_low, 1);

        // The in-flight task is not cancelled by block()
        release.send(()).unwrap();
        assert_eq!(running.await.unwrap(), "running");
        sleep(Duration::from_millis(10)).await;
        assert_eq!(exec.stats().queued_low, 1);
        assert_eq!(*order.lock(), vec!["running"]);

        // After unblocking, the next submission drains what was left behind
        exec.unblock();
        let next = timed(&exec, Priority::Low, "next", Duration::ZERO, &order);
        assert_ok!(queued.await);
        assert_ok!(next.await);
        assert_eq!(*order.lock(), vec!["running", "queued", "next"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_abandons_queued_tasks_only() {
        let exec = CueExecutor::new();
        let order = log();

        let (running, started, release) = gated(&exec, Priority::Medium, "running", &order);
        started.await.unwrap();
        let low = timed(&exec, Priority::Low, "low", Duration::ZERO, &order);
        let high = timed(&exec, Priority::High, "high", Duration::ZERO, &order);
        let low_id = low.task_id();

        assert_eq!(exec.clear(Some(Priority::Low)), 1);
        assert!(matches!(
            low.await,
            Err(Error::TaskAbandoned { task_id }) if task_id == low_id
        ));

        assert_eq!(exec.clear(None), 1);
        assert!(matches!(high.await, Err(Error::TaskAbandoned { .. })));

        release.send(()).unwrap();
        assert_eq!(running.await.unwrap(), "running");
        assert_eq!(exec.stats().abandoned, 2);
        assert_eq!(*order.lock(), vec!["running"]);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_the_loop() {
        let exec = CueExecutor::new();

        let failing = exec
            .submit(Priority::High, || async {
                Err::<(), _>(Error::timeout("http://10.0.0.1/api/rest/v1/engines"))
            })
            .unwrap();
        let next = exec.submit(Priority::High, || async { Ok(7) }).unwrap();

        assert!(matches!(failing.await, Err(Error::TransportTimeout { .. })));
        assert_eq!(next.await.unwrap(), 7);

        let stats = exec.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn test_panicking_task_is_reported_as_abandoned() {
        let exec = CueExecutor::new();

        let boom = exec
            .submit(Priority::High, || async {
                if true {
                    panic!("task exploded");
                }
                Ok(())
            })
            .unwrap();
        let after = exec.submit(Priority::Low, || async { Ok("still running") }).unwrap();

        assert!(matches!(boom.await, Err(Error::TaskAbandoned { .. })));
        assert_eq!(after.await.unwrap(), "still running");
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_restarts_lazily() {
        let exec = CueExecutor::new();

        assert_eq!(exec.submit(Priority::Low, || async { Ok(1) }).unwrap().await.unwrap(), 1);
        sleep(Duration::from_millis(1)).await;
        assert!(!exec.state().running);
        assert_eq!(exec.stats().in_flight, None);

        assert_eq!(exec.submit(Priority::Low, || async { Ok(2) }).unwrap().await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_leaves_queue_until_next_submit() {
        let exec = CueExecutor::new();
        let order = log();

        let (first, started, release) = gated(&exec, Priority::High, "first", &order);
        started.await.unwrap();
        let waiting = timed(&exec, Priority::Low, "waiting", Duration::ZERO, &order);

        exec.stop();
        release.send(()).unwrap();
        assert_ok!(first.await);
        sleep(Duration::from_millis(10)).await;
        assert_eq!(exec.stats().queued_low, 1);

        let urgent = timed(&exec, Priority::High, "urgent", Duration::ZERO, &order);
        assert_ok!(waiting.await);
        assert_ok!(urgent.await);
        assert_eq!(*order.lock(), vec!["first", "urgent", "waiting"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_unblock_during_flight_keeps_single_loop() {
        let exec = CueExecutor::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let submit = |exec: &CueExecutor| {
            let active = active.clone();
            let peak = peak.clone();
            exec.submit(Priority::Medium, move || async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap()
        };

        let first = submit(&exec);
        sleep(Duration::from_millis(5)).await;
        exec.block();
        exec.unblock();
        let second = submit(&exec);
        let third = submit(&exec);

        assert_ok!(first.await);
        assert_ok!(second.await);
        assert_ok!(third.await);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
