//! Per-query request throttling.
//!
//! A [`ThrottleQueue`] runs queued fetches one at a time, no faster than one
//! per configured interval. Callers can bypass the interval with
//! pre-approved credits or run everything queued right now with
//! [`ThrottleQueue::flush`].

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, trace};

use crate::ThrottleError;
use crate::lock::lock;

/// Default minimum spacing between dequeues.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(1000);

/// Default polling period of the dequeue loop.
pub const DEFAULT_TICK: Duration = Duration::from_millis(50);

/// Queue timing settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleConfig {
    /// Minimum time between two uncredited dequeues.
    pub interval: Duration,
    /// How often an idle loop checks for work.
    pub tick: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            tick: DEFAULT_TICK,
        }
    }
}

/// Whether the dequeue loop is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Stopped,
    Running,
}

/// A type-erased queued task paired with its resolver.
trait QueuedTask: Send {
    fn run(self: Box<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>>;

    fn cancel(self: Box<Self>);
}

struct Pending<F, T, E> {
    make: F,
    resolver: oneshot::Sender<Result<T, ThrottleError<E>>>,
}

impl<F, Fut, T, E> QueuedTask for Pending<F, T, E>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    fn run(self: Box<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let Pending { make, resolver } = *self;
        Box::pin(async move {
            let result = make().await.map_err(ThrottleError::Task);
            if resolver.send(result).is_err() {
                trace!("throttled task finished after its caller went away");
            }
        })
    }

    fn cancel(self: Box<Self>) {
        if self.resolver.send(Err(ThrottleError::Cancelled)).is_err() {
            trace!("cancelled task had no waiting caller");
        }
    }
}

/// Result of an enqueued task, resolved when the task runs or is cancelled.
#[must_use = "an enqueued task's result is lost unless awaited"]
pub struct Enqueued<T, E> {
    result_rx: oneshot::Receiver<Result<T, ThrottleError<E>>>,
}

impl<T, E> Future for Enqueued<T, E> {
    type Output = Result<T, ThrottleError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped resolver means the queue went away with the task in it.
        Pin::new(&mut self.result_rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ThrottleError::Cancelled)))
    }
}

struct QueueInner {
    items: VecDeque<Box<dyn QueuedTask>>,
    credits: usize,
    state: QueueState,
    /// Set by `clear`; later enqueues are rejected until the next `start`.
    closed: bool,
    last_dequeue_at: Option<Instant>,
    shutdown_tx: Option<watch::Sender<bool>>,
}

enum Step {
    Run(Box<dyn QueuedTask>),
    Wait(Duration),
}

/// FIFO task queue that rate-limits dequeues.
pub struct ThrottleQueue {
    key: String,
    config: ThrottleConfig,
    inner: Mutex<QueueInner>,
}

impl ThrottleQueue {
    /// Create a stopped queue.
    pub fn new(key: impl Into<String>, config: ThrottleConfig) -> Arc<Self> {
        Arc::new(Self {
            key: key.into(),
            config,
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                credits: 0,
                state: QueueState::Stopped,
                closed: false,
                last_dequeue_at: None,
                shutdown_tx: None,
            }),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> ThrottleConfig {
        self.config
    }

    pub fn state(&self) -> QueueState {
        lock(&self.inner, "state").state
    }

    /// Number of tasks waiting to be dequeued.
    pub fn len(&self) -> usize {
        lock(&self.inner, "len").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unused pre-approval credits.
    pub fn credits(&self) -> usize {
        lock(&self.inner, "credits").credits
    }

    /// Start the dequeue loop. Must be called from within a Tokio runtime.
    ///
    /// Starting a running queue does nothing.
    pub fn start(self: &Arc<Self>) {
        let shutdown_rx = {
            let mut inner = lock(&self.inner, "start");
            if inner.state == QueueState::Running {
                return;
            }
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            inner.state = QueueState::Running;
            inner.closed = false;
            inner.shutdown_tx = Some(shutdown_tx);
            shutdown_rx
        };

        debug!(key = %self.key, "throttle queue started");
        tokio::spawn(Arc::clone(self).run(shutdown_rx));
    }

    /// Append a task and return a future resolving to its result.
    ///
    /// The task is queued immediately, before the returned future is
    /// polled. It runs once the loop dequeues it or [`flush`](Self::flush)
    /// is called; a queue that was never started holds it until then.
    /// After [`clear`](Self::clear) the task is rejected as cancelled.
    pub fn enqueue<F, Fut, T, E>(&self, make: F) -> Enqueued<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let (resolver, result_rx) = oneshot::channel();
        let task: Box<dyn QueuedTask> = Box::new(Pending { make, resolver });

        let mut inner = lock(&self.inner, "enqueue");
        if inner.closed {
            drop(inner);
            debug!(key = %self.key, "enqueue on cleared queue rejected");
            task.cancel();
            return Enqueued { result_rx };
        }
        inner.items.push_back(task);
        let queued = inner.items.len();
        drop(inner);

        trace!(key = %self.key, queued, "task enqueued");
        Enqueued { result_rx }
    }

    /// Let the next `n` dequeues skip the interval.
    pub fn pre_approve(&self, n: usize) {
        let credits = {
            let mut inner = lock(&self.inner, "pre_approve");
            inner.credits += n;
            inner.credits
        };
        debug!(key = %self.key, added = n, credits, "credits pre-approved");
    }

    /// Withdraw up to `n` unused credits. Returns how many were removed.
    pub fn revoke(&self, n: usize) -> usize {
        let (removed, credits) = {
            let mut inner = lock(&self.inner, "revoke");
            let removed = n.min(inner.credits);
            inner.credits -= removed;
            (removed, inner.credits)
        };
        debug!(key = %self.key, removed, credits, "credits revoked");
        removed
    }

    /// Run every currently queued task right now, concurrently.
    ///
    /// Leaves the interval clock untouched. Returns how many tasks were
    /// started.
    pub fn flush(&self) -> usize {
        let drained: Vec<_> = lock(&self.inner, "flush").items.drain(..).collect();
        let count = drained.len();
        for task in drained {
            tokio::spawn(task.run());
        }
        debug!(key = %self.key, count, "throttle queue flushed");
        count
    }

    /// Stop the loop and cancel every queued task.
    ///
    /// Tasks enqueued afterwards are cancelled immediately.
    pub fn clear(&self) {
        let (cancelled, shutdown_tx) = {
            let mut inner = lock(&self.inner, "clear");
            inner.state = QueueState::Stopped;
            inner.closed = true;
            inner.credits = 0;
            let cancelled: Vec<_> = inner.items.drain(..).collect();
            (cancelled, inner.shutdown_tx.take())
        };

        if let Some(tx) = shutdown_tx {
            let _ = tx.send(true);
        }
        let count = cancelled.len();
        for task in cancelled {
            task.cancel();
        }
        debug!(key = %self.key, cancelled = count, "throttle queue cleared");
    }

    async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            match self.next_step() {
                Step::Run(task) => {
                    tokio::spawn(task.run());
                }
                Step::Wait(duration) => {
                    tokio::select! {
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = sleep(duration) => {}
                    }
                }
            }
        }

        info!(key = %self.key, "throttle queue loop stopped");
    }

    fn next_step(&self) -> Step {
        let mut inner = lock(&self.inner, "next_step");
        if inner.items.is_empty() {
            return Step::Wait(self.config.tick);
        }

        let now = Instant::now();
        if inner.credits > 0 {
            inner.credits -= 1;
        } else if let Some(last) = inner.last_dequeue_at {
            let elapsed = now.duration_since(last);
            if elapsed < self.config.interval {
                return Step::Wait(self.config.interval - elapsed);
            }
        }

        match inner.items.pop_front() {
            Some(task) => {
                inner.last_dequeue_at = Some(now);
                trace!(key = %self.key, remaining = inner.items.len(), "task dequeued");
                Step::Run(task)
            }
            None => Step::Wait(self.config.tick),
        }
    }
}

impl Drop for ThrottleQueue {
    fn drop(&mut self) {
        let inner = match self.inner.get_mut() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        for task in inner.items.drain(..) {
            task.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn queue() -> Arc<ThrottleQueue> {
        ThrottleQueue::new("test", ThrottleConfig::default())
    }

    /// Enqueue a task that records when and in which order it ran.
    fn record(
        queue: &ThrottleQueue,
        log: &Arc<StdMutex<Vec<(usize, Instant)>>>,
        id: usize,
    ) -> Enqueued<usize, String> {
        let log = Arc::clone(log);
        queue.enqueue(move || async move {
            log.lock().unwrap().push((id, Instant::now()));
            Ok::<_, String>(id)
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeues_respect_interval() {
        let queue = queue();
        let log = Arc::new(StdMutex::new(Vec::new()));

        let a = record(&queue, &log, 0);
        let b = record(&queue, &log, 1);
        let c = record(&queue, &log, 2);
        queue.start();

        assert_eq!(a.await.unwrap(), 0);
        assert_eq!(b.await.unwrap(), 1);
        assert_eq!(c.await.unwrap(), 2);

        let log = log.lock().unwrap();
        let order: Vec<_> = log.iter().map(|(id, _)| *id).collect();
        assert_eq!(order, vec![0, 1, 2]);
        for pair in log.windows(2) {
            assert!(pair[1].1 - pair[0].1 >= DEFAULT_INTERVAL);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_credits_skip_interval() {
        let queue = queue();
        let log = Arc::new(StdMutex::new(Vec::new()));

        let pending: Vec<_> = (0..3).map(|id| record(&queue, &log, id)).collect();
        queue.pre_approve(3);
        assert_eq!(queue.credits(), 3);

        let started = Instant::now();
        queue.start();
        for task in pending {
            task.await.unwrap();
        }

        assert!(started.elapsed() < DEFAULT_TICK);
        assert_eq!(queue.credits(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_runs_only_already_queued_items() {
        let queue = queue();
        let log = Arc::new(StdMutex::new(Vec::new()));

        let a = record(&queue, &log, 0);
        let b = record(&queue, &log, 1);
        assert_eq!(queue.flush(), 2);
        let c = record(&queue, &log, 2);

        assert_eq!(a.await.unwrap(), 0);
        assert_eq!(b.await.unwrap(), 1);
        assert_eq!(queue.len(), 1);

        queue.clear();
        assert!(c.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_stopped_queue_holds_items() {
        let queue = queue();
        let _pending = queue.enqueue(|| async { Ok::<_, String>(()) });

        tokio::task::yield_now().await;
        assert_eq!(queue.state(), QueueState::Stopped);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cancels_and_stops() {
        let queue = ThrottleQueue::new(
            "slow",
            ThrottleConfig {
                interval: Duration::from_secs(60),
                tick: DEFAULT_TICK,
            },
        );
        let log = Arc::new(StdMutex::new(Vec::new()));

        let first = record(&queue, &log, 0);
        let second = record(&queue, &log, 1);
        let third = record(&queue, &log, 2);
        queue.start();
        assert_eq!(queue.state(), QueueState::Running);

        assert_eq!(first.await.unwrap(), 0);
        queue.clear();

        assert_eq!(queue.state(), QueueState::Stopped);
        assert!(second.await.unwrap_err().is_cancelled());
        assert!(third.await.unwrap_err().is_cancelled());
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_after_clear_is_cancelled() {
        let queue = queue();
        queue.start();
        queue.clear();

        let late = queue.enqueue(|| async { Ok::<_, String>(()) });

        assert!(late.await.unwrap_err().is_cancelled());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_restart_reopens_cleared_queue() {
        let queue = queue();
        queue.clear();
        queue.start();

        let task = queue.enqueue(|| async { Ok::<_, String>(5) });
        assert_eq!(task.await.unwrap(), 5);
    }

    #[test]
    fn test_revoke_saturates_at_available_credits() {
        let queue = queue();
        queue.pre_approve(2);

        assert_eq!(queue.revoke(1), 1);
        assert_eq!(queue.revoke(5), 1);
        assert_eq!(queue.credits(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_keeps_interval_clock() {
        let queue = queue();
        let log = Arc::new(StdMutex::new(Vec::new()));

        let first = record(&queue, &log, 0);
        queue.start();
        first.await.unwrap();
        let first_at = log.lock().unwrap()[0].1;

        sleep(Duration::from_millis(400)).await;
        let flushed = vec![record(&queue, &log, 1), record(&queue, &log, 2)];
        assert_eq!(queue.flush(), 2);
        let last = record(&queue, &log, 3);

        for task in flushed {
            task.await.unwrap();
        }
        last.await.unwrap();

        // The last task waits out the interval since the first dequeue,
        // not a fresh interval from the flush.
        let last_at = log.lock().unwrap()[3].1;
        assert!(last_at - first_at >= DEFAULT_INTERVAL);
        assert!(last_at - first_at < DEFAULT_INTERVAL + Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_task_error_is_propagated() {
        let queue = queue();
        let pending = queue.enqueue(|| async { Err::<(), _>("boom".to_string()) });
        queue.flush();

        match pending.await {
            Err(ThrottleError::Task(e)) => assert_eq!(e, "boom"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dropped_queue_cancels_pending() {
        let queue = queue();
        let pending = queue.enqueue(|| async { Ok::<_, String>(1) });
        drop(queue);

        assert!(pending.await.unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let queue = queue();
        queue.start();
        queue.start();

        let log = Arc::new(StdMutex::new(Vec::new()));
        let a = record(&queue, &log, 0);
        let b = record(&queue, &log, 1);
        a.await.unwrap();
        b.await.unwrap();

        let log = log.lock().unwrap();
        assert!(log[1].1 - log[0].1 >= DEFAULT_INTERVAL);
    }
}
