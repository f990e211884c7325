//! Per-endpoint dispatch queues and cancellable timers.
//!
//! Every endpoint owns a [`DispatchQueue`]. Timer bodies and property-change
//! handlers of that endpoint run while holding the queue, so they never run
//! concurrently with each other. Different endpoints run in parallel on the
//! tokio runtime.
//!
//! A timer is a spawned task that sleeps until its deadline, takes the queue,
//! re-checks its cancelled flag and only then runs the body. Cancelling a
//! timer that has not entered its body therefore guarantees the body never
//! runs; cancelling a timer whose body already finished is a no-op.
//!
//! Bodies return [`TimerAction::Reschedule`] to run again in the same slot.
//! Polling loops are written this way instead of sleeping inside a body.
//!
//! # Example
//!
//! ```rust,ignore
//! let queue = DispatchQueue::new("Wheel");
//! let handle = scheduler.schedule(&queue, Duration::from_millis(500), move || {
//!     let wheel = wheel.clone();
//!     async move {
//!         if wheel.poll().await { TimerAction::Done } else { TimerAction::Reschedule(Duration::from_millis(500)) }
//!     }
//! });
//! ```

use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio::time::Instant;

/// What a timer body asks for after it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    Done,
    Reschedule(Duration),
}

// =============================================================================
// Dispatch Queue
// =============================================================================

/// Serializes all callbacks of one endpoint.
#[derive(Debug, Clone)]
pub struct DispatchQueue {
    name: Arc<str>,
    lock: Arc<Mutex<()>>,
}

impl DispatchQueue {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enter the queue. Never call this from inside a timer body or a
    /// property-change handler of the same endpoint: the queue is already held.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

// =============================================================================
// Timer Handle
// =============================================================================

#[derive(Debug)]
struct TimerShared {
    id: u64,
    cancelled: AtomicBool,
    finished: AtomicBool,
    runs: AtomicU64,
    pending: SyncMutex<Option<Duration>>,
    wake: Notify,
}

/// Handle to a scheduled timer.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    shared: Arc<TimerShared>,
}

impl TimerHandle {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Prevent any future run of the body.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    /// Move the next run to `delay` from now. Returns false if the timer is
    /// already finished or cancelled.
    pub fn reschedule(&self, delay: Duration) -> bool {
        if self.is_finished() || self.is_cancelled() {
            return false;
        }
        *self.shared.pending.lock() = Some(delay);
        self.shared.wake.notify_one();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::SeqCst)
    }

    /// Number of times the body has been entered.
    pub fn run_count(&self) -> u64 {
        self.shared.runs.load(Ordering::SeqCst)
    }
}

/// Cancel the timer stored in `slot` and clear it. Safe to call repeatedly.
pub fn cancel_slot(slot: &mut Option<TimerHandle>) -> bool {
    match slot.take() {
        Some(handle) => {
            handle.cancel();
            true
        }
        None => false,
    }
}

// =============================================================================
// Scheduler
// =============================================================================

#[derive(Debug, Default)]
struct SchedulerInner {
    next_id: AtomicU64,
    live: SyncMutex<HashMap<u64, Weak<TimerShared>>>,
}

/// Spawns timers on the current tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `callback` on `queue` once `delay` has elapsed.
    pub fn schedule<F, Fut>(&self, queue: &DispatchQueue, delay: Duration, callback: F) -> TimerHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TimerAction> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(TimerShared {
            id,
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            runs: AtomicU64::new(0),
            pending: SyncMutex::new(None),
            wake: Notify::new(),
        });
        self.inner.live.lock().insert(id, Arc::downgrade(&shared));
        tracing::trace!(timer = id, queue = queue.name(), ?delay, "timer scheduled");

        tokio::spawn(run_timer(
            shared.clone(),
            queue.clone(),
            delay,
            callback,
            Arc::downgrade(&self.inner),
        ));

        TimerHandle { shared }
    }

    /// Number of timers that have not finished yet.
    pub fn live_timers(&self) -> usize {
        self.inner
            .live
            .lock()
            .values()
            .filter(|w| w.upgrade().is_some())
            .count()
    }

    /// Cancel every live timer.
    pub fn shutdown(&self) {
        let live: Vec<Arc<TimerShared>> = self
            .inner
            .live
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for shared in live {
            TimerHandle { shared }.cancel();
        }
    }
}

async fn run_timer<F, Fut>(
    shared: Arc<TimerShared>,
    queue: DispatchQueue,
    mut delay: Duration,
    callback: F,
    scheduler: Weak<SchedulerInner>,
) where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TimerAction> + Send + 'static,
{
    'outer: loop {
        let mut deadline = Instant::now() + delay;
        loop {
            if shared.cancelled.load(Ordering::SeqCst) {
                break 'outer;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                _ = shared.wake.notified() => {
                    if let Some(next) = shared.pending.lock().take() {
                        deadline = Instant::now() + next;
                    }
                }
            }
        }

        let guard = queue.lock().await;
        if shared.cancelled.load(Ordering::SeqCst) {
            break;
        }
        if let Some(next) = shared.pending.lock().take() {
            drop(guard);
            delay = next;
            continue;
        }

        shared.runs.fetch_add(1, Ordering::SeqCst);
        let action = callback().await;
        drop(guard);

        if let Some(next) = shared.pending.lock().take() {
            delay = next;
            continue;
        }
        match action {
            TimerAction::Done => break,
            TimerAction::Reschedule(next) => delay = next,
        }
    }

    shared.finished.store(true, Ordering::SeqCst);
    if let Some(inner) = scheduler.upgrade() {
        inner.live.lock().remove(&shared.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn counting(
        count: &Arc<AtomicUsize>,
    ) -> impl Fn() -> futures::future::Ready<TimerAction> + Send + Sync + 'static {
        let count = count.clone();
        move || {
            count.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(TimerAction::Done)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let scheduler = Scheduler::new();
        let queue = DispatchQueue::new("ccd");
        let count = counter();

        let handle = scheduler.schedule(&queue, Duration::from_secs(2), counting(&count));

        tokio::time::sleep(Duration::from_millis(1999)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(handle.is_finished());
        assert_eq!(scheduler.live_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_deadline_prevents_body() {
        let scheduler = Scheduler::new();
        let queue = DispatchQueue::new("ccd");
        let count = counter();

        let mut slot = Some(scheduler.schedule(&queue, Duration::from_secs(1), counting(&count)));
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(cancel_slot(&mut slot));
        assert!(!cancel_slot(&mut slot));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_waiting_for_queue_prevents_body() {
        let scheduler = Scheduler::new();
        let queue = DispatchQueue::new("mount");
        let count = counter();

        let guard = queue.lock().await;
        let handle = scheduler.schedule(&queue, Duration::from_millis(10), counting(&count));

        // Deadline passes while the queue is held by a "handler".
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        drop(guard);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_run_is_noop() {
        let scheduler = Scheduler::new();
        let queue = DispatchQueue::new("ccd");
        let count = counter();

        let handle = scheduler.schedule(&queue, Duration::from_millis(10), counting(&count));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(handle.run_count(), 1);
        assert!(!handle.reschedule(Duration::from_millis(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn body_can_reschedule_itself() {
        let scheduler = Scheduler::new();
        let queue = DispatchQueue::new("wheel");
        let count = counter();

        let ticks = count.clone();
        let handle = scheduler.schedule(&queue, Duration::from_millis(500), move || {
            let n = ticks.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 4 {
                    TimerAction::Reschedule(Duration::from_millis(500))
                } else {
                    TimerAction::Done
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 4);
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_moves_deadline() {
        let scheduler = Scheduler::new();
        let queue = DispatchQueue::new("guider");
        let count = counter();

        let handle = scheduler.schedule(&queue, Duration::from_millis(100), counting(&count));
        assert!(handle.reschedule(Duration::from_secs(1)));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bodies_on_one_queue_never_overlap() {
        let scheduler = Scheduler::new();
        let queue = DispatchQueue::new("mount");
        let active = counter();
        let max_active = counter();

        for _ in 0..4 {
            let active = active.clone();
            let max_active = max_active.clone();
            scheduler.schedule(&queue, Duration::from_millis(10), move || {
                let active = active.clone();
                let max_active = max_active.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    TimerAction::Done
                }
            });
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_live_timers() {
        let scheduler = Scheduler::new();
        let queue = DispatchQueue::new("ccd");
        let count = counter();

        for _ in 0..3 {
            scheduler.schedule(&queue, Duration::from_secs(5), counting(&count));
        }
        assert_eq!(scheduler.live_timers(), 3);

        scheduler.shutdown();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.live_timers(), 0);
    }
}
