//! The start / poll / complete pattern behind exposures, wheel moves and
//! guide pulses.
//!
//! An [`AsyncOperation`] knows how to start, poll and abort one kind of
//! hardware operation. [`OperationRunner`] owns the governing property's
//! state transitions and the poll timer:
//!
//! 1. not connected → ALERT; already BUSY → silent no-op
//! 2. BUSY + publish, then `start`; a start error → ALERT, no timer
//! 3. poll timer after the delay `start` returned
//! 4. `poll` → `Complete` (OK), `Pending` (publish progress, reschedule) or
//!    `Failed` (ALERT)
//!
//! Every transition happens in the handler that called `start`/`abort` or in
//! the timer body, both of which hold the endpoint's dispatch queue.

use crate::endpoint::EndpointContext;
use crate::property::PropertyState;
use crate::timer::{cancel_slot, DispatchQueue, Scheduler, TimerAction, TimerHandle};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Result of one poll of a running operation.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Complete { message: Option<String> },
    Pending { next: Duration },
    Failed { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// The property was already BUSY. Nothing was sent to the hardware.
    AlreadyBusy,
    NotConnected,
    /// The hardware rejected the start. The property is ALERT.
    Failed,
}

#[async_trait]
pub trait AsyncOperation: Send + Sync + 'static {
    type Params: Send + 'static;

    /// Name of the governing property.
    fn property(&self) -> &str;

    /// Issue the hardware start command. Returns the delay before the first poll.
    async fn start(&self, ctx: &EndpointContext, params: Self::Params) -> anyhow::Result<Duration>;

    /// Check progress. May update progress items in `ctx` without publishing.
    async fn poll(&self, ctx: &EndpointContext) -> PollOutcome;

    /// Stop the hardware.
    async fn abort(&self, ctx: &EndpointContext) -> anyhow::Result<()>;
}

struct RunnerInner<O> {
    operation: O,
    ctx: EndpointContext,
    queue: DispatchQueue,
    scheduler: Scheduler,
    timer: parking_lot::Mutex<Option<TimerHandle>>,
}

/// Runs one [`AsyncOperation`] against its governing property.
pub struct OperationRunner<O: AsyncOperation> {
    inner: Arc<RunnerInner<O>>,
}

impl<O: AsyncOperation> Clone for OperationRunner<O> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<O: AsyncOperation> OperationRunner<O> {
    pub fn new(operation: O, ctx: EndpointContext, queue: DispatchQueue, scheduler: Scheduler) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                operation,
                ctx,
                queue,
                scheduler,
                timer: parking_lot::Mutex::new(None),
            }),
        }
    }

    pub fn operation(&self) -> &O {
        &self.inner.operation
    }

    pub fn is_busy(&self) -> bool {
        self.inner.ctx.state(self.inner.operation.property()) == PropertyState::Busy
    }

    /// Whether a poll timer is armed.
    pub fn is_scheduled(&self) -> bool {
        self.inner.timer.lock().is_some()
    }

    pub async fn start(&self, connected: bool, params: O::Params) -> StartOutcome {
        let inner = &self.inner;
        let property = inner.operation.property();

        if !connected {
            inner.ctx.alert(property, "Device is not connected");
            return StartOutcome::NotConnected;
        }
        if self.is_busy() {
            tracing::debug!(endpoint = %inner.ctx.device(), property, "start ignored, already busy");
            return StartOutcome::AlreadyBusy;
        }

        inner.ctx.busy(property);
        let delay = match inner.operation.start(&inner.ctx, params).await {
            Ok(delay) => delay,
            Err(e) => {
                inner.ctx.alert(property, &format!("{e:#}"));
                return StartOutcome::Failed;
            }
        };

        let runner = self.inner.clone();
        let handle = inner.scheduler.schedule(&inner.queue, delay, move || {
            let runner = runner.clone();
            async move { runner.tick().await }
        });
        cancel_slot(&mut inner.timer.lock());
        *inner.timer.lock() = Some(handle);
        StartOutcome::Started
    }

    /// Abort a BUSY operation. Returns false if nothing was running.
    pub async fn abort(&self) -> bool {
        let inner = &self.inner;
        if !self.is_busy() {
            return false;
        }
        cancel_slot(&mut inner.timer.lock());

        let property = inner.operation.property();
        match inner.operation.abort(&inner.ctx).await {
            Ok(()) => inner.ctx.ok(property, Some("Aborted")),
            Err(e) => inner.ctx.alert(property, &format!("Abort failed: {e:#}")),
        }
        true
    }

    /// Cancel the poll timer without touching the hardware or the property.
    pub fn cancel(&self) -> bool {
        cancel_slot(&mut self.inner.timer.lock())
    }
}

impl<O: AsyncOperation> RunnerInner<O> {
    async fn tick(&self) -> TimerAction {
        let property = self.operation.property();
        match self.operation.poll(&self.ctx).await {
            PollOutcome::Complete { message } => {
                self.timer.lock().take();
                self.ctx.ok(property, message.as_deref());
                TimerAction::Done
            }
            PollOutcome::Pending { next } => {
                self.ctx.publish(property);
                TimerAction::Reschedule(next)
            }
            PollOutcome::Failed { message } => {
                self.timer.lock().take();
                self.ctx.alert(property, &message);
                TimerAction::Done
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::{names, Item, ItemUpdate, MemoryPropertyStore, Property, PropertyKind};
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    /// Counts down `steps` polls before completing.
    #[derive(Default)]
    struct Countdown {
        starts: AtomicUsize,
        aborts: AtomicUsize,
        remaining: AtomicU32,
        reject: bool,
    }

    #[async_trait]
    impl AsyncOperation for Countdown {
        type Params = u32;

        fn property(&self) -> &str {
            names::WHEEL_SLOT
        }

        async fn start(&self, _ctx: &EndpointContext, steps: u32) -> anyhow::Result<Duration> {
            if self.reject {
                anyhow::bail!("wheel jammed");
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.remaining.store(steps, Ordering::SeqCst);
            Ok(Duration::from_millis(500))
        }

        async fn poll(&self, ctx: &EndpointContext) -> PollOutcome {
            let left = self.remaining.fetch_sub(1, Ordering::SeqCst) - 1;
            ctx.set_values(
                names::WHEEL_SLOT,
                &[ItemUpdate::value(names::WHEEL_SLOT_ITEM, f64::from(5 - left))],
            );
            if left == 0 {
                PollOutcome::Complete { message: None }
            } else {
                PollOutcome::Pending {
                    next: Duration::from_millis(500),
                }
            }
        }

        async fn abort(&self, _ctx: &EndpointContext) -> anyhow::Result<()> {
            self.aborts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn runner(op: Countdown) -> (OperationRunner<Countdown>, EndpointContext, DispatchQueue) {
        let store = Arc::new(MemoryPropertyStore::new());
        let ctx = EndpointContext::new("Wheel", store);
        ctx.define(
            Property::new(names::WHEEL_SLOT, "Slot", PropertyKind::Number)
                .with_item(Item::number(names::WHEEL_SLOT_ITEM, "Slot", 1.0, 5.0, 1.0)),
        )
        .unwrap();
        let queue = DispatchQueue::new("Wheel");
        let runner = OperationRunner::new(op, ctx.clone(), queue.clone(), Scheduler::new());
        (runner, ctx, queue)
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_complete() {
        let (runner, ctx, _queue) = runner(Countdown::default());

        assert_eq!(runner.start(true, 4).await, StartOutcome::Started);
        assert_eq!(ctx.state(names::WHEEL_SLOT), PropertyState::Busy);

        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert_eq!(ctx.state(names::WHEEL_SLOT), PropertyState::Busy);
        assert_eq!(ctx.value(names::WHEEL_SLOT, names::WHEEL_SLOT_ITEM), Some(4.0));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ctx.state(names::WHEEL_SLOT), PropertyState::Ok);
        assert_eq!(ctx.value(names::WHEEL_SLOT, names::WHEEL_SLOT_ITEM), Some(5.0));
        assert!(!runner.is_scheduled());
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_while_busy_is_noop() {
        let (runner, ctx, _queue) = runner(Countdown::default());

        runner.start(true, 2).await;
        assert_eq!(runner.start(true, 2).await, StartOutcome::AlreadyBusy);
        assert_eq!(runner.operation().starts.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.state(names::WHEEL_SLOT), PropertyState::Busy);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_start_alerts_without_timer() {
        let (runner, ctx, _queue) = runner(Countdown {
            reject: true,
            ..Default::default()
        });

        assert_eq!(runner.start(true, 2).await, StartOutcome::Failed);
        assert_eq!(ctx.state(names::WHEEL_SLOT), PropertyState::Alert);
        assert!(!runner.is_scheduled());
    }

    #[tokio::test(start_paused = true)]
    async fn not_connected_alerts() {
        let (runner, ctx, _queue) = runner(Countdown::default());
        assert_eq!(runner.start(false, 2).await, StartOutcome::NotConnected);
        assert_eq!(ctx.state(names::WHEEL_SLOT), PropertyState::Alert);
        assert_eq!(runner.operation().starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_cancels_pending_poll() {
        let (runner, ctx, _queue) = runner(Countdown::default());
        runner.start(true, 4).await;

        assert!(runner.abort().await);
        assert_eq!(ctx.state(names::WHEEL_SLOT), PropertyState::Ok);
        assert_eq!(runner.operation().aborts.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ctx.value(names::WHEEL_SLOT, names::WHEEL_SLOT_ITEM), Some(1.0));
        assert!(!runner.abort().await);
    }
}
