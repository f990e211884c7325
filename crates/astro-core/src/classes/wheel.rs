use super::unknown_property;
use crate::capabilities::{Connectable, SlotCapable};
use crate::connection::{handle_connection_change, ConnectionMachine};
use crate::driver::DriverContext;
use crate::endpoint::{Endpoint, EndpointContext, EndpointKind, PropertyChange};
use crate::operation::{AsyncOperation, OperationRunner, PollOutcome};
use crate::property::{names, Item, ItemUpdate, Property, PropertyKind};
use crate::timer::DispatchQueue;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Filter wheel move, polled every 0.5 s until the wheel reports the target slot.
pub struct WheelMoveOperation {
    wheel: Arc<dyn SlotCapable>,
    slot_count: AtomicU32,
}

impl WheelMoveOperation {
    pub fn new(wheel: Arc<dyn SlotCapable>) -> Self {
        Self {
            wheel,
            slot_count: AtomicU32::new(0),
        }
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AsyncOperation for WheelMoveOperation {
    type Params = u32;

    fn property(&self) -> &str {
        names::WHEEL_SLOT
    }

    async fn start(&self, ctx: &EndpointContext, slot: u32) -> Result<Duration> {
        let count = self.slot_count();
        if slot < 1 || slot > count {
            anyhow::bail!("Slot {slot} is out of range 1-{count}");
        }
        self.wheel.move_to_slot(slot).await?;
        ctx.set_values(
            names::WHEEL_SLOT,
            &[ItemUpdate::target(names::WHEEL_SLOT_ITEM, f64::from(slot))],
        );
        Ok(POLL_INTERVAL)
    }

    async fn poll(&self, ctx: &EndpointContext) -> PollOutcome {
        let current = match self.wheel.current_slot().await {
            Ok(slot) => slot,
            Err(e) => {
                return PollOutcome::Failed {
                    message: format!("Filter wheel error: {e:#}"),
                }
            }
        };
        ctx.set_values(
            names::WHEEL_SLOT,
            &[ItemUpdate::value(names::WHEEL_SLOT_ITEM, f64::from(current))],
        );
        let target = ctx.target(names::WHEEL_SLOT, names::WHEEL_SLOT_ITEM);
        if target == Some(f64::from(current)) {
            PollOutcome::Complete { message: None }
        } else {
            PollOutcome::Pending {
                next: POLL_INTERVAL,
            }
        }
    }

    async fn abort(&self, _ctx: &EndpointContext) -> Result<()> {
        // A wheel cannot be stopped mid-move; the runner just stops polling.
        Ok(())
    }
}

pub struct WheelEndpoint {
    name: String,
    queue: DispatchQueue,
    ctx: EndpointContext,
    connection: ConnectionMachine,
    device: Arc<dyn Connectable>,
    wheel: Arc<dyn SlotCapable>,
    mover: OperationRunner<WheelMoveOperation>,
}

impl WheelEndpoint {
    pub fn new(
        name: &str,
        context: &DriverContext,
        device: Arc<dyn Connectable>,
        wheel: Arc<dyn SlotCapable>,
    ) -> Self {
        let queue = DispatchQueue::new(name);
        let ctx = EndpointContext::new(name, context.store.clone());
        let mover = OperationRunner::new(
            WheelMoveOperation::new(wheel.clone()),
            ctx.clone(),
            queue.clone(),
            context.scheduler.clone(),
        );
        Self {
            name: name.to_string(),
            queue,
            connection: ConnectionMachine::new(ctx.clone()),
            ctx,
            device,
            wheel,
            mover,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    fn slot_property(count: u32, current: u32) -> Property {
        Property::new(names::WHEEL_SLOT, "Current slot", PropertyKind::Number).with_item(Item::number(
            names::WHEEL_SLOT_ITEM,
            "Slot",
            1.0,
            f64::from(count.max(1)),
            f64::from(current.max(1)),
        ))
    }

    async fn open(&self) -> Result<()> {
        let count = self.wheel.slot_count().await.context("Failed to read slot count")?;
        let current = self.wheel.current_slot().await.context("Failed to read slot")?;
        self.mover.operation().slot_count.store(count, Ordering::SeqCst);

        // The slot range is only known now.
        if self.ctx.is_defined(names::WHEEL_SLOT) {
            self.ctx.undefine(names::WHEEL_SLOT)?;
        }
        self.ctx.define(Self::slot_property(count, current))?;
        self.ctx.ok(names::WHEEL_SLOT, None);
        tracing::info!(endpoint = %self.name, count, current, "filter wheel ready");
        Ok(())
    }
}

#[async_trait]
impl Connectable for WheelEndpoint {
    async fn connect(&self) -> Result<()> {
        self.device.connect().await?;
        if let Err(e) = self.open().await {
            if let Err(close_err) = self.device.disconnect().await {
                tracing::warn!(endpoint = %self.name, error = %close_err, "disconnect failed");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.mover.cancel();
        if let Err(e) = self.device.disconnect().await {
            tracing::warn!(endpoint = %self.name, error = %e, "disconnect failed");
        }
        Ok(())
    }
}

#[async_trait]
impl Endpoint for WheelEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EndpointKind {
        EndpointKind::Wheel
    }

    fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    async fn attach(&self) -> Result<()> {
        self.connection.define()?;
        self.ctx.define(Self::slot_property(1, 1))?;
        tracing::info!(endpoint = %self.name, "attached");
        Ok(())
    }

    async fn change_property(&self, change: PropertyChange) -> Result<()> {
        match change.property.as_str() {
            names::CONNECTION => {
                handle_connection_change(&self.connection, self, &change).await;
                Ok(())
            }
            names::WHEEL_SLOT => {
                let Some(slot) = change.requested(names::WHEEL_SLOT_ITEM) else {
                    return Ok(());
                };
                self.mover
                    .start(self.is_connected(), slot.round().max(0.0) as u32)
                    .await;
                Ok(())
            }
            _ => Err(unknown_property(&self.name, &change)),
        }
    }

    async fn detach(&self) -> Result<()> {
        if self.is_connected() {
            Connectable::disconnect(self).await?;
            self.connection.disconnected();
        }
        self.mover.cancel();
        self.ctx.undefine_all();
        tracing::info!(endpoint = %self.name, "detached");
        Ok(())
    }
}
