use super::unknown_property;
use crate::capabilities::{Connectable, GuideAxis, GuideCapable, GuideDirection};
use crate::connection::{handle_connection_change, ConnectionMachine};
use crate::driver::DriverContext;
use crate::endpoint::{Endpoint, EndpointContext, EndpointKind, PropertyChange};
use crate::operation::{AsyncOperation, OperationRunner, PollOutcome};
use crate::property::{names, Item, ItemUpdate, Property, PropertyKind};
use crate::timer::DispatchQueue;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Longest accepted pulse, in milliseconds.
const MAX_PULSE_MS: f64 = 10_000.0;

/// One timed guide pulse on one axis. The pulse ends when the timer fires;
/// both direction items are then zeroed.
pub struct GuidePulseOperation {
    guide: Arc<dyn GuideCapable>,
    axis: GuideAxis,
}

impl GuidePulseOperation {
    pub fn new(guide: Arc<dyn GuideCapable>, axis: GuideAxis) -> Self {
        Self { guide, axis }
    }

    fn items(&self) -> [&'static str; 2] {
        match self.axis {
            GuideAxis::Ra => [names::GUIDER_GUIDE_EAST, names::GUIDER_GUIDE_WEST],
            GuideAxis::Dec => [names::GUIDER_GUIDE_NORTH, names::GUIDER_GUIDE_SOUTH],
        }
    }

    fn clear(&self, ctx: &EndpointContext) {
        let [a, b] = self.items();
        ctx.set_values(
            self.property(),
            &[ItemUpdate::number(a, 0.0), ItemUpdate::number(b, 0.0)],
        );
    }
}

#[async_trait]
impl AsyncOperation for GuidePulseOperation {
    type Params = (GuideDirection, Duration);

    fn property(&self) -> &str {
        match self.axis {
            GuideAxis::Ra => names::GUIDER_GUIDE_RA,
            GuideAxis::Dec => names::GUIDER_GUIDE_DEC,
        }
    }

    async fn start(&self, _ctx: &EndpointContext, (direction, duration): Self::Params) -> Result<Duration> {
        tracing::debug!(?direction, ?duration, "guide pulse");
        self.guide.start_pulse(direction, duration).await?;
        Ok(duration)
    }

    async fn poll(&self, ctx: &EndpointContext) -> PollOutcome {
        let result = self.guide.end_pulse(self.axis).await;
        self.clear(ctx);
        match result {
            Ok(()) => PollOutcome::Complete { message: None },
            Err(e) => PollOutcome::Failed {
                message: format!("Failed to end guide pulse: {e:#}"),
            },
        }
    }

    async fn abort(&self, ctx: &EndpointContext) -> Result<()> {
        self.clear(ctx);
        self.guide.end_pulse(self.axis).await
    }
}

/// Guide port endpoint (GUIDER_GUIDE_RA / GUIDER_GUIDE_DEC, durations in ms).
pub struct GuiderEndpoint {
    name: String,
    queue: DispatchQueue,
    ctx: EndpointContext,
    connection: ConnectionMachine,
    device: Arc<dyn Connectable>,
    ra: OperationRunner<GuidePulseOperation>,
    dec: OperationRunner<GuidePulseOperation>,
}

impl GuiderEndpoint {
    pub fn new(
        name: &str,
        context: &DriverContext,
        device: Arc<dyn Connectable>,
        guide: Arc<dyn GuideCapable>,
    ) -> Self {
        let queue = DispatchQueue::new(name);
        let ctx = EndpointContext::new(name, context.store.clone());
        let runner = |axis| {
            OperationRunner::new(
                GuidePulseOperation::new(guide.clone(), axis),
                ctx.clone(),
                queue.clone(),
                context.scheduler.clone(),
            )
        };
        let ra = runner(GuideAxis::Ra);
        let dec = runner(GuideAxis::Dec);
        Self {
            name: name.to_string(),
            connection: ConnectionMachine::new(ctx.clone()),
            queue,
            ctx,
            device,
            ra,
            dec,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    fn pulse_property(name: &str, label: &str, items: [(&str, &str); 2]) -> Property {
        items.iter().fold(
            Property::new(name, label, PropertyKind::Number),
            |prop, (item, item_label)| {
                prop.with_item(Item::number(item, item_label, 0.0, MAX_PULSE_MS, 0.0))
            },
        )
    }

    async fn on_pulse(
        &self,
        change: &PropertyChange,
        runner: &OperationRunner<GuidePulseOperation>,
        directions: [(&str, GuideDirection); 2],
    ) -> Result<()> {
        if runner.is_busy() {
            return Ok(());
        }
        let property = runner.operation().property().to_string();
        let pulse = directions.iter().find_map(|(item, direction)| {
            change
                .requested(item)
                .filter(|ms| *ms > 0.0)
                .map(|ms| (*direction, Duration::from_secs_f64(ms.min(MAX_PULSE_MS) / 1000.0)))
        });
        let values: Vec<ItemUpdate> = directions
            .iter()
            .map(|(item, _)| ItemUpdate::number(item, change.requested(item).unwrap_or(0.0)))
            .collect();
        self.ctx.set_values(&property, &values);
        match pulse {
            Some(pulse) => {
                runner.start(self.is_connected(), pulse).await;
            }
            None => self.ctx.ok(&property, None),
        }
        Ok(())
    }
}

#[async_trait]
impl Connectable for GuiderEndpoint {
    async fn connect(&self) -> Result<()> {
        self.device.connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        for runner in [&self.ra, &self.dec] {
            if !runner.abort().await {
                runner.cancel();
            }
        }
        if let Err(e) = self.device.disconnect().await {
            tracing::warn!(endpoint = %self.name, error = %e, "disconnect failed");
        }
        Ok(())
    }
}

#[async_trait]
impl Endpoint for GuiderEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EndpointKind {
        EndpointKind::Guider
    }

    fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    async fn attach(&self) -> Result<()> {
        self.connection.define()?;
        self.ctx.define(Self::pulse_property(
            names::GUIDER_GUIDE_DEC,
            "Guide DEC",
            [
                (names::GUIDER_GUIDE_NORTH, "North (ms)"),
                (names::GUIDER_GUIDE_SOUTH, "South (ms)"),
            ],
        ))?;
        self.ctx.define(Self::pulse_property(
            names::GUIDER_GUIDE_RA,
            "Guide RA",
            [
                (names::GUIDER_GUIDE_EAST, "East (ms)"),
                (names::GUIDER_GUIDE_WEST, "West (ms)"),
            ],
        ))?;
        tracing::info!(endpoint = %self.name, "attached");
        Ok(())
    }

    async fn change_property(&self, change: PropertyChange) -> Result<()> {
        match change.property.as_str() {
            names::CONNECTION => {
                handle_connection_change(&self.connection, self, &change).await;
                Ok(())
            }
            names::GUIDER_GUIDE_DEC => {
                self.on_pulse(
                    &change,
                    &self.dec,
                    [
                        (names::GUIDER_GUIDE_NORTH, GuideDirection::North),
                        (names::GUIDER_GUIDE_SOUTH, GuideDirection::South),
                    ],
                )
                .await
            }
            names::GUIDER_GUIDE_RA => {
                self.on_pulse(
                    &change,
                    &self.ra,
                    [
                        (names::GUIDER_GUIDE_EAST, GuideDirection::East),
                        (names::GUIDER_GUIDE_WEST, GuideDirection::West),
                    ],
                )
                .await
            }
            _ => Err(unknown_property(&self.name, &change)),
        }
    }

    async fn detach(&self) -> Result<()> {
        if self.is_connected() {
            Connectable::disconnect(self).await?;
            self.connection.disconnected();
        }
        self.ra.cancel();
        self.dec.cancel();
        self.ctx.undefine_all();
        tracing::info!(endpoint = %self.name, "detached");
        Ok(())
    }
}
