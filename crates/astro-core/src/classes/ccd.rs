use super::unknown_property;
use crate::capabilities::{Connectable, CoolerCapable, CoolerStatus, ExposureCapable, SensorInfo};
use crate::connection::{handle_connection_change, ConnectionMachine};
use crate::driver::DriverContext;
use crate::endpoint::{Endpoint, EndpointContext, EndpointKind, PropertyChange};
use crate::operation::{AsyncOperation, OperationRunner, PollOutcome};
use crate::property::{names, Item, ItemUpdate, Property, PropertyKind, PropertyState, SwitchRule};
use crate::timer::{cancel_slot, DispatchQueue, Scheduler, TimerAction, TimerHandle};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

const TEMPERATURE_INTERVAL: Duration = Duration::from_secs(5);
const READOUT_POLL: Duration = Duration::from_millis(100);
const MIN_EXPOSURE: f64 = 0.001;
const MAX_EXPOSURE: f64 = 3600.0;

/// Exposure: start, wait the requested time, poll until the frame is ready,
/// read it into CCD_IMAGE.
pub struct ExposureOperation {
    camera: Arc<dyn ExposureCapable>,
    sensor: parking_lot::Mutex<Option<SensorInfo>>,
}

impl ExposureOperation {
    pub fn new(camera: Arc<dyn ExposureCapable>) -> Self {
        Self {
            camera,
            sensor: parking_lot::Mutex::new(None),
        }
    }

    pub fn set_sensor(&self, sensor: Option<SensorInfo>) {
        *self.sensor.lock() = sensor;
    }
}

#[async_trait]
impl AsyncOperation for ExposureOperation {
    type Params = f64;

    fn property(&self) -> &str {
        names::CCD_EXPOSURE
    }

    async fn start(&self, ctx: &EndpointContext, seconds: f64) -> Result<Duration> {
        if !(MIN_EXPOSURE..=MAX_EXPOSURE).contains(&seconds) {
            anyhow::bail!("Exposure time {seconds} s is out of range");
        }
        self.camera
            .start_exposure(seconds)
            .await
            .context("Exposure failed to start")?;
        ctx.set_values(
            names::CCD_EXPOSURE,
            &[ItemUpdate::value(names::CCD_EXPOSURE_ITEM, seconds)],
        );
        Ok(Duration::from_secs_f64(seconds))
    }

    async fn poll(&self, ctx: &EndpointContext) -> PollOutcome {
        ctx.set_values(
            names::CCD_EXPOSURE,
            &[ItemUpdate::value(names::CCD_EXPOSURE_ITEM, 0.0)],
        );
        match self.camera.image_ready().await {
            Ok(true) => {}
            Ok(false) => return PollOutcome::Pending { next: READOUT_POLL },
            Err(e) => {
                return PollOutcome::Failed {
                    message: format!("Exposure failed: {e:#}"),
                }
            }
        }

        let Some(sensor) = *self.sensor.lock() else {
            return PollOutcome::Failed {
                message: "Exposure failed: sensor geometry unknown".into(),
            };
        };
        let mut frame = vec![0u8; sensor.frame_bytes()];
        if let Err(e) = self.camera.read_image(&mut frame).await {
            return PollOutcome::Failed {
                message: format!("Exposure failed: {e:#}"),
            };
        }

        tracing::debug!(endpoint = %ctx.device(), bytes = frame.len(), "frame downloaded");
        ctx.set_values(
            names::CCD_IMAGE,
            &[ItemUpdate::blob(names::CCD_IMAGE_ITEM, Bytes::from(frame))],
        );
        ctx.ok(names::CCD_IMAGE, None);
        PollOutcome::Complete { message: None }
    }

    async fn abort(&self, ctx: &EndpointContext) -> Result<()> {
        ctx.set_values(
            names::CCD_EXPOSURE,
            &[ItemUpdate::value(names::CCD_EXPOSURE_ITEM, 0.0)],
        );
        self.camera.abort_exposure().await
    }
}

/// Imaging camera endpoint.
pub struct CcdEndpoint {
    name: String,
    queue: DispatchQueue,
    ctx: EndpointContext,
    scheduler: Scheduler,
    connection: ConnectionMachine,
    device: Arc<dyn Connectable>,
    camera: Arc<dyn ExposureCapable>,
    cooler: Option<Arc<dyn CoolerCapable>>,
    exposure: OperationRunner<ExposureOperation>,
    temperature_timer: parking_lot::Mutex<Option<TimerHandle>>,
}

impl CcdEndpoint {
    pub fn new(
        name: &str,
        context: &DriverContext,
        device: Arc<dyn Connectable>,
        camera: Arc<dyn ExposureCapable>,
        cooler: Option<Arc<dyn CoolerCapable>>,
    ) -> Self {
        let queue = DispatchQueue::new(name);
        let ctx = EndpointContext::new(name, context.store.clone());
        let exposure = OperationRunner::new(
            ExposureOperation::new(camera.clone()),
            ctx.clone(),
            queue.clone(),
            context.scheduler.clone(),
        );
        Self {
            name: name.to_string(),
            queue,
            connection: ConnectionMachine::new(ctx.clone()),
            ctx,
            scheduler: context.scheduler.clone(),
            device,
            camera,
            cooler,
            exposure,
            temperature_timer: parking_lot::Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    fn info_property(sensor: Option<SensorInfo>) -> Property {
        let (w, h, bpp, pixel) = sensor
            .map(|s| (s.width, s.height, s.bits_per_pixel, s.pixel_size_um))
            .unwrap_or((0, 0, 16, 0.0));
        Property::new(names::CCD_INFO, "CCD info", PropertyKind::Number)
            .read_only()
            .with_item(Item::number(names::CCD_INFO_WIDTH, "Width", 0.0, 65535.0, f64::from(w)))
            .with_item(Item::number(names::CCD_INFO_HEIGHT, "Height", 0.0, 65535.0, f64::from(h)))
            .with_item(Item::number(names::CCD_INFO_BITS_PER_PIXEL, "Bits/pixel", 8.0, 32.0, f64::from(bpp)))
            .with_item(Item::number(names::CCD_INFO_PIXEL_SIZE, "Pixel size", 0.0, 100.0, pixel))
    }

    fn define_cooler(&self, status: CoolerStatus) -> Result<()> {
        self.ctx.define(
            Property::new(names::CCD_COOLER, "Cooler", PropertyKind::Switch)
                .with_rule(SwitchRule::OneOfMany)
                .with_state(PropertyState::Ok)
                .with_item(Item::switch(names::CCD_COOLER_ON, "On", status.on))
                .with_item(Item::switch(names::CCD_COOLER_OFF, "Off", !status.on)),
        )?;
        self.ctx.define(
            Property::new(names::CCD_COOLER_POWER, "Cooler power", PropertyKind::Number)
                .read_only()
                .with_state(PropertyState::Ok)
                .with_item(Item::number(names::CCD_COOLER_POWER_ITEM, "Power (%)", 0.0, 100.0, status.power)),
        )?;
        let mut temperature = Item::number(
            names::CCD_TEMPERATURE_ITEM,
            "Temperature (°C)",
            -50.0,
            50.0,
            status.temperature,
        );
        if let crate::property::ItemValue::Number(n) = &mut temperature.value {
            n.target = status.target;
        }
        self.ctx.define(
            Property::new(names::CCD_TEMPERATURE, "Sensor temperature", PropertyKind::Number)
                .with_state(temperature_state(&status))
                .with_item(temperature),
        )?;
        Ok(())
    }

    fn undefine_cooler(&self) {
        for name in [names::CCD_COOLER, names::CCD_COOLER_POWER, names::CCD_TEMPERATURE] {
            if self.ctx.is_defined(name) {
                if let Err(e) = self.ctx.undefine(name) {
                    tracing::warn!(property = name, error = %e, "undefine cooler property failed");
                }
            }
        }
    }

    fn start_temperature_timer(&self, cooler: Arc<dyn CoolerCapable>) {
        let ctx = self.ctx.clone();
        let handle = self.scheduler.schedule(&self.queue, TEMPERATURE_INTERVAL, move || {
            let ctx = ctx.clone();
            let cooler = cooler.clone();
            async move {
                refresh_temperature(&ctx, cooler.as_ref()).await;
                TimerAction::Reschedule(TEMPERATURE_INTERVAL)
            }
        });
        let mut slot = self.temperature_timer.lock();
        cancel_slot(&mut slot);
        *slot = Some(handle);
    }

    async fn open(&self) -> Result<()> {
        let sensor = self
            .camera
            .sensor_info()
            .await
            .context("Failed to read sensor geometry")?;
        self.exposure.operation().set_sensor(Some(sensor));
        self.ctx.set_values(
            names::CCD_INFO,
            &[
                ItemUpdate::number(names::CCD_INFO_WIDTH, f64::from(sensor.width)),
                ItemUpdate::number(names::CCD_INFO_HEIGHT, f64::from(sensor.height)),
                ItemUpdate::number(names::CCD_INFO_BITS_PER_PIXEL, f64::from(sensor.bits_per_pixel)),
                ItemUpdate::number(names::CCD_INFO_PIXEL_SIZE, sensor.pixel_size_um),
            ],
        );
        self.ctx.ok(names::CCD_INFO, None);

        if let Some(cooler) = &self.cooler {
            let status = cooler
                .cooler_status()
                .await
                .context("Failed to read cooler status")?;
            self.define_cooler(status)?;
            self.start_temperature_timer(cooler.clone());
        }
        Ok(())
    }

    async fn on_exposure(&self, change: &PropertyChange) -> Result<()> {
        let Some(seconds) = change.requested(names::CCD_EXPOSURE_ITEM) else {
            return Ok(());
        };
        if !self.exposure.is_busy() {
            self.ctx.apply(change)?;
        }
        self.exposure.start(self.is_connected(), seconds).await;
        Ok(())
    }

    async fn on_abort(&self, change: &PropertyChange) -> Result<()> {
        if change.is_on(names::CCD_ABORT_EXPOSURE_ITEM) && self.exposure.abort().await {
            tracing::info!(endpoint = %self.name, "exposure aborted");
        }
        self.ctx.set_values(
            names::CCD_ABORT_EXPOSURE,
            &[ItemUpdate::switch(names::CCD_ABORT_EXPOSURE_ITEM, false)],
        );
        self.ctx.ok(names::CCD_ABORT_EXPOSURE, None);
        Ok(())
    }

    async fn on_cooler(&self, change: &PropertyChange) -> Result<()> {
        let Some(cooler) = self.cooler.as_ref().filter(|_| self.is_connected()) else {
            self.ctx.alert(names::CCD_COOLER, "Cooler not available");
            return Ok(());
        };
        self.ctx.apply(change)?;
        let on = self.ctx.is_on(names::CCD_COOLER, names::CCD_COOLER_ON);
        let target = self
            .ctx
            .target(names::CCD_TEMPERATURE, names::CCD_TEMPERATURE_ITEM)
            .unwrap_or(0.0);

        match cooler.set_cooler(on, target).await {
            Ok(()) => {
                if !on {
                    self.ctx.set_values(
                        names::CCD_COOLER_POWER,
                        &[ItemUpdate::value(names::CCD_COOLER_POWER_ITEM, 0.0)],
                    );
                    self.ctx.ok(names::CCD_COOLER_POWER, None);
                }
                self.ctx.ok(names::CCD_COOLER, None);
            }
            Err(e) => self
                .ctx
                .alert(names::CCD_COOLER, &format!("Failed to switch cooler: {e:#}")),
        }
        Ok(())
    }

    async fn on_temperature(&self, change: &PropertyChange) -> Result<()> {
        let Some(target) = change.requested(names::CCD_TEMPERATURE_ITEM) else {
            return Ok(());
        };
        let Some(cooler) = self.cooler.as_ref().filter(|_| self.is_connected()) else {
            return Ok(());
        };
        self.ctx.set_values(
            names::CCD_TEMPERATURE,
            &[ItemUpdate::target(names::CCD_TEMPERATURE_ITEM, target)],
        );
        if let Err(e) = cooler.set_cooler(true, target).await {
            self.ctx.alert(
                names::CCD_TEMPERATURE,
                &format!("Failed to set temperature: {e:#}"),
            );
            return Ok(());
        }
        if !self.ctx.is_on(names::CCD_COOLER, names::CCD_COOLER_ON) {
            self.ctx.set_values(
                names::CCD_COOLER,
                &[ItemUpdate::switch(names::CCD_COOLER_ON, true)],
            );
            self.ctx.ok(names::CCD_COOLER, None);
        }
        self.ctx.busy(names::CCD_TEMPERATURE);
        Ok(())
    }
}

fn temperature_state(status: &CoolerStatus) -> PropertyState {
    if status.on && (status.temperature - status.target).abs() > 1.0 {
        PropertyState::Busy
    } else {
        PropertyState::Ok
    }
}

async fn refresh_temperature(ctx: &EndpointContext, cooler: &dyn CoolerCapable) {
    let status = match cooler.cooler_status().await {
        Ok(status) => status,
        Err(e) => {
            tracing::warn!(endpoint = %ctx.device(), error = %e, "temperature read failed");
            return;
        }
    };
    let temperature = (status.temperature * 10.0).round() / 10.0;
    let mut updates = vec![ItemUpdate::value(names::CCD_TEMPERATURE_ITEM, temperature)];
    if status.on {
        updates.push(ItemUpdate::target(names::CCD_TEMPERATURE_ITEM, status.target));
        ctx.set_values(
            names::CCD_COOLER_POWER,
            &[ItemUpdate::value(names::CCD_COOLER_POWER_ITEM, status.power.round())],
        );
        ctx.ok(names::CCD_COOLER_POWER, None);
    }
    ctx.set_values(names::CCD_TEMPERATURE, &updates);
    ctx.update(names::CCD_TEMPERATURE, temperature_state(&status), None);
}

#[async_trait]
impl Connectable for CcdEndpoint {
    async fn connect(&self) -> Result<()> {
        self.device.connect().await?;
        if let Err(e) = self.open().await {
            self.close_quietly().await;
            return Err(e);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if !self.exposure.abort().await {
            self.exposure.cancel();
        }
        self.close_quietly().await;
        Ok(())
    }
}

impl CcdEndpoint {
    async fn close_quietly(&self) {
        cancel_slot(&mut self.temperature_timer.lock());
        self.undefine_cooler();
        self.exposure.operation().set_sensor(None);
        if let Err(e) = self.device.disconnect().await {
            tracing::warn!(endpoint = %self.name, error = %e, "disconnect failed");
        }
    }
}

#[async_trait]
impl Endpoint for CcdEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EndpointKind {
        EndpointKind::Ccd
    }

    fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    async fn attach(&self) -> Result<()> {
        self.connection.define()?;
        self.ctx.define(Self::info_property(None))?;
        self.ctx.define(
            Property::new(names::CCD_EXPOSURE, "Start exposure", PropertyKind::Number).with_item(
                Item::number(names::CCD_EXPOSURE_ITEM, "Duration (s)", MIN_EXPOSURE, MAX_EXPOSURE, 0.0),
            ),
        )?;
        self.ctx.define(
            Property::new(names::CCD_ABORT_EXPOSURE, "Abort exposure", PropertyKind::Switch)
                .with_rule(SwitchRule::AtMostOne)
                .with_item(Item::switch(names::CCD_ABORT_EXPOSURE_ITEM, "Abort", false)),
        )?;
        self.ctx.define(
            Property::new(names::CCD_IMAGE, "Image", PropertyKind::Blob)
                .read_only()
                .with_item(Item::blob(names::CCD_IMAGE_ITEM, "Image")),
        )?;
        tracing::info!(endpoint = %self.name, "attached");
        Ok(())
    }

    async fn change_property(&self, change: PropertyChange) -> Result<()> {
        match change.property.as_str() {
            names::CONNECTION => {
                handle_connection_change(&self.connection, self, &change).await;
                Ok(())
            }
            names::CCD_EXPOSURE => self.on_exposure(&change).await,
            names::CCD_ABORT_EXPOSURE => self.on_abort(&change).await,
            names::CCD_COOLER => self.on_cooler(&change).await,
            names::CCD_TEMPERATURE => self.on_temperature(&change).await,
            _ => Err(unknown_property(&self.name, &change)),
        }
    }

    async fn detach(&self) -> Result<()> {
        if self.is_connected() {
            Connectable::disconnect(self).await?;
            self.connection.disconnected();
        }
        self.exposure.cancel();
        self.ctx.undefine_all();
        tracing::info!(endpoint = %self.name, "detached");
        Ok(())
    }
}
