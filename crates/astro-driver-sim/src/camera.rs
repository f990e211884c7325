//! Simulated USB camera with optional guide port, cooler and filter wheel.
//!
//! [`SimCameraHardware`] is the open device: one instance per physical
//! camera, shared by the CCD, guider and wheel endpoints through
//! [`SharedDevice`]. [`SimCamera`] is the capability facade those endpoints
//! hold; it resolves the open handle on every call so it can be built before
//! anything is connected.

use crate::common::{ErrorConfig, MockMode, MockRng, SimOp};
use crate::link::SimCameraLink;
use anyhow::{bail, Result};
use astro_core::capabilities::{
    CoolerCapable, CoolerStatus, ExposureCapable, GuideAxis, GuideCapable, GuideDirection, SensorInfo,
    SlotCapable,
};
use astro_core::connection::{HardwareLink, SharedDevice};
use astro_core::error::AstroError;
use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Sensor temperature with the cooler off.
pub const AMBIENT_C: f64 = 20.0;
/// Deepest cooling below ambient at full power.
pub const MAX_DELTA_C: f64 = 40.0;
/// Temperature change per second while cooling or warming.
pub const COOLING_RATE_C_PER_S: f64 = 0.5;

const BACKGROUND_ADU: f64 = 800.0;
const STAR_COUNT: usize = 24;

/// What a simulated product looks like.
#[derive(Debug, Clone, PartialEq)]
pub struct SimCameraModel {
    pub name: String,
    pub sensor: SensorInfo,
    pub has_guider: bool,
    pub has_cooler: bool,
    /// Filter wheel positions, 0 when there is no wheel.
    pub wheel_slots: u32,
}

impl SimCameraModel {
    pub fn default_sensor() -> SensorInfo {
        SensorInfo {
            width: 1600,
            height: 1200,
            bits_per_pixel: 16,
            pixel_size_um: 5.2,
        }
    }
}

impl Default for SimCameraModel {
    fn default() -> Self {
        Self {
            name: "Sim Camera".into(),
            sensor: Self::default_sensor(),
            has_guider: true,
            has_cooler: false,
            wheel_slots: 0,
        }
    }
}

struct Exposure {
    seconds: f64,
    ready_at: Instant,
}

struct CoolerModel {
    on: bool,
    target: f64,
    temperature: f64,
    updated: Instant,
}

impl CoolerModel {
    fn new() -> Self {
        Self {
            on: false,
            target: 0.0,
            temperature: AMBIENT_C,
            updated: Instant::now(),
        }
    }

    /// Integrate the temperature up to `now`.
    fn advance(&mut self, now: Instant) {
        let dt = now.saturating_duration_since(self.updated).as_secs_f64();
        self.updated = now;
        let goal = if self.on {
            self.target.max(AMBIENT_C - MAX_DELTA_C)
        } else {
            AMBIENT_C
        };
        let step = COOLING_RATE_C_PER_S * dt;
        let delta = goal - self.temperature;
        self.temperature = if delta.abs() <= step {
            goal
        } else {
            self.temperature + step * delta.signum()
        };
    }

    fn power(&self) -> f64 {
        if !self.on {
            return 0.0;
        }
        ((AMBIENT_C - self.temperature) / MAX_DELTA_C * 100.0).clamp(0.0, 100.0)
    }
}

struct WheelModel {
    slots: u32,
    current: u32,
    target: u32,
}

/// Open simulated camera.
pub struct SimCameraHardware {
    model: SimCameraModel,
    mode: MockMode,
    errors: ErrorConfig,
    rng: MockRng,
    exposure: parking_lot::Mutex<Option<Exposure>>,
    cooler: parking_lot::Mutex<CoolerModel>,
    wheel: parking_lot::Mutex<WheelModel>,
    pulses: parking_lot::Mutex<Vec<(GuideDirection, Duration)>>,
}

impl SimCameraHardware {
    pub fn new(model: SimCameraModel, mode: MockMode, errors: ErrorConfig, seed: Option<u64>) -> Self {
        let slots = model.wheel_slots;
        Self {
            model,
            mode,
            errors,
            rng: MockRng::new(seed),
            exposure: parking_lot::Mutex::new(None),
            cooler: parking_lot::Mutex::new(CoolerModel::new()),
            wheel: parking_lot::Mutex::new(WheelModel {
                slots,
                current: 1,
                target: 1,
            }),
            pulses: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn model(&self) -> &SimCameraModel {
        &self.model
    }

    pub fn start_exposure(&self, seconds: f64) -> Result<()> {
        self.errors.check(SimOp::StartExposure)?;
        if !seconds.is_finite() || seconds < 0.0 {
            bail!("invalid exposure time {seconds}");
        }
        let mut exposure = self.exposure.lock();
        if exposure.is_some() {
            bail!("exposure already in progress");
        }
        let ready_at = Instant::now() + Duration::from_secs_f64(seconds) + self.mode.readout(&self.rng);
        *exposure = Some(Exposure { seconds, ready_at });
        tracing::debug!(camera = %self.model.name, seconds, "exposure started");
        Ok(())
    }

    pub fn image_ready(&self) -> Result<bool> {
        match &*self.exposure.lock() {
            Some(exposure) => Ok(Instant::now() >= exposure.ready_at),
            None => bail!("no exposure in progress"),
        }
    }

    /// Render the finished frame into `buffer` and end the exposure.
    pub fn read_image(&self, buffer: &mut [u8]) -> Result<()> {
        self.errors.check(SimOp::ReadImage)?;
        let seconds = {
            let mut exposure = self.exposure.lock();
            match &*exposure {
                Some(e) if Instant::now() >= e.ready_at => {}
                Some(_) => bail!("frame not ready"),
                None => bail!("no exposure in progress"),
            }
            exposure.take().map(|e| e.seconds).unwrap_or_default()
        };
        let expected = self.model.sensor.frame_bytes();
        if buffer.len() != expected {
            bail!("frame buffer is {} bytes, sensor needs {expected}", buffer.len());
        }
        render_star_field(&self.model.sensor, seconds, self.rng.next_u64(), buffer);
        Ok(())
    }

    pub fn abort_exposure(&self) {
        if self.exposure.lock().take().is_some() {
            tracing::debug!(camera = %self.model.name, "exposure aborted");
        }
    }

    pub fn cooler_status(&self) -> Result<CoolerStatus> {
        if !self.model.has_cooler {
            bail!("{} has no cooler", self.model.name);
        }
        let mut cooler = self.cooler.lock();
        cooler.advance(Instant::now());
        Ok(CoolerStatus {
            on: cooler.on,
            temperature: cooler.temperature,
            target: cooler.target,
            power: cooler.power(),
        })
    }

    pub fn set_cooler(&self, on: bool, target: f64) -> Result<()> {
        if !self.model.has_cooler {
            bail!("{} has no cooler", self.model.name);
        }
        self.errors.check(SimOp::Cooler)?;
        let mut cooler = self.cooler.lock();
        cooler.advance(Instant::now());
        cooler.on = on;
        cooler.target = target;
        Ok(())
    }

    pub fn slot_count(&self) -> Result<u32> {
        match self.wheel.lock().slots {
            0 => bail!("{} has no filter wheel", self.model.name),
            n => Ok(n),
        }
    }

    pub fn move_to_slot(&self, slot: u32) -> Result<()> {
        self.errors.check(SimOp::MoveWheel)?;
        let mut wheel = self.wheel.lock();
        if slot == 0 || slot > wheel.slots {
            bail!("slot {slot} out of range 1-{}", wheel.slots);
        }
        wheel.target = slot;
        Ok(())
    }

    /// Current slot. A moving wheel turns one position per query.
    pub fn current_slot(&self) -> Result<u32> {
        let mut wheel = self.wheel.lock();
        if wheel.slots == 0 {
            bail!("{} has no filter wheel", self.model.name);
        }
        if wheel.current != wheel.target {
            wheel.current = wheel.current % wheel.slots + 1;
        }
        Ok(wheel.current)
    }

    pub fn start_pulse(&self, direction: GuideDirection, duration: Duration) -> Result<()> {
        if !self.model.has_guider {
            bail!("{} has no guide port", self.model.name);
        }
        self.errors.check(SimOp::Guide)?;
        self.pulses.lock().push((direction, duration));
        Ok(())
    }

    /// Guide pulses issued since the device was opened.
    pub fn pulses(&self) -> Vec<(GuideDirection, Duration)> {
        self.pulses.lock().clone()
    }

    /// Stop everything that would keep running after close.
    pub fn shutdown(&self) {
        self.abort_exposure();
        let mut cooler = self.cooler.lock();
        cooler.advance(Instant::now());
        if cooler.on {
            tracing::info!(camera = %self.model.name, temperature = cooler.temperature, "warming up sensor");
            cooler.on = false;
        }
    }
}

/// Gaussian stars on a noisy sky background.
fn render_star_field(sensor: &SensorInfo, seconds: f64, seed: u64, buffer: &mut [u8]) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let (width, height) = (sensor.width as usize, sensor.height as usize);
    let max = if sensor.bits_per_pixel <= 8 { 255.0 } else { 65535.0 };
    let scale = (seconds.max(0.001) / 10.0).min(1.0);

    let mut pixels: Vec<f64> = (0..width * height)
        .map(|_| BACKGROUND_ADU * scale.sqrt() + rng.gen_range(0.0..40.0))
        .collect();

    for _ in 0..STAR_COUNT {
        if width == 0 || height == 0 {
            break;
        }
        let cx = rng.gen_range(0.0..width as f64);
        let cy = rng.gen_range(0.0..height as f64);
        let peak = rng.gen_range(2_000.0..40_000.0) * scale;
        let sigma: f64 = rng.gen_range(1.0..2.5);
        let radius = (sigma * 4.0).ceil() as i64;
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                let x = cx as i64 + dx;
                let y = cy as i64 + dy;
                if x < 0 || y < 0 || x >= width as i64 || y >= height as i64 {
                    continue;
                }
                let r2 = (x as f64 - cx).powi(2) + (y as f64 - cy).powi(2);
                pixels[y as usize * width + x as usize] += peak * (-r2 / (2.0 * sigma * sigma)).exp();
            }
        }
    }

    if sensor.bits_per_pixel <= 8 {
        for (out, value) in buffer.iter_mut().zip(&pixels) {
            *out = value.clamp(0.0, max) as u8;
        }
    } else {
        for (out, value) in buffer.chunks_exact_mut(2).zip(&pixels) {
            out.copy_from_slice(&(value.clamp(0.0, max) as u16).to_le_bytes());
        }
    }
}

/// Capability facade over the shared simulated camera.
#[derive(Clone)]
pub struct SimCamera {
    device: Arc<SharedDevice<SimCameraLink>>,
}

impl SimCamera {
    pub fn new(device: Arc<SharedDevice<SimCameraLink>>) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &Arc<SharedDevice<SimCameraLink>> {
        &self.device
    }

    async fn hardware(&self) -> Result<Arc<SimCameraHardware>> {
        self.device
            .handle()
            .await
            .ok_or_else(|| AstroError::NotConnected(self.device.link().identity()).into())
    }
}

#[async_trait]
impl ExposureCapable for SimCamera {
    async fn sensor_info(&self) -> Result<SensorInfo> {
        Ok(self.hardware().await?.model().sensor)
    }

    async fn start_exposure(&self, seconds: f64) -> Result<()> {
        self.hardware().await?.start_exposure(seconds)
    }

    async fn image_ready(&self) -> Result<bool> {
        self.hardware().await?.image_ready()
    }

    async fn read_image(&self, buffer: &mut [u8]) -> Result<()> {
        self.hardware().await?.read_image(buffer)
    }

    async fn abort_exposure(&self) -> Result<()> {
        self.hardware().await?.abort_exposure();
        Ok(())
    }
}

#[async_trait]
impl CoolerCapable for SimCamera {
    async fn cooler_status(&self) -> Result<CoolerStatus> {
        self.hardware().await?.cooler_status()
    }

    async fn set_cooler(&self, on: bool, target: f64) -> Result<()> {
        self.hardware().await?.set_cooler(on, target)
    }
}

#[async_trait]
impl SlotCapable for SimCamera {
    async fn slot_count(&self) -> Result<u32> {
        self.hardware().await?.slot_count()
    }

    async fn move_to_slot(&self, slot: u32) -> Result<()> {
        self.hardware().await?.move_to_slot(slot)
    }

    async fn current_slot(&self) -> Result<u32> {
        self.hardware().await?.current_slot()
    }
}

#[async_trait]
impl GuideCapable for SimCamera {
    async fn start_pulse(&self, direction: GuideDirection, duration: Duration) -> Result<()> {
        self.hardware().await?.start_pulse(direction, duration)
    }

    // The simulated port times pulses itself; nothing to release.
    async fn end_pulse(&self, _axis: GuideAxis) -> Result<()> {
        self.hardware().await.map(|_| ())
    }
}
