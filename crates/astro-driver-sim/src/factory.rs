//! Factories for the simulated camera.
//!
//! Two ways in:
//!
//! - [`SimCameraEndpointFactory`] plugs into the hot-plug registry and turns
//!   discovered devices with the simulator's vendor ID into endpoints.
//! - [`SimCameraDriverFactory`] is the `sim_camera` driver for `[[devices]]`
//!   entries, for setups without a USB bus:
//!
//! ```toml
//! [[devices]]
//! driver = "sim_camera"
//! id = "Imager"
//! [devices.config]
//! model = "efw"          # "camera", "efw" or "guide"
//! mode = "realistic"
//! failure_rate = 0.0
//! ```

use crate::camera::{SimCamera, SimCameraModel};
use crate::common::{ErrorConfig, MockMode};
use crate::link::SimCameraLink;
use anyhow::{anyhow, Context, Result};
use astro_core::capabilities::{CoolerCapable, SensorInfo};
use astro_core::classes::{CcdEndpoint, GuiderEndpoint, WheelEndpoint};
use astro_core::connection::SharedDevice;
use astro_core::driver::{Capability, DeviceComponents, DriverContext, DriverFactory};
use astro_core::endpoint::Endpoint;
use astro_hardware::hotplug::{DiscoveredDevice, EndpointFactory};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

pub const SIM_VENDOR_ID: u16 = 0x20E7;
pub const SIM_CAMERA_PID: u16 = 0xDF01;
pub const SIM_CAMERA_EFW_PID: u16 = 0xDF02;
pub const SIM_GUIDE_CAMERA_PID: u16 = 0xDF03;

/// Product table of the simulated vendor.
pub fn model_for(product_id: u16) -> Option<SimCameraModel> {
    let model = match product_id {
        SIM_CAMERA_PID => SimCameraModel::default(),
        SIM_CAMERA_EFW_PID => SimCameraModel {
            name: "Sim Camera EFW".into(),
            has_cooler: true,
            wheel_slots: 5,
            ..SimCameraModel::default()
        },
        SIM_GUIDE_CAMERA_PID => SimCameraModel {
            name: "Sim Guide Camera".into(),
            sensor: SensorInfo {
                width: 1280,
                height: 960,
                bits_per_pixel: 8,
                pixel_size_um: 3.75,
            },
            ..SimCameraModel::default()
        },
        _ => return None,
    };
    Some(model)
}

/// Everything built for one simulated camera.
pub struct SimCameraEndpoints {
    pub camera: SimCamera,
    pub ccd: Arc<CcdEndpoint>,
    pub guider: Option<Arc<GuiderEndpoint>>,
    pub wheel: Option<Arc<WheelEndpoint>>,
}

impl SimCameraEndpoints {
    /// CCD first: detach runs in reverse, so the master goes last.
    pub fn endpoints(&self) -> Vec<Arc<dyn Endpoint>> {
        let mut endpoints: Vec<Arc<dyn Endpoint>> = vec![self.ccd.clone()];
        if let Some(guider) = &self.guider {
            endpoints.push(guider.clone());
        }
        if let Some(wheel) = &self.wheel {
            endpoints.push(wheel.clone());
        }
        endpoints
    }
}

/// Build the CCD endpoint and, depending on the model, guider and wheel
/// siblings sharing one [`SharedDevice`].
pub fn build_endpoints(
    name: &str,
    link: SimCameraLink,
    context: &DriverContext,
    lock_dir: Option<&PathBuf>,
) -> SimCameraEndpoints {
    let model = link.model().clone();
    let mut device = SharedDevice::new(link);
    if let Some(dir) = lock_dir {
        device = device.with_lock_dir(dir);
    }
    let device = Arc::new(device);
    let camera = SimCamera::new(device.clone());
    let hardware = Arc::new(camera.clone());

    let cooler = model
        .has_cooler
        .then(|| hardware.clone() as Arc<dyn CoolerCapable>);
    let ccd = Arc::new(CcdEndpoint::new(
        name,
        context,
        device.clone(),
        hardware.clone(),
        cooler,
    ));
    let guider = model.has_guider.then(|| {
        Arc::new(GuiderEndpoint::new(
            &format!("{name} (guider)"),
            context,
            device.clone(),
            hardware.clone(),
        ))
    });
    let wheel = (model.wheel_slots > 0).then(|| {
        Arc::new(WheelEndpoint::new(
            &format!("{name} (wheel)"),
            context,
            device.clone(),
            hardware.clone(),
        ))
    });

    SimCameraEndpoints {
        camera,
        ccd,
        guider,
        wheel,
    }
}

// =============================================================================
// Hot-plug
// =============================================================================

/// Creates endpoints for simulated cameras found on the (simulated) bus.
#[derive(Default)]
pub struct SimCameraEndpointFactory {
    mode: MockMode,
    lock_dir: Option<PathBuf>,
    seed: Option<u64>,
}

impl SimCameraEndpointFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = Some(dir.into());
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

#[async_trait]
impl EndpointFactory for SimCameraEndpointFactory {
    fn name(&self) -> &str {
        "sim_camera"
    }

    fn matches(&self, device: &DiscoveredDevice) -> bool {
        device.vendor_id == SIM_VENDOR_ID && model_for(device.product_id).is_some()
    }

    async fn create(
        &self,
        device: &DiscoveredDevice,
        context: &DriverContext,
    ) -> Result<Vec<Arc<dyn Endpoint>>> {
        let model = model_for(device.product_id)
            .ok_or_else(|| anyhow!("unknown simulated product {:#06x}", device.product_id))?;
        let name = format!("{} #{}", model.name, device.identity);
        let link = SimCameraLink::new(&device.identity, model)
            .with_mode(self.mode)
            .with_seed(self.seed);
        let built = build_endpoints(&name, link, context, self.lock_dir.as_ref());
        tracing::debug!(identity = %device.identity, endpoints = built.endpoints().len(), "sim camera endpoints created");
        Ok(built.endpoints())
    }
}

// =============================================================================
// Configured driver
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimModelName {
    #[default]
    Camera,
    Efw,
    Guide,
}

impl SimModelName {
    fn product_id(self) -> u16 {
        match self {
            SimModelName::Camera => SIM_CAMERA_PID,
            SimModelName::Efw => SIM_CAMERA_EFW_PID,
            SimModelName::Guide => SIM_GUIDE_CAMERA_PID,
        }
    }
}

/// Configuration for the `sim_camera` driver
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimCameraConfig {
    #[serde(default)]
    pub model: SimModelName,
    #[serde(default)]
    pub mode: MockMode,
    /// Probability (0-1) that any hardware call fails
    #[serde(default)]
    pub failure_rate: f64,
    /// Seed for noise and failures; random when absent
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub lock_dir: Option<PathBuf>,
}

impl SimCameraConfig {
    fn check(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(anyhow!(
                "failure_rate must be between 0 and 1, got {}",
                self.failure_rate
            ));
        }
        Ok(())
    }

    fn errors(&self) -> ErrorConfig {
        if self.failure_rate > 0.0 {
            ErrorConfig::random_failures_seeded(self.failure_rate, self.seed)
        } else {
            ErrorConfig::none()
        }
    }
}

pub struct SimCameraDriverFactory;

static SIM_CAMERA_CAPABILITIES: &[Capability] = &[
    Capability::Connectable,
    Capability::Exposure,
    Capability::Cooler,
    Capability::Slot,
    Capability::Guide,
];

impl DriverFactory for SimCameraDriverFactory {
    fn driver_type(&self) -> &'static str {
        "sim_camera"
    }

    fn name(&self) -> &'static str {
        "Simulated Camera"
    }

    fn capabilities(&self) -> &'static [Capability] {
        SIM_CAMERA_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: SimCameraConfig = config.clone().try_into()?;
        cfg.check()
    }

    fn build(
        &self,
        name: String,
        config: toml::Value,
        context: DriverContext,
    ) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: SimCameraConfig = config.try_into().context("Invalid sim_camera config")?;
            cfg.check()?;
            let model = model_for(cfg.model.product_id())
                .ok_or_else(|| anyhow!("no simulated model {:?}", cfg.model))?;

            let link = SimCameraLink::new(&name, model.clone())
                .with_mode(cfg.mode)
                .with_errors(cfg.errors())
                .with_seed(cfg.seed);
            let built = build_endpoints(&name, link, &context, cfg.lock_dir.as_ref());
            let hardware = Arc::new(built.camera.clone());

            let mut components = DeviceComponents::new();
            for endpoint in built.endpoints() {
                components = components.with_endpoint(endpoint);
            }
            components = components
                .with_connectable(built.ccd.clone())
                .with_exposure(hardware.clone());
            if model.has_cooler {
                components = components.with_cooler(hardware.clone());
            }
            if model.wheel_slots > 0 {
                components = components.with_slot(hardware.clone());
            }
            if model.has_guider {
                components = components.with_guide(hardware);
            }
            Ok(components)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use astro_hardware::hotplug::DeviceIdentity;

    fn discovered(vendor_id: u16, product_id: u16) -> DiscoveredDevice {
        DiscoveredDevice {
            identity: DeviceIdentity::new(1, "4"),
            vendor_id,
            product_id,
            product: "whatever".into(),
        }
    }

    #[test]
    fn product_table() {
        assert_eq!(model_for(SIM_CAMERA_PID).unwrap().name, "Sim Camera");
        let efw = model_for(SIM_CAMERA_EFW_PID).unwrap();
        assert!(efw.has_cooler && efw.has_guider);
        assert_eq!(efw.wheel_slots, 5);
        assert_eq!(model_for(SIM_GUIDE_CAMERA_PID).unwrap().sensor.bits_per_pixel, 8);
        assert!(model_for(0x1234).is_none());
    }

    #[test]
    fn matches_vendor_and_product() {
        let factory = SimCameraEndpointFactory::new();
        assert!(factory.matches(&discovered(SIM_VENDOR_ID, SIM_CAMERA_PID)));
        assert!(!factory.matches(&discovered(SIM_VENDOR_ID, 0x0001)));
        assert!(!factory.matches(&discovered(0x03c3, SIM_CAMERA_PID)));
    }

    #[test]
    fn validate_config() {
        let factory = SimCameraDriverFactory;
        assert_eq!(factory.driver_type(), "sim_camera");

        let valid = toml::Value::Table(toml::toml! {
            model = "efw"
            mode = "chaos"
            failure_rate = 0.1
            seed = 7
        });
        assert!(factory.validate(&valid).is_ok());

        let empty = toml::Value::Table(toml::map::Map::new());
        let cfg: SimCameraConfig = empty.clone().try_into().unwrap();
        assert_eq!(cfg.model, SimModelName::Camera);
        assert_eq!(cfg.mode, MockMode::Instant);
        assert!(factory.validate(&empty).is_ok());

        let bad_rate = toml::Value::Table(toml::toml! {
            failure_rate = 1.5
        });
        assert!(factory.validate(&bad_rate).is_err());

        let bad_model = toml::Value::Table(toml::toml! {
            model = "spectrograph"
        });
        assert!(factory.validate(&bad_model).is_err());

        let unknown_key = toml::Value::Table(toml::toml! {
            exposure = 1.0
        });
        assert!(factory.validate(&unknown_key).is_err());
    }
}
