//! `synscan` driver factory.
//!
//! ```toml
//! [[devices]]
//! driver = "synscan"
//! id = "EQ6"
//! [devices.config]
//! port = "/dev/ttyUSB0"      # or "synscan://192.168.4.1:11880", "sim://eq6"
//! latitude = 48.2
//! longitude = 16.4
//! ```

use crate::coordinates::PreferNormal;
use crate::guider::MountGuidePort;
use crate::link::SynscanLink;
use crate::mount::{MountEndpoint, MountSettings};
use crate::sidereal::SystemClock;
use crate::state::MountShared;
use crate::transport::{PortSpec, TransportConfig};
use anyhow::{anyhow, Context, Result};
use astro_core::classes::GuiderEndpoint;
use astro_core::connection::SharedDevice;
use astro_core::driver::{Capability, DeviceComponents, DriverContext, DriverFactory};
use futures::future::BoxFuture;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn default_timeout_ms() -> u64 {
    1000
}

fn default_drain_ms() -> u64 {
    100
}

fn default_park_ha() -> f64 {
    6.0
}

fn default_park_dec() -> f64 {
    90.0
}

fn default_guide_rate() -> f64 {
    50.0
}

/// Configuration for the SynScan driver
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SynscanConfig {
    /// Serial path, `synscan://host[:port]` or `sim://profile`
    pub port: String,
    /// Site latitude in degrees, north positive
    #[serde(default)]
    pub latitude: f64,
    /// Site longitude in degrees, east positive
    #[serde(default)]
    pub longitude: f64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_drain_ms")]
    pub drain_ms: u64,
    /// Park hour angle in hours
    #[serde(default = "default_park_ha")]
    pub park_ha: f64,
    /// Park declination in degrees
    #[serde(default = "default_park_dec")]
    pub park_dec: f64,
    /// Guide rate, percent of sidereal (10-90)
    #[serde(default = "default_guide_rate")]
    pub guide_rate: f64,
    /// Directory for the per-port lock file
    #[serde(default)]
    pub lock_dir: Option<PathBuf>,
}

impl SynscanConfig {
    fn check(&self) -> Result<()> {
        PortSpec::parse(&self.port)?;
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(anyhow!("latitude must be -90..90, got {}", self.latitude));
        }
        if !(-180.0..=360.0).contains(&self.longitude) {
            return Err(anyhow!("longitude must be -180..360, got {}", self.longitude));
        }
        if !(-12.0..=12.0).contains(&self.park_ha) || !(-90.0..=90.0).contains(&self.park_dec) {
            return Err(anyhow!(
                "park position out of range: HA {} DEC {}",
                self.park_ha,
                self.park_dec
            ));
        }
        if !(10.0..=90.0).contains(&self.guide_rate) {
            return Err(anyhow!("guide_rate must be 10-90 %, got {}", self.guide_rate));
        }
        if self.timeout_ms == 0 {
            return Err(anyhow!("timeout_ms must be positive"));
        }
        Ok(())
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            timeout: Duration::from_millis(self.timeout_ms),
            drain: Duration::from_millis(self.drain_ms),
            ..TransportConfig::default()
        }
    }

    pub fn settings(&self) -> MountSettings {
        MountSettings {
            latitude: self.latitude,
            longitude: self.longitude,
            park_ha: self.park_ha,
            park_dec: self.park_dec,
            guide_rate: self.guide_rate,
        }
    }
}

/// Factory for SynScan mounts.
pub struct SynscanFactory;

static SYNSCAN_CAPABILITIES: &[Capability] =
    &[Capability::Connectable, Capability::Axis, Capability::Guide];

impl DriverFactory for SynscanFactory {
    fn driver_type(&self) -> &'static str {
        "synscan"
    }

    fn name(&self) -> &'static str {
        "SkyWatcher SynScan Mount"
    }

    fn capabilities(&self) -> &'static [Capability] {
        SYNSCAN_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: SynscanConfig = config.clone().try_into()?;
        cfg.check()
    }

    fn build(
        &self,
        name: String,
        config: toml::Value,
        context: DriverContext,
    ) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: SynscanConfig = config.try_into().context("Invalid SynScan config")?;
            cfg.check()?;
            let spec = PortSpec::parse(&cfg.port)?;

            let mut device = SharedDevice::new(SynscanLink::new(spec, cfg.transport()));
            if let Some(dir) = &cfg.lock_dir {
                device = device.with_lock_dir(dir);
            }
            let shared = Arc::new(MountShared::new(Arc::new(device)));

            let mount = Arc::new(MountEndpoint::new(
                &name,
                &context,
                shared.clone(),
                cfg.settings(),
                Arc::new(SystemClock),
                Arc::new(PreferNormal),
            ));
            let port = Arc::new(MountGuidePort::new(shared.clone()));
            let guider = Arc::new(GuiderEndpoint::new(
                &format!("{name} (guider)"),
                &context,
                shared.device().clone(),
                port.clone(),
            ));

            Ok(DeviceComponents::new()
                .with_endpoint(mount.clone())
                .with_endpoint(guider)
                .with_connectable(mount.clone())
                .with_axis(mount)
                .with_guide(port))
        })
    }
}
