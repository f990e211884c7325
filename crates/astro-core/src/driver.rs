//! Driver factories and the components they produce.
//!
//! Statically configured drivers (serial/TCP mounts, simulators) implement
//! [`DriverFactory`] and are registered with the driver registry at startup.
//! Hot-plugged USB devices go through the hot-plug registry instead, but end
//! up as the same thing: a set of endpoints plus the capability objects
//! behind them.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  config/astro-daq.toml   [[devices]] driver = "synscan"      │
//! └──────────────────────────────────────────────────────────────┘
//!                               │ validate(&config)
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │  DriverFactory::build(config, DriverContext)                 │
//! │  → DeviceComponents { endpoints, connectable, axis, ... }    │
//! └──────────────────────────────────────────────────────────────┘
//!                               │ Endpoint::attach()
//!                               ▼
//!                      properties defined in the store
//! ```

use crate::capabilities::{
    AxisCapable, Connectable, CoolerCapable, ExposureCapable, GuideCapable, SlotCapable,
};
use crate::endpoint::Endpoint;
use crate::property::PropertyStore;
use crate::timer::Scheduler;
use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Runtime capability flags for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Connectable,
    Exposure,
    Slot,
    Guide,
    Axis,
    Cooler,
}

impl Capability {
    pub fn name(&self) -> &'static str {
        match self {
            Capability::Connectable => "Connectable",
            Capability::Exposure => "Exposure",
            Capability::Slot => "Filter Slot",
            Capability::Guide => "Guide Pulses",
            Capability::Axis => "Mount Axes",
            Capability::Cooler => "Cooler",
        }
    }
}

/// What a driver hands back: the endpoints to attach, plus the capability
/// objects for callers that drive hardware without going through properties.
#[derive(Default, Clone)]
pub struct DeviceComponents {
    pub endpoints: Vec<Arc<dyn Endpoint>>,
    pub connectable: Option<Arc<dyn Connectable>>,
    pub exposure: Option<Arc<dyn ExposureCapable>>,
    pub slot: Option<Arc<dyn SlotCapable>>,
    pub guide: Option<Arc<dyn GuideCapable>>,
    pub axis: Option<Arc<dyn AxisCapable>>,
    pub cooler: Option<Arc<dyn CoolerCapable>>,
}

impl DeviceComponents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoint(mut self, endpoint: Arc<dyn Endpoint>) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    pub fn with_connectable(mut self, c: Arc<dyn Connectable>) -> Self {
        self.connectable = Some(c);
        self
    }

    pub fn with_exposure(mut self, e: Arc<dyn ExposureCapable>) -> Self {
        self.exposure = Some(e);
        self
    }

    pub fn with_slot(mut self, s: Arc<dyn SlotCapable>) -> Self {
        self.slot = Some(s);
        self
    }

    pub fn with_guide(mut self, g: Arc<dyn GuideCapable>) -> Self {
        self.guide = Some(g);
        self
    }

    pub fn with_axis(mut self, a: Arc<dyn AxisCapable>) -> Self {
        self.axis = Some(a);
        self
    }

    pub fn with_cooler(mut self, c: Arc<dyn CoolerCapable>) -> Self {
        self.cooler = Some(c);
        self
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = Vec::new();
        if self.connectable.is_some() {
            caps.push(Capability::Connectable);
        }
        if self.exposure.is_some() {
            caps.push(Capability::Exposure);
        }
        if self.slot.is_some() {
            caps.push(Capability::Slot);
        }
        if self.guide.is_some() {
            caps.push(Capability::Guide);
        }
        if self.axis.is_some() {
            caps.push(Capability::Axis);
        }
        if self.cooler.is_some() {
            caps.push(Capability::Cooler);
        }
        caps
    }
}

/// Shared services every driver builds its endpoints against.
#[derive(Clone)]
pub struct DriverContext {
    pub store: Arc<dyn PropertyStore>,
    pub scheduler: Scheduler,
}

impl DriverContext {
    pub fn new(store: Arc<dyn PropertyStore>, scheduler: Scheduler) -> Self {
        Self { store, scheduler }
    }
}

/// Creates driver instances from a `[[devices]]` config entry.
///
/// Factories are registered once at startup and live for the program's
/// lifetime. `build` takes `&self` and returns a `'static` future, so a
/// factory must not keep per-build mutable state.
pub trait DriverFactory: Send + Sync + 'static {
    /// Value of the `driver` field in config that selects this factory.
    fn driver_type(&self) -> &'static str;

    /// Human-readable name, e.g. "SkyWatcher SynScan Mount".
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> &'static [Capability] {
        &[]
    }

    /// Check the `config` table without touching hardware.
    fn validate(&self, config: &toml::Value) -> Result<()>;

    /// Build the driver's endpoints. Hardware is opened later, when a client
    /// connects.
    fn build(
        &self,
        name: String,
        config: toml::Value,
        context: DriverContext,
    ) -> BoxFuture<'static, Result<DeviceComponents>>;
}
