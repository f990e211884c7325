//! Daemon wiring: property store, driver registry, hot-plug registry.
//!
//! ```text
//! AstroConfig ──► DriverRegistry ──► [[devices]] endpoints (synscan, sim_camera)
//!             └─► HotplugRegistry ◄── USB events (feature `usb`)
//!                        └─► SimCameraEndpointFactory
//! ```

use crate::config::{AstroConfig, DeviceDefinition};
use anyhow::{Context, Result};
use astro_core::driver::DriverContext;
use astro_core::endpoint::Endpoint;
use astro_core::property::{MemoryPropertyStore, PropertyEvent, PropertyState};
use astro_core::timer::Scheduler;
use astro_driver_sim::{SimCameraDriverFactory, SimCameraEndpointFactory};
use astro_driver_synscan::SynscanFactory;
use astro_hardware::hotplug::{DeviceEnumerator, HotplugConfig, HotplugRegistry};
use astro_hardware::DriverRegistry;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// A registry with every driver this build knows.
pub fn driver_registry(context: DriverContext) -> DriverRegistry {
    astro_driver_synscan::link();
    astro_driver_sim::link();
    let registry = DriverRegistry::new(context);
    registry.register_factory(Arc::new(SynscanFactory));
    registry.register_factory(Arc::new(SimCameraDriverFactory));
    registry
}

/// Check every enabled device entry against its driver without building it.
pub fn validate_devices(registry: &DriverRegistry, devices: &[DeviceDefinition]) -> Result<()> {
    for device in devices.iter().filter(|d| d.enabled) {
        registry
            .validate(&device.id, &device.driver, &device.config)
            .with_context(|| format!("device '{}'", device.id))?;
    }
    Ok(())
}

/// A running set of drivers.
pub struct Daemon {
    store: Arc<MemoryPropertyStore>,
    registry: DriverRegistry,
    hotplug: Option<HotplugRegistry>,
    tasks: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Start with the platform USB enumerator (feature `usb`), or without
    /// hot-plug when the feature is off.
    pub async fn start(config: &AstroConfig) -> Result<Self> {
        Self::start_with(config, platform_enumerator(config)).await
    }

    /// Start with an explicit device enumerator (`None` disables hot-plug).
    pub async fn start_with(
        config: &AstroConfig,
        enumerator: Option<Arc<dyn DeviceEnumerator>>,
    ) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(MemoryPropertyStore::new());
        let context = DriverContext::new(store.clone(), Scheduler::new());
        let mut tasks = vec![spawn_event_log(store.subscribe())];

        let registry = driver_registry(context.clone());
        validate_devices(&registry, &config.devices)?;
        for device in config.enabled_devices() {
            if let Err(e) = registry
                .instantiate(&device.id, &device.driver, device.config.clone())
                .await
            {
                registry.shutdown().await;
                tasks.iter().for_each(JoinHandle::abort);
                return Err(anyhow::Error::new(e).context(format!("device '{}'", device.id)));
            }
        }

        let hotplug = match enumerator.filter(|_| config.hotplug.enabled) {
            Some(enumerator) => {
                let hotplug = HotplugRegistry::new(
                    enumerator,
                    context,
                    HotplugConfig {
                        capacity: config.hotplug.capacity,
                        defer: config.hotplug.defer(),
                    },
                )
                .with_factory(Arc::new(SimCameraEndpointFactory::new()));
                if let Some(task) = spawn_usb_watch(&hotplug) {
                    tasks.push(task);
                }
                Some(hotplug)
            }
            None => None,
        };

        tracing::info!(
            name = %config.application.name,
            devices = registry.device_ids().await.len(),
            hotplug = hotplug.is_some(),
            "astro-daq started"
        );
        Ok(Self {
            store,
            registry,
            hotplug,
            tasks,
        })
    }

    pub fn store(&self) -> &Arc<MemoryPropertyStore> {
        &self.store
    }

    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    pub fn hotplug(&self) -> Option<&HotplugRegistry> {
        self.hotplug.as_ref()
    }

    /// Configured and hot-plugged endpoints.
    pub async fn endpoints(&self) -> Vec<Arc<dyn Endpoint>> {
        let mut endpoints = self.registry.endpoints().await;
        if let Some(hotplug) = &self.hotplug {
            endpoints.extend(hotplug.endpoints().await);
        }
        endpoints
    }

    /// Detach everything: connected endpoints disconnect, timers are cancelled.
    pub async fn shutdown(self) {
        tracing::info!("shutting down");
        if let Some(hotplug) = &self.hotplug {
            hotplug.shutdown().await;
        }
        self.registry.shutdown().await;
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(feature = "usb")]
fn platform_enumerator(config: &AstroConfig) -> Option<Arc<dyn DeviceEnumerator>> {
    Some(Arc::new(astro_hardware::usb::UsbEnumerator::new(
        config.hotplug.vendor_ids.clone(),
    )))
}

#[cfg(not(feature = "usb"))]
fn platform_enumerator(config: &AstroConfig) -> Option<Arc<dyn DeviceEnumerator>> {
    if config.hotplug.enabled {
        tracing::warn!("built without the `usb` feature, hot-plug disabled");
    }
    None
}

#[cfg(feature = "usb")]
fn spawn_usb_watch(hotplug: &HotplugRegistry) -> Option<JoinHandle<()>> {
    let hotplug = hotplug.clone();
    Some(tokio::spawn(async move {
        if let Err(e) = astro_hardware::usb::watch_usb(hotplug).await {
            tracing::error!(error = %e, "USB hot-plug watch failed");
        }
    }))
}

// Without a USB watch, one initial scan picks up what the enumerator reports.
#[cfg(not(feature = "usb"))]
fn spawn_usb_watch(hotplug: &HotplugRegistry) -> Option<JoinHandle<()>> {
    hotplug.handle_event(astro_hardware::HotplugEvent::Arrived);
    None
}

/// Log property traffic: alerts at WARN, the rest at TRACE.
fn spawn_event_log(mut events: broadcast::Receiver<PropertyEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(PropertyEvent::Updated { property, message }) => {
                    if property.state == PropertyState::Alert {
                        tracing::warn!(
                            device = %property.device,
                            property = %property.name,
                            message = message.as_deref().unwrap_or(""),
                            "alert"
                        );
                    } else {
                        tracing::trace!(
                            device = %property.device,
                            property = %property.name,
                            state = ?property.state,
                            "updated"
                        );
                    }
                }
                Ok(PropertyEvent::Defined(property)) => {
                    tracing::trace!(device = %property.device, property = %property.name, "defined");
                }
                Ok(PropertyEvent::Deleted { device, name }) => {
                    tracing::trace!(%device, property = %name, "deleted");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "property log lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
