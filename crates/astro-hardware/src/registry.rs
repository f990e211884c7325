//! Registry for statically configured drivers.
//!
//! Serial and TCP mounts cannot be discovered, so they come from
//! `[[devices]]` entries in the config file. Each entry names a driver type;
//! the registry looks up the matching [`DriverFactory`], validates the entry,
//! builds the endpoints and attaches them.
//!
//! # Example
//!
//! ```rust,ignore
//! let registry = DriverRegistry::new(context);
//! registry.register_factory(Arc::new(SynscanFactory));
//! registry.instantiate("mount", "synscan", config).await?;
//! ```

use astro_core::driver::{DeviceComponents, DriverContext, DriverFactory};
use astro_core::endpoint::{self, Endpoint};
use astro_core::error::{AppResult, AstroError, DriverError, DriverErrorKind};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Information about a registered driver factory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoryInfo {
    pub driver_type: String,
    pub name: String,
    pub capabilities: Vec<String>,
}

struct RegisteredDevice {
    driver_type: String,
    components: DeviceComponents,
}

pub struct DriverRegistry {
    context: DriverContext,
    factories: DashMap<String, Arc<dyn DriverFactory>>,
    devices: Mutex<BTreeMap<String, RegisteredDevice>>,
}

impl DriverRegistry {
    pub fn new(context: DriverContext) -> Self {
        Self {
            context,
            factories: DashMap::new(),
            devices: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn context(&self) -> &DriverContext {
        &self.context
    }

    /// Register a factory. Returns the factory it replaced, if any.
    pub fn register_factory(&self, factory: Arc<dyn DriverFactory>) -> Option<Arc<dyn DriverFactory>> {
        let driver_type = factory.driver_type().to_string();
        tracing::info!(
            driver_type = %driver_type,
            name = %factory.name(),
            capabilities = ?factory.capabilities(),
            "Registering driver factory"
        );
        self.factories.insert(driver_type, factory)
    }

    pub fn has_factory(&self, driver_type: &str) -> bool {
        self.factories.contains_key(driver_type)
    }

    /// Registered driver types, sorted.
    pub fn list_factories(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }

    pub fn factory_info(&self, driver_type: &str) -> Option<FactoryInfo> {
        self.factories.get(driver_type).map(|entry| {
            let factory = entry.value();
            FactoryInfo {
                driver_type: factory.driver_type().to_string(),
                name: factory.name().to_string(),
                capabilities: factory
                    .capabilities()
                    .iter()
                    .map(|c| c.name().to_string())
                    .collect(),
            }
        })
    }

    fn factory(&self, driver_type: &str) -> AppResult<Arc<dyn DriverFactory>> {
        self.factories
            .get(driver_type)
            .map(|e| e.value().clone())
            .ok_or_else(|| {
                AstroError::Configuration(format!(
                    "No factory registered for driver '{}'. Available: {:?}",
                    driver_type,
                    self.list_factories()
                ))
            })
    }

    /// Check a config entry without building anything.
    pub fn validate(&self, id: &str, driver_type: &str, config: &toml::Value) -> AppResult<()> {
        let factory = self.factory(driver_type)?;
        factory.validate(config).map_err(|e| {
            DriverError::new(
                driver_type,
                DriverErrorKind::Configuration,
                format!("Configuration validation failed for device '{id}': {e:#}"),
            )
            .into()
        })
    }

    /// Build and attach a configured device.
    pub async fn instantiate(&self, id: &str, driver_type: &str, config: toml::Value) -> AppResult<()> {
        let mut devices = self.devices.lock().await;
        if devices.contains_key(id) {
            return Err(AstroError::Configuration(format!(
                "Device '{id}' is already registered"
            )));
        }

        self.validate(id, driver_type, &config)?;
        let factory = self.factory(driver_type)?;

        tracing::info!(device_id = %id, driver_type, "Building device from factory");
        let components = factory
            .build(id.to_string(), config, self.context.clone())
            .await
            .map_err(|e| {
                AstroError::from(DriverError::new(
                    driver_type,
                    DriverErrorKind::Initialization,
                    format!("Factory build failed for device '{id}': {e:#}"),
                ))
            })?;

        for (i, ep) in components.endpoints.iter().enumerate() {
            if let Err(e) = endpoint::attach(ep.as_ref()).await {
                for attached in components.endpoints[..i].iter().rev() {
                    let _ = endpoint::detach(attached.as_ref()).await;
                }
                return Err(DriverError::new(
                    driver_type,
                    DriverErrorKind::Initialization,
                    format!("Attach failed for '{}': {e:#}", ep.name()),
                )
                .into());
            }
        }

        tracing::info!(
            device_id = %id,
            endpoints = components.endpoints.len(),
            capabilities = ?components.capabilities(),
            "Device registered"
        );
        devices.insert(
            id.to_string(),
            RegisteredDevice {
                driver_type: driver_type.to_string(),
                components,
            },
        );
        Ok(())
    }

    pub async fn device_ids(&self) -> Vec<String> {
        self.devices.lock().await.keys().cloned().collect()
    }

    pub async fn driver_type(&self, id: &str) -> Option<String> {
        self.devices.lock().await.get(id).map(|d| d.driver_type.clone())
    }

    pub async fn components(&self, id: &str) -> Option<DeviceComponents> {
        self.devices.lock().await.get(id).map(|d| d.components.clone())
    }

    pub async fn endpoints(&self) -> Vec<Arc<dyn Endpoint>> {
        self.devices
            .lock()
            .await
            .values()
            .flat_map(|d| d.components.endpoints.iter().cloned())
            .collect()
    }

    /// Detach a device's endpoints and forget it. Returns false if unknown.
    pub async fn remove(&self, id: &str) -> bool {
        let Some(device) = self.devices.lock().await.remove(id) else {
            return false;
        };
        detach_components(id, &device.components).await;
        true
    }

    /// Detach every device.
    pub async fn shutdown(&self) {
        let devices = std::mem::take(&mut *self.devices.lock().await);
        for (id, device) in devices.iter().rev() {
            detach_components(id, &device.components).await;
        }
    }
}

async fn detach_components(id: &str, components: &DeviceComponents) {
    for ep in components.endpoints.iter().rev() {
        if let Err(e) = endpoint::detach(ep.as_ref()).await {
            tracing::warn!(device_id = %id, endpoint = ep.name(), error = %e, "detach failed");
        }
    }
    tracing::info!(device_id = %id, "Device removed");
}
