//! Endpoints: the logical devices clients see.
//!
//! A physical device exposes one or more endpoints (CCD, guider, wheel,
//! mount). Each endpoint owns a [`DispatchQueue`]; [`dispatch`] enters it before
//! handing a client change to [`Endpoint::change_property`], which is what keeps
//! handlers and timer bodies of one endpoint strictly sequential.

use crate::error::AppResult;
use crate::property::{ItemUpdate, Property, PropertyState, PropertyStore, UpdateValue};
use crate::timer::DispatchQueue;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Ccd,
    Guider,
    Wheel,
    Mount,
}

/// A client request to change a property.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyChange {
    pub property: String,
    pub updates: Vec<ItemUpdate>,
}

impl PropertyChange {
    pub fn new(property: &str) -> Self {
        Self {
            property: property.to_string(),
            updates: Vec::new(),
        }
    }

    pub fn with(mut self, update: ItemUpdate) -> Self {
        self.updates.push(update);
        self
    }

    /// Turn one switch item on.
    pub fn switch(property: &str, item: &str) -> Self {
        Self::new(property).with(ItemUpdate::switch(item, true))
    }

    /// Request a numeric target for one item.
    pub fn number(property: &str, item: &str, target: f64) -> Self {
        Self::new(property).with(ItemUpdate::target(item, target))
    }

    /// Whether the change turns `item` on.
    pub fn is_on(&self, item: &str) -> bool {
        self.updates
            .iter()
            .any(|u| u.item == item && u.value == UpdateValue::Switch(true))
    }

    /// First switch the change turns on.
    pub fn first_on(&self) -> Option<&str> {
        self.updates
            .iter()
            .find(|u| u.value == UpdateValue::Switch(true))
            .map(|u| u.item.as_str())
    }

    /// Number requested for `item`, whether sent as target or value.
    pub fn requested(&self, item: &str) -> Option<f64> {
        self.updates.iter().find(|u| u.item == item).and_then(|u| match u.value {
            UpdateValue::Target(v) | UpdateValue::Value(v) | UpdateValue::ValueAndTarget(v) => Some(v),
            _ => None,
        })
    }
}

#[async_trait]
pub trait Endpoint: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> EndpointKind;
    fn queue(&self) -> &DispatchQueue;

    /// Define the endpoint's properties.
    async fn attach(&self) -> anyhow::Result<()>;

    /// Handle a client change. Runs inside the endpoint's queue.
    async fn change_property(&self, change: PropertyChange) -> anyhow::Result<()>;

    /// Disconnect if needed, cancel timers and undefine every property.
    /// Runs inside the endpoint's queue.
    async fn detach(&self) -> anyhow::Result<()>;
}

/// Deliver a client change through the endpoint's queue.
pub async fn dispatch(endpoint: &dyn Endpoint, change: PropertyChange) -> anyhow::Result<()> {
    let _queue = endpoint.queue().lock().await;
    endpoint.change_property(change).await
}

/// Attach an endpoint inside its queue.
pub async fn attach(endpoint: &dyn Endpoint) -> anyhow::Result<()> {
    let _queue = endpoint.queue().lock().await;
    endpoint.attach().await
}

/// Detach an endpoint inside its queue.
pub async fn detach(endpoint: &dyn Endpoint) -> anyhow::Result<()> {
    let _queue = endpoint.queue().lock().await;
    endpoint.detach().await
}

// =============================================================================
// Endpoint Context
// =============================================================================

/// Property store bound to one endpoint name.
///
/// The state helpers (`busy`, `ok`, `alert`, `update`) log store failures
/// instead of returning them: they run from timer bodies where nothing could
/// act on the error, and the properties they touch were defined by the
/// endpoint itself.
#[derive(Clone)]
pub struct EndpointContext {
    device: Arc<str>,
    store: Arc<dyn PropertyStore>,
    defined: Arc<parking_lot::Mutex<Vec<String>>>,
}

impl EndpointContext {
    pub fn new(device: &str, store: Arc<dyn PropertyStore>) -> Self {
        Self {
            device: Arc::from(device),
            store,
            defined: Arc::new(parking_lot::Mutex::new(Vec::new())),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn store(&self) -> &Arc<dyn PropertyStore> {
        &self.store
    }

    pub fn define(&self, property: Property) -> AppResult<()> {
        let name = property.name.clone();
        self.store.define(property.for_device(&self.device))?;
        self.defined.lock().push(name);
        Ok(())
    }

    pub fn undefine(&self, name: &str) -> AppResult<()> {
        self.defined.lock().retain(|n| n != name);
        self.store.undefine(&self.device, name)
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.defined.lock().iter().any(|n| n == name)
    }

    /// Undefine everything this context defined, newest first.
    pub fn undefine_all(&self) {
        let names: Vec<String> = self.defined.lock().drain(..).rev().collect();
        for name in names {
            if let Err(e) = self.store.undefine(&self.device, &name) {
                tracing::warn!(device = %self.device, property = %name, error = %e, "undefine failed");
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Property> {
        self.store.get(&self.device, name)
    }

    pub fn state(&self, name: &str) -> PropertyState {
        self.get(name).map(|p| p.state).unwrap_or_default()
    }

    pub fn value(&self, name: &str, item: &str) -> Option<f64> {
        self.get(name)?.value(item)
    }

    pub fn target(&self, name: &str, item: &str) -> Option<f64> {
        self.get(name)?.target(item)
    }

    pub fn is_on(&self, name: &str, item: &str) -> bool {
        self.get(name).map(|p| p.is_on(item)).unwrap_or(false)
    }

    /// Apply a client change to the store without publishing.
    pub fn apply(&self, change: &PropertyChange) -> AppResult<()> {
        self.store
            .set_values(&self.device, &change.property, &change.updates)
    }

    pub fn set_values(&self, name: &str, updates: &[ItemUpdate]) {
        if let Err(e) = self.store.set_values(&self.device, name, updates) {
            tracing::warn!(device = %self.device, property = name, error = %e, "set_values failed");
        }
    }

    /// Set the state and publish, with an optional client message.
    pub fn update(&self, name: &str, state: PropertyState, message: Option<&str>) {
        let result = self
            .store
            .set_state(&self.device, name, state)
            .and_then(|_| self.store.publish(&self.device, name, message));
        if let Err(e) = result {
            tracing::warn!(device = %self.device, property = name, error = %e, "publish failed");
        }
    }

    pub fn busy(&self, name: &str) {
        self.update(name, PropertyState::Busy, None);
    }

    pub fn ok(&self, name: &str, message: Option<&str>) {
        self.update(name, PropertyState::Ok, message);
    }

    /// ALERT always carries a message.
    pub fn alert(&self, name: &str, message: &str) {
        tracing::info!(device = %self.device, property = name, message, "alert");
        self.update(name, PropertyState::Alert, Some(message));
    }

    /// Republish without touching the state.
    pub fn publish(&self, name: &str) {
        if let Err(e) = self.store.publish(&self.device, name, None) {
            tracing::warn!(device = %self.device, property = name, error = %e, "publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::{names, Item, MemoryPropertyStore, PropertyKind};

    #[test]
    fn define_binds_device_and_undefine_all_clears() {
        let store = Arc::new(MemoryPropertyStore::new());
        let ctx = EndpointContext::new("CCD Simulator", store.clone());

        ctx.define(
            Property::new(names::CCD_EXPOSURE, "Exposure", PropertyKind::Number)
                .with_item(Item::number(names::CCD_EXPOSURE_ITEM, "Duration", 0.0, 3600.0, 0.0)),
        )
        .unwrap();
        assert!(ctx.is_defined(names::CCD_EXPOSURE));
        assert_eq!(
            store.get("CCD Simulator", names::CCD_EXPOSURE).unwrap().device,
            "CCD Simulator"
        );

        ctx.undefine_all();
        assert!(store.properties("CCD Simulator").is_empty());
    }

    #[test]
    fn alert_sets_state() {
        let store = Arc::new(MemoryPropertyStore::new());
        let ctx = EndpointContext::new("Wheel", store);
        ctx.define(
            Property::new(names::WHEEL_SLOT, "Slot", PropertyKind::Number)
                .with_item(Item::number(names::WHEEL_SLOT_ITEM, "Slot", 1.0, 5.0, 1.0)),
        )
        .unwrap();

        ctx.alert(names::WHEEL_SLOT, "Slot out of range");
        assert_eq!(ctx.state(names::WHEEL_SLOT), PropertyState::Alert);
    }
}
