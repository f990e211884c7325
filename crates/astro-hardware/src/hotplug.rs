//! Hot-plug device registry.
//!
//! Tracks physical USB devices by identity (bus + port path) and the
//! endpoints created for each. Every arrival or removal event triggers the
//! same reconciliation: enumerate what is present, tear down tracked devices
//! that are gone, create endpoints for untracked ones. Running it twice with
//! nothing changed is a no-op.
//!
//! Event handlers do no work themselves. They arm (or push back) a one-shot
//! timer on the registry's own dispatch queue, so a burst of USB events
//! produces one rescan half a second after the last of them.
//!
//! ```text
//! USB event ──► handle_event() ──► [0.5 s timer] ──► reconcile()
//!                                                     ├─ enumerate()      (error: keep state, retry on next event)
//!                                                     ├─ gone    → detach endpoints
//!                                                     └─ new     → factory.create() → capacity check → attach
//! ```

use anyhow::Result;
use astro_core::driver::DriverContext;
use astro_core::endpoint::{self, Endpoint};
use astro_core::error::AstroError;
use astro_core::timer::{DispatchQueue, TimerAction, TimerHandle};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Delay between a hot-plug event and the rescan it triggers.
pub const HOTPLUG_DEFER: Duration = Duration::from_millis(500);

/// Default upper bound on endpoints created from hot-plugged devices.
pub const DEFAULT_CAPACITY: usize = 10;

/// Stable identity of a physical device. Enumeration indices shift as
/// devices come and go; the bus and port path do not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub bus: u8,
    pub port_path: String,
}

impl DeviceIdentity {
    pub fn new(bus: u8, port_path: impl Into<String>) -> Self {
        Self {
            bus,
            port_path: port_path.into(),
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.bus, self.port_path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub identity: DeviceIdentity,
    pub vendor_id: u16,
    pub product_id: u16,
    pub product: String,
}

/// Lists devices currently present on the bus.
#[async_trait]
pub trait DeviceEnumerator: Send + Sync {
    async fn enumerate(&self) -> Result<Vec<DiscoveredDevice>>;
}

/// Turns a discovered device into endpoints (camera, plus guider and wheel
/// when the hardware has them). Must not open the hardware.
#[async_trait]
pub trait EndpointFactory: Send + Sync {
    fn name(&self) -> &str;

    fn matches(&self, device: &DiscoveredDevice) -> bool;

    async fn create(
        &self,
        device: &DiscoveredDevice,
        context: &DriverContext,
    ) -> Result<Vec<Arc<dyn Endpoint>>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugEvent {
    Arrived,
    Left,
}

#[derive(Debug, Clone, Copy)]
pub struct HotplugConfig {
    pub capacity: usize,
    pub defer: Duration,
}

impl Default for HotplugConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            defer: HOTPLUG_DEFER,
        }
    }
}

/// What one reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RescanSummary {
    pub attached: Vec<DeviceIdentity>,
    pub detached: Vec<DeviceIdentity>,
    pub ignored: Vec<DeviceIdentity>,
}

struct Tracked {
    device: DiscoveredDevice,
    endpoints: Vec<Arc<dyn Endpoint>>,
}

struct Inner {
    enumerator: Arc<dyn DeviceEnumerator>,
    factories: Vec<Arc<dyn EndpointFactory>>,
    context: DriverContext,
    config: HotplugConfig,
    queue: DispatchQueue,
    tracked: Mutex<BTreeMap<DeviceIdentity, Tracked>>,
    pending: parking_lot::Mutex<Option<TimerHandle>>,
}

#[derive(Clone)]
pub struct HotplugRegistry {
    inner: Arc<Inner>,
}

impl HotplugRegistry {
    pub fn new(
        enumerator: Arc<dyn DeviceEnumerator>,
        context: DriverContext,
        config: HotplugConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                enumerator,
                factories: Vec::new(),
                context,
                config,
                queue: DispatchQueue::new("hotplug"),
                tracked: Mutex::new(BTreeMap::new()),
                pending: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Add an endpoint factory. Only valid before the registry is shared.
    pub fn with_factory(mut self, factory: Arc<dyn EndpointFactory>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.factories.push(factory),
            None => tracing::warn!(factory = factory.name(), "factory added after registry was shared, ignored"),
        }
        self
    }

    /// React to a USB event. Cheap: arms or pushes back the deferred rescan.
    pub fn handle_event(&self, event: HotplugEvent) {
        tracing::debug!(?event, "hot-plug event");
        let mut pending = self.inner.pending.lock();
        if let Some(handle) = pending.as_ref() {
            if handle.reschedule(self.inner.config.defer) {
                return;
            }
        }

        let inner = self.inner.clone();
        let handle = self
            .inner
            .context
            .scheduler
            .schedule(&self.inner.queue, self.inner.config.defer, move || {
                let inner = inner.clone();
                async move {
                    inner.pending.lock().take();
                    if let Err(e) = inner.reconcile().await {
                        tracing::warn!(error = %e, "hot-plug rescan failed, keeping tracked devices");
                    }
                    TimerAction::Done
                }
            });
        *pending = Some(handle);
    }

    /// Reconcile now, serialized with deferred rescans.
    pub async fn rescan(&self) -> Result<RescanSummary> {
        let _queue = self.inner.queue.lock().await;
        self.inner.reconcile().await
    }

    pub async fn tracked(&self) -> Vec<DeviceIdentity> {
        self.inner.tracked.lock().await.keys().cloned().collect()
    }

    pub async fn endpoint_count(&self) -> usize {
        self.inner
            .tracked
            .lock()
            .await
            .values()
            .map(|t| t.endpoints.len())
            .sum()
    }

    pub async fn endpoints(&self) -> Vec<Arc<dyn Endpoint>> {
        self.inner
            .tracked
            .lock()
            .await
            .values()
            .flat_map(|t| t.endpoints.iter().cloned())
            .collect()
    }

    /// Cancel any pending rescan and detach every tracked device.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.inner.pending.lock().take() {
            handle.cancel();
        }
        let _queue = self.inner.queue.lock().await;
        let mut tracked = self.inner.tracked.lock().await;
        for (identity, device) in std::mem::take(&mut *tracked) {
            detach_all(&identity, &device.endpoints).await;
        }
    }
}

impl Inner {
    async fn reconcile(&self) -> Result<RescanSummary> {
        let present: Vec<DiscoveredDevice> = self
            .enumerator
            .enumerate()
            .await?
            .into_iter()
            .filter(|d| self.factory_for(d).is_some())
            .collect();

        let mut summary = RescanSummary::default();
        let mut tracked = self.tracked.lock().await;

        let gone: Vec<DeviceIdentity> = tracked
            .keys()
            .filter(|id| !present.iter().any(|d| &d.identity == *id))
            .cloned()
            .collect();
        for identity in gone {
            if let Some(device) = tracked.remove(&identity) {
                detach_all(&identity, &device.endpoints).await;
                tracing::info!(%identity, product = %device.device.product, "device removed");
                summary.detached.push(identity);
            }
        }

        for device in present {
            if tracked.contains_key(&device.identity) {
                continue;
            }
            let Some(factory) = self.factory_for(&device) else {
                continue;
            };
            let endpoints = match factory.create(&device, &self.context).await {
                Ok(endpoints) => endpoints,
                Err(e) => {
                    tracing::warn!(identity = %device.identity, error = %e, "endpoint creation failed");
                    continue;
                }
            };

            let in_use: usize = tracked.values().map(|t| t.endpoints.len()).sum();
            if in_use + endpoints.len() > self.config.capacity {
                let err = AstroError::RegistryFull {
                    capacity: self.config.capacity,
                };
                tracing::warn!(identity = %device.identity, product = %device.product, error = %err, "device ignored");
                summary.ignored.push(device.identity);
                continue;
            }

            if let Err(e) = attach_all(&endpoints).await {
                tracing::warn!(identity = %device.identity, error = %e, "attach failed");
                continue;
            }
            tracing::info!(
                identity = %device.identity,
                product = %device.product,
                endpoints = endpoints.len(),
                "device attached"
            );
            summary.attached.push(device.identity.clone());
            tracked.insert(device.identity.clone(), Tracked { device, endpoints });
        }

        Ok(summary)
    }

    fn factory_for(&self, device: &DiscoveredDevice) -> Option<&Arc<dyn EndpointFactory>> {
        self.factories.iter().find(|f| f.matches(device))
    }
}

async fn attach_all(endpoints: &[Arc<dyn Endpoint>]) -> Result<()> {
    for (i, ep) in endpoints.iter().enumerate() {
        if let Err(e) = endpoint::attach(ep.as_ref()).await {
            for attached in endpoints[..i].iter().rev() {
                let _ = endpoint::detach(attached.as_ref()).await;
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Detach in reverse creation order, so the master endpoint goes last.
async fn detach_all(identity: &DeviceIdentity, endpoints: &[Arc<dyn Endpoint>]) {
    for ep in endpoints.iter().rev() {
        if let Err(e) = endpoint::detach(ep.as_ref()).await {
            tracing::warn!(%identity, endpoint = ep.name(), error = %e, "detach failed");
        }
    }
}
