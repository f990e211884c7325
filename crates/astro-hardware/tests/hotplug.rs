//! Hot-plug reconciliation against a scripted bus.

use anyhow::{bail, Result};
use astro_core::driver::DriverContext;
use astro_core::endpoint::{Endpoint, EndpointContext, EndpointKind, PropertyChange};
use astro_core::property::{names, Item, MemoryPropertyStore, Property, PropertyKind};
use astro_core::timer::{DispatchQueue, Scheduler};
use astro_hardware::{
    DeviceEnumerator, DeviceIdentity, DiscoveredDevice, EndpointFactory, HotplugConfig,
    HotplugEvent, HotplugRegistry,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;

#[derive(Default)]
struct ScriptedBus {
    devices: parking_lot::Mutex<Vec<DiscoveredDevice>>,
    fail: AtomicBool,
    scans: AtomicUsize,
}

impl ScriptedBus {
    fn plug(&self, port: &str) {
        self.devices.lock().push(DiscoveredDevice {
            identity: DeviceIdentity::new(1, port),
            vendor_id: 0x20e7,
            product_id: 0xdf01,
            product: "Sim Camera".into(),
        });
    }

    fn unplug(&self, port: &str) {
        self.devices.lock().retain(|d| d.identity.port_path != port);
    }
}

#[async_trait]
impl DeviceEnumerator for ScriptedBus {
    async fn enumerate(&self) -> Result<Vec<DiscoveredDevice>> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            bail!("bus unavailable");
        }
        Ok(self.devices.lock().clone())
    }
}

struct PlainEndpoint {
    name: String,
    queue: DispatchQueue,
    ctx: EndpointContext,
}

#[async_trait]
impl Endpoint for PlainEndpoint {
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
        self.ctx.define(
            Property::new(names::CCD_EXPOSURE, "Exposure", PropertyKind::Number).with_item(
                Item::number(names::CCD_EXPOSURE_ITEM, "Duration", 0.0, 3600.0, 0.0),
            ),
        )?;
        Ok(())
    }

    async fn change_property(&self, _change: PropertyChange) -> Result<()> {
        Ok(())
    }

    async fn detach(&self) -> Result<()> {
        self.ctx.undefine_all();
        Ok(())
    }
}

/// Camera plus guider per device.
struct PairFactory;

#[async_trait]
impl EndpointFactory for PairFactory {
    fn name(&self) -> &str {
        "pair"
    }

    fn matches(&self, device: &DiscoveredDevice) -> bool {
        device.vendor_id == 0x20e7
    }

    async fn create(
        &self,
        device: &DiscoveredDevice,
        context: &DriverContext,
    ) -> Result<Vec<Arc<dyn Endpoint>>> {
        let base = format!("{} #{}", device.product, device.identity);
        Ok([base.clone(), format!("{base} (guider)")]
            .into_iter()
            .map(|name| {
                Arc::new(PlainEndpoint {
                    queue: DispatchQueue::new(&name),
                    ctx: EndpointContext::new(&name, context.store.clone()),
                    name,
                }) as Arc<dyn Endpoint>
            })
            .collect())
    }
}

fn registry(capacity: usize) -> (HotplugRegistry, Arc<ScriptedBus>, Arc<MemoryPropertyStore>) {
    let store = Arc::new(MemoryPropertyStore::new());
    let bus = Arc::new(ScriptedBus::default());
    let registry = HotplugRegistry::new(
        bus.clone(),
        DriverContext::new(store.clone(), Scheduler::new()),
        HotplugConfig {
            capacity,
            ..HotplugConfig::default()
        },
    )
    .with_factory(Arc::new(PairFactory));
    (registry, bus, store)
}

#[tokio::test]
async fn rescan_is_idempotent() {
    let (registry, bus, store) = registry(10);
    bus.plug("2.1");

    let first = registry.rescan().await.unwrap();
    assert_eq!(first.attached, vec![DeviceIdentity::new(1, "2.1")]);
    assert_eq!(registry.endpoint_count().await, 2);
    assert!(store.devices().contains(&"Sim Camera #1-2.1 (guider)".to_string()));

    let second = registry.rescan().await.unwrap();
    assert_eq!(second, Default::default());
    assert_eq!(registry.endpoint_count().await, 2);
}

#[tokio::test(start_paused = true)]
async fn event_burst_triggers_one_deferred_rescan() {
    let (registry, bus, _store) = registry(10);
    bus.plug("2.1");

    for _ in 0..5 {
        registry.handle_event(HotplugEvent::Arrived);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(bus.scans.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(450)).await;
    assert_eq!(bus.scans.load(Ordering::SeqCst), 1);
    assert_eq!(registry.tracked().await, vec![DeviceIdentity::new(1, "2.1")]);
}

#[tokio::test(start_paused = true)]
async fn removal_detaches_only_the_missing_device() {
    let (registry, bus, store) = registry(10);
    bus.plug("2.1");
    bus.plug("2.3");
    registry.rescan().await.unwrap();

    bus.unplug("2.1");
    registry.handle_event(HotplugEvent::Left);
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(registry.tracked().await, vec![DeviceIdentity::new(1, "2.3")]);
    assert!(store.properties("Sim Camera #1-2.1").is_empty());
    assert!(!store.properties("Sim Camera #1-2.3").is_empty());
}

#[tokio::test]
async fn enumeration_failure_keeps_tracked_devices() {
    let (registry, bus, _store) = registry(10);
    bus.plug("2.1");
    registry.rescan().await.unwrap();

    bus.fail.store(true, Ordering::SeqCst);
    assert!(registry.rescan().await.is_err());
    assert_eq!(registry.endpoint_count().await, 2);
}

#[tokio::test]
#[traced_test]
async fn full_registry_ignores_new_device() {
    let (registry, bus, store) = registry(3);
    bus.plug("2.1");
    bus.plug("2.3");

    let summary = registry.rescan().await.unwrap();
    assert_eq!(summary.attached.len(), 1);
    assert_eq!(summary.ignored.len(), 1);
    assert_eq!(registry.endpoint_count().await, 2);
    assert_eq!(store.devices().len(), 2);
    assert!(logs_contain("device ignored"));
}

#[tokio::test]
async fn shutdown_detaches_everything() {
    let (registry, bus, store) = registry(10);
    bus.plug("2.1");
    registry.rescan().await.unwrap();

    registry.shutdown().await;
    assert!(registry.tracked().await.is_empty());
    assert!(store.devices().is_empty());
}
