//! Hot-plug registry reconciling a simulated USB bus.

use astro_core::driver::DriverContext;
use astro_core::endpoint::{dispatch, EndpointKind, PropertyChange};
use astro_core::property::{names, MemoryPropertyStore, PropertyStore};
use astro_core::timer::Scheduler;
use astro_driver_sim::factory::{SIM_CAMERA_EFW_PID, SIM_CAMERA_PID};
use astro_driver_sim::{SimCameraEndpointFactory, SimEnumerator, SIM_VENDOR_ID};
use astro_hardware::hotplug::{
    DeviceIdentity, DiscoveredDevice, HotplugConfig, HotplugEvent, HotplugRegistry, HOTPLUG_DEFER,
};
use std::sync::Arc;
use std::time::Duration;

struct Bus {
    store: Arc<MemoryPropertyStore>,
    enumerator: Arc<SimEnumerator>,
    registry: HotplugRegistry,
    _tmp: tempfile::TempDir,
}

fn bus_with(capacity: usize) -> Bus {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryPropertyStore::new());
    let context = DriverContext::new(store.clone(), Scheduler::new());
    let enumerator = Arc::new(SimEnumerator::new());
    let registry = HotplugRegistry::new(
        enumerator.clone(),
        context,
        HotplugConfig {
            capacity,
            ..HotplugConfig::default()
        },
    )
    .with_factory(Arc::new(
        SimCameraEndpointFactory::new()
            .with_lock_dir(tmp.path())
            .with_seed(5),
    ));
    Bus {
        store,
        enumerator,
        registry,
        _tmp: tmp,
    }
}

fn camera(port: &str, product_id: u16) -> DiscoveredDevice {
    DiscoveredDevice {
        identity: DeviceIdentity::new(1, port),
        vendor_id: SIM_VENDOR_ID,
        product_id,
        product: "Sim Camera".into(),
    }
}

async fn after_defer() {
    tokio::time::sleep(HOTPLUG_DEFER + Duration::from_millis(100)).await;
}

#[tokio::test(start_paused = true)]
async fn rescan_creates_endpoints_per_capability() {
    let bus = bus_with(10);
    bus.enumerator.plug(camera("2", SIM_CAMERA_EFW_PID));

    let summary = bus.registry.rescan().await.unwrap();
    assert_eq!(summary.attached, vec![DeviceIdentity::new(1, "2")]);
    assert_eq!(bus.registry.endpoint_count().await, 3);

    let mut kinds: Vec<(String, EndpointKind)> = bus
        .registry
        .endpoints()
        .await
        .iter()
        .map(|e| (e.name().to_string(), e.kind()))
        .collect();
    kinds.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        kinds,
        vec![
            ("Sim Camera EFW #1-2".to_string(), EndpointKind::Ccd),
            ("Sim Camera EFW #1-2 (guider)".to_string(), EndpointKind::Guider),
            ("Sim Camera EFW #1-2 (wheel)".to_string(), EndpointKind::Wheel),
        ]
    );
    assert!(bus.store.get("Sim Camera EFW #1-2", names::CONNECTION).is_some());

    // Nothing changed, nothing happens.
    let again = bus.registry.rescan().await.unwrap();
    assert!(again.attached.is_empty() && again.detached.is_empty());
}

#[tokio::test(start_paused = true)]
async fn events_trigger_a_deferred_rescan() {
    let bus = bus_with(10);
    bus.enumerator.plug(camera("3", SIM_CAMERA_PID));
    bus.registry.handle_event(HotplugEvent::Arrived);

    tokio::time::sleep(HOTPLUG_DEFER / 2).await;
    assert!(bus.registry.tracked().await.is_empty());

    after_defer().await;
    assert_eq!(bus.registry.tracked().await, vec![DeviceIdentity::new(1, "3")]);
    assert_eq!(bus.registry.endpoint_count().await, 2);
}

#[tokio::test(start_paused = true)]
async fn unplug_detaches_connected_endpoints() {
    let bus = bus_with(10);
    bus.enumerator.plug(camera("2", SIM_CAMERA_PID));
    bus.registry.rescan().await.unwrap();

    let ccd = bus
        .registry
        .endpoints()
        .await
        .into_iter()
        .find(|e| e.kind() == EndpointKind::Ccd)
        .unwrap();
    dispatch(
        ccd.as_ref(),
        PropertyChange::switch(names::CONNECTION, names::CONNECTION_CONNECTED),
    )
    .await
    .unwrap();
    let connection = bus.store.get(ccd.name(), names::CONNECTION).unwrap();
    assert!(connection.is_on(names::CONNECTION_CONNECTED));

    assert!(bus.enumerator.unplug(&DeviceIdentity::new(1, "2")));
    bus.registry.handle_event(HotplugEvent::Left);
    after_defer().await;

    assert!(bus.registry.tracked().await.is_empty());
    assert!(bus.store.properties(ccd.name()).is_empty());
    assert!(bus.store.properties("Sim Camera #1-2 (guider)").is_empty());
}

#[tokio::test(start_paused = true)]
async fn devices_beyond_capacity_are_ignored() {
    let bus = bus_with(4);
    bus.enumerator.plug(camera("1", SIM_CAMERA_EFW_PID));
    bus.enumerator.plug(camera("2", SIM_CAMERA_PID));

    let summary = bus.registry.rescan().await.unwrap();
    assert_eq!(summary.attached, vec![DeviceIdentity::new(1, "1")]);
    assert_eq!(summary.ignored, vec![DeviceIdentity::new(1, "2")]);
    assert_eq!(bus.registry.endpoint_count().await, 3);
}

#[tokio::test(start_paused = true)]
async fn foreign_devices_are_not_tracked() {
    let bus = bus_with(10);
    bus.enumerator.plug(DiscoveredDevice {
        identity: DeviceIdentity::new(2, "1"),
        vendor_id: 0x03c3,
        product_id: 0x120a,
        product: "Some Other Camera".into(),
    });
    let summary = bus.registry.rescan().await.unwrap();
    assert!(summary.attached.is_empty() && summary.ignored.is_empty());
    assert!(bus.registry.tracked().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn enumeration_failure_keeps_tracked_devices() {
    let bus = bus_with(10);
    bus.enumerator.plug(camera("2", SIM_CAMERA_PID));
    bus.registry.rescan().await.unwrap();

    bus.enumerator.unplug(&DeviceIdentity::new(1, "2"));
    bus.enumerator.set_failing(true);
    bus.registry.handle_event(HotplugEvent::Left);
    after_defer().await;
    assert_eq!(bus.registry.tracked().await.len(), 1);

    bus.enumerator.set_failing(false);
    bus.registry.handle_event(HotplugEvent::Left);
    after_defer().await;
    assert!(bus.registry.tracked().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_detaches_everything() {
    let bus = bus_with(10);
    bus.enumerator.plug(camera("1", SIM_CAMERA_PID));
    bus.enumerator.plug(camera("2", SIM_CAMERA_EFW_PID));
    bus.registry.rescan().await.unwrap();
    assert_eq!(bus.registry.endpoint_count().await, 5);

    bus.registry.shutdown().await;
    assert_eq!(bus.registry.endpoint_count().await, 0);
    assert!(bus.store.devices().is_empty());
}
