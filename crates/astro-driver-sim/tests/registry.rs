use astro_core::driver::{Capability, DriverContext};
use astro_core::property::{names, MemoryPropertyStore, PropertyStore};
use astro_core::timer::Scheduler;
use astro_driver_sim::SimCameraDriverFactory;
use astro_hardware::DriverRegistry;
use std::sync::Arc;

fn registry() -> (DriverRegistry, Arc<MemoryPropertyStore>) {
    let store = Arc::new(MemoryPropertyStore::new());
    let registry = DriverRegistry::new(DriverContext::new(store.clone(), Scheduler::new()));
    registry.register_factory(Arc::new(SimCameraDriverFactory));
    (registry, store)
}

#[tokio::test(start_paused = true)]
async fn configured_camera_is_built_and_attached() {
    let tmp = tempfile::tempdir().unwrap();
    let (registry, store) = registry();
    let mut config = toml::map::Map::new();
    config.insert("model".into(), toml::Value::String("efw".into()));
    config.insert("seed".into(), toml::Value::Integer(3));
    config.insert(
        "lock_dir".into(),
        toml::Value::String(tmp.path().display().to_string()),
    );

    registry
        .instantiate("Imager", "sim_camera", toml::Value::Table(config))
        .await
        .unwrap();

    assert_eq!(registry.device_ids().await, vec!["Imager".to_string()]);
    let components = registry.components("Imager").await.unwrap();
    let capabilities = components.capabilities();
    for capability in [
        Capability::Connectable,
        Capability::Exposure,
        Capability::Cooler,
        Capability::Slot,
        Capability::Guide,
    ] {
        assert!(capabilities.contains(&capability), "{capability:?}");
    }
    assert_eq!(registry.endpoints().await.len(), 3);
    assert!(store.get("Imager (wheel)", names::WHEEL_SLOT).is_some());

    registry.shutdown().await;
    assert!(store.devices().is_empty());
}

#[tokio::test]
async fn invalid_config_is_rejected_before_build() {
    let (registry, store) = registry();
    let config = toml::Value::Table(toml::toml! {
        failure_rate = 2.0
    });
    assert!(registry.instantiate("Broken", "sim_camera", config).await.is_err());
    assert!(registry.device_ids().await.is_empty());
    assert!(store.devices().is_empty());
}
