//! Daemon wiring from a config file down to attached endpoints.

use astro_core::endpoint::{dispatch, EndpointKind, PropertyChange};
use astro_core::property::{names, PropertyStore};
use astro_daq::config::AstroConfig;
use astro_daq::Daemon;
use astro_driver_sim::factory::SIM_CAMERA_PID;
use astro_driver_sim::{SimEnumerator, SIM_VENDOR_ID};
use astro_hardware::hotplug::{DeviceEnumerator, DeviceIdentity, DiscoveredDevice};
use std::sync::Arc;
use std::time::Duration;

fn config(lock_dir: &std::path::Path, extra: &str) -> AstroConfig {
    let lock_dir = lock_dir.display();
    AstroConfig::from_toml_str(&format!(
        r#"
        [application]
        name = "test"

        [[devices]]
        id = "EQ6"
        driver = "synscan"
        [devices.config]
        port = "sim://eq6"
        latitude = 45.0
        drain_ms = 10
        lock_dir = '{lock_dir}'

        [[devices]]
        id = "Imager"
        driver = "sim_camera"
        [devices.config]
        model = "efw"
        lock_dir = '{lock_dir}'

        {extra}
        "#
    ))
    .unwrap()
}

fn bus_with_camera() -> Arc<SimEnumerator> {
    let bus = Arc::new(SimEnumerator::new());
    bus.plug(DiscoveredDevice {
        identity: DeviceIdentity::new(3, "1.4"),
        vendor_id: SIM_VENDOR_ID,
        product_id: SIM_CAMERA_PID,
        product: "Sim Camera".into(),
    });
    bus
}

#[tokio::test(start_paused = true)]
async fn configured_and_hotplugged_devices_come_up() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config(tmp.path(), "");
    let bus: Arc<dyn DeviceEnumerator> = bus_with_camera();
    let daemon = Daemon::start_with(&config, Some(bus)).await.unwrap();

    assert_eq!(
        daemon.registry().device_ids().await,
        vec!["EQ6".to_string(), "Imager".to_string()]
    );
    // Mount + guider, CCD + guider + wheel.
    assert_eq!(daemon.endpoints().await.len(), 5);

    tokio::time::sleep(Duration::from_millis(600)).await;
    let hotplug = daemon.hotplug().unwrap();
    assert_eq!(hotplug.tracked().await, vec![DeviceIdentity::new(3, "1.4")]);
    assert_eq!(daemon.endpoints().await.len(), 7);

    let mount = daemon
        .endpoints()
        .await
        .into_iter()
        .find(|e| e.kind() == EndpointKind::Mount)
        .unwrap();
    dispatch(
        mount.as_ref(),
        PropertyChange::switch(names::CONNECTION, names::CONNECTION_CONNECTED),
    )
    .await
    .unwrap();
    let connection = daemon.store().get("EQ6", names::CONNECTION).unwrap();
    assert!(connection.is_on(names::CONNECTION_CONNECTED));

    let store = daemon.store().clone();
    daemon.shutdown().await;
    assert!(store.devices().is_empty());
}

#[tokio::test(start_paused = true)]
async fn hotplug_can_be_disabled() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config(tmp.path(), "[hotplug]\nenabled = false");
    let bus: Arc<dyn DeviceEnumerator> = bus_with_camera();
    let daemon = Daemon::start_with(&config, Some(bus)).await.unwrap();
    assert!(daemon.hotplug().is_none());
    daemon.shutdown().await;
}

#[tokio::test]
async fn disabled_devices_are_skipped() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = config(tmp.path(), "");
    config.devices[1].enabled = false;
    let daemon = Daemon::start_with(&config, None).await.unwrap();
    assert_eq!(daemon.registry().device_ids().await, vec!["EQ6".to_string()]);
    daemon.shutdown().await;
}

#[tokio::test]
async fn bad_driver_config_fails_startup() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = config(tmp.path(), "");
    config.devices[0].config = toml::Value::Table(toml::toml! {
        port = "sim://eq6"
        latitude = 123.0
    });
    let err = Daemon::start_with(&config, None).await.err().unwrap();
    assert!(format!("{err:#}").contains("EQ6"), "{err:#}");
}

#[tokio::test]
async fn unknown_driver_fails_startup() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config(
        tmp.path(),
        r#"
        [[devices]]
        id = "Focuser"
        driver = "moonlite"
        "#,
    );
    let err = Daemon::start_with(&config, None).await.err().unwrap();
    assert!(format!("{err:#}").contains("moonlite"), "{err:#}");
}
