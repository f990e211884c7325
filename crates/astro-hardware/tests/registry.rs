use anyhow::{anyhow, Result};
use astro_core::driver::{Capability, DeviceComponents, DriverContext, DriverFactory};
use astro_core::endpoint::{Endpoint, EndpointContext, EndpointKind, PropertyChange};
use astro_core::error::{AstroError, DriverErrorKind};
use astro_core::property::{names, Item, MemoryPropertyStore, Property, PropertyKind, PropertyStore};
use astro_core::timer::{DispatchQueue, Scheduler};
use astro_hardware::DriverRegistry;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;

struct SlotEndpoint {
    name: String,
    queue: DispatchQueue,
    ctx: EndpointContext,
}

#[async_trait]
impl Endpoint for SlotEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EndpointKind {
        EndpointKind::Wheel
    }

    fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    async fn attach(&self) -> Result<()> {
        self.ctx.define(
            Property::new(names::WHEEL_SLOT, "Slot", PropertyKind::Number)
                .with_item(Item::number(names::WHEEL_SLOT_ITEM, "Slot", 1.0, 5.0, 1.0)),
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

/// Requires `slots` in its config table.
struct WheelFactory;

impl DriverFactory for WheelFactory {
    fn driver_type(&self) -> &'static str {
        "test_wheel"
    }

    fn name(&self) -> &'static str {
        "Test Wheel"
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Slot]
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        config
            .get("slots")
            .and_then(|v| v.as_integer())
            .map(|_| ())
            .ok_or_else(|| anyhow!("missing 'slots'"))
    }

    fn build(
        &self,
        name: String,
        _config: toml::Value,
        context: DriverContext,
    ) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let endpoint = SlotEndpoint {
                queue: DispatchQueue::new(&name),
                ctx: EndpointContext::new(&name, context.store.clone()),
                name,
            };
            Ok(DeviceComponents::new().with_endpoint(Arc::new(endpoint)))
        })
    }
}

fn registry() -> (DriverRegistry, Arc<MemoryPropertyStore>) {
    let store = Arc::new(MemoryPropertyStore::new());
    let registry = DriverRegistry::new(DriverContext::new(store.clone(), Scheduler::new()));
    registry.register_factory(Arc::new(WheelFactory));
    (registry, store)
}

fn config(slots: i64) -> toml::Value {
    toml::Value::Table(toml::map::Map::from_iter([(
        "slots".to_string(),
        toml::Value::Integer(slots),
    )]))
}

#[test]
fn factory_introspection() {
    let (registry, _) = registry();
    assert!(registry.has_factory("test_wheel"));
    assert_eq!(registry.list_factories(), vec!["test_wheel"]);
    let info = registry.factory_info("test_wheel").unwrap();
    assert_eq!(info.capabilities, vec!["Filter Slot"]);
}

#[tokio::test]
async fn instantiate_attaches_and_remove_detaches() {
    let (registry, store) = registry();
    registry.instantiate("wheel", "test_wheel", config(5)).await.unwrap();
    assert!(store.get("wheel", names::WHEEL_SLOT).is_some());
    assert_eq!(registry.driver_type("wheel").await.as_deref(), Some("test_wheel"));

    let dup = registry.instantiate("wheel", "test_wheel", config(5)).await;
    assert!(matches!(dup, Err(AstroError::Configuration(_))));

    assert!(registry.remove("wheel").await);
    assert!(store.devices().is_empty());
    assert!(!registry.remove("wheel").await);
}

#[tokio::test]
async fn invalid_config_is_a_configuration_error() {
    let (registry, _) = registry();
    let err = registry
        .instantiate("wheel", "test_wheel", toml::Value::Table(Default::default()))
        .await
        .unwrap_err();
    match err {
        AstroError::Driver(e) => assert_eq!(e.kind, DriverErrorKind::Configuration),
        other => panic!("unexpected error: {other}"),
    }
    assert!(registry.device_ids().await.is_empty());
}

#[tokio::test]
async fn unknown_driver_lists_available() {
    let (registry, _) = registry();
    let err = registry
        .instantiate("cam", "nope", config(1))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("test_wheel"));
}

#[tokio::test]
async fn shutdown_detaches_all() {
    let (registry, store) = registry();
    registry.instantiate("a", "test_wheel", config(5)).await.unwrap();
    registry.instantiate("b", "test_wheel", config(8)).await.unwrap();
    assert_eq!(registry.endpoints().await.len(), 2);
    registry.shutdown().await;
    assert!(store.devices().is_empty());
}
