//! `astro-hardware`
//!
//! Device discovery and driver instantiation:
//!
//! - [`hotplug`]: USB devices tracked by bus/port identity, with debounced rescans
//!   and a cap on the number of endpoints
//! - [`registry`]: config-driven drivers built through [`astro_core::driver::DriverFactory`]
//! - `usb` (feature `usb`): `nusb` enumeration and hot-plug watch

pub mod hotplug;
pub mod registry;
#[cfg(feature = "usb")]
pub mod usb;

pub use hotplug::{
    DeviceEnumerator, DeviceIdentity, DiscoveredDevice, EndpointFactory, HotplugConfig,
    HotplugEvent, HotplugRegistry,
};
pub use registry::{DriverRegistry, FactoryInfo};
