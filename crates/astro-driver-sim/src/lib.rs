//! Simulated USB camera for astro-daq.
//!
//! Stands in for real camera hardware in tests and demos: a CCD with
//! optional guide port, thermoelectric cooler and integrated filter wheel.
//! Timing follows the paused tokio clock, so a 30 s exposure costs nothing
//! in a `start_paused` test.
//!
//! ```text
//!  CcdEndpoint ────┐
//!  GuiderEndpoint ─┼─► SharedDevice<SimCameraLink> ─► SimCameraHardware
//!  WheelEndpoint ──┘        (one open per camera)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use astro_driver_sim::{SimCameraDriverFactory, SimCameraEndpointFactory};
//!
//! registry.register_factory(Arc::new(SimCameraDriverFactory));
//! let hotplug = HotplugRegistry::new(enumerator, context, config)
//!     .with_factory(Arc::new(SimCameraEndpointFactory::new()));
//! ```

pub mod camera;
pub mod common;
pub mod enumerator;
pub mod factory;
pub mod link;

pub use camera::{SimCamera, SimCameraHardware, SimCameraModel};
pub use common::{ErrorConfig, ErrorScenario, MockMode, SimOp};
pub use enumerator::SimEnumerator;
pub use factory::{SimCameraDriverFactory, SimCameraEndpointFactory, SIM_VENDOR_ID};
pub use link::SimCameraLink;

/// Force the linker to include this crate.
#[inline(never)]
pub fn link() {
    std::hint::black_box(std::any::TypeId::of::<SimCameraDriverFactory>());
}
