//! SkyWatcher SynScan motor controller driver for astro-daq.
//!
//! One controller serves two endpoints: the mount (GOTO, park, tracking,
//! manual motion, sync) and an ST-4 style guide port. Both share a single
//! open connection and one [`state::MountState`].
//!
//! ```text
//!  MountEndpoint ─┐                    ┌─► serial  /dev/ttyUSB0
//!                 ├─► SharedDevice ────┼─► TCP     synscan://host:port
//!  GuiderEndpoint ┘   (MotorController)└─► sim://  in-process simulator
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use astro_driver_synscan::SynscanFactory;
//!
//! registry.register_factory(Arc::new(SynscanFactory));
//! ```

pub mod axis;
pub mod controller;
pub mod coordinates;
pub mod factory;
pub mod guider;
pub mod link;
pub mod mount;
pub mod protocol;
pub mod sidereal;
pub mod simulator;
pub mod state;
pub mod transport;

pub use factory::{SynscanConfig, SynscanFactory};
pub use guider::MountGuidePort;
pub use link::SynscanLink;
pub use mount::{MountEndpoint, MountSettings};

/// Force the linker to include this crate.
///
/// Call this function from main() to ensure the driver factory is linked
/// into the final binary and not stripped by the linker.
#[inline(never)]
pub fn link() {
    std::hint::black_box(std::any::TypeId::of::<SynscanFactory>());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_does_not_panic() {
        link();
    }
}
