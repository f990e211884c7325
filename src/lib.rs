//! astro-daq: astronomy device driver framework.
//!
//! The driver machinery lives in the workspace crates:
//!
//! - `astro-core`: property store, timers, connection lifecycle, async operations
//! - `astro-hardware`: hot-plug and configured-driver registries
//! - `astro-driver-synscan`: SkyWatcher SynScan mounts
//! - `astro-driver-sim`: simulated USB camera
//!
//! This crate ties them together for the `astro-daq` binary: configuration
//! ([`config`]), logging setup ([`logging`]) and daemon wiring ([`app`]).

pub mod app;
pub mod config;
pub mod logging;

pub use app::Daemon;
pub use config::AstroConfig;
