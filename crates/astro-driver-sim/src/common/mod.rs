//! Building blocks shared by the simulated devices.
//!
//! - **mode**: readout timing (Instant, Realistic, Chaos)
//! - **errors**: fault injection
//! - **rng**: seeded random source

pub mod errors;
pub mod mode;
pub mod rng;

pub use errors::{ErrorConfig, ErrorScenario, SimOp};
pub use mode::MockMode;
pub use rng::MockRng;
