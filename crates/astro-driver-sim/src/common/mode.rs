//! How closely the simulated camera imitates real hardware timing.

use super::rng::MockRng;
use serde::Deserialize;
use std::time::Duration;

/// Frame readout time of the simulated sensor in [`MockMode::Realistic`].
pub const READOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockMode {
    /// Frames are ready the moment the exposure ends.
    #[default]
    Instant,
    /// Fixed readout delay after the exposure.
    Realistic,
    /// Readout delay with random jitter of up to twice [`READOUT`].
    Chaos,
}

impl MockMode {
    pub fn readout(self, rng: &MockRng) -> Duration {
        match self {
            MockMode::Instant => Duration::ZERO,
            MockMode::Realistic => READOUT,
            MockMode::Chaos => READOUT + READOUT.mul_f64(2.0 * rng.next_f64()),
        }
    }
}
