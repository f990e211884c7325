//! Fault injection for the simulated camera.
//!
//! Every hardware call on [`crate::camera::SimCameraHardware`] first asks
//! [`ErrorConfig::check`] whether it should fail, so connection, exposure,
//! cooler and wheel error paths can be driven from tests and config files.

use super::rng::MockRng;
use astro_core::error::{DriverError, DriverErrorKind};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

const DRIVER: &str = "sim_camera";

/// Hardware call subject to fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    Open,
    StartExposure,
    ReadImage,
    Cooler,
    MoveWheel,
    Guide,
}

impl fmt::Display for SimOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SimOp::Open => "open",
            SimOp::StartExposure => "start_exposure",
            SimOp::ReadImage => "read_image",
            SimOp::Cooler => "cooler",
            SimOp::MoveWheel => "move_wheel",
            SimOp::Guide => "guide",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub enum ErrorScenario {
    /// Let `count` calls of `op` succeed, fail every one after that.
    FailAfterN { op: SimOp, count: u32 },
    /// Every call of `op` times out.
    Timeout { op: SimOp },
    /// Every call fails as if the USB cable was pulled.
    CommunicationLoss,
}

#[derive(Default)]
struct ErrorState {
    calls: HashMap<SimOp, u32>,
}

#[derive(Clone)]
pub struct ErrorConfig {
    failure_rate: f64,
    scenarios: Arc<Vec<ErrorScenario>>,
    rng: Arc<MockRng>,
    state: Arc<parking_lot::Mutex<ErrorState>>,
}

impl ErrorConfig {
    /// Never fails.
    pub fn none() -> Self {
        Self::build(0.0, Vec::new(), None)
    }

    /// Every call fails with probability `rate`.
    pub fn random_failures_seeded(rate: f64, seed: Option<u64>) -> Self {
        Self::build(rate, Vec::new(), seed)
    }

    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self::build(0.0, scenarios, None)
    }

    fn build(failure_rate: f64, scenarios: Vec<ErrorScenario>, seed: Option<u64>) -> Self {
        Self {
            failure_rate,
            scenarios: Arc::new(scenarios),
            rng: Arc::new(MockRng::new(seed)),
            state: Arc::new(parking_lot::Mutex::new(ErrorState::default())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.failure_rate > 0.0 || !self.scenarios.is_empty()
    }

    /// Decide whether this call of `op` fails.
    pub fn check(&self, op: SimOp) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        let calls = {
            let n = state.calls.entry(op).or_insert(0);
            *n += 1;
            *n
        };

        for scenario in self.scenarios.iter() {
            match scenario {
                ErrorScenario::CommunicationLoss => {
                    return Err(DriverError::new(
                        DRIVER,
                        DriverErrorKind::Communication,
                        "USB communication lost",
                    ));
                }
                ErrorScenario::Timeout { op: target } if *target == op => {
                    return Err(DriverError::new(
                        DRIVER,
                        DriverErrorKind::Timeout,
                        format!("{op} timed out"),
                    ));
                }
                ErrorScenario::FailAfterN { op: target, count } if *target == op && calls > *count => {
                    return Err(DriverError::new(
                        DRIVER,
                        DriverErrorKind::Hardware,
                        format!("injected {op} failure after {count} calls"),
                    ));
                }
                _ => {}
            }
        }

        if self.rng.should_fail(self.failure_rate) {
            return Err(DriverError::new(
                DRIVER,
                DriverErrorKind::Hardware,
                format!("random {op} failure"),
            ));
        }
        Ok(())
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Debug for ErrorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorConfig")
            .field("failure_rate", &self.failure_rate)
            .field("scenarios", &self.scenarios)
            .finish_non_exhaustive()
    }
}
