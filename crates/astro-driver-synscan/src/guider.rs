//! ST-4 style guide pulses through the motor controller.
//!
//! A pulse is a temporary rate change on one axis. RA pulses ride on top of
//! the tracking rate (west faster, east slower); DEC pulses run the idle DEC
//! motor north or south. The guider endpoint owns pulse timing, this port
//! only starts and ends the rate change.

use crate::axis::{configure_for_rate, update_rate_in_place, AxisMode, AxisState};
use crate::controller::MotorController;
use crate::protocol::{Axis, SIDEREAL_RATE};
use crate::state::{GlobalMode, MountShared};
use anyhow::{anyhow, bail, Result};
use astro_core::capabilities::{GuideAxis, GuideCapable, GuideDirection};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

const REFUSED: &str = "Guide pulse refused - mount busy!";

fn axis_of(axis: GuideAxis) -> Axis {
    match axis {
        GuideAxis::Ra => Axis::Ra,
        GuideAxis::Dec => Axis::Dec,
    }
}

/// Guide port of a SynScan mount.
pub struct MountGuidePort {
    shared: Arc<MountShared>,
    /// RA rate to restore when a pulse ends, if RA was tracking.
    resume_rate: parking_lot::Mutex<Option<f64>>,
}

impl MountGuidePort {
    pub fn new(shared: Arc<MountShared>) -> Self {
        Self {
            shared,
            resume_rate: parking_lot::Mutex::new(None),
        }
    }

    async fn controller(&self) -> Result<Arc<MotorController>> {
        self.shared
            .controller()
            .await
            .ok_or_else(|| anyhow!("Mount is not connected"))
    }
}

/// Bring a Stopping axis to Idle if the motor has actually stopped.
async fn settle(ctrl: &MotorController, state: &mut AxisState) -> Result<()> {
    if state.mode == AxisMode::Stopping && !ctrl.status(state.axis).await?.is_running() {
        state.mode = AxisMode::Idle;
    }
    Ok(())
}

async fn run_at(ctrl: &MotorController, state: &mut AxisState, rate: f64) -> Result<()> {
    configure_for_rate(ctrl, state, rate).await?;
    ctrl.start(state.axis).await?;
    Ok(())
}

#[async_trait]
impl GuideCapable for MountGuidePort {
    async fn start_pulse(&self, direction: GuideDirection, duration: Duration) -> Result<()> {
        let ctrl = self.controller().await?;
        let mut state = self.shared.lock().await;
        state.bind(&ctrl);
        if state.global != GlobalMode::Idle {
            bail!(REFUSED);
        }

        let guide_ra = state.guide_rate_ra / 100.0 * SIDEREAL_RATE;
        let guide_dec = state.guide_rate_dec / 100.0 * SIDEREAL_RATE;
        let axis = axis_of(direction.axis());
        let axis_state = state.axis_mut(axis);
        settle(&ctrl, axis_state).await?;

        match direction {
            GuideDirection::West | GuideDirection::East => {
                let tracking = axis_state.mode == AxisMode::Tracking
                    && axis_state.desired == AxisMode::Tracking;
                if !tracking && axis_state.mode != AxisMode::Idle {
                    bail!(REFUSED);
                }
                let base = if tracking { axis_state.desired_rate } else { 0.0 };
                let offset = if direction == GuideDirection::West {
                    guide_ra
                } else {
                    -guide_ra
                };
                // Southern tracking runs reverse; west still means faster.
                let sign = if base < 0.0 { -1.0 } else { 1.0 };
                let rate = base + sign * offset;
                if tracking {
                    if !update_rate_in_place(&ctrl, axis_state, rate).await? {
                        bail!("guide rate would reverse the RA motor");
                    }
                } else {
                    run_at(&ctrl, axis_state, rate).await?;
                }
                *self.resume_rate.lock() = tracking.then_some(base);
                axis_state.request(AxisMode::Guiding, rate);
                axis_state.mode = AxisMode::Guiding;
            }
            GuideDirection::North | GuideDirection::South => {
                if axis_state.mode != AxisMode::Idle {
                    bail!(REFUSED);
                }
                let rate = if direction == GuideDirection::North {
                    guide_dec
                } else {
                    -guide_dec
                };
                run_at(&ctrl, axis_state, rate).await?;
                axis_state.request(AxisMode::Guiding, rate);
                axis_state.mode = AxisMode::Guiding;
            }
        }
        tracing::debug!(?direction, ?duration, "guide pulse started");
        Ok(())
    }

    async fn end_pulse(&self, axis: GuideAxis) -> Result<()> {
        let ctrl = self.controller().await?;
        let mut state = self.shared.lock().await;
        state.bind(&ctrl);
        let axis_state = state.axis_mut(axis_of(axis));
        if axis_state.mode != AxisMode::Guiding {
            return Ok(());
        }

        let resume = match axis {
            GuideAxis::Ra => self.resume_rate.lock().take(),
            GuideAxis::Dec => None,
        };
        match resume {
            Some(rate) => {
                if !update_rate_in_place(&ctrl, axis_state, rate).await? {
                    ctrl.stop(axis_state.axis).await?;
                    axis_state.mode = AxisMode::Stopping;
                }
                axis_state.request(AxisMode::Tracking, rate);
                if axis_state.mode == AxisMode::Guiding {
                    axis_state.mode = AxisMode::Tracking;
                }
            }
            None => {
                ctrl.stop(axis_state.axis).await?;
                axis_state.mode = AxisMode::Stopping;
                axis_state.request(AxisMode::Idle, 0.0);
            }
        }
        tracing::debug!(?axis, "guide pulse ended");
        Ok(())
    }
}
