//! Mount-wide state shared by the mount and guider endpoints.
//!
//! Both endpoints run on their own dispatch queues, so everything they share
//! sits behind one async mutex: axis states, the global mode and the phase
//! of a running GOTO or park. Wire I/O for an axis transition happens while
//! this mutex is held; the port's own transaction lock nests inside it.

use crate::axis::{AxisMode, AxisState};
use crate::controller::MotorController;
use crate::coordinates::PierSide;
use crate::link::SynscanLink;
use crate::protocol::{Axis, SIDEREAL_RATE};
use astro_core::connection::SharedDevice;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GlobalMode {
    #[default]
    Idle,
    Slewing,
    Parking,
    Parked,
}

/// GOTO sequence, advanced by the slew timer every 0.25 s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GotoPhase {
    /// Pick a solution and start both axes.
    Start,
    /// RA arrived; re-aim it at where the target will be a few seconds from now.
    Refine,
    /// Wait for the refined RA slew.
    AwaitRa,
    /// Wait for sidereal time to reach the refined target, then track or idle.
    AwaitLst,
    /// Wait for DEC.
    AwaitDec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkPhase {
    Start,
    AwaitRa,
    AwaitDec,
}

#[derive(Debug, Clone)]
pub struct MountState {
    session: u64,
    pub global: GlobalMode,
    pub ra: AxisState,
    pub dec: AxisState,
    pub goto: Option<GotoPhase>,
    pub park: Option<ParkPhase>,
    /// GOTO target: RA hours, DEC degrees.
    pub goto_target: (f64, f64),
    /// Start tracking when the GOTO ends.
    pub track_after_goto: bool,
    pub target_lst: f64,
    pub pier_side: PierSide,
    /// Tracking rate, arcsec/s.
    pub track_rate: f64,
    /// Guide rates in percent of sidereal.
    pub guide_rate_ra: f64,
    pub guide_rate_dec: f64,
}

impl Default for MountState {
    fn default() -> Self {
        Self {
            session: 0,
            global: GlobalMode::Idle,
            ra: AxisState::new(Axis::Ra),
            dec: AxisState::new(Axis::Dec),
            goto: None,
            park: None,
            goto_target: (0.0, 0.0),
            track_after_goto: true,
            target_lst: 0.0,
            pier_side: PierSide::East,
            track_rate: SIDEREAL_RATE,
            guide_rate_ra: 50.0,
            guide_rate_dec: 50.0,
        }
    }
}

impl MountState {
    /// Attach to an open controller. The first endpoint to see a new
    /// controller session resets the axes; returns true in that case.
    pub fn bind(&mut self, controller: &MotorController) -> bool {
        if self.session == controller.session() {
            return false;
        }
        let Some(configuration) = controller.configuration() else {
            return false;
        };
        self.session = controller.session();
        self.ra.reset(configuration.ra);
        self.dec.reset(configuration.dec);
        self.global = GlobalMode::Idle;
        self.goto = None;
        self.park = None;
        true
    }

    pub fn is_bound_to(&self, controller: &MotorController) -> bool {
        self.session == controller.session()
    }

    pub fn axis_mut(&mut self, axis: Axis) -> &mut AxisState {
        match axis {
            Axis::Ra => &mut self.ra,
            Axis::Dec => &mut self.dec,
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.ra.desired == AxisMode::Tracking
    }

    /// Cancel any GOTO or park and bring both axes to Idle.
    pub fn cancel_motion(&mut self) {
        if matches!(self.global, GlobalMode::Slewing | GlobalMode::Parking) {
            self.global = GlobalMode::Idle;
        }
        self.goto = None;
        self.park = None;
        for axis in [&mut self.ra, &mut self.dec] {
            if axis.desired != AxisMode::Guiding {
                axis.request(AxisMode::Idle, 0.0);
            }
        }
    }
}

/// What the mount and guider endpoints of one controller share.
pub struct MountShared {
    device: Arc<SharedDevice<SynscanLink>>,
    state: Mutex<MountState>,
}

impl MountShared {
    pub fn new(device: Arc<SharedDevice<SynscanLink>>) -> Self {
        Self {
            device,
            state: Mutex::new(MountState::default()),
        }
    }

    pub fn device(&self) -> &Arc<SharedDevice<SynscanLink>> {
        &self.device
    }

    pub async fn lock(&self) -> MutexGuard<'_, MountState> {
        self.state.lock().await
    }

    /// Open controller, if any endpoint is connected.
    pub async fn controller(&self) -> Option<Arc<MotorController>> {
        self.device.handle().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_motion_idles_both_axes() {
        let mut state = MountState {
            global: GlobalMode::Parking,
            park: Some(ParkPhase::AwaitRa),
            ..MountState::default()
        };
        state.ra.slew_to(0.3);
        state.dec.slew_to(0.2);

        state.cancel_motion();
        assert_eq!(state.global, GlobalMode::Idle);
        assert_eq!(state.park, None);
        assert_eq!(state.ra.desired, AxisMode::Idle);
        assert_eq!(state.dec.desired, AxisMode::Idle);
    }

    #[test]
    fn cancel_motion_keeps_parked() {
        let mut state = MountState {
            global: GlobalMode::Parked,
            ..MountState::default()
        };
        state.cancel_motion();
        assert_eq!(state.global, GlobalMode::Parked);
    }
}
