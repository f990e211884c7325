//! Per-axis state machine.
//!
//! Handlers and slew phases only set the *desired* mode (plus rate or
//! target). [`axis_tick`], run every 250 ms per axis, is what moves the
//! actual mode towards it, one transition per tick:
//!
//! ```text
//!              ┌──────── Tracking / ManualSlewing ────────┐
//!              │ configure + :J                   :K      ▼
//!   Idle ──────┤                                      Stopping ──(motor stopped)──► Idle
//!    ▲         │ :G abs, :H, :M, :J                       ▲
//!    │         └──────────► Slewing ──(motor stopped)──► SlewIdle
//!    │                         │ :K (desired changed)     │
//!    │                         └──────────────────────────┘
//!    └──────────────────── SlewIdle (desired Idle) ◄──────┘
//! ```
//!
//! `Guiding` belongs to the guide port: the tick leaves such an axis alone.

use crate::controller::{AxisParameters, MotorController};
use crate::protocol::{Axis, Direction, ProtocolError, SpeedMode, SIDEREAL_RATE};

/// Rates above this (arcsec/s) use turbo gearing.
pub const TURBO_THRESHOLD: f64 = 128.0 * SIDEREAL_RATE;

/// Steps before the target at which a GOTO starts braking.
const SLOWDOWN_STEPS: i64 = 80_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AxisMode {
    #[default]
    Idle,
    Tracking,
    ManualSlewing,
    Slewing,
    SlewIdle,
    Stopping,
    Guiding,
}

impl AxisMode {
    pub fn is_continuous(self) -> bool {
        matches!(self, AxisMode::Tracking | AxisMode::ManualSlewing)
    }
}

/// Gearing and rate code last sent to an axis.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AxisConfig {
    pub valid: bool,
    pub direction: Direction,
    pub turbo: bool,
    /// Signed rate in arcsec/s.
    pub rate: f64,
    pub code: u32,
}

/// Configuration needed to move at `rate` arcsec/s (sign is direction).
pub fn config_for_rate(rate: f64, params: &AxisParameters) -> AxisConfig {
    let turbo = rate.abs() > TURBO_THRESHOLD;
    let mut speed = rate.abs();
    if turbo {
        speed /= f64::from(params.high_speed_ratio.max(1));
    }
    let steps_per_second = speed * f64::from(params.total_steps) / (3600.0 * 360.0);
    let code = if steps_per_second > 0.0 {
        (f64::from(params.timer_frequency) / steps_per_second)
            .round()
            .clamp(1.0, f64::from(0xFF_FFFFu32)) as u32
    } else {
        0xFF_FFFF
    };
    AxisConfig {
        valid: true,
        direction: Direction::of(rate),
        turbo,
        rate,
        code,
    }
}

/// Whether moving from `cached` to `required` needs a `:G` (motor stopped).
pub fn needs_reconfigure(required: &AxisConfig, cached: &AxisConfig) -> bool {
    required.turbo || !cached.valid || cached.direction != required.direction || cached.turbo
}

#[derive(Debug, Clone)]
pub struct AxisState {
    pub axis: Axis,
    pub mode: AxisMode,
    pub desired: AxisMode,
    /// Rate for Tracking / ManualSlewing, arcsec/s.
    pub desired_rate: f64,
    /// Encoder position for Slewing.
    pub target: f64,
    pub config: AxisConfig,
    pub params: AxisParameters,
}

impl AxisState {
    pub fn new(axis: Axis) -> Self {
        Self {
            axis,
            mode: AxisMode::Idle,
            desired: AxisMode::Idle,
            desired_rate: 0.0,
            target: 0.0,
            config: AxisConfig::default(),
            params: AxisParameters::default(),
        }
    }

    /// Fresh state for a newly opened controller.
    pub fn reset(&mut self, params: AxisParameters) {
        *self = Self {
            params,
            ..Self::new(self.axis)
        };
    }

    pub fn request(&mut self, mode: AxisMode, rate: f64) {
        self.desired = mode;
        self.desired_rate = rate;
    }

    pub fn slew_to(&mut self, target: f64) {
        self.desired = AxisMode::Slewing;
        self.target = target;
    }

    /// The last slew ended and nothing new was asked for.
    pub fn slew_complete(&self) -> bool {
        self.mode == AxisMode::SlewIdle && self.desired == AxisMode::SlewIdle
    }

    pub fn is_settled(&self) -> bool {
        self.mode == self.desired
            && (!self.mode.is_continuous() || self.config.rate == self.desired_rate)
    }
}

// =============================================================================
// Wire sequences
// =============================================================================

/// Send gearing (when needed) and rate code for `rate`. The motor must be
/// stopped if the gearing changes.
pub async fn configure_for_rate(
    ctrl: &MotorController,
    state: &mut AxisState,
    rate: f64,
) -> Result<(), ProtocolError> {
    let required = config_for_rate(rate, &state.params);
    let reconfigure = needs_reconfigure(&required, &state.config);
    state.config.valid = false;
    if reconfigure {
        let speed = if required.turbo {
            SpeedMode::HighSpeed
        } else {
            SpeedMode::LowSpeed
        };
        ctrl.set_gearing(state.axis, speed, required.direction).await?;
    }
    ctrl.set_rate_code(state.axis, required.code).await?;
    state.config = required;
    Ok(())
}

/// Change the rate of a running axis without stopping it. Returns false,
/// sending nothing, when the change needs new gearing.
pub async fn update_rate_in_place(
    ctrl: &MotorController,
    state: &mut AxisState,
    rate: f64,
) -> Result<bool, ProtocolError> {
    let required = config_for_rate(rate, &state.params);
    if needs_reconfigure(&required, &state.config) {
        return Ok(false);
    }
    state.config.valid = false;
    ctrl.set_rate_code(state.axis, required.code).await?;
    state.config = required;
    Ok(true)
}

/// Start an absolute move to encoder `position`. Does nothing if the axis
/// is already there.
pub async fn slew_to_position(
    ctrl: &MotorController,
    state: &mut AxisState,
    position: f64,
) -> Result<(), ProtocolError> {
    let axis = state.axis;
    let current = ctrl.position(axis).await?;
    let target = state.params.geometry().position_to_steps(position);
    let delta = target - current;
    if delta == 0 {
        return Ok(());
    }

    let direction = if delta < 0 {
        Direction::Reverse
    } else {
        Direction::Forward
    };
    let distance = delta.abs();
    let slowdown = match distance - SLOWDOWN_STEPS {
        s if s < 0 => distance / 2,
        s => s,
    };
    tracing::debug!(%axis, current, target, "absolute slew");

    state.config.valid = false;
    state.config.direction = direction;
    ctrl.set_gearing(axis, SpeedMode::AbsoluteSlew, direction).await?;
    ctrl.set_step_count(axis, distance).await?;
    ctrl.set_slowdown(axis, slowdown).await?;
    ctrl.start(axis).await
}

/// One transition of the axis towards its desired mode. A wire error leaves
/// the mode unchanged; the next tick retries.
pub async fn axis_tick(ctrl: &MotorController, state: &mut AxisState) -> Result<(), ProtocolError> {
    use AxisMode::*;

    let axis = state.axis;
    let before = state.mode;
    match (state.mode, state.desired) {
        (Guiding, _) | (_, Guiding) => {}
        (Stopping, _) => {
            if !ctrl.status(axis).await?.is_running() {
                state.mode = Idle;
            }
        }
        (Idle | SlewIdle, Tracking | ManualSlewing) => {
            configure_for_rate(ctrl, state, state.desired_rate).await?;
            ctrl.start(axis).await?;
            state.mode = state.desired;
        }
        (Idle | SlewIdle, Slewing) => {
            slew_to_position(ctrl, state, state.target).await?;
            state.mode = Slewing;
        }
        (SlewIdle, Idle) => state.mode = Idle,
        (Tracking | ManualSlewing, Idle | Slewing | SlewIdle) => {
            ctrl.stop(axis).await?;
            state.mode = Stopping;
        }
        (Tracking | ManualSlewing, Tracking | ManualSlewing) => {
            if state.config.rate != state.desired_rate || !state.config.valid {
                if update_rate_in_place(ctrl, state, state.desired_rate).await? {
                    state.mode = state.desired;
                } else {
                    ctrl.stop(axis).await?;
                    state.mode = Stopping;
                }
            } else {
                state.mode = state.desired;
            }
        }
        (Slewing, Slewing) => {
            if !ctrl.status(axis).await?.is_running() {
                state.mode = SlewIdle;
                state.desired = SlewIdle;
            }
        }
        (Slewing, _) => {
            ctrl.stop(axis).await?;
            state.mode = Stopping;
        }
        _ => {}
    }
    if state.mode != before {
        tracing::debug!(%axis, from = ?before, to = ?state.mode, desired = ?state.desired, "axis transition");
    }
    Ok(())
}
