//! Mount endpoint: GOTO, park, tracking, manual motion and sync.
//!
//! All motion goes through the axis state machine. Handlers validate the
//! request against the global mode, set desired axis modes and arm a phase
//! timer; the per-axis tick timers do the wire work.
//!
//! ```text
//! GOTO:  Start ─► Refine ─► AwaitRa ─► AwaitLst ─► AwaitDec ─► (track | idle)
//! Park:  Start ─► AwaitRa ─► AwaitDec ─► Parked
//! ```
//!
//! Every timer body and handler runs on the mount's dispatch queue and takes
//! the shared [`MountState`] lock for the duration of its step.

use crate::axis::{axis_tick, AxisMode};
use crate::controller::MotorController;
use crate::coordinates::{
    encoder_to_equatorial, equatorial_to_encoder, hours_to_radians, normalize_hours,
    radians_to_hours, KeepPierSide, PierSide, PierSideStrategy,
};
use crate::protocol::{
    format_firmware, mount_model, st4_rate_code, Axis, LUNAR_RATE, SIDEREAL_RATE, SOLAR_RATE,
};
use crate::sidereal::{hour_difference, SiderealClock};
use crate::state::{GlobalMode, GotoPhase, MountShared, MountState, ParkPhase};
use anyhow::{Context, Result};
use astro_core::capabilities::{AxisCapable, Connectable};
use astro_core::connection::{handle_connection_change, ConnectionMachine};
use astro_core::driver::DriverContext;
use astro_core::endpoint::{self, Endpoint, EndpointContext, EndpointKind, PropertyChange};
use astro_core::error::AstroError;
use astro_core::property::{
    names, Item, ItemUpdate, Property, PropertyKind, PropertyState, SwitchRule,
};
use astro_core::timer::{cancel_slot, DispatchQueue, Scheduler, TimerAction, TimerHandle};
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

const AXIS_TICK: Duration = Duration::from_millis(250);
const POSITION_INTERVAL: Duration = Duration::from_millis(500);
const PHASE_INTERVAL: Duration = Duration::from_millis(250);
const TRACKING_CHECK: Duration = Duration::from_millis(250);
const TRACKING_ATTEMPTS: u32 = 20;
/// How far ahead of the current sidereal time the refined GOTO aims, in seconds.
const GOTO_LEAD_SECONDS: f64 = 5.0;

const WARN_PARKED: &str = "Mount is parked, please unpark!";
const WARN_PARKING: &str = "Mount parking is in progress, please wait until complete!";
const MOUNT_BUSY: &str = "Mount busy!";
const TRACKING_REFUSED: &str = "Tracking change refused - mount busy!";
const NOT_CONNECTED: &str = "Mount is not connected";

/// Manual slew rates in multiples of sidereal, indexed by slew speed.
const RA_SLEW_RATES: [f64; 10] = [1.25, 2.0, 8.0, 16.0, 32.0, 70.0, 100.0, 625.0, 725.0, 825.0];
const DEC_SLEW_RATES: [f64; 10] = [0.5, 1.0, 8.0, 16.0, 32.0, 70.0, 100.0, 625.0, 725.0, 825.0];

/// Site and park defaults, from the driver config.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MountSettings {
    pub latitude: f64,
    pub longitude: f64,
    /// Park hour angle in hours.
    pub park_ha: f64,
    /// Park declination in degrees.
    pub park_dec: f64,
    /// Guide rate, percent of sidereal.
    pub guide_rate: f64,
}

impl Default for MountSettings {
    fn default() -> Self {
        Self {
            latitude: 0.0,
            longitude: 0.0,
            park_ha: 6.0,
            park_dec: 90.0,
            guide_rate: 50.0,
        }
    }
}

fn slew_speed_index(item: &str) -> usize {
    match item {
        names::MOUNT_SLEW_RATE_GUIDE => 1,
        names::MOUNT_SLEW_RATE_CENTERING => 4,
        names::MOUNT_SLEW_RATE_FIND => 6,
        _ => 9,
    }
}

fn track_rate_of(item: &str) -> f64 {
    match item {
        names::MOUNT_TRACK_RATE_SOLAR => SOLAR_RATE,
        names::MOUNT_TRACK_RATE_LUNAR => LUNAR_RATE,
        _ => SIDEREAL_RATE,
    }
}

#[derive(Default)]
struct MountTimers {
    ra_tick: Option<TimerHandle>,
    dec_tick: Option<TimerHandle>,
    position: Option<TimerHandle>,
    goto: Option<TimerHandle>,
    park: Option<TimerHandle>,
    tracking: Option<TimerHandle>,
}

impl MountTimers {
    fn cancel_all(&mut self) {
        for slot in [
            &mut self.ra_tick,
            &mut self.dec_tick,
            &mut self.position,
            &mut self.goto,
            &mut self.park,
            &mut self.tracking,
        ] {
            cancel_slot(slot);
        }
    }
}

struct MountInner {
    name: String,
    queue: DispatchQueue,
    ctx: EndpointContext,
    scheduler: Scheduler,
    connection: ConnectionMachine,
    shared: Arc<MountShared>,
    controller: parking_lot::RwLock<Option<Arc<MotorController>>>,
    clock: Arc<dyn SiderealClock>,
    strategy: Arc<dyn PierSideStrategy>,
    settings: MountSettings,
    timers: parking_lot::Mutex<MountTimers>,
    tracking_attempts: AtomicU32,
}

/// SynScan mount endpoint.
#[derive(Clone)]
pub struct MountEndpoint {
    inner: Arc<MountInner>,
}

impl MountEndpoint {
    pub fn new(
        name: &str,
        context: &DriverContext,
        shared: Arc<MountShared>,
        settings: MountSettings,
        clock: Arc<dyn SiderealClock>,
        strategy: Arc<dyn PierSideStrategy>,
    ) -> Self {
        let ctx = EndpointContext::new(name, context.store.clone());
        Self {
            inner: Arc::new(MountInner {
                name: name.to_string(),
                queue: DispatchQueue::new(name),
                connection: ConnectionMachine::new(ctx.clone()),
                ctx,
                scheduler: context.scheduler.clone(),
                shared,
                controller: parking_lot::RwLock::new(None),
                clock,
                strategy,
                settings,
                timers: parking_lot::Mutex::new(MountTimers::default()),
                tracking_attempts: AtomicU32::new(0),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    pub fn shared(&self) -> &Arc<MountShared> {
        &self.inner.shared
    }
}

// =============================================================================
// Properties
// =============================================================================

fn switches(name: &str, label: &str, rule: SwitchRule, items: &[(&str, &str, bool)]) -> Property {
    items.iter().fold(
        Property::new(name, label, PropertyKind::Switch).with_rule(rule),
        |prop, (item, item_label, on)| prop.with_item(Item::switch(item, item_label, *on)),
    )
}

impl MountInner {
    fn define_properties(&self) -> Result<()> {
        let s = &self.settings;
        self.ctx.define(
            Property::new(names::MOUNT_INFO, "Mount info", PropertyKind::Text)
                .read_only()
                .with_item(Item::text(names::MOUNT_INFO_VENDOR, "Vendor", "Sky-Watcher"))
                .with_item(Item::text(names::MOUNT_INFO_MODEL, "Model", ""))
                .with_item(Item::text(names::MOUNT_INFO_FIRMWARE, "Firmware", "")),
        )?;
        self.ctx.define(
            Property::new(names::MOUNT_GEOGRAPHIC_COORDINATES, "Location", PropertyKind::Number)
                .with_item(Item::number(
                    names::MOUNT_GEOGRAPHIC_LATITUDE,
                    "Latitude (-90 to +90° +N)",
                    -90.0,
                    90.0,
                    s.latitude,
                ))
                .with_item(Item::number(
                    names::MOUNT_GEOGRAPHIC_LONGITUDE,
                    "Longitude (0 to 360° +E)",
                    -180.0,
                    360.0,
                    s.longitude,
                )),
        )?;
        self.ctx.define(
            Property::new(names::MOUNT_EQUATORIAL_COORDINATES, "Equatorial EOD coordinates", PropertyKind::Number)
                .with_item(Item::number(names::MOUNT_EQUATORIAL_RA, "Right ascension (0 to 24 hrs)", 0.0, 24.0, 0.0))
                .with_item(Item::number(names::MOUNT_EQUATORIAL_DEC, "Declination (-90° to 90°)", -90.0, 90.0, 90.0)),
        )?;
        self.ctx.define(switches(
            names::MOUNT_ON_COORDINATES_SET,
            "On coordinates set",
            SwitchRule::OneOfMany,
            &[
                (names::MOUNT_ON_COORDINATES_SET_TRACK, "Slew and track", true),
                (names::MOUNT_ON_COORDINATES_SET_SLEW, "Slew", false),
                (names::MOUNT_ON_COORDINATES_SET_SYNC, "Sync", false),
            ],
        ))?;
        self.ctx.define(switches(
            names::MOUNT_TRACKING,
            "Tracking",
            SwitchRule::OneOfMany,
            &[
                (names::MOUNT_TRACKING_ON, "On", false),
                (names::MOUNT_TRACKING_OFF, "Off", true),
            ],
        ))?;
        self.ctx.define(switches(
            names::MOUNT_TRACK_RATE,
            "Track rate",
            SwitchRule::OneOfMany,
            &[
                (names::MOUNT_TRACK_RATE_SIDEREAL, "Sidereal rate", true),
                (names::MOUNT_TRACK_RATE_SOLAR, "Solar rate", false),
                (names::MOUNT_TRACK_RATE_LUNAR, "Lunar rate", false),
            ],
        ))?;
        self.ctx.define(switches(
            names::MOUNT_SLEW_RATE,
            "Slew rate",
            SwitchRule::OneOfMany,
            &[
                (names::MOUNT_SLEW_RATE_GUIDE, "Guide rate", false),
                (names::MOUNT_SLEW_RATE_CENTERING, "Centering rate", false),
                (names::MOUNT_SLEW_RATE_FIND, "Find rate", false),
                (names::MOUNT_SLEW_RATE_MAX, "Max rate", true),
            ],
        ))?;
        self.ctx.define(switches(
            names::MOUNT_MOTION_DEC,
            "Move N/S",
            SwitchRule::AtMostOne,
            &[
                (names::MOUNT_MOTION_NORTH, "North", false),
                (names::MOUNT_MOTION_SOUTH, "South", false),
            ],
        ))?;
        self.ctx.define(switches(
            names::MOUNT_MOTION_RA,
            "Move W/E",
            SwitchRule::AtMostOne,
            &[
                (names::MOUNT_MOTION_WEST, "West", false),
                (names::MOUNT_MOTION_EAST, "East", false),
            ],
        ))?;
        self.ctx.define(switches(
            names::MOUNT_ABORT_MOTION,
            "Abort motion",
            SwitchRule::AtMostOne,
            &[(names::MOUNT_ABORT_MOTION_ITEM, "Abort motion", false)],
        ))?;
        self.ctx.define(switches(
            names::MOUNT_PARK,
            "Park",
            SwitchRule::OneOfMany,
            &[
                (names::MOUNT_PARK_PARKED, "Mount parked", false),
                (names::MOUNT_PARK_UNPARKED, "Mount unparked", true),
            ],
        ))?;
        self.ctx.define(
            Property::new(names::MOUNT_PARK_POSITION, "Park position", PropertyKind::Number)
                .with_item(Item::number(names::MOUNT_PARK_POSITION_HA, "Hour angle (-12 to 12 hrs)", -12.0, 12.0, s.park_ha))
                .with_item(Item::number(names::MOUNT_PARK_POSITION_DEC, "Declination (-90° to 90°)", -90.0, 90.0, s.park_dec)),
        )?;
        self.ctx.define(
            Property::new(names::MOUNT_GUIDE_RATE, "Guide rate", PropertyKind::Number)
                .with_item(Item::number(names::MOUNT_GUIDE_RATE_RA, "RA (% of sidereal)", 10.0, 90.0, s.guide_rate))
                .with_item(Item::number(names::MOUNT_GUIDE_RATE_DEC, "DEC (% of sidereal)", 10.0, 90.0, s.guide_rate)),
        )?;
        Ok(())
    }

    fn polarscope_property() -> Property {
        Property::new(names::MOUNT_POLARSCOPE, "Polarscope", PropertyKind::Number).with_item(
            Item::number(names::MOUNT_POLARSCOPE_BRIGHTNESS, "Brightness", 0.0, 255.0, 0.0),
        )
    }

    fn site(&self) -> (f64, f64) {
        let latitude = self
            .ctx
            .value(names::MOUNT_GEOGRAPHIC_COORDINATES, names::MOUNT_GEOGRAPHIC_LATITUDE)
            .unwrap_or(self.settings.latitude);
        let longitude = self
            .ctx
            .value(names::MOUNT_GEOGRAPHIC_COORDINATES, names::MOUNT_GEOGRAPHIC_LONGITUDE)
            .unwrap_or(self.settings.longitude);
        (latitude, longitude)
    }

    fn controller(&self) -> Option<Arc<MotorController>> {
        self.controller.read().clone()
    }

    fn tracking_on(&self) -> bool {
        self.ctx.is_on(names::MOUNT_TRACKING, names::MOUNT_TRACKING_ON)
    }

    fn show_tracking(&self, on: bool, message: Option<&str>) {
        let item = if on {
            names::MOUNT_TRACKING_ON
        } else {
            names::MOUNT_TRACKING_OFF
        };
        self.ctx
            .set_values(names::MOUNT_TRACKING, &[ItemUpdate::switch(item, true)]);
        self.ctx.ok(names::MOUNT_TRACKING, message);
    }

    fn show_parked(&self, parked: bool) {
        let item = if parked {
            names::MOUNT_PARK_PARKED
        } else {
            names::MOUNT_PARK_UNPARKED
        };
        self.ctx
            .set_values(names::MOUNT_PARK, &[ItemUpdate::switch(item, true)]);
    }

    /// Signed sidereal-direction rate for this hemisphere.
    fn signed_rate(&self, rate: f64) -> f64 {
        if self.site().0 < 0.0 {
            -rate
        } else {
            rate
        }
    }

    /// Reject motion requests while parked or parking. Publishes the ALERT.
    fn refuse_when_parked(&self, state: &MountState, property: &str) -> bool {
        match state.global {
            GlobalMode::Parked => {
                self.ctx.alert(property, WARN_PARKED);
                true
            }
            GlobalMode::Parking => {
                self.ctx.alert(property, WARN_PARKING);
                true
            }
            _ => false,
        }
    }

    fn schedule<F, Fut>(self: &Arc<Self>, delay: Duration, body: F) -> TimerHandle
    where
        F: Fn(Arc<MountInner>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TimerAction> + Send + 'static,
    {
        let inner = self.clone();
        self.scheduler
            .schedule(&self.queue, delay, move || body(inner.clone()))
    }
}

// =============================================================================
// Connection
// =============================================================================

impl MountInner {
    async fn connect(self: &Arc<Self>) -> Result<()> {
        let controller = self.shared.device().acquire().await?;
        let Some(configuration) = controller.configuration() else {
            self.shared.device().release().await;
            anyhow::bail!("controller was opened without configuration");
        };

        {
            let mut state = self.shared.lock().await;
            state.bind(&controller);
            if self.ctx.is_on(names::MOUNT_PARK, names::MOUNT_PARK_PARKED) {
                state.global = GlobalMode::Parked;
            }
            let rate_item = self
                .ctx
                .get(names::MOUNT_TRACK_RATE)
                .and_then(|p| p.first_on().map(str::to_string))
                .unwrap_or_default();
            state.track_rate = track_rate_of(&rate_item);
            state.guide_rate_ra = self
                .ctx
                .value(names::MOUNT_GUIDE_RATE, names::MOUNT_GUIDE_RATE_RA)
                .unwrap_or(self.settings.guide_rate);
            state.guide_rate_dec = self
                .ctx
                .value(names::MOUNT_GUIDE_RATE, names::MOUNT_GUIDE_RATE_DEC)
                .unwrap_or(self.settings.guide_rate);
        }
        *self.controller.write() = Some(controller);

        self.ctx.set_values(
            names::MOUNT_INFO,
            &[
                ItemUpdate::text(names::MOUNT_INFO_MODEL, mount_model(configuration.firmware)),
                ItemUpdate::text(
                    names::MOUNT_INFO_FIRMWARE,
                    &format_firmware(configuration.firmware),
                ),
            ],
        );
        self.ctx.ok(names::MOUNT_INFO, None);
        if configuration.polarscope && !self.ctx.is_defined(names::MOUNT_POLARSCOPE) {
            self.ctx.define(Self::polarscope_property())?;
        }

        let mut timers = self.timers.lock();
        timers.ra_tick = Some(self.schedule(AXIS_TICK, |inner| async move {
            inner.axis_step(Axis::Ra).await
        }));
        timers.dec_tick = Some(self.schedule(AXIS_TICK, |inner| async move {
            inner.axis_step(Axis::Dec).await
        }));
        timers.position = Some(self.schedule(Duration::ZERO, |inner| async move {
            inner.position_step().await
        }));
        tracing::info!(endpoint = %self.name, "connected to mount!");
        Ok(())
    }

    async fn disconnect(&self) {
        self.timers.lock().cancel_all();
        {
            let mut state = self.shared.lock().await;
            if matches!(state.global, GlobalMode::Slewing | GlobalMode::Parking) {
                state.cancel_motion();
            }
        }
        *self.controller.write() = None;
        if self.ctx.is_defined(names::MOUNT_POLARSCOPE) {
            if let Err(e) = self.ctx.undefine(names::MOUNT_POLARSCOPE) {
                tracing::warn!(endpoint = %self.name, error = %e, "undefine polarscope failed");
            }
        }
        self.shared.device().release().await;
    }
}

#[async_trait]
impl Connectable for MountEndpoint {
    async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.disconnect().await;
        Ok(())
    }
}

// =============================================================================
// Timer bodies
// =============================================================================

impl MountInner {
    async fn axis_step(&self, axis: Axis) -> TimerAction {
        let Some(controller) = self.controller() else {
            return TimerAction::Done;
        };
        let mut state = self.shared.lock().await;
        state.bind(&controller);
        if let Err(e) = axis_tick(&controller, state.axis_mut(axis)).await {
            tracing::warn!(endpoint = %self.name, %axis, error = %e, "axis tick failed");
        }
        TimerAction::Reschedule(AXIS_TICK)
    }

    async fn position_step(&self) -> TimerAction {
        let Some(controller) = self.controller() else {
            return TimerAction::Done;
        };
        let (parked, moving, ra_geometry, dec_geometry) = {
            let state = self.shared.lock().await;
            (
                state.global == GlobalMode::Parked,
                state.goto.is_some(),
                state.ra.params.geometry(),
                state.dec.params.geometry(),
            )
        };
        if parked {
            return TimerAction::Reschedule(POSITION_INTERVAL);
        }

        let positions = async {
            let dec = controller.position(Axis::Dec).await?;
            let ra = controller.position(Axis::Ra).await?;
            Ok::<_, crate::protocol::ProtocolError>((ra, dec))
        };
        let (ra_steps, dec_steps) = match positions.await {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(endpoint = %self.name, error = %e, "position read failed");
                return TimerAction::Reschedule(POSITION_INTERVAL);
            }
        };

        let (latitude, longitude) = self.site();
        let (ha, dec) = encoder_to_equatorial(
            ra_geometry.steps_to_position(ra_steps),
            dec_geometry.steps_to_position(dec_steps),
            latitude,
        );
        let lst = self.clock.local_sidereal_time(longitude);
        let ra = normalize_hours(lst - radians_to_hours(ha));
        self.ctx.set_values(
            names::MOUNT_EQUATORIAL_COORDINATES,
            &[
                ItemUpdate::value(names::MOUNT_EQUATORIAL_RA, ra),
                ItemUpdate::value(names::MOUNT_EQUATORIAL_DEC, dec.to_degrees()),
            ],
        );

        let property = names::MOUNT_EQUATORIAL_COORDINATES;
        if moving {
            self.ctx.busy(property);
        } else if self.ctx.state(property) == PropertyState::Busy {
            self.ctx.ok(property, None);
        } else {
            self.ctx.publish(property);
        }
        TimerAction::Reschedule(POSITION_INTERVAL)
    }

    async fn goto_step(&self) -> TimerAction {
        let Some(controller) = self.controller() else {
            return TimerAction::Done;
        };
        let (latitude, longitude) = self.site();
        let mut state = self.shared.lock().await;
        state.bind(&controller);
        let Some(phase) = state.goto else {
            return TimerAction::Done;
        };
        let lst = self.clock.local_sidereal_time(longitude);
        let (ra, dec) = state.goto_target;
        let dec = dec.to_radians();

        match phase {
            GotoPhase::Start => {
                let ha = hours_to_radians(lst - ra);
                let solutions = equatorial_to_encoder(ha, dec, latitude);
                let chosen = solutions[self.strategy.select(&solutions)];
                state.pier_side = chosen.pier_side();
                state.ra.slew_to(chosen.ha);
                state.dec.slew_to(chosen.dec);
                tracing::debug!(endpoint = %self.name, ?chosen, pier_side = ?state.pier_side, "GOTO started");
                state.goto = Some(GotoPhase::Refine);
            }
            GotoPhase::Refine => {
                if state.ra.slew_complete() {
                    state.target_lst = normalize_hours(lst + GOTO_LEAD_SECONDS / 3600.0);
                    let ha = hours_to_radians(state.target_lst - ra);
                    let solutions = equatorial_to_encoder(ha, dec, latitude);
                    let refined = solutions[KeepPierSide(state.pier_side).select(&solutions)];
                    state.ra.slew_to(refined.ha);
                    state.goto = Some(GotoPhase::AwaitRa);
                }
            }
            GotoPhase::AwaitRa => {
                if state.ra.slew_complete() {
                    state.goto = Some(GotoPhase::AwaitLst);
                }
            }
            GotoPhase::AwaitLst => {
                if hour_difference(lst, state.target_lst) >= 0.0 {
                    if state.track_after_goto {
                        let rate = self.signed_rate(state.track_rate);
                        state.ra.request(AxisMode::Tracking, rate);
                    } else {
                        state.ra.request(AxisMode::Idle, 0.0);
                    }
                    state.goto = Some(GotoPhase::AwaitDec);
                }
            }
            GotoPhase::AwaitDec => {
                if state.dec.slew_complete() {
                    state.dec.request(AxisMode::Idle, 0.0);
                    state.goto = None;
                    state.global = GlobalMode::Idle;
                    let tracking = state.track_after_goto;
                    drop(state);

                    self.timers.lock().goto.take();
                    self.show_tracking(tracking, None);
                    self.ctx
                        .ok(names::MOUNT_EQUATORIAL_COORDINATES, Some("Slew complete."));
                    tracing::info!(endpoint = %self.name, tracking, "GOTO finished");
                    return TimerAction::Done;
                }
            }
        }
        TimerAction::Reschedule(PHASE_INTERVAL)
    }

    async fn park_step(&self) -> TimerAction {
        let Some(controller) = self.controller() else {
            return TimerAction::Done;
        };
        let mut state = self.shared.lock().await;
        state.bind(&controller);
        let Some(phase) = state.park else {
            return TimerAction::Done;
        };

        match phase {
            ParkPhase::Start => {
                let ha = self
                    .ctx
                    .value(names::MOUNT_PARK_POSITION, names::MOUNT_PARK_POSITION_HA)
                    .unwrap_or(self.settings.park_ha);
                let dec = self
                    .ctx
                    .value(names::MOUNT_PARK_POSITION, names::MOUNT_PARK_POSITION_DEC)
                    .unwrap_or(self.settings.park_dec);
                let [solution, _] =
                    equatorial_to_encoder(hours_to_radians(ha), dec.to_radians(), self.site().0);
                state.ra.slew_to(solution.ha);
                state.dec.slew_to(solution.dec);
                state.park = Some(ParkPhase::AwaitRa);
            }
            ParkPhase::AwaitRa => {
                if state.ra.slew_complete() {
                    state.ra.request(AxisMode::Idle, 0.0);
                    state.park = Some(ParkPhase::AwaitDec);
                }
            }
            ParkPhase::AwaitDec => {
                if state.dec.slew_complete() {
                    state.dec.request(AxisMode::Idle, 0.0);
                    state.park = None;
                    state.global = GlobalMode::Parked;
                    drop(state);

                    self.timers.lock().park.take();
                    self.show_parked(true);
                    self.ctx.ok(names::MOUNT_PARK, Some("Mount Parked."));
                    tracing::info!(endpoint = %self.name, "mount parked");
                    return TimerAction::Done;
                }
            }
        }
        TimerAction::Reschedule(PHASE_INTERVAL)
    }

    /// Wait for RA to settle after a tracking change.
    async fn tracking_step(&self) -> TimerAction {
        let (settled, on) = {
            let state = self.shared.lock().await;
            (state.ra.is_settled(), state.is_tracking())
        };
        if settled {
            self.timers.lock().tracking.take();
            let message = if on { "Tracking started" } else { "Tracking stopped" };
            self.ctx.ok(names::MOUNT_TRACKING, Some(message));
            return TimerAction::Done;
        }
        let attempts = self.tracking_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempts >= TRACKING_ATTEMPTS || self.controller().is_none() {
            self.timers.lock().tracking.take();
            let message = if on {
                "Failed to start tracking"
            } else {
                "Failed to stop tracking"
            };
            self.ctx.alert(names::MOUNT_TRACKING, message);
            return TimerAction::Done;
        }
        TimerAction::Reschedule(TRACKING_CHECK)
    }
}

// =============================================================================
// Handlers
// =============================================================================

impl MountInner {
    async fn on_coordinates(self: &Arc<Self>, change: &PropertyChange) -> Result<()> {
        let property = names::MOUNT_EQUATORIAL_COORDINATES;
        let Some(controller) = self.controller() else {
            self.ctx.alert(property, NOT_CONNECTED);
            return Ok(());
        };
        let current = self.ctx.get(property);
        let ra = change
            .requested(names::MOUNT_EQUATORIAL_RA)
            .or_else(|| current.as_ref().and_then(|p| p.target(names::MOUNT_EQUATORIAL_RA)))
            .unwrap_or(0.0);
        let dec = change
            .requested(names::MOUNT_EQUATORIAL_DEC)
            .or_else(|| current.as_ref().and_then(|p| p.target(names::MOUNT_EQUATORIAL_DEC)))
            .unwrap_or(0.0);
        if !(0.0..=24.0).contains(&ra) || !(-90.0..=90.0).contains(&dec) {
            self.ctx.alert(property, "Coordinates out of range");
            return Ok(());
        }

        let mut state = self.shared.lock().await;
        state.bind(&controller);
        if self.refuse_when_parked(&state, property) {
            return Ok(());
        }
        if state.global != GlobalMode::Idle {
            drop(state);
            self.ctx.alert(property, MOUNT_BUSY);
            return Ok(());
        }

        if self
            .ctx
            .is_on(names::MOUNT_ON_COORDINATES_SET, names::MOUNT_ON_COORDINATES_SET_SYNC)
        {
            return self.sync(&controller, &mut state, ra, dec).await;
        }

        self.ctx.set_values(
            property,
            &[
                ItemUpdate::target(names::MOUNT_EQUATORIAL_RA, ra),
                ItemUpdate::target(names::MOUNT_EQUATORIAL_DEC, dec),
            ],
        );
        state.goto_target = (ra, dec);
        state.track_after_goto = self
            .ctx
            .is_on(names::MOUNT_ON_COORDINATES_SET, names::MOUNT_ON_COORDINATES_SET_TRACK);
        state.global = GlobalMode::Slewing;
        state.goto = Some(GotoPhase::Start);
        drop(state);

        self.ctx.update(property, PropertyState::Busy, Some("Slewing..."));
        tracing::info!(endpoint = %self.name, ra, dec, "GOTO requested");
        let handle = self.schedule(Duration::ZERO, |inner| async move { inner.goto_step().await });
        let mut timers = self.timers.lock();
        cancel_slot(&mut timers.goto);
        timers.goto = Some(handle);
        Ok(())
    }

    /// Rewrite both axis positions so the mount reads `ra`/`dec`, keeping the
    /// current pier side.
    async fn sync(
        &self,
        controller: &MotorController,
        state: &mut MountState,
        ra: f64,
        dec: f64,
    ) -> Result<()> {
        let property = names::MOUNT_EQUATORIAL_COORDINATES;
        let (latitude, longitude) = self.site();
        let lst = self.clock.local_sidereal_time(longitude);
        let solutions = equatorial_to_encoder(hours_to_radians(lst - ra), dec.to_radians(), latitude);

        let result = async {
            let dec_steps = controller.position(Axis::Dec).await?;
            let side = PierSide::of_dec_position(state.dec.params.geometry().steps_to_position(dec_steps));
            let solution = solutions[KeepPierSide(side).select(&solutions)];
            controller
                .set_position(Axis::Ra, state.ra.params.geometry().position_to_steps(solution.ha))
                .await?;
            controller
                .set_position(Axis::Dec, state.dec.params.geometry().position_to_steps(solution.dec))
                .await
        }
        .await;

        match result {
            Ok(()) => {
                self.ctx.set_values(
                    property,
                    &[
                        ItemUpdate::number(names::MOUNT_EQUATORIAL_RA, ra),
                        ItemUpdate::number(names::MOUNT_EQUATORIAL_DEC, dec),
                    ],
                );
                self.ctx.ok(property, Some("Synced."));
                tracing::info!(endpoint = %self.name, ra, dec, "synced");
            }
            Err(e) => self.ctx.alert(property, &format!("Sync failed: {e}")),
        }
        Ok(())
    }

    async fn on_tracking(self: &Arc<Self>, change: &PropertyChange) -> Result<()> {
        let property = names::MOUNT_TRACKING;
        if self.ctx.state(property) == PropertyState::Busy {
            return Ok(());
        }
        let on = if change.is_on(names::MOUNT_TRACKING_ON) {
            true
        } else if change.is_on(names::MOUNT_TRACKING_OFF) {
            false
        } else {
            return Ok(());
        };
        let Some(controller) = self.controller() else {
            self.ctx.alert(property, NOT_CONNECTED);
            return Ok(());
        };

        let mut state = self.shared.lock().await;
        state.bind(&controller);
        if state.global != GlobalMode::Idle {
            drop(state);
            self.ctx.alert(property, TRACKING_REFUSED);
            return Ok(());
        }
        if on {
            let rate = self.signed_rate(state.track_rate);
            state.ra.request(AxisMode::Tracking, rate);
        } else {
            state.ra.request(AxisMode::Idle, 0.0);
        }
        drop(state);

        self.ctx.apply(change)?;
        self.ctx.busy(property);
        self.tracking_attempts.store(0, Ordering::SeqCst);
        let handle = self.schedule(TRACKING_CHECK, |inner| async move {
            inner.tracking_step().await
        });
        let mut timers = self.timers.lock();
        cancel_slot(&mut timers.tracking);
        timers.tracking = Some(handle);
        Ok(())
    }

    async fn on_track_rate(&self, change: &PropertyChange) -> Result<()> {
        self.ctx.apply(change)?;
        let item = self
            .ctx
            .get(names::MOUNT_TRACK_RATE)
            .and_then(|p| p.first_on().map(str::to_string))
            .unwrap_or_default();
        let rate = track_rate_of(&item);
        {
            let mut state = self.shared.lock().await;
            state.track_rate = rate;
            if state.ra.desired == AxisMode::Tracking {
                state.ra.desired_rate = self.signed_rate(rate);
            }
        }
        self.ctx.ok(names::MOUNT_TRACK_RATE, None);
        Ok(())
    }

    fn slew_rate(&self, axis: Axis) -> f64 {
        let item = self
            .ctx
            .get(names::MOUNT_SLEW_RATE)
            .and_then(|p| p.first_on().map(str::to_string))
            .unwrap_or_default();
        let index = slew_speed_index(&item);
        let table = match axis {
            Axis::Ra => &RA_SLEW_RATES,
            Axis::Dec => &DEC_SLEW_RATES,
        };
        table[index] * SIDEREAL_RATE
    }

    async fn on_slew_rate(&self, change: &PropertyChange) -> Result<()> {
        self.ctx.apply(change)?;
        {
            let mut state = self.shared.lock().await;
            for axis in Axis::BOTH {
                let rate = self.slew_rate(axis);
                let axis_state = state.axis_mut(axis);
                if axis_state.desired == AxisMode::ManualSlewing {
                    axis_state.desired_rate = rate.copysign(axis_state.desired_rate);
                }
            }
        }
        let index = self
            .ctx
            .get(names::MOUNT_SLEW_RATE)
            .and_then(|p| p.first_on().map(slew_speed_index))
            .unwrap_or(9);
        self.ctx
            .ok(names::MOUNT_SLEW_RATE, Some(&format!("slew speed = {index}")));
        Ok(())
    }

    async fn on_motion(&self, change: &PropertyChange, axis: Axis) -> Result<()> {
        let (property, positive, negative) = match axis {
            // West is the positive RA direction; north is negative on DEC.
            Axis::Ra => (names::MOUNT_MOTION_RA, names::MOUNT_MOTION_WEST, names::MOUNT_MOTION_EAST),
            Axis::Dec => (names::MOUNT_MOTION_DEC, names::MOUNT_MOTION_SOUTH, names::MOUNT_MOTION_NORTH),
        };
        let Some(controller) = self.controller() else {
            self.ctx.alert(property, NOT_CONNECTED);
            return Ok(());
        };

        let mut state = self.shared.lock().await;
        state.bind(&controller);
        if self.refuse_when_parked(&state, property) {
            return Ok(());
        }
        if state.global == GlobalMode::Slewing {
            drop(state);
            self.ctx.alert(property, MOUNT_BUSY);
            return Ok(());
        }
        self.ctx.apply(change)?;

        let rate = self.slew_rate(axis);
        let direction = if self.ctx.is_on(property, positive) {
            Some((rate, positive))
        } else if self.ctx.is_on(property, negative) {
            Some((-rate, negative))
        } else {
            None
        };

        match direction {
            Some((signed, item)) => {
                state.axis_mut(axis).request(AxisMode::ManualSlewing, signed);
                drop(state);
                let label = match item {
                    names::MOUNT_MOTION_NORTH => "North",
                    names::MOUNT_MOTION_SOUTH => "South",
                    names::MOUNT_MOTION_WEST => "West",
                    _ => "East",
                };
                self.ctx
                    .update(property, PropertyState::Busy, Some(&format!("Moving {label}...")));
            }
            None => {
                if axis == Axis::Ra && self.tracking_on() {
                    let rate = self.signed_rate(state.track_rate);
                    state.ra.request(AxisMode::Tracking, rate);
                } else {
                    state.axis_mut(axis).request(AxisMode::Idle, 0.0);
                }
                drop(state);
                self.ctx.ok(property, Some("Stopped moving."));
            }
        }
        Ok(())
    }

    async fn on_abort(&self, change: &PropertyChange) -> Result<()> {
        let property = names::MOUNT_ABORT_MOTION;
        if !change.is_on(names::MOUNT_ABORT_MOTION_ITEM) {
            self.ctx.ok(property, None);
            return Ok(());
        }
        let Some(controller) = self.controller() else {
            self.ctx.alert(property, NOT_CONNECTED);
            return Ok(());
        };
        {
            let mut timers = self.timers.lock();
            cancel_slot(&mut timers.goto);
            cancel_slot(&mut timers.park);
            cancel_slot(&mut timers.tracking);
        }

        let was_parking;
        {
            let mut state = self.shared.lock().await;
            state.bind(&controller);
            was_parking = state.global == GlobalMode::Parking;
            state.cancel_motion();
            for axis in Axis::BOTH {
                if state.axis_mut(axis).mode == AxisMode::Guiding {
                    continue;
                }
                if let Err(e) = controller.instant_stop(axis).await {
                    tracing::warn!(endpoint = %self.name, %axis, error = %e, "instant stop failed");
                }
            }
        }

        for motion in [names::MOUNT_MOTION_RA, names::MOUNT_MOTION_DEC] {
            let items: Vec<ItemUpdate> = self
                .ctx
                .get(motion)
                .map(|p| p.items.iter().map(|i| ItemUpdate::switch(&i.name, false)).collect())
                .unwrap_or_default();
            self.ctx.set_values(motion, &items);
            self.ctx.ok(motion, None);
        }
        self.show_tracking(false, None);
        if self.ctx.state(names::MOUNT_EQUATORIAL_COORDINATES) == PropertyState::Busy {
            self.ctx.ok(names::MOUNT_EQUATORIAL_COORDINATES, None);
        }
        if was_parking {
            self.show_parked(false);
            self.ctx.ok(names::MOUNT_PARK, None);
        }
        self.ctx.set_values(
            property,
            &[ItemUpdate::switch(names::MOUNT_ABORT_MOTION_ITEM, false)],
        );
        self.ctx.ok(property, Some("Aborted."));
        tracing::info!(endpoint = %self.name, "motion aborted");
        Ok(())
    }

    async fn on_park(self: &Arc<Self>, change: &PropertyChange) -> Result<()> {
        let property = names::MOUNT_PARK;
        let Some(controller) = self.controller() else {
            self.ctx.alert(property, NOT_CONNECTED);
            return Ok(());
        };
        let mut state = self.shared.lock().await;
        state.bind(&controller);

        if change.is_on(names::MOUNT_PARK_PARKED) {
            match state.global {
                GlobalMode::Parked => {
                    drop(state);
                    self.ctx.ok(property, Some("Mount Parked."));
                }
                GlobalMode::Parking => {
                    drop(state);
                    self.ctx.alert(property, WARN_PARKING);
                }
                GlobalMode::Slewing => {
                    drop(state);
                    self.show_parked(false);
                    self.ctx.alert(property, MOUNT_BUSY);
                }
                GlobalMode::Idle => {
                    state.global = GlobalMode::Parking;
                    state.park = Some(ParkPhase::Start);
                    drop(state);

                    self.ctx.apply(change)?;
                    self.ctx.update(property, PropertyState::Busy, Some("Parking..."));
                    self.show_tracking(false, None);
                    let handle =
                        self.schedule(Duration::ZERO, |inner| async move { inner.park_step().await });
                    let mut timers = self.timers.lock();
                    cancel_slot(&mut timers.tracking);
                    cancel_slot(&mut timers.park);
                    timers.park = Some(handle);
                    tracing::info!(endpoint = %self.name, "parking");
                }
            }
        } else if change.is_on(names::MOUNT_PARK_UNPARKED) {
            match state.global {
                GlobalMode::Parking => {
                    drop(state);
                    self.ctx.alert(property, WARN_PARKING);
                }
                GlobalMode::Parked => {
                    state.global = GlobalMode::Idle;
                    drop(state);
                    self.show_parked(false);
                    self.ctx.ok(property, Some("Mount unparked."));
                    tracing::info!(endpoint = %self.name, "unparked");
                }
                _ => {
                    drop(state);
                    self.show_parked(false);
                    self.ctx.ok(property, None);
                }
            }
        }
        Ok(())
    }

    async fn on_guide_rate(&self, change: &PropertyChange) -> Result<()> {
        let property = names::MOUNT_GUIDE_RATE;
        let clamp = |item: &str| change.requested(item).map(|v| v.clamp(10.0, 90.0));
        let mut updates = Vec::new();
        for item in [names::MOUNT_GUIDE_RATE_RA, names::MOUNT_GUIDE_RATE_DEC] {
            if let Some(v) = clamp(item) {
                updates.push(ItemUpdate::number(item, v));
            }
        }
        self.ctx.set_values(property, &updates);
        let ra = self
            .ctx
            .value(property, names::MOUNT_GUIDE_RATE_RA)
            .unwrap_or(self.settings.guide_rate);
        let dec = self
            .ctx
            .value(property, names::MOUNT_GUIDE_RATE_DEC)
            .unwrap_or(self.settings.guide_rate);
        {
            let mut state = self.shared.lock().await;
            state.guide_rate_ra = ra;
            state.guide_rate_dec = dec;
        }

        if let Some(controller) = self.controller() {
            if let Err(e) = controller.set_st4_rate(st4_rate_code(ra)).await {
                tracing::warn!(endpoint = %self.name, error = %e, "ST4 rate not accepted");
                self.ctx.alert(property, "Failed to set ST4 guide rate");
                return Ok(());
            }
        }
        self.ctx.ok(property, None);
        Ok(())
    }

    async fn on_polarscope(&self, change: &PropertyChange) -> Result<()> {
        let property = names::MOUNT_POLARSCOPE;
        let Some(controller) = self.controller() else {
            self.ctx.alert(property, NOT_CONNECTED);
            return Ok(());
        };
        let level = change
            .requested(names::MOUNT_POLARSCOPE_BRIGHTNESS)
            .unwrap_or(0.0)
            .clamp(0.0, 255.0);
        self.ctx.set_values(
            property,
            &[ItemUpdate::number(names::MOUNT_POLARSCOPE_BRIGHTNESS, level)],
        );
        match controller.set_polarscope(level.round() as u8).await {
            Ok(()) => self.ctx.ok(property, None),
            Err(e) => self
                .ctx
                .alert(property, &format!("Failed to set polarscope brightness: {e}")),
        }
        Ok(())
    }

    fn on_settings(&self, change: &PropertyChange) -> Result<()> {
        self.ctx.apply(change)?;
        self.ctx.ok(&change.property, None);
        Ok(())
    }
}

// =============================================================================
// Endpoint
// =============================================================================

#[async_trait]
impl Endpoint for MountEndpoint {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn kind(&self) -> EndpointKind {
        EndpointKind::Mount
    }

    fn queue(&self) -> &DispatchQueue {
        &self.inner.queue
    }

    async fn attach(&self) -> Result<()> {
        self.inner.connection.define()?;
        self.inner
            .define_properties()
            .with_context(|| format!("defining properties of {}", self.inner.name))?;
        tracing::info!(endpoint = %self.inner.name, "attached");
        Ok(())
    }

    async fn change_property(&self, change: PropertyChange) -> Result<()> {
        let inner = &self.inner;
        match change.property.as_str() {
            names::CONNECTION => {
                handle_connection_change(&inner.connection, self, &change).await;
                Ok(())
            }
            names::MOUNT_EQUATORIAL_COORDINATES => inner.on_coordinates(&change).await,
            names::MOUNT_TRACKING => inner.on_tracking(&change).await,
            names::MOUNT_TRACK_RATE => inner.on_track_rate(&change).await,
            names::MOUNT_SLEW_RATE => inner.on_slew_rate(&change).await,
            names::MOUNT_MOTION_RA => inner.on_motion(&change, Axis::Ra).await,
            names::MOUNT_MOTION_DEC => inner.on_motion(&change, Axis::Dec).await,
            names::MOUNT_ABORT_MOTION => inner.on_abort(&change).await,
            names::MOUNT_PARK => inner.on_park(&change).await,
            names::MOUNT_GUIDE_RATE => inner.on_guide_rate(&change).await,
            names::MOUNT_POLARSCOPE => inner.on_polarscope(&change).await,
            names::MOUNT_GEOGRAPHIC_COORDINATES
            | names::MOUNT_ON_COORDINATES_SET
            | names::MOUNT_PARK_POSITION => inner.on_settings(&change),
            _ => Err(AstroError::UnknownProperty {
                device: inner.name.clone(),
                name: change.property.clone(),
            }
            .into()),
        }
    }

    async fn detach(&self) -> Result<()> {
        if self.is_connected() {
            self.inner.disconnect().await;
            self.inner.connection.disconnected();
        }
        self.inner.timers.lock().cancel_all();
        self.inner.ctx.undefine_all();
        tracing::info!(endpoint = %self.inner.name, "detached");
        Ok(())
    }
}

/// Mount control without a property client. Each call is delivered through
/// the mount's dispatch queue, exactly like a client change.
#[async_trait]
impl AxisCapable for MountEndpoint {
    async fn slew_to(&self, ra_hours: f64, dec_degrees: f64) -> Result<()> {
        let change = PropertyChange::new(names::MOUNT_EQUATORIAL_COORDINATES)
            .with(ItemUpdate::target(names::MOUNT_EQUATORIAL_RA, ra_hours))
            .with(ItemUpdate::target(names::MOUNT_EQUATORIAL_DEC, dec_degrees));
        endpoint::dispatch(self, change).await
    }

    async fn set_tracking(&self, on: bool) -> Result<()> {
        let item = if on {
            names::MOUNT_TRACKING_ON
        } else {
            names::MOUNT_TRACKING_OFF
        };
        endpoint::dispatch(self, PropertyChange::switch(names::MOUNT_TRACKING, item)).await
    }

    async fn park(&self) -> Result<()> {
        endpoint::dispatch(self, PropertyChange::switch(names::MOUNT_PARK, names::MOUNT_PARK_PARKED)).await
    }

    async fn unpark(&self) -> Result<()> {
        endpoint::dispatch(self, PropertyChange::switch(names::MOUNT_PARK, names::MOUNT_PARK_UNPARKED)).await
    }

    async fn abort_motion(&self) -> Result<()> {
        endpoint::dispatch(
            self,
            PropertyChange::switch(names::MOUNT_ABORT_MOTION, names::MOUNT_ABORT_MOTION_ITEM),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slew_speed_items_map_to_table_indices() {
        assert_eq!(slew_speed_index(names::MOUNT_SLEW_RATE_GUIDE), 1);
        assert_eq!(slew_speed_index(names::MOUNT_SLEW_RATE_CENTERING), 4);
        assert_eq!(slew_speed_index(names::MOUNT_SLEW_RATE_FIND), 6);
        assert_eq!(slew_speed_index(names::MOUNT_SLEW_RATE_MAX), 9);
        assert_eq!(RA_SLEW_RATES[1], 2.0);
        assert_eq!(DEC_SLEW_RATES[1], 1.0);
    }

    #[test]
    fn track_rates() {
        assert_eq!(track_rate_of(names::MOUNT_TRACK_RATE_LUNAR), LUNAR_RATE);
        assert_eq!(track_rate_of(names::MOUNT_TRACK_RATE_SOLAR), SOLAR_RATE);
        assert!((track_rate_of("") - 15.041).abs() < 1e-3);
    }
}
