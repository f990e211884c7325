//! Mount and guide port against the in-process simulated controller.

use astro_core::capabilities::GuideCapable;
use astro_core::classes::GuiderEndpoint;
use astro_core::connection::SharedDevice;
use astro_core::driver::DriverContext;
use astro_core::endpoint::{attach, dispatch, Endpoint, PropertyChange};
use astro_core::property::{
    names, ItemUpdate, MemoryPropertyStore, PropertyEvent, PropertyState, PropertyStore,
};
use astro_core::timer::Scheduler;
use astro_driver_synscan::axis::AxisMode;
use astro_driver_synscan::coordinates::PreferNormal;
use astro_driver_synscan::protocol::{Axis, HOME_POSITION, SIDEREAL_RATE};
use astro_driver_synscan::sidereal::InstantClock;
use astro_driver_synscan::state::{GlobalMode, MountShared};
use astro_driver_synscan::transport::{PortSpec, TransportConfig};
use astro_driver_synscan::{MountEndpoint, MountGuidePort, MountSettings, SynscanLink};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const MOUNT: &str = "EQ6";
const GUIDER: &str = "EQ6 (guider)";

struct Rig {
    store: Arc<MemoryPropertyStore>,
    shared: Arc<MountShared>,
    mount: Arc<MountEndpoint>,
    guider: Arc<GuiderEndpoint>,
    _tmp: tempfile::TempDir,
}

impl Rig {
    fn state(&self, property: &str) -> PropertyState {
        self.store.get(MOUNT, property).unwrap().state
    }

    fn is_on(&self, property: &str, item: &str) -> bool {
        self.store.get(MOUNT, property).unwrap().is_on(item)
    }

    async fn change(&self, change: PropertyChange) {
        dispatch(self.mount.as_ref(), change).await.unwrap();
    }

    async fn goto(&self, ra: f64, dec: f64) {
        self.change(
            PropertyChange::new(names::MOUNT_EQUATORIAL_COORDINATES)
                .with(ItemUpdate::target(names::MOUNT_EQUATORIAL_RA, ra))
                .with(ItemUpdate::target(names::MOUNT_EQUATORIAL_DEC, dec)),
        )
        .await;
    }

    async fn modes(&self) -> (GlobalMode, AxisMode, AxisMode) {
        let state = self.shared.lock().await;
        (state.global, state.ra.mode, state.dec.mode)
    }
}

async fn rig() -> Rig {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryPropertyStore::new());
    let context = DriverContext::new(store.clone(), Scheduler::new());
    let link = SynscanLink::new(
        PortSpec::parse("sim://eq6").unwrap(),
        TransportConfig {
            drain: Duration::from_millis(10),
            ..TransportConfig::default()
        },
    );
    let device = Arc::new(SharedDevice::new(link).with_lock_dir(tmp.path()));
    let shared = Arc::new(MountShared::new(device));
    let settings = MountSettings {
        latitude: 45.0,
        longitude: 0.0,
        ..MountSettings::default()
    };
    let mount = Arc::new(MountEndpoint::new(
        MOUNT,
        &context,
        shared.clone(),
        settings,
        Arc::new(InstantClock::new(0.0)),
        Arc::new(PreferNormal),
    ));
    let guider = Arc::new(GuiderEndpoint::new(
        GUIDER,
        &context,
        shared.device().clone(),
        Arc::new(MountGuidePort::new(shared.clone())),
    ));
    attach(mount.as_ref()).await.unwrap();
    attach(guider.as_ref()).await.unwrap();

    dispatch(
        mount.as_ref(),
        PropertyChange::switch(names::CONNECTION, names::CONNECTION_CONNECTED),
    )
    .await
    .unwrap();
    assert!(mount.is_connected());
    Rig {
        store,
        shared,
        mount,
        guider,
        _tmp: tmp,
    }
}

/// Messages published for `property` since the receiver was created.
fn messages(rx: &mut broadcast::Receiver<PropertyEvent>, property: &str) -> Vec<(PropertyState, Option<String>)> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let PropertyEvent::Updated { property: p, message } = event {
            if p.name == property {
                out.push((p.state, message));
            }
        }
    }
    out
}

async fn settle(seconds: u64) {
    tokio::time::sleep(Duration::from_secs(seconds)).await;
}

#[tokio::test(start_paused = true)]
async fn connect_publishes_mount_info() {
    let rig = rig().await;
    let info = rig.store.get(MOUNT, names::MOUNT_INFO).unwrap();
    assert_eq!(info.text(names::MOUNT_INFO_VENDOR), Some("Sky-Watcher"));
    assert_eq!(info.text(names::MOUNT_INFO_MODEL), Some("EQ6"));
    assert_eq!(info.text(names::MOUNT_INFO_FIRMWARE), Some(" 3.15.00"));
    assert!(rig.store.get(MOUNT, names::MOUNT_POLARSCOPE).is_some());
    assert_eq!(rig.modes().await, (GlobalMode::Idle, AxisMode::Idle, AxisMode::Idle));
}

#[tokio::test(start_paused = true)]
async fn goto_slews_then_tracks() {
    let rig = rig().await;
    let mut rx = rig.store.subscribe();
    rig.goto(22.0, 30.0).await;
    assert_eq!(rig.state(names::MOUNT_EQUATORIAL_COORDINATES), PropertyState::Busy);
    assert_eq!(rig.modes().await.0, GlobalMode::Slewing);

    settle(120).await;
    let eq = rig.store.get(MOUNT, names::MOUNT_EQUATORIAL_COORDINATES).unwrap();
    assert_eq!(eq.state, PropertyState::Ok);
    assert!((eq.value(names::MOUNT_EQUATORIAL_RA).unwrap() - 22.0).abs() < 0.01);
    assert!((eq.value(names::MOUNT_EQUATORIAL_DEC).unwrap() - 30.0).abs() < 0.01);
    assert!(rig.is_on(names::MOUNT_TRACKING, names::MOUNT_TRACKING_ON));

    let (global, ra, dec) = rig.modes().await;
    assert_eq!(global, GlobalMode::Idle);
    assert_eq!(ra, AxisMode::Tracking);
    assert_eq!(dec, AxisMode::Idle);
    assert!(rig.shared.lock().await.goto.is_none());

    let published = messages(&mut rx, names::MOUNT_EQUATORIAL_COORDINATES);
    assert!(published
        .iter()
        .any(|(s, m)| *s == PropertyState::Ok && m.as_deref() == Some("Slew complete.")));
}

#[tokio::test(start_paused = true)]
async fn goto_without_tracking_leaves_ra_idle() {
    let rig = rig().await;
    rig.change(PropertyChange::switch(
        names::MOUNT_ON_COORDINATES_SET,
        names::MOUNT_ON_COORDINATES_SET_SLEW,
    ))
    .await;
    rig.goto(3.0, 60.0).await;
    settle(120).await;

    assert_eq!(rig.state(names::MOUNT_EQUATORIAL_COORDINATES), PropertyState::Ok);
    assert!(rig.is_on(names::MOUNT_TRACKING, names::MOUNT_TRACKING_OFF));
    assert_eq!(rig.modes().await, (GlobalMode::Idle, AxisMode::Idle, AxisMode::Idle));
}

#[tokio::test(start_paused = true)]
async fn goto_while_parking_is_refused() {
    let rig = rig().await;
    rig.change(PropertyChange::switch(names::MOUNT_PARK, names::MOUNT_PARK_PARKED))
        .await;
    assert_eq!(rig.modes().await.0, GlobalMode::Parking);

    let mut rx = rig.store.subscribe();
    rig.goto(5.0, 20.0).await;
    let published = messages(&mut rx, names::MOUNT_EQUATORIAL_COORDINATES);
    assert_eq!(
        published.last(),
        Some(&(
            PropertyState::Alert,
            Some("Mount parking is in progress, please wait until complete!".to_string())
        ))
    );
    assert!(rig.shared.lock().await.goto.is_none());
}

#[tokio::test(start_paused = true)]
async fn park_returns_home_and_unpark_releases() {
    let rig = rig().await;
    rig.goto(20.0, 10.0).await;
    settle(120).await;

    rig.change(PropertyChange::switch(names::MOUNT_PARK, names::MOUNT_PARK_PARKED))
        .await;
    assert_eq!(rig.state(names::MOUNT_PARK), PropertyState::Busy);
    assert!(rig.is_on(names::MOUNT_TRACKING, names::MOUNT_TRACKING_OFF));
    settle(120).await;

    assert_eq!(rig.state(names::MOUNT_PARK), PropertyState::Ok);
    assert!(rig.is_on(names::MOUNT_PARK, names::MOUNT_PARK_PARKED));
    assert_eq!(rig.modes().await, (GlobalMode::Parked, AxisMode::Idle, AxisMode::Idle));
    let controller = rig.shared.controller().await.unwrap();
    let home = i64::from(HOME_POSITION);
    assert!((controller.position(Axis::Ra).await.unwrap() - home).abs() < 10);
    assert!((controller.position(Axis::Dec).await.unwrap() - home).abs() < 10);

    let mut rx = rig.store.subscribe();
    rig.goto(5.0, 20.0).await;
    let published = messages(&mut rx, names::MOUNT_EQUATORIAL_COORDINATES);
    assert_eq!(
        published.last().and_then(|(_, m)| m.clone()).as_deref(),
        Some("Mount is parked, please unpark!")
    );

    rig.change(PropertyChange::switch(names::MOUNT_PARK, names::MOUNT_PARK_UNPARKED))
        .await;
    assert!(rig.is_on(names::MOUNT_PARK, names::MOUNT_PARK_UNPARKED));
    assert_eq!(rig.modes().await.0, GlobalMode::Idle);
}

#[tokio::test(start_paused = true)]
async fn tracking_starts_stops_and_is_refused_while_slewing() {
    let rig = rig().await;
    let mut rx = rig.store.subscribe();
    rig.change(PropertyChange::switch(names::MOUNT_TRACKING, names::MOUNT_TRACKING_ON))
        .await;
    assert_eq!(rig.state(names::MOUNT_TRACKING), PropertyState::Busy);
    settle(2).await;
    assert_eq!(rig.state(names::MOUNT_TRACKING), PropertyState::Ok);
    assert_eq!(rig.modes().await.1, AxisMode::Tracking);
    let published = messages(&mut rx, names::MOUNT_TRACKING);
    assert_eq!(
        published.last().and_then(|(_, m)| m.clone()).as_deref(),
        Some("Tracking started")
    );

    rig.change(PropertyChange::switch(names::MOUNT_TRACKING, names::MOUNT_TRACKING_OFF))
        .await;
    settle(2).await;
    assert_eq!(rig.state(names::MOUNT_TRACKING), PropertyState::Ok);
    assert_eq!(rig.modes().await.1, AxisMode::Idle);

    rig.goto(1.0, 45.0).await;
    rig.change(PropertyChange::switch(names::MOUNT_TRACKING, names::MOUNT_TRACKING_ON))
        .await;
    let published = messages(&mut rx, names::MOUNT_TRACKING);
    assert_eq!(
        published.last(),
        Some(&(
            PropertyState::Alert,
            Some("Tracking change refused - mount busy!".to_string())
        ))
    );
}

#[tokio::test(start_paused = true)]
async fn abort_stops_a_running_goto() {
    let rig = rig().await;
    rig.goto(18.0, -20.0).await;
    settle(3).await;
    assert_eq!(rig.modes().await.0, GlobalMode::Slewing);

    rig.change(PropertyChange::switch(
        names::MOUNT_ABORT_MOTION,
        names::MOUNT_ABORT_MOTION_ITEM,
    ))
    .await;
    assert_eq!(rig.state(names::MOUNT_ABORT_MOTION), PropertyState::Ok);
    assert!(!rig.is_on(names::MOUNT_ABORT_MOTION, names::MOUNT_ABORT_MOTION_ITEM));
    assert!(rig.shared.lock().await.goto.is_none());

    settle(3).await;
    assert_eq!(rig.modes().await, (GlobalMode::Idle, AxisMode::Idle, AxisMode::Idle));
    assert_eq!(rig.state(names::MOUNT_EQUATORIAL_COORDINATES), PropertyState::Ok);
    assert!(rig.is_on(names::MOUNT_TRACKING, names::MOUNT_TRACKING_OFF));
}

#[tokio::test(start_paused = true)]
async fn manual_motion_runs_until_released() {
    let rig = rig().await;
    let start = rig
        .shared
        .controller()
        .await
        .unwrap()
        .position(Axis::Dec)
        .await
        .unwrap();

    rig.change(PropertyChange::switch(names::MOUNT_MOTION_DEC, names::MOUNT_MOTION_NORTH))
        .await;
    assert_eq!(rig.state(names::MOUNT_MOTION_DEC), PropertyState::Busy);
    settle(2).await;
    assert_eq!(rig.modes().await.2, AxisMode::ManualSlewing);

    rig.change(
        PropertyChange::new(names::MOUNT_MOTION_DEC)
            .with(ItemUpdate::switch(names::MOUNT_MOTION_NORTH, false)),
    )
    .await;
    assert_eq!(rig.state(names::MOUNT_MOTION_DEC), PropertyState::Ok);
    settle(2).await;
    assert_eq!(rig.modes().await.2, AxisMode::Idle);

    let end = rig
        .shared
        .controller()
        .await
        .unwrap()
        .position(Axis::Dec)
        .await
        .unwrap();
    assert!(end < start, "north moves DEC backwards: {start} -> {end}");
}

#[tokio::test(start_paused = true)]
async fn west_pulse_speeds_up_tracking_then_restores_it() {
    let rig = rig().await;
    rig.change(PropertyChange::switch(names::MOUNT_TRACKING, names::MOUNT_TRACKING_ON))
        .await;
    settle(2).await;
    dispatch(
        rig.guider.as_ref(),
        PropertyChange::switch(names::CONNECTION, names::CONNECTION_CONNECTED),
    )
    .await
    .unwrap();
    assert_eq!(rig.shared.device().ref_count().await, 2);

    dispatch(
        rig.guider.as_ref(),
        PropertyChange::number(names::GUIDER_GUIDE_RA, names::GUIDER_GUIDE_WEST, 500.0),
    )
    .await
    .unwrap();
    {
        let state = rig.shared.lock().await;
        assert_eq!(state.ra.mode, AxisMode::Guiding);
        assert!((state.ra.desired_rate - 1.5 * SIDEREAL_RATE).abs() < 1e-6);
    }

    tokio::time::sleep(Duration::from_millis(800)).await;
    let pulse = rig.store.get(GUIDER, names::GUIDER_GUIDE_RA).unwrap();
    assert_eq!(pulse.state, PropertyState::Ok);
    let state = rig.shared.lock().await;
    assert_eq!(state.ra.mode, AxisMode::Tracking);
    assert!((state.ra.desired_rate - SIDEREAL_RATE).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn guide_pulse_refused_while_slewing() {
    let rig = rig().await;
    rig.goto(2.0, 10.0).await;
    let port = MountGuidePort::new(rig.shared.clone());
    let err = port
        .start_pulse(
            astro_core::capabilities::GuideDirection::North,
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Guide pulse refused - mount busy!");
}

#[tokio::test(start_paused = true)]
async fn disconnect_releases_the_controller() {
    let rig = rig().await;
    assert!(rig.guider.name().ends_with("(guider)"));
    dispatch(
        rig.mount.as_ref(),
        PropertyChange::switch(names::CONNECTION, names::CONNECTION_DISCONNECTED),
    )
    .await
    .unwrap();
    assert!(!rig.mount.is_connected());
    assert!(rig.shared.controller().await.is_none());
    assert!(rig.store.get(MOUNT, names::MOUNT_POLARSCOPE).is_none());

    let mut rx = rig.store.subscribe();
    rig.goto(1.0, 1.0).await;
    assert_eq!(
        messages(&mut rx, names::MOUNT_EQUATORIAL_COORDINATES).last(),
        Some(&(PropertyState::Alert, Some("Mount is not connected".to_string())))
    );
}
