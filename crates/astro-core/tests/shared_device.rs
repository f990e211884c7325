//! Sibling endpoints sharing one physical device.

use anyhow::Result;
use astro_core::capabilities::{
    ExposureCapable, GuideAxis, GuideCapable, GuideDirection, SensorInfo, SlotCapable,
};
use astro_core::classes::{CcdEndpoint, GuiderEndpoint, WheelEndpoint};
use astro_core::connection::{HardwareLink, SharedDevice};
use astro_core::driver::DriverContext;
use astro_core::endpoint::{detach, dispatch, Endpoint, PropertyChange};
use astro_core::error::AstroError;
use astro_core::lock::GlobalLockGuard;
use astro_core::property::{names, MemoryPropertyStore, PropertyState, PropertyStore};
use astro_core::timer::Scheduler;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Counters {
    opens: AtomicUsize,
    closes: AtomicUsize,
    safe_states: AtomicUsize,
}

struct FakeLink {
    counters: Arc<Counters>,
}

#[async_trait]
impl HardwareLink for FakeLink {
    type Handle = ();

    fn identity(&self) -> String {
        "fake-camera-1-4".into()
    }

    async fn open(&self) -> Result<()> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn safe_state(&self, _handle: &()) -> Result<()> {
        self.counters.safe_states.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self, _handle: &()) -> Result<()> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct FakeCamera {
    slot: AtomicUsize,
    pulses: AtomicUsize,
}

#[async_trait]
impl ExposureCapable for FakeCamera {
    async fn sensor_info(&self) -> Result<SensorInfo> {
        Ok(SensorInfo {
            width: 8,
            height: 4,
            bits_per_pixel: 16,
            pixel_size_um: 5.2,
        })
    }

    async fn start_exposure(&self, _seconds: f64) -> Result<()> {
        Ok(())
    }

    async fn image_ready(&self) -> Result<bool> {
        Ok(true)
    }

    async fn read_image(&self, buffer: &mut [u8]) -> Result<()> {
        buffer.fill(0x5a);
        Ok(())
    }

    async fn abort_exposure(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl SlotCapable for FakeCamera {
    async fn slot_count(&self) -> Result<u32> {
        Ok(5)
    }

    async fn move_to_slot(&self, _slot: u32) -> Result<()> {
        Ok(())
    }

    async fn current_slot(&self) -> Result<u32> {
        Ok(self.slot.load(Ordering::SeqCst) as u32 + 1)
    }
}

#[async_trait]
impl GuideCapable for FakeCamera {
    async fn start_pulse(&self, _direction: GuideDirection, _duration: Duration) -> Result<()> {
        self.pulses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn end_pulse(&self, _axis: GuideAxis) -> Result<()> {
        Ok(())
    }
}

struct Rig {
    store: Arc<MemoryPropertyStore>,
    counters: Arc<Counters>,
    lock_dir: PathBuf,
    _tmp: tempfile::TempDir,
    endpoints: Vec<Arc<dyn Endpoint>>,
}

async fn rig() -> Rig {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryPropertyStore::new());
    let context = DriverContext::new(store.clone(), Scheduler::new());
    let counters = Arc::new(Counters::default());
    let device = Arc::new(
        SharedDevice::new(FakeLink {
            counters: counters.clone(),
        })
        .with_lock_dir(tmp.path()),
    );
    let camera = Arc::new(FakeCamera::default());

    let endpoints: Vec<Arc<dyn Endpoint>> = vec![
        Arc::new(CcdEndpoint::new("Fake CCD", &context, device.clone(), camera.clone(), None)),
        Arc::new(GuiderEndpoint::new("Fake CCD (guider)", &context, device.clone(), camera.clone())),
        Arc::new(WheelEndpoint::new("Fake CCD (wheel)", &context, device.clone(), camera.clone())),
    ];
    for endpoint in &endpoints {
        endpoint.attach().await.unwrap();
    }
    Rig {
        store,
        counters,
        lock_dir: tmp.path().to_path_buf(),
        _tmp: tmp,
        endpoints,
    }
}

async fn set_connection(endpoint: &dyn Endpoint, connected: bool) {
    let item = if connected {
        names::CONNECTION_CONNECTED
    } else {
        names::CONNECTION_DISCONNECTED
    };
    dispatch(endpoint, PropertyChange::switch(names::CONNECTION, item))
        .await
        .unwrap();
}

#[tokio::test]
async fn one_open_one_close_regardless_of_order() {
    let rig = rig().await;
    let [ccd, guider, wheel] = [&rig.endpoints[0], &rig.endpoints[1], &rig.endpoints[2]];

    for endpoint in [guider, ccd, wheel] {
        set_connection(endpoint.as_ref(), true).await;
        let prop = rig.store.get(endpoint.name(), names::CONNECTION).unwrap();
        assert_eq!(prop.state, PropertyState::Ok);
        assert!(prop.is_on(names::CONNECTION_CONNECTED));
    }
    assert_eq!(rig.counters.opens.load(Ordering::SeqCst), 1);

    // The global lock is held once for the whole span.
    assert!(matches!(
        GlobalLockGuard::acquire_in(&rig.lock_dir, "fake-camera-1-4"),
        Err(AstroError::LockHeld(_))
    ));

    for endpoint in [ccd, wheel, guider] {
        set_connection(endpoint.as_ref(), false).await;
    }
    assert_eq!(rig.counters.closes.load(Ordering::SeqCst), 1);
    assert_eq!(rig.counters.safe_states.load(Ordering::SeqCst), 1);
    GlobalLockGuard::acquire_in(&rig.lock_dir, "fake-camera-1-4").unwrap();
}

#[tokio::test]
async fn detach_disconnects_and_undefines() {
    let rig = rig().await;
    for endpoint in &rig.endpoints {
        set_connection(endpoint.as_ref(), true).await;
    }
    for endpoint in &rig.endpoints {
        detach(endpoint.as_ref()).await.unwrap();
        assert!(rig.store.properties(endpoint.name()).is_empty());
    }
    assert_eq!(rig.counters.closes.load(Ordering::SeqCst), 1);
    assert!(rig.store.devices().is_empty());
}

#[tokio::test(start_paused = true)]
async fn guide_pulse_zeroes_items_when_done() {
    let rig = rig().await;
    let guider = rig.endpoints[1].clone();
    set_connection(guider.as_ref(), true).await;

    dispatch(
        guider.as_ref(),
        PropertyChange::number(names::GUIDER_GUIDE_DEC, names::GUIDER_GUIDE_NORTH, 250.0),
    )
    .await
    .unwrap();
    let prop = rig.store.get(guider.name(), names::GUIDER_GUIDE_DEC).unwrap();
    assert_eq!(prop.state, PropertyState::Busy);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let prop = rig.store.get(guider.name(), names::GUIDER_GUIDE_DEC).unwrap();
    assert_eq!(prop.state, PropertyState::Ok);
    assert_eq!(prop.value(names::GUIDER_GUIDE_NORTH), Some(0.0));
}
