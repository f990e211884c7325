//! In-memory USB bus for exercising the hot-plug registry without hardware.

use anyhow::{bail, Result};
use astro_hardware::hotplug::{DeviceEnumerator, DeviceIdentity, DiscoveredDevice};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
pub struct SimEnumerator {
    devices: parking_lot::Mutex<BTreeMap<DeviceIdentity, DiscoveredDevice>>,
    failing: AtomicBool,
}

impl SimEnumerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a device on the bus. Replugging the same identity replaces it.
    pub fn plug(&self, device: DiscoveredDevice) {
        self.devices.lock().insert(device.identity.clone(), device);
    }

    pub fn unplug(&self, identity: &DeviceIdentity) -> bool {
        self.devices.lock().remove(identity).is_some()
    }

    /// Make the next enumerations fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeviceEnumerator for SimEnumerator {
    async fn enumerate(&self) -> Result<Vec<DiscoveredDevice>> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("simulated USB enumeration failure");
        }
        Ok(self.devices.lock().values().cloned().collect())
    }
}
