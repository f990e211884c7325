//! USB enumeration and hot-plug events via `nusb`.

use crate::hotplug::{DeviceEnumerator, DeviceIdentity, DiscoveredDevice, HotplugEvent, HotplugRegistry};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;

/// Lists USB devices, optionally restricted to a set of vendor ids.
#[derive(Debug, Clone, Default)]
pub struct UsbEnumerator {
    vendor_ids: Vec<u16>,
}

impl UsbEnumerator {
    pub fn new(vendor_ids: Vec<u16>) -> Self {
        Self { vendor_ids }
    }
}

fn port_path(info: &nusb::DeviceInfo) -> String {
    let chain: Vec<String> = info.port_chain().iter().map(|p| p.to_string()).collect();
    if chain.is_empty() {
        info.device_address().to_string()
    } else {
        chain.join(".")
    }
}

#[async_trait]
impl DeviceEnumerator for UsbEnumerator {
    async fn enumerate(&self) -> Result<Vec<DiscoveredDevice>> {
        let devices = nusb::list_devices().context("USB enumeration failed")?;
        Ok(devices
            .filter(|d| self.vendor_ids.is_empty() || self.vendor_ids.contains(&d.vendor_id()))
            .map(|d| DiscoveredDevice {
                identity: DeviceIdentity::new(d.bus_number(), port_path(&d)),
                vendor_id: d.vendor_id(),
                product_id: d.product_id(),
                product: d.product_string().unwrap_or_default().to_string(),
            })
            .collect())
    }
}

/// Forward USB arrival/removal events to the registry until the watch ends.
pub async fn watch_usb(registry: HotplugRegistry) -> Result<()> {
    let mut events = nusb::watch_devices().context("USB hot-plug watch unavailable")?;
    // Devices already plugged in before the watch started.
    registry.handle_event(HotplugEvent::Arrived);
    while let Some(event) = events.next().await {
        match event {
            nusb::hotplug::HotplugEvent::Connected(_) => registry.handle_event(HotplugEvent::Arrived),
            nusb::hotplug::HotplugEvent::Disconnected(_) => registry.handle_event(HotplugEvent::Left),
        }
    }
    tracing::info!("USB hot-plug watch ended");
    Ok(())
}
