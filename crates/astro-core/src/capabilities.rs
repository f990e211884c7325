//! Capability traits implemented by concrete hardware.
//!
//! An endpoint is "one physical device, N capability implementations": the
//! generic endpoints in [`crate::classes`] drive hardware only through these
//! traits, and drivers compose them in [`crate::driver::DeviceComponents`].
//!
//! All traits are async and return `anyhow::Result`, so drivers can attach
//! context to wire errors without a shared error enum.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Opens and closes the hardware behind an endpoint.
///
/// For devices shared by several endpoints, `connect`/`disconnect` map onto
/// [`crate::connection::SharedDevice::acquire`] / `release`, so only the first
/// connect opens and only the last disconnect closes.
#[async_trait]
pub trait Connectable: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
}

// =============================================================================
// Camera
// =============================================================================

/// Sensor geometry reported by a camera at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorInfo {
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u32,
    pub pixel_size_um: f64,
}

impl SensorInfo {
    /// Bytes needed for one full frame.
    pub fn frame_bytes(&self) -> usize {
        let bytes_per_pixel = (self.bits_per_pixel as usize).div_ceil(8);
        self.width as usize * self.height as usize * bytes_per_pixel
    }
}

#[async_trait]
pub trait ExposureCapable: Send + Sync {
    /// Geometry of the connected sensor.
    async fn sensor_info(&self) -> Result<SensorInfo>;

    async fn start_exposure(&self, seconds: f64) -> Result<()>;

    /// True once the frame can be read out.
    async fn image_ready(&self) -> Result<bool>;

    /// Copy the finished frame into `buffer`.
    async fn read_image(&self, buffer: &mut [u8]) -> Result<()>;

    async fn abort_exposure(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoolerStatus {
    pub on: bool,
    pub temperature: f64,
    pub target: f64,
    /// Percent of maximum cooler power.
    pub power: f64,
}

#[async_trait]
pub trait CoolerCapable: Send + Sync {
    async fn cooler_status(&self) -> Result<CoolerStatus>;
    async fn set_cooler(&self, on: bool, target: f64) -> Result<()>;
}

// =============================================================================
// Filter Wheel
// =============================================================================

#[async_trait]
pub trait SlotCapable: Send + Sync {
    /// Number of filter positions (slots are 1-based).
    async fn slot_count(&self) -> Result<u32>;

    /// Start moving towards `slot`. Returns once the move has been issued.
    async fn move_to_slot(&self, slot: u32) -> Result<()>;

    /// Slot the wheel currently sits at (or is passing).
    async fn current_slot(&self) -> Result<u32>;
}

// =============================================================================
// Guiding
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuideDirection {
    North,
    South,
    East,
    West,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuideAxis {
    Ra,
    Dec,
}

impl GuideDirection {
    pub fn axis(self) -> GuideAxis {
        match self {
            GuideDirection::North | GuideDirection::South => GuideAxis::Dec,
            GuideDirection::East | GuideDirection::West => GuideAxis::Ra,
        }
    }
}

/// Timed guide corrections. The caller owns the timing: it calls
/// `start_pulse`, waits `duration`, then calls `end_pulse`.
#[async_trait]
pub trait GuideCapable: Send + Sync {
    async fn start_pulse(&self, direction: GuideDirection, duration: Duration) -> Result<()>;
    async fn end_pulse(&self, axis: GuideAxis) -> Result<()>;
}

// =============================================================================
// Mount
// =============================================================================

/// High-level mount control, implemented by mount endpoints.
///
/// Each call starts the operation and returns; progress is reported through
/// the mount's properties.
#[async_trait]
pub trait AxisCapable: Send + Sync {
    /// Slew to RA (hours) / DEC (degrees).
    async fn slew_to(&self, ra_hours: f64, dec_degrees: f64) -> Result<()>;
    async fn set_tracking(&self, on: bool) -> Result<()>;
    async fn park(&self) -> Result<()>;
    async fn unpark(&self) -> Result<()>;
    async fn abort_motion(&self) -> Result<()>;
}
