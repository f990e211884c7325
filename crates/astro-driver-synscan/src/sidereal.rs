//! Local sidereal time sources.

use crate::coordinates::normalize_hours;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Sidereal seconds per solar second.
pub const SIDEREAL_RATIO: f64 = 1.002_737_909_35;

pub trait SiderealClock: Send + Sync {
    /// Local sidereal time in hours, `[0, 24)`. Longitude is degrees east.
    fn local_sidereal_time(&self, longitude: f64) -> f64;
}

/// Greenwich mean sidereal time in hours (IAU 1982 polynomial).
pub fn greenwich_sidereal_time(utc: DateTime<Utc>) -> f64 {
    let seconds = utc.timestamp() as f64 + f64::from(utc.timestamp_subsec_nanos()) * 1e-9;
    let julian_day = seconds / 86_400.0 + 2_440_587.5;
    let d = julian_day - 2_451_545.0;
    let t = d / 36_525.0;
    let degrees = 280.460_618_37 + 360.985_647_366_29 * d + 0.000_387_933 * t * t
        - t * t * t / 38_710_000.0;
    normalize_hours(degrees.rem_euclid(360.0) / 15.0)
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SiderealClock for SystemClock {
    fn local_sidereal_time(&self, longitude: f64) -> f64 {
        normalize_hours(greenwich_sidereal_time(Utc::now()) + longitude / 15.0)
    }
}

/// Sidereal time advancing with `tokio::time`, starting from a fixed
/// Greenwich sidereal time. Follows a paused test clock.
#[derive(Debug, Clone, Copy)]
pub struct InstantClock {
    start_gst: f64,
    start: Instant,
}

impl InstantClock {
    pub fn new(start_gst: f64) -> Self {
        Self {
            start_gst,
            start: Instant::now(),
        }
    }
}

impl SiderealClock for InstantClock {
    fn local_sidereal_time(&self, longitude: f64) -> f64 {
        let elapsed = self.start.elapsed().as_secs_f64() * SIDEREAL_RATIO / 3600.0;
        normalize_hours(self.start_gst + elapsed + longitude / 15.0)
    }
}

/// Signed difference `a - b` in hours, wrapped into `[-12, 12)`.
pub fn hour_difference(a: f64, b: f64) -> f64 {
    (a - b + 12.0).rem_euclid(24.0) - 12.0
}
