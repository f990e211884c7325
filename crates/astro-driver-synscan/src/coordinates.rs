//! Encoder positions ↔ hour angle / declination for a German equatorial mount.
//!
//! Encoder positions are fractions of a full axis revolution. Each sky
//! position has two encoder solutions, one per pier side: the "normal" one
//! (counterweight down) and the flipped one (counterweight up). Which one a
//! slew uses is decided by a [`PierSideStrategy`].
//!
//! Angles are radians; the mount endpoint converts from hours and degrees.

use crate::protocol::HOME_POSITION;
use std::f64::consts::{PI, TAU};

/// Step geometry of one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisGeometry {
    pub total_steps: i64,
    /// Step count at encoder position 0.
    pub zero_position: i64,
}

impl AxisGeometry {
    pub fn new(total_steps: u32) -> Self {
        let total_steps = i64::from(total_steps);
        Self {
            total_steps,
            zero_position: i64::from(HOME_POSITION) - total_steps / 4,
        }
    }

    /// Fraction of a revolution in `[0, 1)`.
    pub fn steps_to_position(&self, steps: i64) -> f64 {
        if self.total_steps == 0 {
            return 0.0;
        }
        let position = (steps - self.zero_position) as f64 / self.total_steps as f64;
        if position < 0.0 {
            position + 1.0
        } else {
            position
        }
    }

    /// Positions above 0.75 map below zero, keeping the axis away from the
    /// encoder wrap.
    pub fn position_to_steps(&self, position: f64) -> i64 {
        let position = if position > 0.75 {
            position - 1.0
        } else {
            position
        };
        (self.zero_position as f64 + position * self.total_steps as f64).round() as i64
    }
}

// =============================================================================
// Pier side
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PierSide {
    East,
    West,
}

impl PierSide {
    /// West iff the DEC encoder sits in `[0.25, 0.75)`.
    pub fn of_dec_position(position: f64) -> Self {
        if (0.25..0.75).contains(&position) {
            PierSide::West
        } else {
            PierSide::East
        }
    }
}

/// One encoder pair reaching a sky position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncoderSolution {
    pub ha: f64,
    pub dec: f64,
}

impl EncoderSolution {
    pub fn pier_side(&self) -> PierSide {
        PierSide::of_dec_position(self.dec)
    }
}

/// Picks one of the two solutions of [`equatorial_to_encoder`].
pub trait PierSideStrategy: Send + Sync {
    fn select(&self, solutions: &[EncoderSolution; 2]) -> usize;
}

/// Always the normal (counterweight down) solution.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferNormal;

impl PierSideStrategy for PreferNormal {
    fn select(&self, _solutions: &[EncoderSolution; 2]) -> usize {
        0
    }
}

/// The solution on a given pier side, falling back to the normal one.
#[derive(Debug, Clone, Copy)]
pub struct KeepPierSide(pub PierSide);

impl PierSideStrategy for KeepPierSide {
    fn select(&self, solutions: &[EncoderSolution; 2]) -> usize {
        solutions
            .iter()
            .position(|s| s.pier_side() == self.0)
            .unwrap_or(0)
    }
}

// =============================================================================
// Transform
// =============================================================================

fn rebase(angle: f64) -> f64 {
    let angle = if angle > 1.5 * PI { angle - TAU } else { angle };
    angle / TAU
}

/// Both encoder solutions for hour angle `ha` and declination `dec`,
/// normal solution first.
pub fn equatorial_to_encoder(ha: f64, dec: f64, latitude: f64) -> [EncoderSolution; 2] {
    let south = latitude < 0.0;

    let (dec_west, dec_east) = if south {
        (if dec < 0.0 { -dec } else { TAU - dec }, PI + dec)
    } else {
        (PI - dec, if dec < 0.0 { TAU + dec } else { dec })
    };
    let dec_west = rebase(dec_west);
    let dec_east = rebase(dec_east);

    let mut ha = ha % TAU;
    if ha > PI {
        ha -= TAU;
    } else if ha < -PI {
        ha += TAU;
    }

    let (ha_west, ha_east) = if south {
        (PI - ha, if ha >= 0.0 { TAU - ha } else { -ha })
    } else {
        (if ha >= 0.0 { ha } else { ha + TAU }, ha + PI)
    };
    let ha_west = ha_west / TAU;
    let ha_east = ha_east / TAU;

    let west = EncoderSolution {
        ha: ha_west,
        dec: dec_west,
    };
    let east = EncoderSolution {
        ha: ha_east,
        dec: dec_east,
    };
    if ha_west < 0.5 {
        [west, east]
    } else {
        [east, west]
    }
}

/// Hour angle and declination for an encoder pair. Hour angle is in `[-π, π)`.
pub fn encoder_to_equatorial(ha_position: f64, dec_position: f64, latitude: f64) -> (f64, f64) {
    let south = latitude < 0.0;

    let (mut dec, mut west) = if dec_position < 0.25 {
        (dec_position, false)
    } else if dec_position < 0.75 {
        (0.5 - dec_position, true)
    } else {
        (dec_position - 1.0, false)
    };
    if south {
        west = !west;
        dec = -dec;
    }

    let mut ha = if south {
        if west {
            0.5 - ha_position
        } else if ha_position < 0.5 {
            -ha_position
        } else {
            1.0 - ha_position
        }
    } else if !west {
        ha_position - 0.5
    } else if ha_position < 0.5 {
        ha_position
    } else {
        ha_position - 1.0
    };
    while ha >= 0.5 {
        ha -= 1.0;
    }
    while ha < -0.5 {
        ha += 1.0;
    }

    (ha * TAU, dec * TAU)
}

pub fn hours_to_radians(hours: f64) -> f64 {
    hours * PI / 12.0
}

pub fn radians_to_hours(radians: f64) -> f64 {
    radians * 12.0 / PI
}

/// Wrap hours into `[0, 24)`.
pub fn normalize_hours(hours: f64) -> f64 {
    hours.rem_euclid(24.0)
}
