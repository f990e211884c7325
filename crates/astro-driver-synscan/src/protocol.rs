//! SynScan motor controller wire format.
//!
//! Commands are ASCII: `:` + opcode + axis digit + optional payload + `\r`.
//! Replies are `=payload\r` on success and `!code\r` on error.
//!
//! 24-bit values travel as six hex digits in little-endian byte order, so
//! `0x0201AB` is sent as `AB0102`. The motor status reply of `:f` is the
//! exception: it is read as plain hex.
//!
//! ```text
//! :j1\r        → =000080\r     RA position 0x800000
//! :I1A0B000\r  → =\r           RA rate code 0x00B0A0
//! :G120\r      → =\r           RA gearing: low speed, forward
//! ```

use bitflags::bitflags;
use std::fmt;
use thiserror::Error;

/// Command terminator, also ends every reply.
pub const TERMINATOR: u8 = b'\r';

/// Longest reply the controller sends, terminator included.
pub const MAX_REPLY_LEN: usize = 20;

/// Sidereal rate in arcsec per second.
pub const SIDEREAL_RATE: f64 = 360.0 * 3600.0 / 86164.090530833;
pub const SOLAR_RATE: f64 = 15.0;
pub const LUNAR_RATE: f64 = 14.511415;

/// Encoder value of the home position (counterweight down, pointing at the pole).
pub const HOME_POSITION: u32 = 0x80_0000;

// =============================================================================
// Axis, gearing, direction
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    Ra,
    Dec,
}

impl Axis {
    pub const BOTH: [Axis; 2] = [Axis::Ra, Axis::Dec];

    pub fn code(self) -> char {
        match self {
            Axis::Ra => '1',
            Axis::Dec => '2',
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Axis::Ra => "RA",
            Axis::Dec => "DEC",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

impl Direction {
    pub fn of(value: f64) -> Self {
        if value < 0.0 {
            Direction::Reverse
        } else {
            Direction::Forward
        }
    }

    fn code(self) -> char {
        match self {
            Direction::Forward => '0',
            Direction::Reverse => '1',
        }
    }
}

/// First character of the `:G` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedMode {
    /// Move a fixed number of steps (GOTO).
    AbsoluteSlew,
    /// Continuous motion, normal gearing.
    LowSpeed,
    /// Continuous motion, turbo gearing.
    HighSpeed,
}

impl SpeedMode {
    fn code(self) -> char {
        match self {
            SpeedMode::AbsoluteSlew => '0',
            SpeedMode::LowSpeed => '1',
            SpeedMode::HighSpeed => '3',
        }
    }
}

bitflags! {
    /// Motor status bits of the `:f` reply.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MotorStatus: u32 {
        const INITIALIZED = 0x001;
        const RUNNING = 0x010;
        const SLEWING = 0x100;
        const BACKWARD = 0x200;
        const TURBO = 0x400;
    }
}

impl MotorStatus {
    pub fn is_running(self) -> bool {
        self.contains(MotorStatus::RUNNING)
    }

    pub fn is_initialized(self) -> bool {
        self.contains(MotorStatus::INITIALIZED)
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("no reply from controller")]
    Timeout,

    #[error("malformed reply {0:?}")]
    Malformed(String),

    #[error("controller rejected command (error {code})")]
    Rejected { code: String },

    #[error("port I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether a second attempt of the same transaction makes sense.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProtocolError::Timeout | ProtocolError::Malformed(_))
    }
}

// =============================================================================
// Commands
// =============================================================================

/// One controller command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Firmware,
    TotalSteps(Axis),
    WormSteps(Axis),
    TimerFrequency(Axis),
    HighSpeedRatio(Axis),
    Status(Axis),
    Position(Axis),
    SetPosition(Axis, u32),
    Initialize(Axis),
    Stop(Axis),
    InstantStop(Axis),
    SetGearing(Axis, SpeedMode, Direction),
    SetStepCount(Axis, u32),
    SetRateCode(Axis, u32),
    Start(Axis),
    SetSlowdown(Axis, u32),
    Polarscope(u8),
    St4Rate(Axis, u8),
}

impl Command {
    pub fn opcode(&self) -> char {
        match self {
            Command::Firmware => 'e',
            Command::TotalSteps(_) => 'a',
            Command::WormSteps(_) => 's',
            Command::TimerFrequency(_) => 'b',
            Command::HighSpeedRatio(_) => 'g',
            Command::Status(_) => 'f',
            Command::Position(_) => 'j',
            Command::SetPosition(..) => 'E',
            Command::Initialize(_) => 'F',
            Command::Stop(_) => 'K',
            Command::InstantStop(_) => 'L',
            Command::SetGearing(..) => 'G',
            Command::SetStepCount(..) => 'H',
            Command::SetRateCode(..) => 'I',
            Command::Start(_) => 'J',
            Command::SetSlowdown(..) => 'M',
            Command::Polarscope(_) => 'V',
            Command::St4Rate(..) => 'P',
        }
    }

    fn axis(&self) -> Axis {
        match *self {
            Command::Firmware | Command::Polarscope(_) => Axis::Ra,
            Command::TotalSteps(a)
            | Command::WormSteps(a)
            | Command::TimerFrequency(a)
            | Command::HighSpeedRatio(a)
            | Command::Status(a)
            | Command::Position(a)
            | Command::SetPosition(a, _)
            | Command::Initialize(a)
            | Command::Stop(a)
            | Command::InstantStop(a)
            | Command::SetGearing(a, ..)
            | Command::SetStepCount(a, _)
            | Command::SetRateCode(a, _)
            | Command::Start(a)
            | Command::SetSlowdown(a, _)
            | Command::St4Rate(a, _) => a,
        }
    }

    /// Wire form without the terminator.
    pub fn encode(&self) -> String {
        let mut out = format!(":{}{}", self.opcode(), self.axis().code());
        match *self {
            Command::SetPosition(_, v)
            | Command::SetStepCount(_, v)
            | Command::SetRateCode(_, v)
            | Command::SetSlowdown(_, v) => out.push_str(&encode_u24(v)),
            Command::SetGearing(_, speed, direction) => {
                out.push(speed.code());
                out.push(direction.code());
            }
            Command::Polarscope(level) => out.push_str(&format!("{level:02X}")),
            Command::St4Rate(_, code) => out.push(char::from(b'0' + code.min(9))),
            _ => {}
        }
        out
    }

    /// Wire form with the terminator.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.encode().into_bytes();
        bytes.push(TERMINATOR);
        bytes
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

// =============================================================================
// Value codec
// =============================================================================

/// Six hex digits, low byte first.
pub fn encode_u24(value: u32) -> String {
    format!(
        "{:02X}{:02X}{:02X}",
        value & 0xFF,
        (value >> 8) & 0xFF,
        (value >> 16) & 0xFF
    )
}

/// Inverse of [`encode_u24`]: `AB0102` → `0x0201AB`.
pub fn decode_u24(payload: &str) -> Result<u32, ProtocolError> {
    let digits = payload.get(..6).filter(|d| d.len() == 6);
    let Some(digits) = digits else {
        return Err(ProtocolError::Malformed(payload.to_string()));
    };
    let byte = |i: usize| {
        u32::from_str_radix(&digits[i..i + 2], 16)
            .map_err(|_| ProtocolError::Malformed(payload.to_string()))
    };
    Ok(byte(0)? | (byte(2)? << 8) | (byte(4)? << 16))
}

/// Plain hex, most significant digit first (motor status).
pub fn decode_hex(payload: &str) -> Result<u32, ProtocolError> {
    if payload.is_empty() {
        return Err(ProtocolError::Malformed(payload.to_string()));
    }
    u32::from_str_radix(payload, 16).map_err(|_| ProtocolError::Malformed(payload.to_string()))
}

/// Split a raw reply (terminator already stripped) into its payload.
pub fn parse_reply(raw: &[u8]) -> Result<String, ProtocolError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| ProtocolError::Malformed(String::from_utf8_lossy(raw).into_owned()))?;
    match text.as_bytes().first() {
        Some(b'=') => Ok(text[1..].to_string()),
        Some(b'!') => Err(ProtocolError::Rejected {
            code: text[1..].to_string(),
        }),
        _ => Err(ProtocolError::Malformed(text.to_string())),
    }
}

/// Firmware version as "%2d.%02d.%02d".
pub fn format_firmware(version: u32) -> String {
    format!(
        "{:2}.{:02}.{:02}",
        (version >> 16) & 0xFF,
        (version >> 8) & 0xFF,
        version & 0xFF
    )
}

/// Mount model from the low byte of the firmware reply.
pub fn mount_model(version: u32) -> &'static str {
    match version & 0xFF {
        0x00 => "EQ6",
        0x01 => "HEQ5",
        0x02 => "EQ5",
        0x03 => "EQ3",
        0x04 => "EQ8",
        0x05 => "AZ-EQ6",
        0x06 => "AZ-EQ5",
        0x80 => "GT",
        0x81 => "MF",
        0x82 => "114GT",
        0x90 => "DOB",
        _ => "SynScan",
    }
}

/// ST4 port rate code for a guide rate in percent of sidereal.
pub fn st4_rate_code(percent: f64) -> u8 {
    match percent {
        p if p >= 88.0 => 0,
        p if p >= 63.0 => 1,
        p if p >= 38.0 => 2,
        p if p >= 19.0 => 3,
        _ => 4,
    }
}
