//! In-process SynScan motor controller.
//!
//! Speaks the same wire format as a real controller over a `tokio::io::duplex`
//! pair, so everything above the byte stream (transport, axis state machine,
//! mount endpoint) runs unchanged against it. Motion is integrated lazily from
//! `tokio::time::Instant`, which makes GOTO scenarios deterministic under a
//! paused test clock.

use crate::protocol::{decode_u24, encode_u24, Direction, MotorStatus, HOME_POSITION};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorConfig {
    pub total_steps: u32,
    pub worm_steps: u32,
    pub timer_frequency: u32,
    pub high_speed_ratio: u32,
    /// Natural value of the `:e` reply; the low byte is the mount model.
    pub firmware: u32,
    pub polarscope: bool,
    /// Motors report the init bit without needing `:F`.
    pub initialized: bool,
    /// `:F` has no effect.
    pub init_fails: bool,
    /// GOTO speed in steps per second.
    pub goto_speed: f64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            total_steps: 9_024_000,
            worm_steps: 50_133,
            timer_frequency: 64_935,
            high_speed_ratio: 16,
            firmware: 0x03_0F_00,
            polarscope: true,
            initialized: false,
            init_fails: false,
            goto_speed: 80_000.0,
        }
    }
}

#[derive(Debug)]
struct SimAxis {
    position: f64,
    target: f64,
    running: bool,
    goto_mode: bool,
    turbo: bool,
    direction: Direction,
    rate_code: u32,
    step_count: u32,
    initialized: bool,
    updated: Instant,
}

impl SimAxis {
    fn new(initialized: bool) -> Self {
        Self {
            position: f64::from(HOME_POSITION),
            target: f64::from(HOME_POSITION),
            running: false,
            goto_mode: false,
            turbo: false,
            direction: Direction::Forward,
            rate_code: 0,
            step_count: 0,
            initialized,
            updated: Instant::now(),
        }
    }

    fn sign(&self) -> f64 {
        match self.direction {
            Direction::Forward => 1.0,
            Direction::Reverse => -1.0,
        }
    }

    fn advance(&mut self, config: &SimulatorConfig) {
        let now = Instant::now();
        let dt = now.duration_since(self.updated).as_secs_f64();
        self.updated = now;
        if !self.running {
            return;
        }
        if self.goto_mode {
            let remaining = self.target - self.position;
            let step = config.goto_speed * dt;
            if remaining.abs() <= step {
                self.position = self.target;
                self.running = false;
            } else {
                self.position += remaining.signum() * step;
            }
        } else if self.rate_code > 0 {
            let mut speed = f64::from(config.timer_frequency) / f64::from(self.rate_code);
            if self.turbo {
                speed *= f64::from(config.high_speed_ratio);
            }
            self.position += self.sign() * speed * dt;
        }
    }

    fn status(&self) -> MotorStatus {
        let mut status = MotorStatus::empty();
        status.set(MotorStatus::INITIALIZED, self.initialized);
        status.set(MotorStatus::RUNNING, self.running);
        status.set(MotorStatus::SLEWING, !self.goto_mode);
        status.set(MotorStatus::BACKWARD, self.direction == Direction::Reverse);
        status.set(MotorStatus::TURBO, self.turbo);
        status
    }
}

/// Simulated controller state. Normally driven through [`SimulatedController::spawn`].
#[derive(Debug)]
pub struct SimulatedController {
    config: SimulatorConfig,
    axes: [SimAxis; 2],
}

impl SimulatedController {
    pub fn new(config: SimulatorConfig) -> Self {
        let axes = [SimAxis::new(config.initialized), SimAxis::new(config.initialized)];
        Self { config, axes }
    }

    /// Serve the controller on a background task; returns the client end.
    /// The task ends when the client end is dropped.
    pub fn spawn(config: SimulatorConfig) -> DuplexStream {
        let (client, server) = tokio::io::duplex(256);
        let controller = Self::new(config);
        tokio::spawn(controller.serve(server));
        client
    }

    async fn serve(mut self, mut stream: DuplexStream) {
        let mut line = Vec::with_capacity(32);
        let mut buf = [0u8; 64];
        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            for &byte in &buf[..n] {
                if byte != b'\r' {
                    line.push(byte);
                    continue;
                }
                let command = String::from_utf8_lossy(&line).into_owned();
                line.clear();
                let reply = self.handle(&command);
                if stream.write_all(reply.as_bytes()).await.is_err() {
                    return;
                }
            }
        }
        tracing::debug!("simulated controller stopped");
    }

    /// Process one command (without terminator) and return the full reply.
    pub fn handle(&mut self, command: &str) -> String {
        let mut chars = command.chars();
        if chars.next() != Some(':') {
            return "!0\r".into();
        }
        let (Some(opcode), Some(axis)) = (chars.next(), chars.next()) else {
            return "!0\r".into();
        };
        let index = match axis {
            '1' => 0,
            '2' => 1,
            _ => return "!3\r".into(),
        };
        let payload: String = chars.collect();
        for axis in &mut self.axes {
            axis.advance(&self.config);
        }
        match self.reply(opcode, index, &payload) {
            Ok(body) => format!("={body}\r"),
            Err(code) => format!("!{code}\r"),
        }
    }

    fn reply(&mut self, opcode: char, index: usize, payload: &str) -> Result<String, u8> {
        let config = &self.config;
        let axis = &mut self.axes[index];
        let value = || decode_u24(payload).map_err(|_| 3u8);
        match opcode {
            'e' => Ok(encode_u24(config.firmware)),
            'a' => Ok(encode_u24(config.total_steps)),
            's' => Ok(encode_u24(config.worm_steps)),
            'b' => Ok(encode_u24(config.timer_frequency)),
            'g' => Ok(encode_u24(config.high_speed_ratio)),
            'f' => Ok(format!("{:03X}", axis.status().bits())),
            'j' => Ok(encode_u24((axis.position.round() as i64 & 0xFF_FFFF) as u32)),
            'E' => {
                axis.position = f64::from(value()?);
                Ok(String::new())
            }
            'F' => {
                if !config.init_fails {
                    axis.initialized = true;
                }
                Ok(String::new())
            }
            'K' | 'L' => {
                axis.running = false;
                Ok(String::new())
            }
            'G' => {
                if axis.running {
                    return Err(2);
                }
                let mut mode = payload.chars();
                let speed = mode.next().ok_or(3u8)?;
                let direction = mode.next().ok_or(3u8)?;
                axis.goto_mode = matches!(speed, '0' | '2');
                axis.turbo = matches!(speed, '3');
                axis.direction = if direction == '1' {
                    Direction::Reverse
                } else {
                    Direction::Forward
                };
                Ok(String::new())
            }
            'H' => {
                axis.step_count = value()?;
                Ok(String::new())
            }
            'I' => {
                axis.rate_code = value()?;
                Ok(String::new())
            }
            'M' => {
                value()?;
                Ok(String::new())
            }
            'J' => {
                if !axis.initialized {
                    return Err(4);
                }
                if axis.goto_mode {
                    axis.target = axis.position + axis.sign() * f64::from(axis.step_count);
                } else if axis.rate_code == 0 {
                    return Err(3);
                }
                axis.running = true;
                Ok(String::new())
            }
            'V' if config.polarscope => Ok(String::new()),
            'P' => Ok(String::new()),
            _ => Err(0),
        }
    }

    pub fn position(&self, index: usize) -> f64 {
        self.axes[index].position
    }
}
