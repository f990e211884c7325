//! Port selection and the request/reply transaction.
//!
//! A mount is reached through one of three byte streams, chosen by the
//! configured port string:
//!
//! | port string               | stream                                  |
//! |---------------------------|-----------------------------------------|
//! | `synscan://host[:port]`   | TCP (WiFi adapters listen on 4030)      |
//! | `sim://[profile]`         | in-process simulated controller         |
//! | anything else             | serial device path, 9600 8N1            |
//!
//! [`SynscanPort::transact`] is the only way commands reach the wire. It
//! holds the port mutex for the whole exchange so replies can never be
//! interleaved between callers.

use crate::protocol::{parse_reply, Command, ProtocolError, MAX_REPLY_LEN, TERMINATOR};
use crate::simulator::{SimulatedController, SimulatorConfig};
use anyhow::{bail, Context, Result};
use astro_core::serial::{drain_serial_buffer, wrap_shared, DynSerial, SharedPort};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub const DEFAULT_TCP_PORT: u16 = 4030;
pub const DEFAULT_BAUD_RATE: u32 = 9600;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Port specification
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSpec {
    Serial { path: String, baud_rate: u32 },
    Tcp { host: String, port: u16 },
    Simulator { profile: String },
}

impl PortSpec {
    pub fn parse(port: &str) -> Result<Self> {
        let port = port.trim();
        if port.is_empty() {
            bail!("empty port");
        }
        if let Some(rest) = port.strip_prefix("synscan://") {
            let (host, tcp_port) = split_host_port(rest)
                .with_context(|| format!("invalid TCP address in '{port}'"))?;
            if host.is_empty() {
                bail!("missing host in '{port}'");
            }
            return Ok(PortSpec::Tcp {
                host: host.to_string(),
                port: tcp_port,
            });
        }
        if let Some(profile) = port.strip_prefix("sim://") {
            return Ok(PortSpec::Simulator {
                profile: profile.to_string(),
            });
        }
        Ok(PortSpec::Serial {
            path: port.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
        })
    }

    /// Lock-file friendly identity of the port.
    pub fn identity(&self) -> String {
        match self {
            PortSpec::Serial { path, .. } => format!("synscan-serial-{path}"),
            PortSpec::Tcp { host, port } => format!("synscan-tcp-{host}-{port}"),
            PortSpec::Simulator { profile } => format!("synscan-sim-{profile}"),
        }
    }

    /// Open the byte stream.
    pub async fn open(&self, simulator: &SimulatorConfig) -> Result<DynSerial> {
        match self {
            PortSpec::Serial { path, baud_rate } => {
                let stream =
                    astro_core::serial::open_serial_async(path, *baud_rate, "SynScan mount").await?;
                Ok(Box::new(stream))
            }
            PortSpec::Tcp { host, port } => {
                let stream = tokio::time::timeout(
                    CONNECT_TIMEOUT,
                    tokio::net::TcpStream::connect((host.as_str(), *port)),
                )
                .await
                .with_context(|| format!("Timed out connecting to {host}:{port}"))?
                .with_context(|| format!("Failed to connect to {host}:{port}"))?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            PortSpec::Simulator { profile } => {
                tracing::info!(profile = %profile, "starting simulated SynScan controller");
                Ok(Box::new(SimulatedController::spawn(simulator.clone())))
            }
        }
    }
}

/// `host`, `host:port`, `[v6]` or `[v6]:port`. Bare IPv6 literals are
/// ambiguous with a port suffix and must be bracketed.
fn split_host_port(address: &str) -> Result<(&str, u16)> {
    let (host, port) = if let Some(bracketed) = address.strip_prefix('[') {
        let (host, after) = bracketed
            .split_once(']')
            .ok_or_else(|| anyhow::anyhow!("unclosed '[' in host"))?;
        match after {
            "" => (host, None),
            _ => match after.strip_prefix(':') {
                Some(p) => (host, Some(p)),
                None => bail!("unexpected '{after}' after ']'"),
            },
        }
    } else {
        match address.rsplit_once(':') {
            Some((host, _)) if host.contains(':') => {
                bail!("IPv6 hosts must be written in brackets, e.g. [::1]:4030")
            }
            Some((host, p)) => (host, Some(p)),
            None => (address, None),
        }
    };
    let port = match port {
        Some(p) => p.parse::<u16>().with_context(|| format!("invalid TCP port '{p}'"))?,
        None => DEFAULT_TCP_PORT,
    };
    Ok((host, port))
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSpec::Serial { path, .. } => f.write_str(path),
            PortSpec::Tcp { host, port } if host.contains(':') => {
                write!(f, "synscan://[{host}]:{port}")
            }
            PortSpec::Tcp { host, port } => write!(f, "synscan://{host}:{port}"),
            PortSpec::Simulator { profile } => write!(f, "sim://{profile}"),
        }
    }
}

// =============================================================================
// Transaction
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// Wait for the reply terminator.
    pub timeout: Duration,
    /// Window for discarding stale bytes before each write.
    pub drain: Duration,
    pub attempts: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            drain: Duration::from_millis(100),
            attempts: 2,
        }
    }
}

/// A controller port plus its transaction lock.
#[derive(Clone)]
pub struct SynscanPort {
    port: SharedPort,
    config: TransportConfig,
}

impl SynscanPort {
    pub fn new(port: DynSerial, config: TransportConfig) -> Self {
        Self {
            port: wrap_shared(port),
            config,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Send `command` and return the reply payload.
    ///
    /// Timeouts and malformed replies are retried; an error reply (`!`) or
    /// a dead port is returned at once.
    pub async fn transact(&self, command: Command) -> Result<String, ProtocolError> {
        let mut port = self.port.lock().await;
        let bytes = command.to_bytes();
        let attempts = self.config.attempts.max(1);
        let mut last = ProtocolError::Timeout;

        for attempt in 1..=attempts {
            let stale = drain_serial_buffer(&mut **port, self.config.drain).await;
            if stale > 0 {
                tracing::debug!(%command, stale, "discarded stale bytes");
            }
            port.write_all(&bytes).await?;
            port.flush().await?;

            let result = read_reply(&mut port, self.config.timeout)
                .await
                .and_then(|raw| parse_reply(&raw));
            match result {
                Ok(payload) => {
                    tracing::trace!(%command, reply = %payload, "transaction");
                    return Ok(payload);
                }
                Err(e) if e.is_retryable() => {
                    tracing::debug!(%command, attempt, error = %e, "retrying");
                    last = e;
                }
                Err(e) => {
                    tracing::warn!(%command, error = %e, "command failed");
                    return Err(e);
                }
            }
        }

        tracing::warn!(%command, attempts, error = %last, "command failed after retries");
        Err(last)
    }
}

/// Read up to [`MAX_REPLY_LEN`] bytes until the terminator. The terminator is
/// not part of the result.
async fn read_reply(port: &mut DynSerial, timeout: Duration) -> Result<Vec<u8>, ProtocolError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut reply = Vec::with_capacity(MAX_REPLY_LEN);
    let mut byte = [0u8; 1];
    while reply.len() < MAX_REPLY_LEN {
        match tokio::time::timeout_at(deadline, port.read(&mut byte)).await {
            Err(_) => return Err(ProtocolError::Timeout),
            Ok(Err(e)) => return Err(ProtocolError::Io(e)),
            Ok(Ok(0)) => {
                return Err(ProtocolError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "port closed",
                )))
            }
            Ok(Ok(_)) if byte[0] == TERMINATOR => return Ok(reply),
            Ok(Ok(_)) => reply.push(byte[0]),
        }
    }
    Err(ProtocolError::Malformed(
        String::from_utf8_lossy(&reply).into_owned(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_u24, Axis};
    use astro_core::mock_serial;

    #[test]
    fn parse_port_strings() {
        assert_eq!(
            PortSpec::parse("synscan://192.168.4.1").unwrap(),
            PortSpec::Tcp {
                host: "192.168.4.1".into(),
                port: DEFAULT_TCP_PORT
            }
        );
        assert_eq!(
            PortSpec::parse("synscan://mount.local:11880").unwrap(),
            PortSpec::Tcp {
                host: "mount.local".into(),
                port: 11880
            }
        );
        assert_eq!(
            PortSpec::parse("sim://eq6").unwrap(),
            PortSpec::Simulator {
                profile: "eq6".into()
            }
        );
        assert!(matches!(
            PortSpec::parse("/dev/ttyUSB0").unwrap(),
            PortSpec::Serial { baud_rate: 9600, .. }
        ));
        assert!(PortSpec::parse("synscan://:4030").is_err());
        assert!(PortSpec::parse("synscan://host:notaport").is_err());
        assert!(PortSpec::parse("  ").is_err());
    }

    #[test]
    fn parse_bracketed_ipv6_hosts() {
        assert_eq!(
            PortSpec::parse("synscan://[::1]").unwrap(),
            PortSpec::Tcp {
                host: "::1".into(),
                port: DEFAULT_TCP_PORT
            }
        );
        let spec = PortSpec::parse("synscan://[fe80::2]:11880").unwrap();
        assert_eq!(
            spec,
            PortSpec::Tcp {
                host: "fe80::2".into(),
                port: 11880
            }
        );
        assert_eq!(spec.to_string(), "synscan://[fe80::2]:11880");
        assert!(PortSpec::parse("synscan://::1").is_err());
        assert!(PortSpec::parse("synscan://[::1").is_err());
        assert!(PortSpec::parse("synscan://[::1]4030").is_err());
        assert!(PortSpec::parse("synscan://[]:4030").is_err());
    }

    fn port(timeout_ms: u64) -> (SynscanPort, mock_serial::MockDeviceHarness) {
        let (serial, device) = mock_serial::new();
        let config = TransportConfig {
            timeout: Duration::from_millis(timeout_ms),
            ..TransportConfig::default()
        };
        (SynscanPort::new(Box::new(serial), config), device)
    }

    #[tokio::test(start_paused = true)]
    async fn firmware_round_trip() {
        let (port, mut device) = port(500);
        let task = tokio::spawn(async move { port.transact(Command::Firmware).await });
        device.expect_and_respond(b":e1\r", b"=AB0102\r").await;
        let payload = task.await.unwrap().unwrap();
        assert_eq!(decode_u24(&payload).unwrap(), 131499);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_reply_is_retried_once() {
        let (port, mut device) = port(500);
        let task = tokio::spawn(async move { port.transact(Command::Position(Axis::Ra)).await });
        device.expect_and_respond(b":j1\r", b"garbage\r").await;
        device.expect_and_respond(b":j1\r", b"=000080\r").await;
        assert_eq!(task.await.unwrap().unwrap(), "000080");
    }

    #[tokio::test(start_paused = true)]
    async fn error_reply_is_not_retried() {
        let (port, mut device) = port(500);
        let task = tokio::spawn(async move { port.transact(Command::Start(Axis::Dec)).await });
        device.expect_and_respond(b":J2\r", b"!2\r").await;
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ProtocolError::Rejected { ref code } if code == "2"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(device.try_take_written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out_after_two_attempts() {
        let (port, mut device) = port(300);
        let task = tokio::spawn(async move { port.transact(Command::Status(Axis::Ra)).await });
        device.expect_write(b":f1\r").await;
        device.expect_write(b":f1\r").await;
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_bytes_are_drained_before_write() {
        let (port, mut device) = port(500);
        device.send_response(b"=LATE\r").unwrap();
        let task = tokio::spawn(async move { port.transact(Command::Position(Axis::Dec)).await });
        device.expect_and_respond(b":j2\r", b"=000080\r").await;
        assert_eq!(task.await.unwrap().unwrap(), "000080");
    }
}
