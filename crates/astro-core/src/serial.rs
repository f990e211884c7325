//! Byte-stream ports shared by wire-protocol drivers.
//!
//! Mount controllers are reached over a serial line, a TCP socket or an
//! in-process simulator. All three end up as a [`DynSerial`]: anything that
//! is `AsyncRead + AsyncWrite`. The transaction lock of a physical device is
//! the mutex inside [`SharedPort`].
//!
//! Opening a real serial device needs the `serial` feature:
//!
//! ```toml
//! [dependencies]
//! astro-core = { path = "../astro-core", features = ["serial"] }
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::Mutex;

/// Anything usable as a port: `tokio_serial::SerialStream`, `TcpStream`,
/// `DuplexStream`, the mock serial port.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

pub type DynSerial = Box<dyn SerialPortIO>;

/// Port plus the per-device transaction lock.
pub type SharedPort = Arc<Mutex<DynSerial>>;

pub fn wrap_shared(port: DynSerial) -> SharedPort {
    Arc::new(Mutex::new(port))
}

/// Open a serial device at 8N1 without flow control. Runs the blocking open
/// on the blocking pool.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    path: &str,
    baud_rate: u32,
    device_name: &str,
) -> anyhow::Result<tokio_serial::SerialStream> {
    use anyhow::Context;
    use tokio_serial::SerialPortBuilderExt;

    let path = path.to_string();
    let device_name = device_name.to_string();
    tokio::task::spawn_blocking(move || {
        tokio_serial::new(&path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .with_context(|| format!("Failed to open {device_name} on {path}"))
    })
    .await
    .context("serial open task failed")?
}

/// Read and discard whatever arrives within `window`. Returns the number of
/// bytes thrown away. Stops early on EOF or an I/O error.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin + ?Sized>(port: &mut R, window: Duration) -> usize {
    let mut scratch = [0u8; 128];
    let deadline = tokio::time::Instant::now() + window;
    let mut discarded = 0;

    loop {
        match tokio::time::timeout_at(deadline, port.read(&mut scratch)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
            Ok(Ok(n)) => discarded += n,
        }
    }
    discarded
}
