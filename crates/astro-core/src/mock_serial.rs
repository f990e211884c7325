//! Scriptable in-memory serial port for protocol tests.
//!
//! [`new`] returns a connected pair: a [`MockSerialPort`] implementing
//! `AsyncRead + AsyncWrite`, given to the code under test, and a
//! [`MockDeviceHarness`] kept by the test to assert what was written and to
//! play the device's replies.
//!
//! ```rust,ignore
//! let (port, mut device) = mock_serial::new();
//! let task = tokio::spawn(async move { query_firmware(port).await });
//!
//! device.expect_and_respond(b":e1\r", b"=AB0102\r").await;
//! assert_eq!(task.await??, 0x0201AB);
//! ```

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

const EXPECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Application side of the mock port.
#[derive(Debug)]
pub struct MockSerialPort {
    writes: UnboundedSender<Vec<u8>>,
    replies: UnboundedReceiver<Vec<u8>>,
    pending: VecDeque<u8>,
}

/// Test side of the mock port.
#[derive(Debug)]
pub struct MockDeviceHarness {
    writes: UnboundedReceiver<Vec<u8>>,
    replies: UnboundedSender<Vec<u8>>,
    received: Vec<u8>,
}

pub fn new() -> (MockSerialPort, MockDeviceHarness) {
    let (writes_tx, writes_rx) = mpsc::unbounded_channel();
    let (replies_tx, replies_rx) = mpsc::unbounded_channel();
    (
        MockSerialPort {
            writes: writes_tx,
            replies: replies_rx,
            pending: VecDeque::new(),
        },
        MockDeviceHarness {
            writes: writes_rx,
            replies: replies_tx,
            received: Vec::new(),
        },
    )
}

impl MockSerialPort {
    fn drain_into(&mut self, buf: &mut ReadBuf<'_>) {
        let n = buf.remaining().min(self.pending.len());
        let chunk: Vec<u8> = self.pending.drain(..n).collect();
        buf.put_slice(&chunk);
    }
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pending.is_empty() {
            match self.replies.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => self.pending.extend(chunk),
                // Harness dropped: end of file.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        self.drain_into(buf);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writes.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock device harness dropped",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl MockDeviceHarness {
    /// Queue bytes for the application to read.
    pub fn send_response(&self, data: &[u8]) -> io::Result<()> {
        self.replies
            .send(data.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "mock port dropped"))
    }

    /// Wait until the application has written `expected`.
    ///
    /// # Panics
    /// If the bytes differ or do not arrive within two seconds.
    #[allow(clippy::panic)]
    pub async fn expect_write(&mut self, expected: &[u8]) {
        while self.received.len() < expected.len() {
            match tokio::time::timeout(EXPECT_TIMEOUT, self.writes.recv()).await {
                Ok(Some(chunk)) => self.received.extend_from_slice(&chunk),
                Ok(None) => panic!("port dropped while expecting {:?}", String::from_utf8_lossy(expected)),
                Err(_) => panic!(
                    "timed out waiting for {:?}, got {:?}",
                    String::from_utf8_lossy(expected),
                    String::from_utf8_lossy(&self.received)
                ),
            }
        }
        let actual: Vec<u8> = self.received.drain(..expected.len()).collect();
        assert_eq!(
            actual,
            expected,
            "expected {:?}, got {:?}",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(&actual)
        );
    }

    #[allow(clippy::expect_used)]
    pub async fn expect_and_respond(&mut self, expected: &[u8], response: &[u8]) {
        self.expect_write(expected).await;
        self.send_response(response).expect("mock port dropped");
    }

    /// Read the next `\r`-terminated command, whatever it is.
    pub async fn next_command(&mut self) -> Option<Vec<u8>> {
        loop {
            if let Some(end) = self.received.iter().position(|&b| b == b'\r') {
                return Some(self.received.drain(..=end).collect());
            }
            let chunk = tokio::time::timeout(EXPECT_TIMEOUT, self.writes.recv())
                .await
                .ok()??;
            self.received.extend_from_slice(&chunk);
        }
    }

    /// Everything written so far that no expectation consumed.
    pub fn try_take_written(&mut self) -> Vec<u8> {
        while let Ok(chunk) = self.writes.try_recv() {
            self.received.extend_from_slice(&chunk);
        }
        std::mem::take(&mut self.received)
    }
}
