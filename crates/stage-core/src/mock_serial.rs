//! Scripted serial port for exercising controllers without hardware.
//!
//! [`MockSerialPort`] implements `AsyncRead` and `AsyncWrite` and is handed to
//! the code under test. The test keeps the paired [`MockDeviceHarness`] and
//! plays the controller firmware: it asserts on command lines written by the
//! host and pushes telemetry or query answers back.
//!
//! [`MockOpener`] implements [`PortOpener`] so a whole controller can be
//! opened against prepared mock ports.
//!
//! The pair is connected by two unbounded channels:
//! - host writes travel to the harness as raw chunks
//! - harness responses travel to the port and are buffered until read
//!
//! # Example
//!
//! ```rust,ignore
//! let (opener, mut device) = mock_serial::opener();
//! let controller = Controller::with_opener(config, Arc::new(opener))?;
//! controller.open_port().await?;
//!
//! device.expect_line("INFO=4").await;
//! device.send_str("STAT=1024 EPOS=0 TIME=10\n").unwrap();
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::error::{AppResult, StageError};
use crate::serial::{DynSerial, PortOpener};

const EXPECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Host-facing side of the mock serial port.
#[derive(Debug)]
pub struct MockSerialPort {
    writes_tx: UnboundedSender<Vec<u8>>,
    reads_rx: UnboundedReceiver<Vec<u8>>,
    read_buffer: VecDeque<u8>,
}

/// Test-facing side that plays the device.
#[derive(Debug)]
pub struct MockDeviceHarness {
    writes_rx: UnboundedReceiver<Vec<u8>>,
    reads_tx: UnboundedSender<Vec<u8>>,
    write_buffer: Vec<u8>,
}

/// Create a connected pair of [`MockSerialPort`] and [`MockDeviceHarness`].
pub fn new() -> (MockSerialPort, MockDeviceHarness) {
    let (host_to_device_tx, host_to_device_rx) = mpsc::unbounded_channel();
    let (device_to_host_tx, device_to_host_rx) = mpsc::unbounded_channel();

    let port = MockSerialPort {
        writes_tx: host_to_device_tx,
        reads_rx: device_to_host_rx,
        read_buffer: VecDeque::new(),
    };

    let harness = MockDeviceHarness {
        writes_rx: host_to_device_rx,
        reads_tx: device_to_host_tx,
        write_buffer: Vec::new(),
    };

    (port, harness)
}

/// Create an opener that hands out a single mock port, plus its harness.
pub fn opener() -> (MockOpener, MockDeviceHarness) {
    let (port, harness) = new();
    (MockOpener::with_ports(vec![port]), harness)
}

impl MockSerialPort {
    fn fill(&mut self, buf: &mut ReadBuf<'_>) {
        let to_read = std::cmp::min(buf.remaining(), self.read_buffer.len());
        let chunk: Vec<u8> = self.read_buffer.drain(..to_read).collect();
        buf.put_slice(&chunk);
    }
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.read_buffer.is_empty() {
            self.fill(buf);
            return Poll::Ready(Ok(()));
        }

        match self.reads_rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                self.read_buffer.extend(chunk);
                self.fill(buf);
                Poll::Ready(Ok(()))
            }
            // Harness dropped: end-of-file
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writes_tx.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock device harness disconnected",
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
    /// Push bytes to the host as if the device had sent them.
    ///
    /// # Errors
    /// Returns error if the host port has been dropped.
    pub fn send_response(&self, data: &[u8]) -> Result<(), &'static str> {
        self.reads_tx
            .send(data.to_vec())
            .map_err(|_| "Failed to send response: host port disconnected")
    }

    /// Push a telegram or answer given as text.
    pub fn send_str(&self, text: &str) -> Result<(), &'static str> {
        self.send_response(text.as_bytes())
    }

    /// Wait for the next complete `\n`-terminated line written by the host.
    ///
    /// Returns `None` if no complete line arrives within two seconds or the
    /// host side is gone.
    pub async fn next_line(&mut self) -> Option<String> {
        self.next_line_within(EXPECT_TIMEOUT).await
    }

    /// Like [`next_line`](Self::next_line) with an explicit timeout.
    pub async fn next_line_within(&mut self, wait: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(pos) = self.write_buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.write_buffer.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line[..line.len() - 1]);
                return Some(text.trim_end_matches('\r').to_string());
            }
            match tokio::time::timeout_at(deadline, self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) | Err(_) => return None,
            }
        }
    }

    /// Wait for the host to write exactly `expected` as its next line.
    ///
    /// # Panics
    /// Panics if no line arrives within two seconds or the line differs.
    pub async fn expect_line(&mut self, expected: &str) {
        match self.next_line().await {
            Some(line) => assert_eq!(
                line, expected,
                "Mismatch in expected command line. Expected `{}`, got `{}`.",
                expected, line
            ),
            None => panic!(
                "Timeout waiting for command `{}`; pending bytes `{}`",
                expected,
                String::from_utf8_lossy(&self.write_buffer)
            ),
        }
    }

    /// Skip lines until `expected` is written; returns the skipped lines.
    ///
    /// # Panics
    /// Panics if `expected` is not written within two seconds.
    pub async fn expect_line_eventually(&mut self, expected: &str) -> Vec<String> {
        let mut skipped = Vec::new();
        loop {
            match self.next_line().await {
                Some(line) if line == expected => return skipped,
                Some(line) => skipped.push(line),
                None => panic!(
                    "Timeout waiting for command `{}`; saw {:?}",
                    expected, skipped
                ),
            }
        }
    }

    /// Expect a command line and answer it in one step.
    pub async fn expect_and_respond(&mut self, expected: &str, response: &str) {
        self.expect_line(expected).await;
        if let Err(e) = self.send_str(response) {
            panic!("{}", e);
        }
    }

    /// Collect every line written until the host goes quiet for 50 ms.
    pub async fn drain_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = self.next_line_within(Duration::from_millis(50)).await {
            lines.push(line);
        }
        self.write_buffer.clear();
        lines
    }
}

/// [`PortOpener`] that hands out prepared mock ports in order.
///
/// Every call to `open` consumes one port. Once exhausted, `open` fails with
/// an I/O error the same way a missing device would.
#[derive(Debug, Default)]
pub struct MockOpener {
    ports: Mutex<VecDeque<MockSerialPort>>,
    opened: Mutex<Vec<(String, u32)>>,
}

impl MockOpener {
    /// Opener serving `ports` in order.
    pub fn with_ports(ports: Vec<MockSerialPort>) -> Self {
        Self {
            ports: Mutex::new(ports.into()),
            opened: Mutex::new(Vec::new()),
        }
    }

    /// Queue another port for a later `open`.
    pub fn push(&self, port: MockSerialPort) {
        self.ports.lock().push_back(port);
    }

    /// Every `(path, baud_rate)` that was opened so far.
    pub fn opened(&self) -> Vec<(String, u32)> {
        self.opened.lock().clone()
    }
}

#[async_trait]
impl PortOpener for MockOpener {
    async fn open(&self, path: &str, baud_rate: u32) -> AppResult<DynSerial> {
        let port = self.ports.lock().pop_front().ok_or_else(|| {
            StageError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no mock device behind {}", path),
            ))
        })?;
        self.opened.lock().push((path.to_string(), baud_rate));
        Ok(Box::new(port))
    }
}
