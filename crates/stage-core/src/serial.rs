//! Serial Port Abstractions for Driver Crates
//!
//! This module provides shared types and utilities for async serial communication
//! that can be used by driver crates without duplicating definitions.
//!
//! # Types
//!
//! - [`SerialPortIO`]: Trait alias combining AsyncRead + AsyncWrite for serial ports
//! - [`DynSerial`]: Type-erased boxed serial port
//! - [`SerialReader`] / [`SerialWriter`]: the two halves of a split port. The
//!   reader is handed to whichever task currently owns the receive side; the
//!   writer is shared behind a mutex by every command issuer.
//! - [`PortOpener`]: seam used by controllers to obtain a transport, so tests
//!   can hand in a mock port instead of opening hardware.
//!
//! # Utilities
//!
//! - [`open_serial_async`]: Open a serial port with spawn_blocking
//! - [`available_ports`]: Enumerate serial ports present on the host
//!
//! # Example
//!
//! ```rust,ignore
//! use stage_core::serial::{open_serial_async, split_port};
//!
//! let port = open_serial_async("/dev/ttyUSB0", 115200, "XD-C").await?;
//! let (reader, writer) = split_port(Box::new(port));
//! ```

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadHalf, WriteHalf};

use crate::error::{AppResult, StageError};

// =============================================================================
// Serial Port Trait
// =============================================================================

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port. This includes:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing)
/// - [`crate::mock_serial::MockSerialPort`] (scripted device)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

// Blanket implementation for all types meeting the requirements
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

// =============================================================================
// Type Aliases
// =============================================================================

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Buffered read half of a split serial port.
///
/// `BufReader` enables `read_line()` for the line-oriented query/response
/// exchanges while still allowing raw `read()` for telemetry streaming.
pub type SerialReader = BufReader<ReadHalf<DynSerial>>;

/// Write half of a split serial port.
pub type SerialWriter = WriteHalf<DynSerial>;

// =============================================================================
// Helper Functions
// =============================================================================

/// Split a type-erased serial port into a buffered reader and a writer.
pub fn split_port(port: DynSerial) -> (SerialReader, SerialWriter) {
    let (read, write) = tokio::io::split(port);
    (BufReader::new(read), write)
}

/// Description of a serial port found on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    /// OS path of the port (e.g. "/dev/ttyACM0", "COM4")
    pub name: String,
    /// USB serial number when the port is a USB device
    pub serial_number: Option<String>,
    /// USB product string when available
    pub product: Option<String>,
}

/// Enumerate serial ports present on this host.
pub fn available_ports() -> AppResult<Vec<PortInfo>> {
    let ports = serialport::available_ports()
        .map_err(|e| StageError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

    Ok(ports
        .into_iter()
        .map(|p| {
            let (serial_number, product) = match p.port_type {
                serialport::SerialPortType::UsbPort(usb) => (usb.serial_number, usb.product),
                _ => (None, None),
            };
            PortInfo {
                name: p.port_name,
                serial_number,
                product,
            }
        })
        .collect())
}

// =============================================================================
// Port Opener Seam
// =============================================================================

/// Opens the transport for a controller.
///
/// Controllers never open ports directly; they ask their opener. Production
/// code uses [`SerialOpener`], tests inject a mock that hands out a scripted
/// port.
#[async_trait]
pub trait PortOpener: Send + Sync {
    /// Open `path` at `baud_rate` and return the type-erased stream.
    async fn open(&self, path: &str, baud_rate: u32) -> AppResult<DynSerial>;
}

/// Opens real serial ports through `tokio-serial`.
#[derive(Debug, Clone, Default)]
pub struct SerialOpener;

#[async_trait]
impl PortOpener for SerialOpener {
    async fn open(&self, path: &str, baud_rate: u32) -> AppResult<DynSerial> {
        let stream = open_serial_async(path, baud_rate, "stage controller").await?;
        Ok(Box::new(stream))
    }
}

// =============================================================================
// Serial Port Utilities
// =============================================================================

/// Open a serial port asynchronously using spawn_blocking.
///
/// This function wraps the serial port opening in `spawn_blocking` to avoid
/// blocking the async runtime during port initialization. Standard settings
/// are applied: 8N1, no flow control.
///
/// # Errors
///
/// Returns an error if the port cannot be opened (busy, not present) or
/// spawn_blocking fails.
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> AppResult<tokio_serial::SerialStream> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let device_name_owned = device_name.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                StageError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!(
                        "Failed to open {} serial port {}: {}",
                        device_name_owned, port_path_owned, e
                    ),
                ))
            })
    })
    .await
    .map_err(|e| {
        StageError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("spawn_blocking for serial port opening failed: {}", e),
        ))
    })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_split_port_with_duplex() {
        let (mut host, device) = tokio::io::duplex(64);
        let (mut reader, mut writer) = split_port(Box::new(device));

        host.write_all(b"EPOS=12\n").await.unwrap();
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line.trim(), "EPOS=12");

        writer.write_all(b"DPOS=5\n").await.unwrap();
        writer.flush().await.unwrap();
        let mut buf = [0u8; 7];
        host.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"DPOS=5\n");
    }
}
