//! Wire Protocol Layer
//!
//! Framing, checksums and transports shared by every OBU peripheral.
//!
//! The main board and the payment terminal speak EPDI, a byte-stuffed frame
//! with a CRC16 trailer. The QR scanner and the serial NFC reader use short
//! raw commands over the same serial transport. The card relay is reached
//! over TCP with length-prefixed ASCII messages.

pub mod crc16;
pub mod epdi;
mod error;
pub mod serial;
pub mod stream;
pub mod tcp;

use std::time::Duration;

pub use epdi::{EpdiFrame, FrameBuilder};
pub use error::{ErrorKind, ProtocolError, Result};
pub use serial::{list_ports, PortInfo, SerialLink};
pub use stream::{CommunicationChannel, SerialChannel, TcpChannel};
pub use tcp::TcpLink;

/// Data link escape
pub const DLE: u8 = 0x10;

/// Start of frame marker (follows DLE)
pub const SYNC: u8 = 0x16;

/// End of frame marker (follows DLE)
pub const ETX: u8 = 0x03;

/// Default baud rate of the main board and terminal lines
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default deadline for a serial reply in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Silence on the line that marks the end of a reply, in milliseconds
pub const DEFAULT_QUIET_MS: u64 = 100;

/// Granularity of blocking reads; cancellation is observed at least this often
pub const POLL_SLICE: Duration = Duration::from_millis(50);

/// Format bytes as space separated upper-case hex for logs
pub(crate) fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Format bytes as contiguous upper-case hex
pub fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}
