//! Device configuration
//!
//! Serde-deserializable settings for the serial lines and the card relay.
//! Every field has a default matching the hardware, so a configuration file
//! only needs to name what differs.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::protocol::{ProtocolError, Result, DEFAULT_BAUD_RATE, DEFAULT_QUIET_MS, DEFAULT_TIMEOUT_MS};

/// Default node of the main board line
pub const MBOARD_PORT: &str = "/dev/ttyS0";

/// Default node of the payment terminal line
pub const TERMINAL_PORT: &str = "/dev/ttyUSB1";

/// Default node of the QR scanner
pub const QR_SCANNER_PORT: &str = "/dev/ttyQrReader";

/// Default node of the serial NFC reader
pub const NFC_PORT: &str = "/dev/ttymxc1";

/// Baud rate of the serial NFC reader
pub const NFC_BAUD_RATE: u32 = 921600;

/// Factory baud rate of the QR scanner
pub const QR_BAUD_RATE: u32 = 9600;

/// Settings for one serial line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Device node, e.g. "/dev/ttyS0"
    pub port_name: String,
    /// Line speed
    pub baud_rate: u32,
    /// Overall deadline of a read in milliseconds
    pub timeout_ms: u64,
    /// Silence that ends a reply in milliseconds
    pub quiet_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: MBOARD_PORT.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            quiet_ms: DEFAULT_QUIET_MS,
        }
    }
}

impl SerialConfig {
    /// Defaults for a given node and speed
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Self::default()
        }
    }

    /// Main board line
    pub fn mboard() -> Self {
        Self::new(MBOARD_PORT, DEFAULT_BAUD_RATE)
    }

    /// Payment terminal line
    pub fn terminal() -> Self {
        Self::new(TERMINAL_PORT, DEFAULT_BAUD_RATE)
    }

    /// QR scanner line; replies end after 200 ms of silence
    pub fn qr_scanner() -> Self {
        Self {
            quiet_ms: 200,
            ..Self::new(QR_SCANNER_PORT, QR_BAUD_RATE)
        }
    }

    /// Serial NFC reader line
    pub fn nfc() -> Self {
        Self::new(NFC_PORT, NFC_BAUD_RATE)
    }
}

/// Settings for the TCP card relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorvusConfig {
    /// Relay host name or address
    pub host: String,
    /// Relay TCP port
    pub port: u16,
    /// Operator number sent at logon
    pub operator_id: String,
    /// Operator password; only its digest goes on the wire
    pub password: String,
    /// Deadline of a single exchange in seconds
    pub timeout_secs: u64,
    /// Interval between keepalives while waiting, in milliseconds
    pub keepalive_ms: u64,
}

impl Default for CorvusConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4543,
            operator_id: "1".to_string(),
            password: "23646".to_string(),
            timeout_secs: 20,
            keepalive_ms: 200,
        }
    }
}

/// Which card reader to open, and how
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReaderConfig {
    /// Serial reader that streams card records without a handshake
    SerialPassive(SerialConfig),
    /// Serial reader that needs the two-phase key exchange first
    SerialAuthenticated(SerialConfig),
    /// Card relay reached over TCP
    TcpRelay(CorvusConfig),
}

impl Default for ReaderConfig {
    fn default() -> Self {
        ReaderConfig::SerialAuthenticated(SerialConfig::nfc())
    }
}

impl ReaderConfig {
    /// Parse a configuration from JSON text
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ProtocolError::ParseError(e.to_string()))
    }

    /// Load a configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| ProtocolError::ReadError(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    /// Serialize the configuration as pretty-printed JSON
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| ProtocolError::ParseError(e.to_string()))
    }
}
