//! Protocol errors

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while talking to an OBU peripheral
///
/// The set of kinds is closed; some variants carry diagnostic context.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// No reply before the deadline, or the wait was cancelled
    #[error("Timed out waiting for device")]
    Timeout,

    /// Frame checksum does not match its payload
    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch {
        /// CRC carried by the frame
        expected: u16,
        /// CRC computed over the payload
        actual: u16,
    },

    /// Reply is malformed or too short
    #[error("Invalid response from device")]
    InvalidResponse,

    /// The port or socket could not be opened or configured
    #[error("Port error: {0}")]
    PortError(String),

    /// The NFC reader could not be opened
    #[error("NFC reader initialization failed: {0}")]
    NfcInit(String),

    /// The NFC key exchange failed
    #[error("NFC authentication failed")]
    NfcAuth,

    /// Only part of a command was written
    #[error("Command was not fully written")]
    CmdFailure,

    /// Reading from the device failed
    #[error("Read error: {0}")]
    ReadError(String),

    /// Writing to the device failed
    #[error("Write error: {0}")]
    WriteError(String),

    /// A message could not be decoded
    #[error("Parse error: {0}")]
    ParseError(String),

    /// The peer reported a failure
    #[error("Device reported failure: {0}")]
    DeviceError(String),
}

/// Payload-free discriminant of [`ProtocolError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum ErrorKind {
    Timeout,
    CrcMismatch,
    InvalidResponse,
    PortError,
    NfcInit,
    NfcAuth,
    CmdFailure,
    ReadError,
    WriteError,
    ParseError,
    DeviceError,
}

impl ProtocolError {
    /// Kind of this error without its diagnostic payload
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::Timeout => ErrorKind::Timeout,
            ProtocolError::CrcMismatch { .. } => ErrorKind::CrcMismatch,
            ProtocolError::InvalidResponse => ErrorKind::InvalidResponse,
            ProtocolError::PortError(_) => ErrorKind::PortError,
            ProtocolError::NfcInit(_) => ErrorKind::NfcInit,
            ProtocolError::NfcAuth => ErrorKind::NfcAuth,
            ProtocolError::CmdFailure => ErrorKind::CmdFailure,
            ProtocolError::ReadError(_) => ErrorKind::ReadError,
            ProtocolError::WriteError(_) => ErrorKind::WriteError,
            ProtocolError::ParseError(_) => ErrorKind::ParseError,
            ProtocolError::DeviceError(_) => ErrorKind::DeviceError,
        }
    }

    /// OS-level I/O failures end continuous polling loops
    pub fn is_io_failure(&self) -> bool {
        matches!(
            self,
            ProtocolError::PortError(_) | ProtocolError::ReadError(_) | ProtocolError::WriteError(_)
        )
    }
}

/// Result alias used by every device operation
pub type Result<T> = std::result::Result<T, ProtocolError>;
