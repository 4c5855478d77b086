//! # OBU Core Library
//!
//! Device communication for the peripherals of an on-board toll unit.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - EPDI framing with CRC16 (main board, payment terminal, card records)
//! - Serial transport with silence-terminated reads
//! - Length-prefixed TCP transport for the card relay
//! - Clients for the main board, terminal, QR scanner and NFC readers
//! - Background scanning with cancellation and bounded event channels
//!
//! ## Example
//!
//! ```rust,ignore
//! use obu_core::prelude::*;
//!
//! let config = ReaderConfig::from_file("reader.json")?;
//! let mut reader = open_reader(&config)?;
//! reader.initialize()?;
//!
//! let mut worker = spawn_scanner(reader, 32)?;
//! if let Some(events) = worker.events() {
//!     while let Some(event) = events.blocking_recv() {
//!         if let ReaderEvent::Card(card) = event {
//!             println!("card {}", card.uid_hex());
//!         }
//!     }
//! }
//! let (_reader, outcome) = worker.stop()?;
//! outcome?;
//! ```

/// Device and relay settings
pub mod config;
/// Peripheral clients
pub mod devices;
/// Framing, transports and errors
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{CorvusConfig, ReaderConfig, SerialConfig};
    pub use crate::devices::{
        open_reader, spawn_scanner, AliveResponse, CardEvent, CardInfo, CardReader,
        CorvusNfcReader, Mboard, QrScanner, ReaderEvent, ReaderMode, ScanEvent, SerialNfcReader,
        Terminal, TerminalAddress, TerminalAliveResponse, Worker,
    };
    pub use crate::protocol::{ProtocolError, Result, SerialLink, TcpLink};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
