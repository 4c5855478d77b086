//! OBU peripheral clients
//!
//! Each client owns its transport and performs strictly sequential
//! request/response exchanges. Devices that report on their own (card
//! readers, the QR scanner in continuous mode) run on a [`worker::Worker`].

pub mod mboard;
pub mod nfc;
pub mod qr_scanner;
pub mod terminal;
pub mod worker;

pub use mboard::{AliveResponse, Mboard};
pub use nfc::{
    open_reader, spawn_scanner, CardEvent, CardInfo, CardReader, CorvusNfcReader, ReaderEvent,
    ReaderMode, ReaderState, SerialNfcReader,
};
pub use qr_scanner::{QrScanner, ScanEvent};
pub use terminal::{Terminal, TerminalAddress, TerminalAliveResponse};
pub use worker::{event_channel, EventSink, Worker};
