//! NFC card readers
//!
//! Three reader variants share one capability:
//! - a serial reader that streams card records without a handshake,
//! - the same serial reader behind a two-phase key exchange,
//! - a card relay reached over TCP that answers with the card UID.
//!
//! [`open_reader`] picks the variant from a [`ReaderConfig`] and
//! [`spawn_scanner`] runs any of them on a background thread.

pub mod card;
pub mod corvus;
pub mod serial_reader;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::worker::{EventSink, Worker};
use crate::config::ReaderConfig;
use crate::protocol::Result;

pub use card::{parse_card_info, CardFrameScanner, CardInfo};
pub use corvus::CorvusNfcReader;
pub use serial_reader::{ReaderMode, ReaderState, SerialNfcReader};

/// A card seen by a reader
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CardEvent {
    /// Full record from a serial reader
    Card {
        /// Parsed record
        info: CardInfo,
        /// Receive time
        timestamp: DateTime<Utc>,
    },
    /// UID reported by the relay
    Uid {
        /// Hex UID as sent by the relay
        uid: String,
        /// Receive time
        timestamp: DateTime<Utc>,
    },
}

impl CardEvent {
    /// Record read now
    pub fn card(info: CardInfo) -> Self {
        CardEvent::Card {
            info,
            timestamp: Utc::now(),
        }
    }

    /// UID read now
    pub fn uid(uid: impl Into<String>) -> Self {
        CardEvent::Uid {
            uid: uid.into(),
            timestamp: Utc::now(),
        }
    }

    /// Card UID as upper-case hex
    pub fn uid_hex(&self) -> &str {
        match self {
            CardEvent::Card { info, .. } => &info.uid_hex,
            CardEvent::Uid { uid, .. } => uid,
        }
    }

    /// When the card was received
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            CardEvent::Card { timestamp, .. } | CardEvent::Uid { timestamp, .. } => *timestamp,
        }
    }
}

/// What a scanning reader delivers to its consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ReaderEvent {
    /// A card was read
    Card(CardEvent),
    /// Diagnostic line, also written to the log
    Log(String),
}

/// Write a diagnostic line to the log and to the consumer
pub(crate) fn report(sink: &EventSink<ReaderEvent>, message: String) {
    info!("{}", message);
    sink.emit(ReaderEvent::Log(message));
}

/// Common capability of every card reader
pub trait CardReader: Send {
    /// Short name used for logs and thread names
    fn name(&self) -> &str;

    /// Bring the reader to the point where it can report cards
    fn initialize(&mut self) -> Result<()>;

    /// Wait for a single card, at most `timeout`
    fn read_card(&mut self, timeout: Duration, cancel: &CancellationToken) -> Result<CardEvent>;

    /// Report cards to `sink` until cancelled
    ///
    /// Returns `Ok(())` once `cancel` fires, or the I/O error that ended the loop.
    fn scan(&mut self, cancel: &CancellationToken, sink: &EventSink<ReaderEvent>) -> Result<()>;
}

impl<R: CardReader + ?Sized> CardReader for Box<R> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn initialize(&mut self) -> Result<()> {
        (**self).initialize()
    }

    fn read_card(&mut self, timeout: Duration, cancel: &CancellationToken) -> Result<CardEvent> {
        (**self).read_card(timeout, cancel)
    }

    fn scan(&mut self, cancel: &CancellationToken, sink: &EventSink<ReaderEvent>) -> Result<()> {
        (**self).scan(cancel, sink)
    }
}

/// Open the reader described by `config`
pub fn open_reader(config: &ReaderConfig) -> Result<Box<dyn CardReader>> {
    let reader: Box<dyn CardReader> = match config {
        ReaderConfig::SerialPassive(serial) => {
            Box::new(SerialNfcReader::open(serial, ReaderMode::Passive)?)
        }
        ReaderConfig::SerialAuthenticated(serial) => {
            Box::new(SerialNfcReader::open(serial, ReaderMode::Authenticated)?)
        }
        ReaderConfig::TcpRelay(relay) => Box::new(CorvusNfcReader::new(relay.clone())),
    };
    info!("Opened card reader {}", reader.name());
    Ok(reader)
}

/// Run `reader.scan` on a background thread
pub fn spawn_scanner<R>(reader: R, capacity: usize) -> Result<Worker<R, ReaderEvent>>
where
    R: CardReader + 'static,
{
    let name = format!("nfc-{}", reader.name());
    Worker::spawn(&name, reader, capacity, |reader, cancel, sink| {
        reader.scan(cancel, sink)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = ReaderEvent::Card(CardEvent::uid("04A1B2C3D4E5F6"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "card");
        assert_eq!(json["data"]["type"], "uid");
        assert_eq!(json["data"]["uid"], "04A1B2C3D4E5F6");

        let log = serde_json::to_value(ReaderEvent::Log("hello".into())).unwrap();
        assert_eq!(log["data"], "hello");
    }

    #[test]
    fn test_open_missing_serial_reader_fails() {
        let config = ReaderConfig::SerialPassive(crate::config::SerialConfig::new(
            "/dev/does-not-exist-nfc",
            921600,
        ));
        assert!(matches!(
            open_reader(&config),
            Err(crate::protocol::ProtocolError::NfcInit(_))
        ));
    }
}
