//! Card relay ("Corvus" ECR proxy) client
//!
//! The relay speaks length-prefixed ASCII over TCP. Every request carries a
//! 4-digit sequence number `####`:
//!
//! | request | text |
//! |---|---|
//! | terminal operational? | `300000####01` |
//! | logon | `010000####01L<operator>;P<SHA1 hex>` |
//! | read card UID | `010000####95` |
//! | read card data | `010000####90` |
//!
//! A reply is successful when its bytes 12..15 are `"000"`. While waiting,
//! the client sends keepalives so the relay does not drop the session.

use sha1::{Digest, Sha1};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{report, CardEvent, CardReader, ReaderEvent};
use crate::config::CorvusConfig;
use crate::devices::worker::{sleep_cancellable, EventSink};
use crate::protocol::{hex_string, ProtocolError, Result, TcpLink};

const PASSWORD_BLOCK_LEN: usize = 9;
const SEQUENCE_RANGE: std::ops::Range<usize> = 6..10;
const STATUS_RANGE: std::ops::Range<usize> = 12..15;

const OPERATIONAL_TIMEOUT: Duration = Duration::from_secs(5);
const LOGON_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-attempt deadline of the continuous read loop
pub const SCAN_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between attempts of the continuous read loop
pub const SCAN_RETRY_DELAY: Duration = Duration::from_millis(500);

const UID_OK: &str = "95000";
const UID_NOT_LOGGED_IN: &str = "95001";
const CARD_OK: &str = "90000";

/// Upper-case SHA1 hex of the password zero-padded (or cut) to 9 bytes
pub fn password_digest(password: &str) -> String {
    let mut block = [0u8; PASSWORD_BLOCK_LEN];
    let bytes = password.as_bytes();
    let len = bytes.len().min(PASSWORD_BLOCK_LEN);
    block[..len].copy_from_slice(&bytes[..len]);

    let mut hasher = Sha1::new();
    hasher.update(block);
    hex_string(&hasher.finalize())
}

/// Terminal-operational query
pub fn operational_message(seq: u16) -> String {
    format!("300000{:04}01", seq)
}

/// Logon with operator and hashed password
pub fn logon_message(seq: u16, operator_id: &str, password: &str) -> String {
    format!(
        "010000{:04}01L{};P{}",
        seq,
        operator_id,
        password_digest(password)
    )
}

/// Read the UID of the next card
pub fn read_uid_message(seq: u16) -> String {
    format!("010000{:04}95", seq)
}

/// Read the card number of the next card
pub fn read_card_message(seq: u16) -> String {
    format!("010000{:04}90", seq)
}

/// Status field of a reply reads "000"
pub fn is_success_response(response: &[u8]) -> bool {
    response.get(STATUS_RANGE) == Some(b"000".as_slice())
}

/// The reply carries sequence number `seq`
pub fn answers_request(response: &str, seq: u16) -> bool {
    response.get(SEQUENCE_RANGE) == Some(format!("{:04}", seq).as_str())
}

/// Outcome of a read-UID reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UidReply {
    /// Hex UID of the presented card
    Uid(String),
    /// The relay wants a logon first
    NotLoggedIn,
    /// No UID marker in the reply
    Missing,
}

/// Extract the UID that follows "95000"
pub fn parse_uid_response(response: &str) -> UidReply {
    if let Some(pos) = response.find(UID_OK) {
        let uid = &response[pos + UID_OK.len()..];
        if !uid.is_empty() {
            return UidReply::Uid(uid.to_string());
        }
    }
    if response.contains(UID_NOT_LOGGED_IN) {
        return UidReply::NotLoggedIn;
    }
    UidReply::Missing
}

/// Extract the card number that follows "90000", up to '='
pub fn parse_card_response(response: &str) -> Option<String> {
    let pos = response.find(CARD_OK)?;
    let data = &response[pos + CARD_OK.len()..];
    let pan = data.split('=').next().unwrap_or(data);
    (!pan.is_empty()).then(|| pan.to_string())
}

/// Client for the card relay
pub struct CorvusNfcReader {
    config: CorvusConfig,
    link: Option<TcpLink>,
    counter: u16,
    cancel: CancellationToken,
}

impl CorvusNfcReader {
    /// Client for `config`; connects on first use
    pub fn new(config: CorvusConfig) -> Self {
        Self {
            config,
            link: None,
            counter: 0,
            cancel: CancellationToken::new(),
        }
    }

    /// Relay settings
    pub fn config(&self) -> &CorvusConfig {
        &self.config
    }

    /// A session is open
    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Token that aborts a pending exchange when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn next_counter(&mut self) -> u16 {
        self.counter = (self.counter + 1) % 10000;
        self.counter
    }

    fn keepalive(&self) -> Duration {
        Duration::from_millis(self.config.keepalive_ms)
    }

    /// Connect unless already connected
    pub fn connect(&mut self) -> Result<()> {
        if self.link.is_none() {
            let timeout = Duration::from_secs(self.config.timeout_secs);
            let link = TcpLink::connect(&self.config.host, self.config.port, timeout)?;
            self.link = Some(link);
        }
        Ok(())
    }

    /// Close the session, if any
    pub fn disconnect(&mut self) {
        if self.link.take().is_some() {
            info!("Disconnected from {}:{}", self.config.host, self.config.port);
        }
    }

    /// Send request `seq` and wait for its reply, keeping the session alive
    ///
    /// Late replies to earlier requests are discarded.
    fn exchange(
        &mut self,
        seq: u16,
        message: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.connect()?;
        let keepalive = self.keepalive();
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| ProtocolError::PortError("not connected".to_string()))?;

        let deadline = Instant::now() + timeout;
        let result = match link.send_message(message) {
            Ok(()) => loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match link.wait_for_response(remaining, Some(keepalive), cancel) {
                    Ok(reply) if !answers_request(&reply, seq) => {
                        warn!("discarding reply to another request: {}", reply);
                    }
                    other => break other,
                }
            },
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            if e.is_io_failure() {
                self.disconnect();
            }
        }
        result
    }

    fn operational_with(&mut self, cancel: &CancellationToken) -> Result<()> {
        let seq = self.next_counter();
        let reply = self.exchange(seq, &operational_message(seq), OPERATIONAL_TIMEOUT, cancel)?;
        if !is_success_response(reply.as_bytes()) {
            return Err(ProtocolError::DeviceError(format!(
                "terminal not operational: {reply}"
            )));
        }
        Ok(())
    }

    fn logon_with(&mut self, cancel: &CancellationToken) -> Result<()> {
        let seq = self.next_counter();
        let message = logon_message(seq, &self.config.operator_id, &self.config.password);
        let reply = self.exchange(seq, &message, LOGON_TIMEOUT, cancel)?;
        if !is_success_response(reply.as_bytes()) {
            return Err(ProtocolError::DeviceError(format!("logon failed: {reply}")));
        }
        debug!("logged on as operator {}", self.config.operator_id);
        Ok(())
    }

    fn read_uid_with(&mut self, timeout: Duration, cancel: &CancellationToken) -> Result<String> {
        let seq = self.next_counter();
        let reply = self.exchange(seq, &read_uid_message(seq), timeout, cancel)?;
        match parse_uid_response(&reply) {
            UidReply::Uid(uid) => Ok(uid),
            UidReply::NotLoggedIn => Err(ProtocolError::DeviceError("not logged in".to_string())),
            UidReply::Missing => Err(ProtocolError::ParseError(format!(
                "no UID in response: {reply}"
            ))),
        }
    }

    /// Ask whether the payment terminal behind the relay is up
    pub fn is_terminal_operational(&mut self) -> Result<()> {
        let cancel = self.cancel.clone();
        self.operational_with(&cancel)
    }

    /// Log on with the configured operator and password
    pub fn logon(&mut self) -> Result<()> {
        let cancel = self.cancel.clone();
        self.logon_with(&cancel)
    }

    /// Single read-UID request; assumes a prior logon
    pub fn read_uid(&mut self, timeout: Duration) -> Result<String> {
        let cancel = self.cancel.clone();
        self.read_uid_with(timeout, &cancel)
    }

    fn read_nfc_uid_with(&mut self, timeout: Duration, cancel: &CancellationToken) -> Result<String> {
        self.connect()?;
        self.operational_with(cancel)?;
        self.logon_with(cancel)?;
        let uid = self.read_uid_with(timeout, cancel)?;
        info!("Relay card UID={}", uid);
        Ok(uid)
    }

    /// Connect, check the terminal, log on, then wait up to `timeout` for a card UID
    pub fn read_nfc_uid(&mut self, timeout: Duration) -> Result<String> {
        let cancel = self.cancel.clone();
        self.read_nfc_uid_with(timeout, &cancel)
    }

    /// Like [`CorvusNfcReader::read_nfc_uid`], but returns the card number
    pub fn read_card_data(&mut self, timeout: Duration) -> Result<String> {
        let cancel = self.cancel.clone();
        self.connect()?;
        self.operational_with(&cancel)?;
        self.logon_with(&cancel)?;

        let seq = self.next_counter();
        let reply = self.exchange(seq, &read_card_message(seq), timeout, &cancel)?;
        parse_card_response(&reply).ok_or_else(|| {
            ProtocolError::ParseError(format!("no card data in response: {reply}"))
        })
    }
}

impl CardReader for CorvusNfcReader {
    fn name(&self) -> &str {
        "corvus"
    }

    fn initialize(&mut self) -> Result<()> {
        self.connect()
    }

    fn read_card(&mut self, timeout: Duration, cancel: &CancellationToken) -> Result<CardEvent> {
        self.read_nfc_uid_with(timeout, cancel).map(CardEvent::uid)
    }

    /// Repeat the full read sequence until cancelled
    ///
    /// Timeouts, malformed replies and relay-reported failures are retried
    /// after a short pause. Socket failures end the loop.
    fn scan(&mut self, cancel: &CancellationToken, sink: &EventSink<ReaderEvent>) -> Result<()> {
        report(
            sink,
            format!("[Corvus] Reading from {}:{}", self.config.host, self.config.port),
        );

        let outcome = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }
            match self.read_nfc_uid_with(SCAN_READ_TIMEOUT, cancel) {
                Ok(uid) => {
                    report(sink, format!("[Corvus] Card UID={uid}"));
                    sink.emit(ReaderEvent::Card(CardEvent::uid(uid)));
                }
                Err(e) if e.is_io_failure() => break Err(e),
                Err(ProtocolError::Timeout) => debug!("no card within {:?}", SCAN_READ_TIMEOUT),
                Err(e) => {
                    warn!("relay read failed: {}", e);
                    sink.emit(ReaderEvent::Log(format!("[Corvus] {e}")));
                }
            }
            if !sleep_cancellable(cancel, SCAN_RETRY_DELAY) {
                break Ok(());
            }
        };

        match &outcome {
            Ok(()) => report(sink, "[Corvus] Reader stopped".to_string()),
            Err(e) => {
                error!("relay scan ended: {}", e);
                sink.emit(ReaderEvent::Log(format!("[Corvus] Connection error: {e}")));
            }
        }
        self.disconnect();
        outcome
    }
}
