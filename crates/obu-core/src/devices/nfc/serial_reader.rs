//! Serial NFC reader
//!
//! Commands are raw `[0xF2, command, counter, data..]` bytes; replies carrying
//! cards are EPDI-framed records (see [`super::card`]). The counter is a u8
//! that wraps.
//!
//! An authenticated reader must complete a two-phase key exchange and be
//! re-armed with ENABLE after each card. A passive reader streams records on
//! its own.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::card::CardFrameScanner;
use super::{report, CardEvent, CardInfo, CardReader, ReaderEvent};
use crate::config::SerialConfig;
use crate::devices::worker::EventSink;
use crate::protocol::{ProtocolError, Result, SerialLink};

/// Request address of the reader
pub const ADDR_REQ: u8 = 0xF2;

/// Reader commands
pub mod command {
    /// First half of the key exchange
    pub const AUTH_A: u8 = 0x02;
    /// Second half, carrying the key
    pub const AUTH_B: u8 = 0x03;
    /// Arm the reader for the next card
    pub const ENABLE: u8 = 0x63;
}

/// Longest wait for one byte while scanning
pub const SCAN_POLL: Duration = Duration::from_millis(100);

const AUTH_A_REPLY_MAX: usize = 16;
const AUTH_B_REPLY_MAX: usize = 64;
const KEY_OFFSET: usize = 4;

/// How the reader is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderMode {
    /// Listen only
    Passive,
    /// Key exchange first, ENABLE before every card
    Authenticated,
}

/// Lifecycle of a serial reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderState {
    /// Opened, no handshake yet
    Uninitialized,
    /// Key exchange in progress
    Authenticating,
    /// Can report cards
    Ready,
    /// Scan loop running
    Scanning,
    /// Scan loop ended
    Stopped,
}

/// Client for a serial NFC reader
pub struct SerialNfcReader {
    link: SerialLink,
    mode: ReaderMode,
    state: ReaderState,
    counter: u8,
    frames: CardFrameScanner,
}

impl SerialNfcReader {
    /// Open the reader line
    pub fn open(config: &SerialConfig, mode: ReaderMode) -> Result<Self> {
        let link = SerialLink::open(config).map_err(|e| ProtocolError::NfcInit(e.to_string()))?;
        Ok(Self::new(link, mode))
    }

    /// Use an already-open link
    pub fn new(link: SerialLink, mode: ReaderMode) -> Self {
        Self {
            link,
            mode,
            state: ReaderState::Uninitialized,
            counter: 0,
            frames: CardFrameScanner::new(),
        }
    }

    /// Passive or authenticated
    pub fn mode(&self) -> ReaderMode {
        self.mode
    }

    /// Current lifecycle state
    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Give back the serial link
    pub fn into_link(self) -> SerialLink {
        self.link
    }

    fn send_command(&mut self, cmd: u8, data: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(3 + data.len());
        frame.extend_from_slice(&[ADDR_REQ, cmd, self.counter]);
        frame.extend_from_slice(data);
        self.counter = self.counter.wrapping_add(1);
        self.link.write(&frame).map(|_| ())
    }

    /// Read a reply of at most `max` bytes; silence is an empty reply
    fn read_reply(&mut self, max: usize) -> Result<Vec<u8>> {
        let never = CancellationToken::new();
        match self.link.read(&never) {
            Ok(mut reply) => {
                reply.truncate(max);
                Ok(reply)
            }
            Err(ProtocolError::Timeout) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn authenticate(&mut self) -> Result<()> {
        info!("NFC auth part A");
        self.send_command(command::AUTH_A, &[])
            .map_err(|_| ProtocolError::NfcAuth)?;
        let reply = self.read_reply(AUTH_A_REPLY_MAX)?;

        let key = if reply.len() < KEY_OFFSET {
            warn!("no auth key received, continuing with empty key");
            Vec::new()
        } else {
            debug!("got auth key, {} bytes", reply.len() - KEY_OFFSET);
            reply[KEY_OFFSET..].to_vec()
        };

        info!("NFC auth part B");
        self.send_command(command::AUTH_B, &key)
            .map_err(|_| ProtocolError::NfcAuth)?;
        self.read_reply(AUTH_B_REPLY_MAX)?;
        Ok(())
    }

    /// Arm the reader for the next card
    pub fn enable(&mut self) -> Result<()> {
        debug!("NFC enable card reading");
        self.send_command(command::ENABLE, &[])
    }

    fn ensure_ready(&mut self) -> Result<()> {
        match self.state {
            ReaderState::Uninitialized | ReaderState::Authenticating => self.initialize(),
            _ => Ok(()),
        }
    }

    fn rearm(&mut self) -> Result<()> {
        match self.mode {
            ReaderMode::Authenticated => self.enable(),
            ReaderMode::Passive => Ok(()),
        }
    }

    /// Feed one polled byte to the frame scanner
    fn poll_card(&mut self) -> Result<Option<CardInfo>> {
        match self.link.read_byte(SCAN_POLL)? {
            Some(byte) => {
                self.frames.push(&[byte]);
                Ok(self.frames.next_card())
            }
            None => Ok(None),
        }
    }

    /// Wait for one card record
    pub fn read_single_card(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CardInfo> {
        self.ensure_ready()?;
        self.frames.clear();
        self.rearm()?;

        let deadline = Instant::now() + timeout;
        while !cancel.is_cancelled() && Instant::now() < deadline {
            if let Some(card) = self.poll_card()? {
                info!("NFC {}", card.summary());
                return Ok(card);
            }
        }
        Err(ProtocolError::Timeout)
    }

    fn scan_loop(&mut self, cancel: &CancellationToken, sink: &EventSink<ReaderEvent>) -> Result<()> {
        if self.mode == ReaderMode::Authenticated {
            report(sink, "[NFC] Enable card reading".to_string());
        }
        self.rearm()?;

        while !cancel.is_cancelled() {
            if let Some(card) = self.poll_card()? {
                report(sink, format!("[NFC] {}", card.summary()));
                sink.emit(ReaderEvent::Card(CardEvent::card(card)));
                self.frames.clear();
                self.rearm()?;
            }
        }
        Ok(())
    }
}

impl CardReader for SerialNfcReader {
    fn name(&self) -> &str {
        match self.mode {
            ReaderMode::Passive => "serial-passive",
            ReaderMode::Authenticated => "serial-auth",
        }
    }

    /// Passive readers are ready at once; authenticated ones run the key exchange
    ///
    /// Repeated calls on a ready reader do nothing.
    fn initialize(&mut self) -> Result<()> {
        if matches!(self.state, ReaderState::Ready | ReaderState::Scanning) {
            return Ok(());
        }
        if self.mode == ReaderMode::Authenticated {
            self.state = ReaderState::Authenticating;
            if let Err(e) = self.authenticate() {
                self.state = ReaderState::Uninitialized;
                return Err(e);
            }
        }
        self.state = ReaderState::Ready;
        info!("NFC reader {} initialized", self.link.description());
        Ok(())
    }

    fn read_card(&mut self, timeout: Duration, cancel: &CancellationToken) -> Result<CardEvent> {
        self.read_single_card(timeout, cancel).map(CardEvent::card)
    }

    fn scan(&mut self, cancel: &CancellationToken, sink: &EventSink<ReaderEvent>) -> Result<()> {
        self.ensure_ready()?;
        self.state = ReaderState::Scanning;
        self.frames.clear();
        report(sink, "[NFC] Reader started".to_string());

        let outcome = self.scan_loop(cancel, sink);
        self.state = ReaderState::Stopped;

        match &outcome {
            Ok(()) => report(sink, "[NFC] Reader stopped".to_string()),
            Err(e) => {
                error!("NFC scan ended: {}", e);
                sink.emit(ReaderEvent::Log(format!("[NFC] Read error: {e}")));
            }
        }
        outcome
    }
}
