//! QR scanner client
//!
//! The scanner is driven with 3-byte trigger commands and answers with the
//! decoded text followed by status and terminator bytes. A reply of "NR"
//! means nothing was read; NAK in the status position means the scan failed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::worker::{EventSink, Worker};
use crate::config::SerialConfig;
use crate::protocol::{hex_dump, ProtocolError, Result, SerialLink};

/// Start scanning
pub const TRIGGER_ON: [u8; 3] = [0x16, 0x54, 0x0D];

/// Stop scanning
pub const TRIGGER_OFF: [u8; 3] = [0x16, 0x55, 0x0D];

/// Prefix of configuration and query commands
pub const MENU_PREFIX: [u8; 3] = [0x16, 0x4D, 0x0D];

const ACK: u8 = 0x06;
const NAK: u8 = 0x15;

/// Baud rates tried by [`QrScanner::detect_baud_rate`]
pub const PROBE_BAUD_RATES: [u32; 5] = [9600, 19200, 38400, 57600, 115200];

/// Identical codes within this window are reported once
pub const DEBOUNCE_WINDOW: Duration = Duration::from_secs(1);

const INFO_TIMEOUT: Duration = Duration::from_millis(2000);

fn is_padding(byte: u8) -> bool {
    matches!(byte, b'\r' | b'\n' | ACK | NAK | b'.' | b'!' | b' ' | 0x00)
}

/// Turn a raw scanner reply into the decoded text
pub fn parse_reply(raw: &[u8]) -> Result<String> {
    if raw.len() >= 2 && raw[raw.len() - 2] == NAK {
        return Err(ProtocolError::DeviceError("scanner reported NAK".to_string()));
    }

    let start = raw.iter().position(|&b| !is_padding(b));
    let end = raw.iter().rposition(|&b| !is_padding(b));
    let text = match (start, end) {
        (Some(s), Some(e)) => &raw[s..=e],
        _ => return Err(ProtocolError::InvalidResponse),
    };

    if text == b"NR" {
        return Err(ProtocolError::DeviceError("no read".to_string()));
    }
    Ok(String::from_utf8_lossy(text).into_owned())
}

/// A code delivered by continuous scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanEvent {
    /// Decoded text
    pub code: String,
    /// When the code was read
    pub timestamp: DateTime<Utc>,
}

/// Suppresses a code repeated within a time window
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    last: Option<(String, Instant)>,
}

impl Debouncer {
    /// Debouncer suppressing repeats within `window`
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// Whether `code`, seen at `now`, should be delivered
    pub fn accept(&mut self, code: &str, now: Instant) -> bool {
        if let Some((last, at)) = &self.last {
            if last == code && now.saturating_duration_since(*at) < self.window {
                return false;
            }
        }
        self.last = Some((code.to_string(), now));
        true
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DEBOUNCE_WINDOW)
    }
}

/// Client for the QR scanner
pub struct QrScanner {
    link: SerialLink,
    cancel: CancellationToken,
}

impl QrScanner {
    /// Open the scanner line
    pub fn open(config: &SerialConfig) -> Result<Self> {
        Ok(Self::new(SerialLink::open(config)?))
    }

    /// Use an already-open link
    pub fn new(link: SerialLink) -> Self {
        Self {
            link,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that aborts a pending read when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Give back the serial link
    pub fn into_link(self) -> SerialLink {
        self.link
    }

    /// Start the aimer and decoder
    pub fn trigger_on(&mut self) -> Result<()> {
        self.link.write(&TRIGGER_ON).map(|_| ())
    }

    /// Stop the aimer and decoder
    pub fn trigger_off(&mut self) -> Result<()> {
        self.link.write(&TRIGGER_OFF).map(|_| ())
    }

    /// Wait for one reply and decode it
    pub fn read_code(&mut self, cancel: &CancellationToken) -> Result<String> {
        let raw = self.link.read(cancel)?;
        parse_reply(&raw)
    }

    /// Trigger, wait up to `timeout` for a code, then stop the trigger
    ///
    /// The trigger is switched off whatever the outcome of the read.
    pub fn scan_once(&mut self, timeout: Duration) -> Result<String> {
        self.trigger_on()?;
        let cancel = self.cancel.clone();
        let read = self
            .link
            .read_with_timeout(timeout, &cancel)
            .and_then(|raw| parse_reply(&raw));
        let off = self.trigger_off();

        let code = read?;
        off?;
        info!("QR code: {}", code);
        Ok(code)
    }

    /// Query the firmware revision report
    pub fn device_info(&mut self) -> Result<String> {
        let mut cmd = MENU_PREFIX.to_vec();
        cmd.extend_from_slice(b"REVINF");
        self.link.write(&cmd)?;

        let cancel = self.cancel.clone();
        let raw = self.link.read_with_timeout(INFO_TIMEOUT, &cancel)?;
        Ok(String::from_utf8_lossy(&raw).trim().to_string())
    }

    /// Find a baud rate the scanner on `port_name` answers at
    ///
    /// Each candidate gets a trigger and a short read; the first rate that
    /// produces any reply wins.
    pub fn detect_baud_rate(port_name: &str, candidates: &[u32]) -> Result<Option<u32>> {
        let never = CancellationToken::new();
        for &baud in candidates {
            let config = SerialConfig {
                port_name: port_name.to_string(),
                baud_rate: baud,
                ..SerialConfig::qr_scanner()
            };
            let mut link = SerialLink::open(&config)?;
            link.write(&TRIGGER_ON)?;
            thread::sleep(Duration::from_millis(100));
            let reply = link.read_with_timeout(Duration::from_millis(500), &never);
            link.write(&TRIGGER_OFF)?;

            match reply {
                Ok(raw) => {
                    info!("QR scanner answered at {} baud: {}", baud, hex_dump(&raw));
                    return Ok(Some(baud));
                }
                Err(ProtocolError::Timeout) => debug!("no reply at {} baud", baud),
                Err(e) => return Err(e),
            }
            drop(link);
            thread::sleep(Duration::from_millis(200));
        }
        Ok(None)
    }

    /// Scan until cancelled, delivering each new code to `sink`
    ///
    /// The trigger is re-armed after every reply and switched off on exit.
    pub fn scan_continuous(
        &mut self,
        cancel: &CancellationToken,
        sink: &EventSink<ScanEvent>,
    ) -> Result<()> {
        let mut debouncer = Debouncer::default();
        self.trigger_on()?;

        let outcome = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }
            match self.read_code(cancel) {
                Ok(code) => {
                    if debouncer.accept(&code, Instant::now()) {
                        info!("QR code: {}", code);
                        sink.emit(ScanEvent {
                            code,
                            timestamp: Utc::now(),
                        });
                    }
                }
                Err(ProtocolError::Timeout) => continue,
                Err(e) if e.is_io_failure() => break Err(e),
                Err(e) => debug!("scan discarded: {}", e),
            }
            if let Err(e) = self.trigger_on() {
                break Err(e);
            }
        };

        if let Err(e) = self.trigger_off() {
            warn!("failed to switch scanner trigger off: {}", e);
        }
        outcome
    }

    /// Run [`QrScanner::scan_continuous`] on a background thread
    pub fn start_continuous(self, capacity: usize) -> Result<Worker<QrScanner, ScanEvent>> {
        Worker::spawn("qr-scanner", self, capacity, |scanner, cancel, sink| {
            scanner.scan_continuous(cancel, sink)
        })
    }
}
