//! Card record parsing
//!
//! A card record arrives as a byte-stuffed `DLE SYNC ... DLE ETX crc crc`
//! frame whose unescaped payload has a fixed layout:
//!
//! | offset | field |
//! |---|---|
//! | 0 | destination address |
//! | 1 | service |
//! | 2 | counter |
//! | 3 | source address |
//! | 4 | ack |
//! | 5..7 | ATQA (big-endian) |
//! | 7 | card type (cascade tag) |
//! | 8..11 | UID bytes 0..3 |
//! | 11 | BCC1 |
//! | 12..16 | UID bytes 3..7 |
//! | 16 | BCC2 |
//! | 17 | SAK |
//! | 18.. | extra |
//!
//! The CRC trailer is required to be present but is not verified.

use byteorder::{BigEndian, ByteOrder};
use serde::Serialize;

use crate::protocol::epdi::{self, Unstuffed};
use crate::protocol::{hex_string, DLE, SYNC};

/// Service code of a card record
pub const READ_CARD: u8 = 0xE3;

/// Bytes kept while waiting for a frame to complete
pub const MAX_BUFFER_LEN: usize = 1024;

const HEADER_LEN: usize = 5;
const BODY_LEN: usize = 13;
const UID_LEN: usize = 7;

/// A decoded card record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CardInfo {
    /// Address the record is sent to
    pub dest_addr: u8,
    /// Service code; [`READ_CARD`] for card records
    pub service: u8,
    /// Reader frame counter
    pub counter: u8,
    /// Address of the reader
    pub source_addr: u8,
    /// Zero when the read succeeded
    pub ack: u8,
    /// Answer to request, type A
    pub atqa: u16,
    /// Cascade tag byte
    pub card_type: u8,
    /// Card UID without its check bytes
    pub uid: [u8; UID_LEN],
    /// The 7 UID bytes as upper-case hex
    pub uid_hex: String,
    /// Check byte over the first UID bytes
    pub bcc1: u8,
    /// Check byte over the last UID bytes
    pub bcc2: u8,
    /// Select acknowledge
    pub sak: u8,
    /// Bytes following the SAK
    pub extra: Vec<u8>,
}

impl CardInfo {
    /// Successful card-read record
    pub fn is_card_read(&self) -> bool {
        self.service == READ_CARD && self.ack == 0
    }

    /// One-line summary for logs
    pub fn summary(&self) -> String {
        let mut line = format!(
            "Card UID={} ATQA=0x{:04X} CT=0x{:02X} SAK=0x{:02X}",
            self.uid_hex, self.atqa, self.card_type, self.sak
        );
        if !self.extra.is_empty() {
            line.push_str(" EXTRA=0x");
            line.push_str(&hex_string(&self.extra));
        }
        line
    }
}

/// Read the fixed layout out of an unescaped payload
fn parse_payload(payload: &[u8]) -> Option<CardInfo> {
    if payload.len() < HEADER_LEN + 1 {
        return None;
    }
    let body = payload.get(HEADER_LEN..HEADER_LEN + BODY_LEN)?;

    let mut uid = [0u8; UID_LEN];
    uid[..3].copy_from_slice(&body[3..6]);
    uid[3..].copy_from_slice(&body[7..11]);

    Some(CardInfo {
        dest_addr: payload[0],
        service: payload[1],
        counter: payload[2],
        source_addr: payload[3],
        ack: payload[4],
        atqa: BigEndian::read_u16(&body[0..2]),
        card_type: body[2],
        uid,
        uid_hex: hex_string(&uid),
        bcc1: body[6],
        bcc2: body[11],
        sak: body[12],
        extra: payload[HEADER_LEN + BODY_LEN..].to_vec(),
    })
}

fn find_header(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w[0] == DLE && w[1] == SYNC)
}

/// Parse the first card record in `buffer`
///
/// Returns `None` until a complete, well-formed record is present, so it can
/// be re-invoked as bytes arrive.
pub fn parse_card_info(buffer: &[u8]) -> Option<CardInfo> {
    let start = find_header(buffer)?;
    let body = &buffer[start + 2..];
    match epdi::unstuff(body) {
        // Terminator plus both CRC bytes must be present
        Unstuffed::Complete {
            payload,
            terminator,
        } if body.len() >= terminator + 4 => parse_payload(&payload),
        _ => None,
    }
}

/// Accumulates reader output and yields card-read records
///
/// Frames that are complete but are not successful card reads are dropped,
/// so a status reply never blocks the records behind it.
#[derive(Debug, Default)]
pub struct CardFrameScanner {
    buffer: Vec<u8>,
}

impl CardFrameScanner {
    /// Empty scanner
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(256),
        }
    }

    /// Append received bytes
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes currently buffered
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Nothing buffered
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop everything buffered
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Take the next successful card read out of the buffer, if one is complete
    pub fn next_card(&mut self) -> Option<CardInfo> {
        loop {
            let Some(start) = find_header(&self.buffer) else {
                // Keep a trailing DLE that may begin the next header
                let keep = usize::from(self.buffer.last() == Some(&DLE));
                let drop = self.buffer.len() - keep;
                self.buffer.drain(..drop);
                return None;
            };
            self.buffer.drain(..start);

            match epdi::unstuff(&self.buffer[2..]) {
                Unstuffed::Complete {
                    payload,
                    terminator,
                } => {
                    let end = 2 + terminator + 4;
                    if self.buffer.len() < end {
                        return self.await_more();
                    }
                    self.buffer.drain(..end);
                    match parse_payload(&payload) {
                        Some(card) if card.is_card_read() => return Some(card),
                        _ => continue,
                    }
                }
                Unstuffed::Incomplete => return self.await_more(),
                Unstuffed::Malformed => {
                    self.buffer.drain(..2);
                }
            }
        }
    }

    fn await_more(&mut self) -> Option<CardInfo> {
        if self.buffer.len() > MAX_BUFFER_LEN {
            self.buffer.clear();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn card_payload() -> Vec<u8> {
        vec![
            0x72, 0xE3, 0x01, 0xF2, 0x00, 0x00, 0x04, 0x88, 0x04, 0x12, 0x34, 0x9A, 0x56, 0x78,
            0x9A, 0xBC, 0xCD, 0x08,
        ]
    }

    #[test]
    fn test_reference_record() {
        let frame = epdi::encode(&card_payload());
        let card = parse_card_info(&frame).unwrap();

        assert_eq!(card.atqa, 0x0004);
        assert_eq!(card.sak, 0x08);
        assert_eq!(card.card_type, 0x88);
        assert_eq!(card.uid_hex, "04123456789ABC");
        assert_eq!(card.bcc1, 0x9A);
        assert_eq!(card.bcc2, 0xCD);
        assert!(card.extra.is_empty());
        assert!(card.is_card_read());
    }

    #[test]
    fn test_extra_bytes_and_escaped_payload() {
        let mut payload = card_payload();
        payload[9] = 0x10;
        payload.extend_from_slice(&[0x10, 0x20]);
        let card = parse_card_info(&epdi::encode(&payload)).unwrap();

        assert_eq!(card.uid_hex, "04103456789ABC");
        assert_eq!(card.extra, vec![0x10, 0x20]);
        assert!(card.summary().ends_with("EXTRA=0x1020"));
    }

    #[test]
    fn test_leading_noise_skipped() {
        let mut data = vec![0x00, 0xFF, 0x10];
        data.extend(epdi::encode(&card_payload()));
        assert!(parse_card_info(&data).is_some());
    }

    #[test]
    fn test_short_payload_rejected() {
        let frame = epdi::encode(&card_payload()[..17]);
        assert_eq!(parse_card_info(&frame), None);
    }

    #[test]
    fn test_missing_crc_rejected() {
        let frame = epdi::encode(&card_payload());
        assert_eq!(parse_card_info(&frame[..frame.len() - 1]), None);
    }

    #[test]
    fn test_scanner_skips_non_card_frames() {
        let mut status = card_payload();
        status[1] = 0x63;
        let mut nacked = card_payload();
        nacked[4] = 0x01;

        let mut scanner = CardFrameScanner::new();
        scanner.push(&epdi::encode(&status));
        scanner.push(&epdi::encode(&nacked));
        scanner.push(&[0xAA, 0xBB]);
        scanner.push(&epdi::encode(&card_payload()));

        let card = scanner.next_card().unwrap();
        assert_eq!(card.counter, 0x01);
        assert!(scanner.is_empty());
        assert_eq!(scanner.next_card(), None);
    }

    #[test]
    fn test_scanner_waits_for_crc() {
        let frame = epdi::encode(&card_payload());
        let mut scanner = CardFrameScanner::new();
        scanner.push(&frame[..frame.len() - 2]);
        assert_eq!(scanner.next_card(), None);
        scanner.push(&frame[frame.len() - 2..]);
        assert!(scanner.next_card().is_some());
    }

    #[test]
    fn test_scanner_caps_buffer() {
        let mut scanner = CardFrameScanner::new();
        scanner.push(&[DLE, SYNC]);
        scanner.push(&vec![0x41; MAX_BUFFER_LEN]);
        assert_eq!(scanner.next_card(), None);
        assert!(scanner.is_empty());
    }
}
