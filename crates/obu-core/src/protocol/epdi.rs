//! EPDI frame encoding/decoding
//!
//! Byte-stuffed frames used by the main board and the payment terminal.
//!
//! Frame format:
//! - 2 bytes: DLE SYNC (0x10 0x16)
//! - N bytes: payload, every 0x10 doubled
//! - 2 bytes: DLE ETX (0x10 0x03)
//! - 2 bytes: CRC16 of the unescaped payload (big-endian, not escaped)

use byteorder::{BigEndian, ByteOrder};

use super::{crc16, ProtocolError, Result, DLE, ETX, SYNC};

/// Smallest possible frame: header, terminator and CRC around an empty payload
pub const MIN_FRAME_LEN: usize = 6;

/// A decoded EPDI frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpdiFrame {
    /// Unescaped payload
    pub payload: Vec<u8>,
    /// CRC16 of the payload
    pub crc: u16,
}

impl EpdiFrame {
    /// Create a frame around the given payload
    pub fn new(payload: Vec<u8>) -> Self {
        let crc = crc16::calculate(&payload);
        Self { payload, crc }
    }

    /// Decode and validate a frame from raw bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let payload = decode(data)?;
        Ok(Self::new(payload))
    }

    /// Encode the frame to raw bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        encode(&self.payload)
    }
}

/// Outcome of walking a stuffed payload looking for DLE ETX
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Unstuffed {
    /// Terminator found at `terminator` (index of its DLE, relative to the input)
    Complete { payload: Vec<u8>, terminator: usize },
    /// Ran out of bytes before a terminator
    Incomplete,
    /// A DLE followed by something other than DLE or ETX
    Malformed,
}

/// Unstuff bytes that follow a DLE SYNC header, stopping at the first unescaped DLE ETX
pub(crate) fn unstuff(data: &[u8]) -> Unstuffed {
    let mut payload = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        let byte = data[i];
        if byte != DLE {
            payload.push(byte);
            i += 1;
            continue;
        }
        match data.get(i + 1) {
            Some(&DLE) => {
                payload.push(DLE);
                i += 2;
            }
            Some(&ETX) => {
                return Unstuffed::Complete {
                    payload,
                    terminator: i,
                }
            }
            Some(_) => return Unstuffed::Malformed,
            None => return Unstuffed::Incomplete,
        }
    }
    Unstuffed::Incomplete
}

/// Wrap a payload into an EPDI frame
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let escapes = payload.iter().filter(|&&b| b == DLE).count();
    let mut frame = Vec::with_capacity(payload.len() + escapes + MIN_FRAME_LEN);

    frame.push(DLE);
    frame.push(SYNC);
    for &byte in payload {
        if byte == DLE {
            frame.push(DLE);
        }
        frame.push(byte);
    }
    frame.push(DLE);
    frame.push(ETX);

    let mut crc_bytes = [0u8; 2];
    BigEndian::write_u16(&mut crc_bytes, crc16::calculate(payload));
    frame.extend_from_slice(&crc_bytes);

    frame
}

/// Validate an EPDI frame and return its unescaped payload
///
/// Bytes after the CRC trailer are ignored.
pub fn decode(frame: &[u8]) -> Result<Vec<u8>> {
    if frame.len() < MIN_FRAME_LEN || frame[0] != DLE || frame[1] != SYNC {
        return Err(ProtocolError::InvalidResponse);
    }

    let (payload, terminator) = match unstuff(&frame[2..]) {
        Unstuffed::Complete {
            payload,
            terminator,
        } => (payload, terminator),
        Unstuffed::Incomplete | Unstuffed::Malformed => {
            return Err(ProtocolError::InvalidResponse)
        }
    };

    let crc_start = 2 + terminator + 2;
    let trailer = frame
        .get(crc_start..crc_start + 2)
        .ok_or(ProtocolError::InvalidResponse)?;

    let actual = BigEndian::read_u16(trailer);
    let expected = crc16::calculate(&payload);
    if actual != expected {
        return Err(ProtocolError::CrcMismatch { expected, actual });
    }

    Ok(payload)
}

/// Length of the first complete frame at the start of `buffer`, CRC included
pub fn frame_len(buffer: &[u8]) -> Option<usize> {
    if buffer.len() < MIN_FRAME_LEN || buffer[0] != DLE || buffer[1] != SYNC {
        return None;
    }
    match unstuff(&buffer[2..]) {
        Unstuffed::Complete { terminator, .. } => {
            let len = 2 + terminator + 4;
            (len <= buffer.len()).then_some(len)
        }
        _ => None,
    }
}

/// Builder for request payloads
pub struct FrameBuilder {
    payload: Vec<u8>,
}

impl FrameBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            payload: Vec::new(),
        }
    }

    /// Add a single byte
    pub fn byte(mut self, b: u8) -> Self {
        self.payload.push(b);
        self
    }

    /// Add a 16-bit value (big-endian)
    pub fn u16_be(mut self, value: u16) -> Self {
        let mut bytes = [0u8; 2];
        BigEndian::write_u16(&mut bytes, value);
        self.payload.extend_from_slice(&bytes);
        self
    }

    /// Add raw bytes
    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.payload.extend_from_slice(data);
        self
    }

    /// The unescaped payload built so far
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Build the framed bytes
    pub fn build(self) -> Vec<u8> {
        encode(&self.payload)
    }
}

impl Default for FrameBuilder {
    fn default() -> Self {
        Self::new()
    }
}
