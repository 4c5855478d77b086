//! Payment terminal client
//!
//! Requests are EPDI frames carrying `[base | 0x80, service, data..]` without a
//! counter. The terminal sometimes echoes a frame ahead of its reply; when a
//! read holds a complete frame followed by more bytes, the reply is the
//! second frame.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::SerialConfig;
use crate::protocol::epdi::{self, FrameBuilder};
use crate::protocol::{ProtocolError, Result, SerialLink, DLE, SYNC};

/// Terminal services
///
/// BEEP and WRITE_REGISTERS share code 0x31. They stay separate operations;
/// a beep carries no data.
pub mod service {
    /// Health and version query
    pub const ALIVE: u8 = 0x00;
    /// Write registers starting at a given index
    pub const WRITE_REGISTERS: u8 = 0x31;
    /// Sound the buzzer
    pub const BEEP: u8 = 0x31;
}

const REQUEST_FLAG: u8 = 0x80;
const ALIVE_REPLY_LEN: usize = 10;

/// Terminal or adapter on the shared line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TerminalAddress {
    /// Payment terminal A
    #[default]
    TerminalA = 0x30,
    /// Payment terminal B
    TerminalB = 0x31,
    /// Adapter board A
    AdapterA = 0x32,
    /// Adapter board B
    AdapterB = 0x33,
}

impl TerminalAddress {
    /// Base address
    pub fn base(self) -> u8 {
        self as u8
    }

    /// Address byte used in requests
    pub fn request_addr(self) -> u8 {
        self.base() | REQUEST_FLAG
    }
}

/// Health and version report of a terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TerminalAliveResponse {
    /// Device status word
    pub status: u16,
    /// Hardware revision
    pub hw_version: u16,
    /// Firmware version
    pub sw_version: u16,
    /// Bootloader version
    pub bootloader_version: u16,
}

impl TerminalAliveResponse {
    fn from_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() < ALIVE_REPLY_LEN {
            return Err(ProtocolError::InvalidResponse);
        }
        Ok(Self {
            status: BigEndian::read_u16(&payload[2..4]),
            hw_version: BigEndian::read_u16(&payload[4..6]),
            sw_version: BigEndian::read_u16(&payload[6..8]),
            bootloader_version: BigEndian::read_u16(&payload[8..10]),
        })
    }
}

/// Slice of `raw` starting at the first frame header, if any
fn from_header(raw: &[u8]) -> Option<&[u8]> {
    raw.windows(2)
        .position(|w| w[0] == DLE && w[1] == SYNC)
        .map(|start| &raw[start..])
}

/// Pick the reply frame out of a read, skipping leading noise and an echo
fn reply_frame(raw: &[u8]) -> &[u8] {
    let Some(framed) = from_header(raw) else {
        return raw;
    };
    match epdi::frame_len(framed) {
        Some(first) if first < framed.len() => {
            let rest = &framed[first..];
            from_header(rest).unwrap_or(rest)
        }
        _ => framed,
    }
}

/// Client for the payment terminal line
pub struct Terminal {
    link: SerialLink,
    cancel: CancellationToken,
}

impl Terminal {
    /// Open the terminal line
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

    /// Give the link back
    pub fn into_link(self) -> SerialLink {
        self.link
    }

    fn send_command(&mut self, addr: TerminalAddress, service: u8, data: &[u8]) -> Result<Vec<u8>> {
        let frame = FrameBuilder::new()
            .byte(addr.request_addr())
            .byte(service)
            .bytes(data)
            .build();

        self.link.write(&frame)?;
        let raw = self.link.read(&self.cancel)?;
        let reply = reply_frame(&raw);
        if reply.len() != raw.len() {
            debug!("{:?}: skipped {} leading bytes", addr, raw.len() - reply.len());
        }
        epdi::decode(reply)
    }

    /// Query health and versions of `addr`
    pub fn alive(&mut self, addr: TerminalAddress) -> Result<TerminalAliveResponse> {
        let payload = self.send_command(addr, service::ALIVE, &[])?;
        let alive = TerminalAliveResponse::from_payload(&payload)?;
        info!(
            "{:?} alive: status={:#06x} hw={} sw={} boot={}",
            addr, alive.status, alive.hw_version, alive.sw_version, alive.bootloader_version
        );
        Ok(alive)
    }

    /// Sound the buzzer of `addr`; succeeds once a valid frame comes back
    pub fn beep(&mut self, addr: TerminalAddress) -> Result<()> {
        self.send_command(addr, service::BEEP, &[])?;
        Ok(())
    }

    /// Write `data` to registers of `addr` starting at `start`
    pub fn write_registers(&mut self, addr: TerminalAddress, start: u8, data: &[u8]) -> Result<()> {
        let mut body = Vec::with_capacity(data.len() + 1);
        body.push(start);
        body.extend_from_slice(data);
        self.send_command(addr, service::WRITE_REGISTERS, &body)?;
        Ok(())
    }
}
