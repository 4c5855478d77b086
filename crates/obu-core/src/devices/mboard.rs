//! Main control board client
//!
//! Requests are EPDI frames carrying `[0xF2, service, counter_hi, counter_lo, data..]`.
//! The counter increments on every request and wraps at u16.

use byteorder::{BigEndian, ByteOrder};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::SerialConfig;
use crate::protocol::epdi::{self, FrameBuilder};
use crate::protocol::{ProtocolError, Result, SerialLink};

/// Request address of the main board
pub const REQUEST_ADDR: u8 = 0xF2;

/// Address the main board answers from
pub const RESPONSE_ADDR: u8 = 0x72;

/// Main board services
pub mod service {
    /// Health and version query
    pub const ALIVE: u8 = 0x00;
    /// Read a block of registers
    pub const READ_REGISTERS: u8 = 0x30;
}

const ALIVE_REPLY_LEN: usize = 17;
const REGISTERS_OFFSET: usize = 5;

/// Health and version report of the main board
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AliveResponse {
    /// Board status word
    pub status: u16,
    /// Hardware revision
    pub hw_version: u16,
    /// Firmware version
    pub sw_version: u16,
    /// Bootloader version
    pub bootloader_version: u16,
    /// Seconds since power-up
    pub uptime_seconds: u32,
}

impl AliveResponse {
    fn from_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() < ALIVE_REPLY_LEN {
            return Err(ProtocolError::InvalidResponse);
        }
        Ok(Self {
            status: BigEndian::read_u16(&payload[5..7]),
            hw_version: BigEndian::read_u16(&payload[7..9]),
            sw_version: BigEndian::read_u16(&payload[9..11]),
            bootloader_version: BigEndian::read_u16(&payload[11..13]),
            uptime_seconds: BigEndian::read_u32(&payload[13..17]),
        })
    }
}

/// Client for the main control board
pub struct Mboard {
    link: SerialLink,
    counter: u16,
    cancel: CancellationToken,
}

impl Mboard {
    /// Open the main board line
    pub fn open(config: &SerialConfig) -> Result<Self> {
        Ok(Self::new(SerialLink::open(config)?))
    }

    /// Use an already-open link
    pub fn new(link: SerialLink) -> Self {
        Self {
            link,
            counter: 0,
            cancel: CancellationToken::new(),
        }
    }

    /// Counter value the next request will carry
    pub fn counter(&self) -> u16 {
        self.counter
    }

    /// Token that aborts a pending read when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Give the link back
    pub fn into_link(self) -> SerialLink {
        self.link
    }

    fn send_command(&mut self, service: u8, data: &[u8]) -> Result<Vec<u8>> {
        let frame = FrameBuilder::new()
            .byte(REQUEST_ADDR)
            .byte(service)
            .u16_be(self.counter)
            .bytes(data)
            .build();
        self.counter = self.counter.wrapping_add(1);

        self.link.write(&frame)?;
        let raw = self.link.read(&self.cancel)?;
        epdi::decode(&raw)
    }

    /// Query health, versions and uptime
    pub fn alive(&mut self) -> Result<AliveResponse> {
        let payload = self.send_command(service::ALIVE, &[])?;
        let alive = AliveResponse::from_payload(&payload)?;
        info!(
            "Mboard alive: status={:#06x} hw={} sw={} boot={} uptime={}s",
            alive.status,
            alive.hw_version,
            alive.sw_version,
            alive.bootloader_version,
            alive.uptime_seconds
        );
        Ok(alive)
    }

    /// Read `count` registers starting at `start`
    pub fn read_registers(&mut self, start: u8, count: u8) -> Result<Vec<u8>> {
        let payload = self.send_command(service::READ_REGISTERS, &[start, count])?;
        if payload.len() < REGISTERS_OFFSET {
            return Err(ProtocolError::InvalidResponse);
        }
        let registers = payload[REGISTERS_OFFSET..].to_vec();
        debug!("Mboard registers {}+{}: {} bytes", start, count, registers.len());
        Ok(registers)
    }
}
