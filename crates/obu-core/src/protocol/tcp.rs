//! TCP transport for length-prefixed ASCII messages
//!
//! Each message is a big-endian u16 length followed by that many ASCII bytes.
//! A zero length is a keepalive and carries no message.

use byteorder::{BigEndian, ByteOrder};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::stream::{CommunicationChannel, TcpChannel};
use super::{ProtocolError, Result, POLL_SLICE};

/// Largest message body accepted from the peer
pub const MAX_MESSAGE_LEN: usize = 4096;

/// Zero-length frame sent while waiting on a slow peer
pub const KEEPALIVE: [u8; 2] = [0x00, 0x00];

/// Blocking client side of a length-prefixed TCP exchange
pub struct TcpLink {
    channel: Box<dyn CommunicationChannel>,
    buffer: Vec<u8>,
}

impl TcpLink {
    /// Connect to `host:port`, trying each resolved address in turn
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| ProtocolError::PortError(format!("{host}:{port}: {e}")))?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream
                        .set_nodelay(true)
                        .map_err(|e| ProtocolError::PortError(e.to_string()))?;
                    info!("Connected to {}", addr);
                    return Ok(Self::from_channel(Box::new(TcpChannel::new(stream))));
                }
                Err(e) => {
                    debug!("connect to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }

        Err(ProtocolError::PortError(match last_err {
            Some(e) => format!("{host}:{port}: {e}"),
            None => format!("{host}:{port}: no addresses resolved"),
        }))
    }

    /// Wrap an already-connected channel
    pub fn from_channel(channel: Box<dyn CommunicationChannel>) -> Self {
        Self {
            channel,
            buffer: Vec::new(),
        }
    }

    /// Human-readable description of the peer
    pub fn description(&self) -> String {
        self.channel.description()
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.channel.write_all(frame).map_err(|e| match e.kind() {
            io::ErrorKind::WriteZero => ProtocolError::CmdFailure,
            _ => ProtocolError::WriteError(e.to_string()),
        })?;
        self.channel
            .flush()
            .map_err(|e| ProtocolError::WriteError(e.to_string()))
    }

    /// Send one message with its length prefix
    pub fn send_message(&mut self, message: &str) -> Result<()> {
        let body = message.as_bytes();
        if body.len() > MAX_MESSAGE_LEN {
            return Err(ProtocolError::ParseError(format!(
                "message of {} bytes exceeds {}",
                body.len(),
                MAX_MESSAGE_LEN
            )));
        }

        let mut frame = vec![0u8; 2];
        BigEndian::write_u16(&mut frame, body.len() as u16);
        frame.extend_from_slice(body);

        debug!("{} TX: {}", self.channel.description(), message);
        self.write_frame(&frame)
    }

    /// Send a zero-length keepalive
    pub fn send_keepalive(&mut self) -> Result<()> {
        trace!("{} TX: keepalive", self.channel.description());
        self.write_frame(&KEEPALIVE)
    }

    /// Receive one message without sending keepalives
    pub fn receive_message(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.wait_for_response(timeout, None, cancel)
    }

    /// Receive one message, sending a keepalive every `keepalive` while waiting
    ///
    /// Incoming keepalives are discarded. Bytes belonging to a later message
    /// stay buffered for the next call. Cancellation is reported as `Timeout`.
    pub fn wait_for_response(
        &mut self,
        timeout: Duration,
        keepalive: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.channel
            .set_timeout(POLL_SLICE)
            .map_err(|e| ProtocolError::PortError(e.to_string()))?;

        let start = Instant::now();
        let mut last_keepalive = start;
        let mut chunk = [0u8; 512];

        loop {
            if let Some(message) = take_message(&mut self.buffer)? {
                debug!("{} RX: {}", self.channel.description(), message);
                return Ok(message);
            }
            if cancel.is_cancelled() || start.elapsed() >= timeout {
                return Err(ProtocolError::Timeout);
            }
            if let Some(interval) = keepalive {
                if last_keepalive.elapsed() >= interval {
                    self.send_keepalive()?;
                    last_keepalive = Instant::now();
                }
            }

            match self.channel.read(&mut chunk) {
                Ok(0) => {
                    return Err(ProtocolError::ReadError(
                        "connection closed by peer".to_string(),
                    ))
                }
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(ProtocolError::ReadError(e.to_string())),
            }
        }
    }
}

/// Pop the first complete message off `buffer`, skipping keepalives
fn take_message(buffer: &mut Vec<u8>) -> Result<Option<String>> {
    loop {
        if buffer.len() < 2 {
            return Ok(None);
        }
        let len = BigEndian::read_u16(&buffer[..2]) as usize;
        if len == 0 {
            buffer.drain(..2);
            continue;
        }
        if len > MAX_MESSAGE_LEN {
            buffer.clear();
            return Err(ProtocolError::ParseError(format!(
                "message length {} exceeds {}",
                len, MAX_MESSAGE_LEN
            )));
        }
        if buffer.len() < 2 + len {
            return Ok(None);
        }

        let body: Vec<u8> = buffer.drain(..2 + len).skip(2).collect();
        return String::from_utf8(body)
            .map(Some)
            .map_err(|e| ProtocolError::ParseError(e.to_string()));
    }
}
