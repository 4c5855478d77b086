//! Byte channels beneath the serial and TCP links

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

#[cfg(unix)]
use super::serial::SavedTermios;

/// Abstraction for communication channels (Serial or TCP)
pub trait CommunicationChannel: Read + Write + Send {
    /// Set timeout for read/write operations
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Discard any bytes already received but not yet read
    fn clear_input_buffer(&mut self) -> io::Result<()>;

    /// Human-readable description of the peer
    fn description(&self) -> String;
}

/// Serial port wrapper implementing CommunicationChannel
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
    #[cfg(unix)]
    saved: Option<SavedTermios>,
}

impl SerialChannel {
    /// Wrap an opened serial port
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self {
            port,
            #[cfg(unix)]
            saved: None,
        }
    }

    /// Restore `saved` terminal settings when the channel is dropped
    #[cfg(unix)]
    pub(crate) fn with_saved_termios(port: Box<dyn SerialPort>, saved: SavedTermios) -> Self {
        Self {
            port,
            saved: Some(saved),
        }
    }
}

#[cfg(unix)]
impl Drop for SerialChannel {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            saved.restore();
        }
    }
}

impl Read for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    // serialport drains the output queue (tcdrain) on flush
    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl CommunicationChannel for SerialChannel {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port.set_timeout(timeout).map_err(io::Error::other)
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::other)
    }

    fn description(&self) -> String {
        format!(
            "Serial({}@{})",
            self.port.name().unwrap_or_default(),
            self.port.baud_rate().unwrap_or(0)
        )
    }
}

/// TCP stream wrapper implementing CommunicationChannel
pub struct TcpChannel {
    stream: TcpStream,
}

impl TcpChannel {
    /// Wrap a connected socket
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl Read for TcpChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl CommunicationChannel for TcpChannel {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.stream.set_read_timeout(Some(timeout))?;
        self.stream.set_write_timeout(Some(timeout))?;
        Ok(())
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        // No syscall for this on sockets: read until WouldBlock, then restore blocking mode.
        self.stream.set_nonblocking(true)?;
        let mut buf = [0u8; 1024];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    let _ = self.stream.set_nonblocking(false);
                    return Err(e);
                }
            }
        }
        self.stream.set_nonblocking(false)?;
        Ok(())
    }

    fn description(&self) -> String {
        match self.stream.peer_addr() {
            Ok(addr) => format!("TCP({addr})"),
            Err(_) => "TCP(disconnected)".to_string(),
        }
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}
