//! Serial port handling
//!
//! Port discovery, raw 8-N-1 configuration and the silence-terminated
//! reads every serial peripheral relies on.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(unix)]
use nix::sys::termios::{self, SetArg, Termios};
#[cfg(unix)]
use std::fs;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::stream::{CommunicationChannel, SerialChannel};
use super::{hex_dump, ProtocolError, Result, POLL_SLICE};
use crate::config::SerialConfig;

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "/dev/ttymxc1")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Product name (if available)
    pub product: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, product) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => {
                (Some(usb_info.vid), Some(usb_info.pid), usb_info.product)
            }
            _ => (None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            product,
        }
    }
}

impl PortInfo {
    fn bare(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            product: None,
        }
    }
}

/// Device node prefixes the OBU peripherals show up under, in listing order
const NODE_PREFIXES: [&str; 4] = ["ttyACM", "ttyUSB", "ttymxc", "ttyS"];

/// Sort key: known node families first (numerically by suffix), then everything else by name
fn port_sort_key(name: &str) -> (usize, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    for (rank, prefix) in NODE_PREFIXES.iter().enumerate() {
        if let Some(rest) = basename.strip_prefix(prefix) {
            let num = rest.parse::<usize>().unwrap_or(usize::MAX);
            return (rank, num, basename.to_string());
        }
    }
    (NODE_PREFIXES.len(), 0, basename.to_string())
}

/// List all available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    // Embedded boards expose UARTs the enumeration API does not always report
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if NODE_PREFIXES.iter().any(|p| fname.starts_with(p)) {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone())
                        .or_insert_with(|| PortInfo::bare(full));
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// Original terminal settings of a device node, put back when the port closes
#[cfg(unix)]
pub(crate) struct SavedTermios {
    file: fs::File,
    termios: Termios,
}

#[cfg(unix)]
impl SavedTermios {
    /// Read the current settings of `path` before anything reconfigures it
    fn capture(path: &str) -> Option<Self> {
        use nix::fcntl::OFlag;
        use std::os::unix::fs::OpenOptionsExt;

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags((OFlag::O_NOCTTY | OFlag::O_NONBLOCK).bits())
            .open(path)
            .ok()?;
        let termios = termios::tcgetattr(&file).ok()?;
        Some(Self { file, termios })
    }

    pub(crate) fn restore(&self) {
        if let Err(e) = termios::tcsetattr(&self.file, SetArg::TCSANOW, &self.termios) {
            warn!("failed to restore terminal settings: {}", e);
        }
    }
}

/// Configure a serial port for raw 8-N-1 without flow control
pub fn configure_port(port: &mut dyn SerialPort) -> Result<()> {
    port.set_data_bits(serialport::DataBits::Eight)
        .map_err(|e| ProtocolError::PortError(e.to_string()))?;
    port.set_parity(serialport::Parity::None)
        .map_err(|e| ProtocolError::PortError(e.to_string()))?;
    port.set_stop_bits(serialport::StopBits::One)
        .map_err(|e| ProtocolError::PortError(e.to_string()))?;
    port.set_flow_control(serialport::FlowControl::None)
        .map_err(|e| ProtocolError::PortError(e.to_string()))?;
    Ok(())
}

/// Clear the serial port buffers
pub fn clear_buffers(port: &mut dyn SerialPort) -> Result<()> {
    port.clear(serialport::ClearBuffer::All)
        .map_err(|e| ProtocolError::PortError(e.to_string()))
}

/// Open and configure the device node named in `config`
pub fn open_channel(config: &SerialConfig) -> Result<SerialChannel> {
    let builder = serialport::new(&config.port_name, config.baud_rate).timeout(POLL_SLICE);

    #[cfg(unix)]
    let original = SavedTermios::capture(&config.port_name);

    let mut port = builder
        .open()
        .map_err(|e| ProtocolError::PortError(format!("{}: {e}", config.port_name)))?;
    configure_port(port.as_mut())?;
    clear_buffers(port.as_mut())?;

    #[cfg(unix)]
    let channel = match original {
        Some(saved) => SerialChannel::with_saved_termios(port, saved),
        None => SerialChannel::new(port),
    };
    #[cfg(not(unix))]
    let channel = SerialChannel::new(port);

    Ok(channel)
}

fn is_poll_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Blocking serial transport with silence-terminated reads
///
/// Peripherals on the OBU bus do not always mark where a reply ends, so a
/// read is considered complete once bytes have arrived and the line has then
/// been quiet for the configured period.
pub struct SerialLink {
    channel: Box<dyn CommunicationChannel>,
    timeout: Duration,
    quiet: Duration,
}

impl SerialLink {
    /// Open the port described by `config`
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let channel = open_channel(config)?;
        info!(
            "Opened serial port {} @ {} baud",
            config.port_name, config.baud_rate
        );
        Ok(Self::from_channel(Box::new(channel), config))
    }

    /// Wrap an already-open channel
    pub fn from_channel(channel: Box<dyn CommunicationChannel>, config: &SerialConfig) -> Self {
        Self {
            channel,
            timeout: Duration::from_millis(config.timeout_ms),
            quiet: Duration::from_millis(config.quiet_ms),
        }
    }

    /// Human-readable description of the underlying channel
    pub fn description(&self) -> String {
        self.channel.description()
    }

    /// Overall deadline used by [`SerialLink::read`]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Set the overall deadline used by [`SerialLink::read`]
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Set the inter-byte gap that marks the end of a reply
    pub fn set_quiet_period(&mut self, quiet: Duration) {
        self.quiet = quiet;
    }

    /// Write all bytes and wait for them to leave the output queue
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        debug!("{} TX: {}", self.channel.description(), hex_dump(data));
        self.channel.write_all(data).map_err(|e| match e.kind() {
            io::ErrorKind::WriteZero => ProtocolError::CmdFailure,
            _ => ProtocolError::WriteError(e.to_string()),
        })?;
        self.channel
            .flush()
            .map_err(|e| ProtocolError::WriteError(e.to_string()))?;
        Ok(data.len())
    }

    /// Read one reply using the configured deadline
    pub fn read(&mut self, cancel: &CancellationToken) -> Result<Vec<u8>> {
        self.read_with_timeout(self.timeout, cancel)
    }

    /// Read one reply, giving up after `timeout`
    ///
    /// Returns once bytes are buffered and the line has been quiet, the
    /// deadline passes, or `cancel` fires. `Timeout` if nothing arrived.
    pub fn read_with_timeout(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        self.channel
            .set_timeout(POLL_SLICE)
            .map_err(|e| ProtocolError::PortError(e.to_string()))?;

        let start = Instant::now();
        let mut last_data = start;
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 256];

        while !cancel.is_cancelled() {
            match self.channel.read(&mut chunk) {
                Ok(0) => {}
                Ok(n) => {
                    buffer.extend_from_slice(&chunk[..n]);
                    last_data = Instant::now();
                }
                Err(e) if is_poll_timeout(&e) => {}
                Err(e) => return Err(ProtocolError::ReadError(e.to_string())),
            }

            if !buffer.is_empty() && last_data.elapsed() >= self.quiet {
                break;
            }
            if start.elapsed() >= timeout {
                break;
            }
        }

        if buffer.is_empty() {
            return Err(ProtocolError::Timeout);
        }
        debug!("{} RX: {}", self.channel.description(), hex_dump(&buffer));
        Ok(buffer)
    }

    /// Read a single byte, waiting at most `poll`
    ///
    /// `Ok(None)` when nothing arrived in time.
    pub fn read_byte(&mut self, poll: Duration) -> Result<Option<u8>> {
        self.channel
            .set_timeout(poll)
            .map_err(|e| ProtocolError::PortError(e.to_string()))?;

        let mut byte = [0u8; 1];
        match self.channel.read(&mut byte) {
            Ok(1) => Ok(Some(byte[0])),
            Ok(_) => Ok(None),
            Err(e) if is_poll_timeout(&e) => Ok(None),
            Err(e) => Err(ProtocolError::ReadError(e.to_string())),
        }
    }

    /// Drop any stale bytes waiting in the input queue
    pub fn clear_input(&mut self) -> Result<()> {
        self.channel
            .clear_input_buffer()
            .map_err(|e| ProtocolError::PortError(e.to_string()))
    }
}
