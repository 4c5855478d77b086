//! Shared test fixtures: a scripted in-memory channel and a fake card relay.

#![allow(dead_code)]

use obu_core::config::SerialConfig;
use obu_core::protocol::{CommunicationChannel, SerialLink};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("obu_core=debug")
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct MockState {
    written: Vec<Vec<u8>>,
    replies: VecDeque<Vec<u8>>,
    incoming: VecDeque<u8>,
    fail_reads: bool,
    fail_writes: bool,
}

/// Test-side view of a [`MockChannel`]
#[derive(Clone, Default)]
pub struct MockHandle(Arc<Mutex<MockState>>);

impl MockHandle {
    /// Bytes that become readable after the next write
    pub fn reply_with(&self, bytes: impl Into<Vec<u8>>) -> &Self {
        self.0.lock().unwrap().replies.push_back(bytes.into());
        self
    }

    /// Bytes that are readable right away
    pub fn feed(&self, bytes: &[u8]) {
        self.0.lock().unwrap().incoming.extend(bytes.iter().copied());
    }

    /// Every write so far, one entry per call
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.0.lock().unwrap().written.clone()
    }

    pub fn fail_reads(&self) {
        self.0.lock().unwrap().fail_reads = true;
    }

    pub fn fail_writes(&self) {
        self.0.lock().unwrap().fail_writes = true;
    }
}

/// In-memory channel that answers each write with the next scripted reply
pub struct MockChannel {
    handle: MockHandle,
    timeout: Duration,
}

impl MockChannel {
    pub fn new() -> (Self, MockHandle) {
        let handle = MockHandle::default();
        let channel = Self {
            handle: handle.clone(),
            timeout: Duration::from_millis(50),
        };
        (channel, handle)
    }
}

impl Read for MockChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = Instant::now() + self.timeout;
        loop {
            {
                let mut state = self.handle.0.lock().unwrap();
                if !state.incoming.is_empty() {
                    let n = buf.len().min(state.incoming.len());
                    for (slot, byte) in buf.iter_mut().zip(state.incoming.drain(..n)) {
                        *slot = byte;
                    }
                    return Ok(n);
                }
                if state.fail_reads {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
                }
            }
            if Instant::now() >= deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
            }
            thread::sleep(Duration::from_millis(2));
        }
    }
}

impl Write for MockChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.handle.0.lock().unwrap();
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        state.written.push(buf.to_vec());
        if let Some(reply) = state.replies.pop_front() {
            state.incoming.extend(reply);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CommunicationChannel for MockChannel {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.handle.0.lock().unwrap().incoming.clear();
        Ok(())
    }

    fn description(&self) -> String {
        "Mock".to_string()
    }
}

/// Serial link over a fresh mock, with short deadlines
pub fn mock_link() -> (SerialLink, MockHandle) {
    let (channel, handle) = MockChannel::new();
    let config = SerialConfig {
        port_name: "mock".to_string(),
        timeout_ms: 300,
        quiet_ms: 30,
        ..SerialConfig::default()
    };
    (SerialLink::from_channel(Box::new(channel), &config), handle)
}

/// What the fake relay saw
#[derive(Debug, Default)]
pub struct RelayLog {
    pub messages: Vec<String>,
    pub keepalives: Vec<Instant>,
}

/// Single-connection card relay answering each message with `respond`
///
/// `respond` returns the reply text and how long to hold it back.
pub struct FakeRelay {
    pub port: u16,
    pub log: Arc<Mutex<RelayLog>>,
    handle: Option<JoinHandle<()>>,
}

impl FakeRelay {
    pub fn start<F>(respond: F) -> Self
    where
        F: Fn(&str) -> Option<(String, Duration)> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let log = Arc::new(Mutex::new(RelayLog::default()));
        let shared = log.clone();

        let handle = thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { return };
                if !serve(stream, &respond, &shared) {
                    return;
                }
            }
        });

        Self {
            port,
            log,
            handle: Some(handle),
        }
    }

    pub fn messages(&self) -> Vec<String> {
        self.log.lock().unwrap().messages.clone()
    }

    pub fn keepalives(&self) -> Vec<Instant> {
        self.log.lock().unwrap().keepalives.clone()
    }
}

impl Drop for FakeRelay {
    fn drop(&mut self) {
        // Unblock accept() so the thread can exit
        let _ = TcpStream::connect(("127.0.0.1", self.port));
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Serve one connection; `false` once a connection closes without sending anything
fn serve<F>(mut stream: TcpStream, respond: &F, log: &Arc<Mutex<RelayLog>>) -> bool
where
    F: Fn(&str) -> Option<(String, Duration)>,
{
    let mut served = false;
    loop {
        let mut header = [0u8; 2];
        if stream.read_exact(&mut header).is_err() {
            return served;
        }
        served = true;
        let len = u16::from_be_bytes(header) as usize;
        if len == 0 {
            log.lock().unwrap().keepalives.push(Instant::now());
            continue;
        }
        let mut body = vec![0u8; len];
        if stream.read_exact(&mut body).is_err() {
            return served;
        }
        let message = String::from_utf8_lossy(&body).into_owned();
        log.lock().unwrap().messages.push(message.clone());

        if let Some((reply, delay)) = respond(&message) {
            let mut writer = stream.try_clone().unwrap();
            // Reply from the side so keepalives keep being read meanwhile
            thread::spawn(move || {
                thread::sleep(delay);
                let mut frame = (reply.len() as u16).to_be_bytes().to_vec();
                frame.extend_from_slice(reply.as_bytes());
                let _ = writer.write_all(&frame);
            });
        }
    }
}

/// Standard relay replies for a message, with status `status`
pub fn relay_reply(message: &str, status: &str, payload: &str) -> String {
    // Echo the sequence number, swap the request prefix for a reply prefix
    let seq = &message[6..10];
    let service = &message[10..12];
    format!("110000{seq}{service}{status}{payload}")
}
