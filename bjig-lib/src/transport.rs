//! Byte transports underneath the link manager.
//!
//! A [`Connector`] opens the physical link and hands back independent read and
//! write halves. [`SerialConnector`] talks to a real router over a serial port;
//! [`memory_link`] pairs a connector with a [`RouterEnd`] so a simulated router
//! can sit on the far side in tests.

use crate::constants::DEFAULT_BAUD_RATE;
use crate::error::BjigError;
use crate::framer::{FrameBuffer, FrameEvent};
use crate::message::Packet;
use crate::packet::Direction;
use serialport::{DataBits, FlowControl, Parity, StopBits};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::info;

pub type LinkReader = Box<dyn Read + Send>;
pub type LinkWriter = Box<dyn Write + Send>;

/// Opens the physical link.
///
/// Reads on the returned reader must not block forever: they should return
/// `ErrorKind::TimedOut` (or `WouldBlock`) periodically so the read loop can
/// notice a close request. `Ok(0)` means the far side went away.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<(LinkReader, LinkWriter), BjigError>;

    /// Short name used in logs
    fn describe(&self) -> String;
}

/// Serial port parameters. Framing is always 8N1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    /// Upper bound on a single blocking read
    pub read_timeout: Duration,
}

impl SerialSettings {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Self::default()
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SerialConnector {
    settings: SerialSettings,
}

impl SerialConnector {
    pub fn new(settings: SerialSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }
}

impl Connector for SerialConnector {
    fn connect(&self) -> Result<(LinkReader, LinkWriter), BjigError> {
        info!(
            "Opening {} at {} baud (8N1)",
            self.settings.port, self.settings.baud_rate
        );
        let port = serialport::new(&self.settings.port, self.settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(self.settings.read_timeout)
            .open()?;
        let reader = port.try_clone()?;
        Ok((Box::new(reader), Box::new(port)))
    }

    fn describe(&self) -> String {
        self.settings.port.clone()
    }
}

/// In-memory link: a connector for the host side and the router end to drive it.
pub fn memory_link() -> (MemoryConnector, RouterEnd) {
    let shared = Arc::new(Mutex::new(MemoryShared::default()));
    (
        MemoryConnector {
            shared: Arc::clone(&shared),
        },
        RouterEnd {
            shared,
            framer: FrameBuffer::new(Direction::HostToRouter),
            pending: VecDeque::new(),
        },
    )
}

const MEMORY_READ_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Default)]
struct MemoryShared {
    session: Option<Arc<MemorySession>>,
    refuse_connections: bool,
    connections: usize,
}

struct MemorySession {
    to_host: Mutex<Option<Sender<Vec<u8>>>>,
    from_host: Mutex<Receiver<Vec<u8>>>,
}

pub struct MemoryConnector {
    shared: Arc<Mutex<MemoryShared>>,
}

impl Connector for MemoryConnector {
    fn connect(&self) -> Result<(LinkReader, LinkWriter), BjigError> {
        let mut shared = lock(&self.shared);
        if shared.refuse_connections {
            return Err(BjigError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "memory router refused the connection",
            )));
        }
        let (to_host, host_rx) = mpsc::channel();
        let (host_tx, from_host) = mpsc::channel();
        shared.session = Some(Arc::new(MemorySession {
            to_host: Mutex::new(Some(to_host)),
            from_host: Mutex::new(from_host),
        }));
        shared.connections += 1;
        Ok((
            Box::new(MemoryReader {
                rx: host_rx,
                pending: Vec::new(),
                offset: 0,
            }),
            Box::new(MemoryWriter { tx: host_tx }),
        ))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

struct MemoryReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    offset: usize,
}

impl Read for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.offset >= self.pending.len() {
            match self.rx.recv_timeout(MEMORY_READ_TIMEOUT) {
                Ok(chunk) => {
                    self.pending = chunk;
                    self.offset = 0;
                }
                Err(RecvTimeoutError::Timeout) => return Err(io::ErrorKind::TimedOut.into()),
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let available = &self.pending[self.offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.offset += n;
        Ok(n)
    }
}

struct MemoryWriter {
    tx: Sender<Vec<u8>>,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "memory router hung up"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Router side of an in-memory link.
///
/// Always talks to the most recent connection made through the paired
/// [`MemoryConnector`].
pub struct RouterEnd {
    shared: Arc<Mutex<MemoryShared>>,
    framer: FrameBuffer,
    pending: VecDeque<Packet>,
}

impl RouterEnd {
    fn session(&self) -> Option<Arc<MemorySession>> {
        lock(&self.shared).session.clone()
    }

    /// Number of successful `connect` calls so far
    pub fn connections(&self) -> usize {
        lock(&self.shared).connections
    }

    /// Make later `connect` calls fail
    pub fn refuse_connections(&self, refuse: bool) {
        lock(&self.shared).refuse_connections = refuse;
    }

    /// Deliver raw bytes to the host. Returns false when nobody is connected.
    pub fn inject(&self, bytes: &[u8]) -> bool {
        let Some(session) = self.session() else {
            return false;
        };
        let to_host = lock(&session.to_host);
        match to_host.as_ref() {
            Some(tx) => tx.send(bytes.to_vec()).is_ok(),
            None => false,
        }
    }

    /// Encode and deliver a router-to-host packet.
    pub fn send_packet(&self, packet: &Packet) -> Result<bool, BjigError> {
        Ok(self.inject(&packet.to_bytes()?))
    }

    /// Close the router-to-host direction; the host reader sees end of stream.
    pub fn hang_up(&self) {
        if let Some(session) = self.session() {
            lock(&session.to_host).take();
        }
    }

    /// Raw bytes written by the host, as one chunk per write call.
    pub fn recv_raw(&self, timeout: Duration) -> Option<Vec<u8>> {
        let session = self.session()?;
        let from_host = lock(&session.from_host);
        from_host.recv_timeout(timeout).ok()
    }

    /// Next complete packet written by the host, decoded as a request.
    pub fn next_request(&mut self, timeout: Duration) -> Option<Packet> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(packet) = self.pending.pop_front() {
                return Some(packet);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let chunk = self.recv_raw(remaining)?;
            self.framer.push(&chunk);
            for event in self.framer.drain_frames() {
                if let FrameEvent::Packet { packet, .. } = event {
                    self.pending.push_back(packet);
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
