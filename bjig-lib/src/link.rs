//! Serial link manager.
//!
//! [`LinkManager`] owns one connection to a router. While connected, a
//! dedicated reader thread pulls bytes off the link, frames them and publishes
//! every packet:
//!
//! * to registered [`LinkObserver`]s, in arrival order;
//! * on a broadcast channel ([`LinkManager::subscribe`]), so any number of
//!   waiters can look at every packet without taking it from anyone else.
//!
//! The connection state is published on a watch channel as well as through
//! observers. A broken link moves straight to `Disconnected` and is reported
//! once as `LinkLost`; reconnecting is up to the caller.

use crate::error::BjigError;
use crate::framer::{FrameBuffer, FrameEvent};
use crate::message::Packet;
use crate::packet::Direction;
use crate::transport::{Connector, LinkReader, LinkWriter, SerialConnector, SerialSettings};
use bytes::Bytes;
use serde::Serialize;
use std::io::{ErrorKind, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use strum_macros::Display;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

/// Packets buffered per subscriber before the slowest one starts lagging
const PACKET_CHANNEL_CAPACITY: usize = 256;
const READ_CHUNK_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Callbacks fired by the link manager.
///
/// Packet and error callbacks run on the reader thread; keep them short.
/// State callbacks run on whichever thread caused the transition.
pub trait LinkObserver: Send + Sync {
    fn on_packet(&self, _packet: &Packet) {}

    /// Raw bytes of each successfully framed packet, before `on_packet`
    fn on_frame(&self, _raw: &Bytes) {}

    /// Framing errors and `LinkLost`
    fn on_raw_error(&self, _error: &BjigError) {}

    fn on_connection_state_changed(&self, _state: ConnectionState) {}
}

/// Link counters. Written by the reader and senders, readable from anywhere.
#[derive(Debug, Default)]
pub struct LinkStats {
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    connection_attempts: AtomicU64,
    packets_received: AtomicU64,
    decode_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStatsSnapshot {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub connection_attempts: u64,
    pub packets_received: u64,
    pub decode_errors: u64,
}

impl LinkStats {
    pub fn snapshot(&self) -> LinkStatsSnapshot {
        LinkStatsSnapshot {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }

    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

struct ReaderHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

struct Shared {
    state: Mutex<ConnectionState>,
    state_tx: watch::Sender<ConnectionState>,
    /// Serialises open/close teardown
    lifecycle: Mutex<()>,
    writer: Mutex<Option<LinkWriter>>,
    reader: Mutex<Option<ReaderHandle>>,
    packets: broadcast::Sender<Packet>,
    observers: RwLock<Vec<Arc<dyn LinkObserver>>>,
    stats: LinkStats,
}

pub struct LinkManager {
    connector: Box<dyn Connector>,
    shared: Arc<Shared>,
}

impl LinkManager {
    pub fn new(connector: impl Connector + 'static) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (packets, _) = broadcast::channel(PACKET_CHANNEL_CAPACITY);
        Self {
            connector: Box::new(connector),
            shared: Arc::new(Shared {
                state: Mutex::new(ConnectionState::Disconnected),
                state_tx,
                lifecycle: Mutex::new(()),
                writer: Mutex::new(None),
                reader: Mutex::new(None),
                packets,
                observers: RwLock::new(Vec::new()),
                stats: LinkStats::default(),
            }),
        }
    }

    /// A manager for a router on a serial port
    pub fn serial(settings: SerialSettings) -> Self {
        Self::new(SerialConnector::new(settings))
    }

    pub fn add_observer(&self, observer: Arc<dyn LinkObserver>) {
        self.shared
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.shared.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Every packet framed after this call, in arrival order.
    pub fn subscribe(&self) -> broadcast::Receiver<Packet> {
        self.shared.packets.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn stats(&self) -> LinkStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Connect and start the reader.
    ///
    /// Does nothing when already connected. Fails with `AlreadyConnecting` if
    /// another `open` is in progress. If another thread is closing the link,
    /// waits for the close to finish first.
    pub fn open(&self) -> Result<(), BjigError> {
        {
            let _lifecycle = lock(&self.shared.lifecycle);
            let mut state = lock(&self.shared.state);
            match *state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => return Err(BjigError::AlreadyConnecting),
                ConnectionState::Disconnected | ConnectionState::Closing => {
                    *state = ConnectionState::Connecting;
                }
            }
        }
        self.shared.publish_state(ConnectionState::Connecting);
        self.shared.reap_reader();
        LinkStats::add(&self.shared.stats.connection_attempts, 1);

        let target = self.connector.describe();
        let (reader, writer) = match self.connector.connect() {
            Ok(halves) => halves,
            Err(e) => {
                warn!("Failed to connect to {target}: {e}");
                self.shared.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        *lock(&self.shared.writer) = Some(writer);
        self.shared.set_state(ConnectionState::Connected);

        let stop = Arc::new(AtomicBool::new(false));
        let shared = Arc::clone(&self.shared);
        let thread_stop = Arc::clone(&stop);
        let spawned = thread::Builder::new()
            .name("bjig-reader".to_string())
            .spawn(move || read_loop(shared, reader, thread_stop));
        match spawned {
            Ok(thread) => {
                *lock(&self.shared.reader) = Some(ReaderHandle { stop, thread });
                info!("Connected to {target}");
                Ok(())
            }
            Err(e) => {
                lock(&self.shared.writer).take();
                self.shared.set_state(ConnectionState::Disconnected);
                Err(BjigError::Io(e))
            }
        }
    }

    /// Stop the reader and release the port. Idempotent.
    ///
    /// A close requested while an `open` is still connecting is ignored.
    pub fn close(&self) {
        let _lifecycle = lock(&self.shared.lifecycle);
        {
            let mut state = lock(&self.shared.state);
            match *state {
                ConnectionState::Connected => *state = ConnectionState::Closing,
                ConnectionState::Connecting => {
                    debug!("Close requested while connecting; ignoring");
                    return;
                }
                ConnectionState::Disconnected | ConnectionState::Closing => return,
            }
        }
        self.shared.publish_state(ConnectionState::Closing);

        if let Some(reader) = lock(&self.shared.reader).as_ref() {
            reader.stop.store(true, Ordering::Release);
        }
        lock(&self.shared.writer).take();
        self.shared.reap_reader();

        self.shared.set_state(ConnectionState::Disconnected);
        info!("Link closed");
    }

    /// Write one whole frame.
    ///
    /// Returns false without blocking when the link is not connected, and false
    /// if the write fails; a failed write tears the link down as `LinkLost`.
    pub fn send(&self, bytes: &[u8]) -> bool {
        if !self.is_connected() {
            return false;
        }
        let mut writer = lock(&self.shared.writer);
        let Some(port) = writer.as_mut() else {
            return false;
        };
        match port.write_all(bytes).and_then(|()| port.flush()) {
            Ok(()) => {
                LinkStats::add(&self.shared.stats.bytes_sent, bytes.len());
                debug!(bytes = hex::encode(bytes), "Serial write");
                true
            }
            Err(e) => {
                drop(writer);
                self.shared.link_lost(format!("write failed: {e}"));
                false
            }
        }
    }

    /// Encode and send a packet. `Ok(false)` has the same meaning as in [`LinkManager::send`].
    pub fn send_packet(&self, packet: &Packet) -> Result<bool, BjigError> {
        Ok(self.send(&packet.to_bytes()?))
    }
}

impl Drop for LinkManager {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn observers(&self) -> Vec<Arc<dyn LinkObserver>> {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_state(&self, new: ConnectionState) {
        let changed = {
            let mut state = lock(&self.state);
            let changed = *state != new;
            *state = new;
            changed
        };
        if changed {
            self.publish_state(new);
        }
    }

    fn publish_state(&self, state: ConnectionState) {
        debug!("Connection state: {state}");
        self.state_tx.send_replace(state);
        for observer in self.observers() {
            observer.on_connection_state_changed(state);
        }
    }

    /// Join a finished or stopping reader, unless called from that reader.
    fn reap_reader(&self) {
        let Some(reader) = lock(&self.reader).take() else {
            return;
        };
        reader.stop.store(true, Ordering::Release);
        if reader.thread.thread().id() == thread::current().id() {
            return;
        }
        if reader.thread.join().is_err() {
            error!("Reader thread panicked");
        }
    }

    /// Tear down after an I/O failure. Reported at most once per connection.
    fn link_lost(&self, reason: String) {
        let already_stopping = lock(&self.reader)
            .as_ref()
            .is_some_and(|reader| reader.stop.swap(true, Ordering::AcqRel));
        if already_stopping {
            return;
        }
        {
            let mut state = lock(&self.state);
            if *state != ConnectionState::Connected {
                return;
            }
            *state = ConnectionState::Disconnected;
        }
        lock(&self.writer).take();
        error!("Link lost: {reason}");

        let lost = BjigError::LinkLost(reason);
        for observer in self.observers() {
            observer.on_raw_error(&lost);
        }
        self.publish_state(ConnectionState::Disconnected);
    }

    fn dispatch(&self, event: FrameEvent) {
        match event {
            FrameEvent::Packet { packet, raw } => {
                LinkStats::add(&self.stats.packets_received, 1);
                debug!(bytes = hex::encode(&raw), "Received {}", packet_kind(&packet));
                for observer in self.observers() {
                    observer.on_frame(&raw);
                    observer.on_packet(&packet);
                }
                // No subscribers is fine
                let _ = self.packets.send(packet);
            }
            FrameEvent::Discarded { error, .. } => {
                LinkStats::add(&self.stats.decode_errors, 1);
                for observer in self.observers() {
                    observer.on_raw_error(&error);
                }
            }
        }
    }
}

fn read_loop(shared: Arc<Shared>, mut reader: LinkReader, stop: Arc<AtomicBool>) {
    let mut framer = FrameBuffer::new(Direction::RouterToHost);
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    while !stop.load(Ordering::Acquire) {
        match reader.read(&mut chunk) {
            Ok(0) => {
                if !stop.load(Ordering::Acquire) {
                    shared.link_lost("end of stream".to_string());
                }
                break;
            }
            Ok(n) => {
                LinkStats::add(&shared.stats.bytes_received, n);
                debug!(bytes = hex::encode(&chunk[..n]), "Serial read");
                framer.push(&chunk[..n]);
                while let Some(event) = framer.next_frame() {
                    shared.dispatch(event);
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
            Err(e) => {
                if !stop.load(Ordering::Acquire) {
                    shared.link_lost(format!("read failed: {e}"));
                }
                break;
            }
        }
    }

    framer.clear();
    debug!("Reader stopped");
}

fn packet_kind(packet: &Packet) -> &'static str {
    match packet {
        Packet::DownlinkRequest(_) => "downlink request",
        Packet::DownlinkResponse(_) => "downlink response",
        Packet::UplinkNotification(_) => "uplink notification",
        Packet::JigInfoRequest(_) => "JIG info request",
        Packet::JigInfoResponse(_) => "JIG info response",
        Packet::DfuRequest(_) => "DFU request",
        Packet::DfuResponse(_) => "DFU response",
        Packet::ErrorNotification(_) => "error notification",
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
