//! Transport session: the TCP control channel to the signaling server
//!
//! # State Machine
//!
//! ```text
//!                  connect()
//!  Disconnected ──────────────► Connecting ──── socket completes ───► Connected
//!       ▲                           │                                    │
//!       │                           │ refused / timed out                │ server closed,
//!       │ disconnect()              ▼                                    │ send/recv error
//!       └─────────────────── FailedToConnect ◄───────────────────────────┘
//! ```
//!
//! # Threads
//!
//! `connect` opens a non-blocking socket, queues the greeting and starts one
//! I/O thread. Each iteration the thread reads whatever is available into its
//! line buffer, drains the outgoing queue, then hands complete lines to the
//! dispatcher, which calls into the engine. The queue lock is never held
//! while the engine runs: the engine may push a reply through a signal sender
//! from inside that call.
//!
//! The thread sleeps in `mio::Poll` for at most `poll_interval`. Pushing a
//! frame or calling `disconnect` wakes it early through a `mio::Waker`.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use serde::{Deserialize, Serialize};

use crate::config::{parse_server_address, SessionConfig};
use crate::dispatch::dispatch_frames;
use crate::engine::TransportEngine;
use crate::frame::encode_greeting;
use crate::identity::PeerIdentity;
use crate::queue::{OutgoingQueue, SendOutcome};
use crate::sender::{SignalOutbox, SignalSender};
use crate::stats::{SessionStats, StatsSnapshot};

// ============================================================================
// Constants
// ============================================================================

/// mio token for the server socket
const SOCKET_TOKEN: Token = Token(0);

/// mio token for the wake-up handle
const WAKE_TOKEN: Token = Token(1);

/// Inbound bytes without a newline beyond this are discarded
pub const MAX_PENDING_LINE: usize = 256 * 1024;

/// Unclaimed inbound senders kept per session; the oldest is released
/// beyond this
pub const MAX_PARKED_SENDERS: usize = 64;

// ============================================================================
// Connection Status
// ============================================================================

/// Control channel status as seen by the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConnectionStatus {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    FailedToConnect = 3,
}

impl ConnectionStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionStatus::Connecting,
            2 => ConnectionStatus::Connected,
            3 => ConnectionStatus::FailedToConnect,
            _ => ConnectionStatus::Disconnected,
        }
    }

    /// Connecting or connected
    pub fn is_active(self) -> bool {
        matches!(self, ConnectionStatus::Connecting | ConnectionStatus::Connected)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::FailedToConnect => write!(f, "failed to connect"),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Synchronous `connect` failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Server address did not parse or resolve
    AddressResolutionFailed(String),
    /// Could not set up the socket, poller or I/O thread
    SocketCreateFailed(String),
    /// Connect failed immediately (in-progress is not a failure)
    ConnectFailed(String),
    /// Engine has no identity to greet the server with
    LocalIdentityUnavailable,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::AddressResolutionFailed(e) => {
                write!(f, "address resolution failed: {}", e)
            }
            SessionError::SocketCreateFailed(e) => write!(f, "socket creation failed: {}", e),
            SessionError::ConnectFailed(e) => write!(f, "connect failed: {}", e),
            SessionError::LocalIdentityUnavailable => {
                write!(f, "transport engine has no local identity")
            }
        }
    }
}

impl std::error::Error for SessionError {}

/// Fatal I/O-thread conditions. Reported through the status value and the
/// debug message, never returned across the thread boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFault {
    /// Non-blocking connect completed with an error
    ConnectFailed(String),
    /// Connect still in progress after the configured timeout
    ConnectTimedOut,
    /// Write error other than would-block
    SendFailed(String),
    /// Only part of a frame was written; the protocol cannot resume it
    PartialSend { sent: usize, len: usize },
    /// Read error other than would-block
    RecvFailed(String),
    /// Zero-byte read
    ClosedByServer,
}

impl fmt::Display for TransportFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportFault::ConnectFailed(e) => write!(f, "connect failed: {}", e),
            TransportFault::ConnectTimedOut => write!(f, "connect timed out"),
            TransportFault::SendFailed(e) => write!(f, "send failed: {}", e),
            TransportFault::PartialSend { sent, len } => {
                write!(f, "partial send: {} of {} bytes", sent, len)
            }
            TransportFault::RecvFailed(e) => write!(f, "recv failed: {}", e),
            TransportFault::ClosedByServer => write!(f, "connection closed by server"),
        }
    }
}

// ============================================================================
// Shared State
// ============================================================================

/// State shared between the application thread, signal senders and the
/// I/O thread
pub(crate) struct SessionShared {
    queue: OutgoingQueue,
    stats: SessionStats,
    status: AtomicU8,
    stop: AtomicBool,
    waker: Mutex<Option<Arc<Waker>>>,
    debug_message: Mutex<Option<String>>,
    /// Senders handed out for inbound requests, waiting for the registry.
    /// Oldest first, at most one per peer.
    inbound_senders: Mutex<VecDeque<SignalSender>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionShared {
    fn new(config: &SessionConfig) -> Self {
        SessionShared {
            queue: OutgoingQueue::new(config.queue_capacity),
            stats: SessionStats::new(),
            status: AtomicU8::new(ConnectionStatus::Disconnected as u8),
            stop: AtomicBool::new(false),
            waker: Mutex::new(None),
            debug_message: Mutex::new(None),
            inbound_senders: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue a framed line and wake the I/O thread
    pub(crate) fn enqueue(&self, line: String) {
        let evicted = self.queue.push(line);
        if evicted > 0 {
            log::warn!(
                "Signaling send queue is backed up; discarded {} oldest signal(s)",
                evicted
            );
            SessionStats::add(&self.stats.frames_evicted, evicted as u64);
        }
        self.wake();
    }

    pub(crate) fn park_inbound_sender(&self, sender: SignalSender) {
        let mut parked = lock(&self.inbound_senders);
        parked.retain(|s| s.peer() != sender.peer());
        while parked.len() >= MAX_PARKED_SENDERS {
            if let Some(oldest) = parked.pop_front() {
                log::debug!("Releasing unclaimed signal sender for '{}'", oldest.peer());
                oldest.release();
            }
        }
        parked.push_back(sender);
    }

    pub(crate) fn take_inbound_sender(&self, peer: &PeerIdentity) -> Option<SignalSender> {
        let mut parked = lock(&self.inbound_senders);
        let index = parked.iter().position(|s| s.peer() == peer)?;
        parked.remove(index)
    }

    /// Release every unclaimed sender. Returns how many there were.
    fn release_parked_senders(&self) -> usize {
        let parked: Vec<SignalSender> = lock(&self.inbound_senders).drain(..).collect();
        for sender in &parked {
            sender.release();
        }
        parked.len()
    }

    fn parked_senders(&self) -> usize {
        lock(&self.inbound_senders).len()
    }

    fn wake(&self) {
        if let Some(waker) = lock(&self.waker).as_ref() {
            if let Err(e) = waker.wake() {
                log::debug!("Failed to wake signaling I/O thread: {}", e);
            }
        }
    }

    fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn set_debug_message(&self, message: Option<String>) {
        *lock(&self.debug_message) = message;
    }

    fn fail(&self, message: String) {
        log::warn!("Signaling connection failed: {}", message);
        self.set_debug_message(Some(message));
        self.set_status(ConnectionStatus::FailedToConnect);
    }

    /// Fatal I/O-thread fault: report it and drop everything queued
    fn abort(&self, fault: &TransportFault) {
        self.fail(fault.to_string());
        self.queue.clear();
    }
}

// ============================================================================
// Signaling Session
// ============================================================================

/// One control channel to a signaling server
pub struct SignalingSession {
    engine: Arc<dyn TransportEngine>,
    config: SessionConfig,
    shared: Arc<SessionShared>,
    worker: Option<JoinHandle<()>>,
    local_identity: Option<PeerIdentity>,
    server_addr: Option<SocketAddr>,
}

impl SignalingSession {
    pub fn new(engine: Arc<dyn TransportEngine>, config: SessionConfig) -> Self {
        let shared = Arc::new(SessionShared::new(&config));
        SignalingSession {
            engine,
            config,
            shared,
            worker: None,
            local_identity: None,
            server_addr: None,
        }
    }

    /// Connect to `server_address` (`host[:port]`, default port 10000).
    ///
    /// No-op while already connecting or connected. Returns once the
    /// non-blocking connect is issued; completion is reported through
    /// [`SignalingSession::status`].
    pub fn connect(&mut self, server_address: &str) -> Result<(), SessionError> {
        let status = self.status();
        if status.is_active() {
            log::debug!("connect({}) ignored: already {}", server_address, status);
            return Ok(());
        }

        // Reap the thread of a previous, failed connection
        self.stop_worker();

        self.open(server_address).map_err(|e| {
            self.shared.fail(e.to_string());
            e
        })
    }

    fn open(&mut self, server_address: &str) -> Result<(), SessionError> {
        let addr = parse_server_address(server_address)?;
        let identity = self
            .engine
            .local_identity()
            .ok_or(SessionError::LocalIdentityUnavailable)?;

        let poll = Poll::new().map_err(|e| SessionError::SocketCreateFailed(e.to_string()))?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)
            .map_err(|e| SessionError::SocketCreateFailed(e.to_string()))?;

        SessionStats::add(&self.shared.stats.connect_attempts, 1);
        let mut stream =
            TcpStream::connect(addr).map_err(|e| SessionError::ConnectFailed(e.to_string()))?;
        poll.registry()
            .register(&mut stream, SOCKET_TOKEN, Interest::READABLE | Interest::WRITABLE)
            .map_err(|e| SessionError::SocketCreateFailed(e.to_string()))?;

        log::info!("Connecting to signaling server {} as '{}'", addr, identity);

        self.shared.queue.clear();
        self.shared.release_parked_senders();
        self.shared.set_debug_message(None);
        self.shared.stop.store(false, Ordering::Release);
        *lock(&self.shared.waker) = Some(Arc::new(waker));
        self.shared.set_status(ConnectionStatus::Connecting);

        // Goes out as soon as the socket connects
        self.shared.enqueue(encode_greeting(&identity));

        let worker = IoWorker {
            shared: Arc::clone(&self.shared),
            outbox: SignalOutbox::new(&self.shared),
            engine: Arc::clone(&self.engine),
            config: self.config.clone(),
            poll,
            stream,
            line_buf: Vec::new(),
            read_buf: vec![0u8; self.config.read_chunk.max(1)],
            started: Instant::now(),
        };

        let handle = std::thread::Builder::new()
            .name("rendezvous-io".to_string())
            .spawn(move || worker.run())
            .map_err(|e| {
                self.shared.set_status(ConnectionStatus::Disconnected);
                SessionError::SocketCreateFailed(e.to_string())
            })?;

        self.worker = Some(handle);
        self.local_identity = Some(identity);
        self.server_addr = Some(addr);
        Ok(())
    }

    /// Stop the I/O thread, close the socket and clear buffers. Safe to call
    /// at any time, including before any `connect`.
    pub fn disconnect(&mut self) {
        let was = self.status();
        self.stop_worker();
        self.shared.queue.clear();
        let released = self.shared.release_parked_senders();
        if released > 0 {
            log::debug!("Released {} unclaimed inbound signal sender(s)", released);
        }
        self.shared.set_status(ConnectionStatus::Disconnected);
        if was.is_active() {
            log::info!("Disconnected from signaling server");
        }
    }

    fn stop_worker(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wake();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                log::error!("Signaling I/O thread panicked");
            }
        }
        *lock(&self.shared.waker) = None;
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status()
    }

    /// Description of the last failure, cleared by a new `connect`
    pub fn debug_message(&self) -> Option<String> {
        lock(&self.shared.debug_message).clone()
    }

    /// Identity used in the most recent greeting
    pub fn local_identity(&self) -> Option<&PeerIdentity> {
        self.local_identity.as_ref()
    }

    /// Resolved address of the most recent `connect`
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server_addr
    }

    /// Handle for creating signal senders bound to this session
    pub fn outbox(&self) -> SignalOutbox {
        SignalOutbox::new(&self.shared)
    }

    /// Framed lines not yet written, oldest first
    pub fn pending_frames(&self) -> Vec<String> {
        self.shared.queue.snapshot()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Inbound-request senders no registry has claimed yet
    pub fn parked_senders(&self) -> usize {
        self.shared.parked_senders()
    }
}

impl Drop for SignalingSession {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

// ============================================================================
// I/O Thread
// ============================================================================

struct IoWorker {
    shared: Arc<SessionShared>,
    outbox: SignalOutbox,
    engine: Arc<dyn TransportEngine>,
    config: SessionConfig,
    poll: Poll,
    stream: TcpStream,
    line_buf: Vec<u8>,
    read_buf: Vec<u8>,
    started: Instant,
}

impl IoWorker {
    fn run(mut self) {
        let mut events = Events::with_capacity(8);

        while !self.shared.stop_requested() {
            if let Err(e) = self.poll.poll(&mut events, Some(self.config.poll_interval)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                self.shared.fail(format!("poll failed: {}", e));
                break;
            }

            if self.shared.stop_requested() {
                break;
            }

            if let Err(fault) = self.step() {
                self.shared.abort(&fault);
                break;
            }
        }

        if let Err(e) = self.poll.registry().deregister(&mut self.stream) {
            log::debug!("Failed to deregister signaling socket: {}", e);
        }
        log::debug!("Signaling I/O thread exiting");
    }

    fn step(&mut self) -> Result<(), TransportFault> {
        if self.shared.status() == ConnectionStatus::Connecting && !self.check_connected()? {
            return Ok(());
        }

        let closed = self.receive()?;
        if !closed {
            self.flush()?;
        }

        // No lock held here: the engine may re-enter through a signal sender
        let summary = dispatch_frames(&mut self.line_buf, self.engine.as_ref(), &self.outbox);
        SessionStats::add(&self.shared.stats.frames_received, summary.delivered as u64);
        SessionStats::add(&self.shared.stats.frames_malformed, summary.malformed as u64);

        if self.line_buf.len() > MAX_PENDING_LINE {
            log::warn!(
                "Discarding {} buffered bytes with no line terminator",
                self.line_buf.len()
            );
            self.line_buf.clear();
            SessionStats::add(&self.shared.stats.frames_malformed, 1);
        }

        if closed {
            return Err(TransportFault::ClosedByServer);
        }
        Ok(())
    }

    /// Returns true once the non-blocking connect has completed
    fn check_connected(&mut self) -> Result<bool, TransportFault> {
        match self.stream.take_error() {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => return Err(TransportFault::ConnectFailed(e.to_string())),
        }

        let progress = connect_progress(
            self.stream.peer_addr(),
            self.started.elapsed(),
            self.config.connect_timeout,
        )?;
        match progress {
            Some(peer) => {
                log::info!("Connected to signaling server {}", peer);
                self.shared.set_status(ConnectionStatus::Connected);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Read everything available. Returns true if the server closed.
    fn receive(&mut self) -> Result<bool, TransportFault> {
        loop {
            match self.stream.read(&mut self.read_buf) {
                Ok(0) => return Ok(true),
                Ok(n) => {
                    log::trace!("Read {} bytes from signaling server", n);
                    self.line_buf.extend_from_slice(&self.read_buf[..n]);
                    SessionStats::add(&self.shared.stats.bytes_received, n as u64);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportFault::RecvFailed(e.to_string())),
            }
        }
    }

    fn flush(&mut self) -> Result<(), TransportFault> {
        let stream = &mut self.stream;
        let sent = self.shared.queue.drain(|line| write_line(stream, line))?;
        if sent > 0 {
            log::debug!("Sent {} signal frame(s)", sent);
            SessionStats::add(&self.shared.stats.frames_sent, sent as u64);
        }
        Ok(())
    }
}

/// Interpret `peer_addr` on a socket whose connect was issued `elapsed` ago.
/// `None` means still in progress.
fn connect_progress(
    peer: io::Result<SocketAddr>,
    elapsed: Duration,
    timeout: Duration,
) -> Result<Option<SocketAddr>, TransportFault> {
    match peer {
        Ok(peer) => Ok(Some(peer)),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => {
            if elapsed > timeout {
                Err(TransportFault::ConnectTimedOut)
            } else {
                Ok(None)
            }
        }
        Err(e) => Err(TransportFault::ConnectFailed(e.to_string())),
    }
}

/// Write one framed line in a single call
fn write_line<W: Write>(stream: &mut W, line: &str) -> Result<SendOutcome, TransportFault> {
    loop {
        match stream.write(line.as_bytes()) {
            Ok(n) if n == line.len() => return Ok(SendOutcome::Sent),
            Ok(n) => {
                return Err(TransportFault::PartialSend {
                    sent: n,
                    len: line.len(),
                })
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(SendOutcome::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransportFault::SendFailed(e.to_string())),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
