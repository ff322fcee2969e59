//! Rendezvous signaling relay
//!
//! A TCP server that:
//! - Registers each client under the identity in its first line
//! - Relays `<destination> <hex>` lines to the destination, rewritten as
//!   `<source> <hex>`
//! - Drops frames for unknown destinations and malformed lines
//! - Keeps at most `max_pending_bytes` queued per client, dropping the
//!   oldest frames for a client that stops reading
//!
//! ```text
//!   peer_1                      relay                       peer_2
//!     │ "peer_1 \n"               │                           │
//!     ├──────────────────────────►│ register peer_1           │
//!     │                           │◄──────────────────────────┤ "peer_2 \n"
//!     │ "peer_2 deadbeef\n"       │                           │
//!     ├──────────────────────────►│ "peer_1 deadbeef\n"       │
//!     │                           ├──────────────────────────►│
//! ```

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use rendezvous::{decode_frame, encode_frame, FrameError, PeerIdentity};

pub mod client;
pub mod config;
pub mod metrics;
pub mod registry;

use client::Client;
pub use config::{ConfigError, ServerConfig};
pub use metrics::RelayMetrics;
use registry::Registry;

// ============================================================================
// Constants
// ============================================================================

/// mio token for the listening socket
const LISTENER_TOKEN: Token = Token(0);

/// Upper bound on how long a shutdown request goes unnoticed
const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_millis(200);

/// Socket read size
const READ_CHUNK: usize = 4096;

// ============================================================================
// Server Structure
// ============================================================================

pub struct RelayServer {
    /// mio poll instance
    poll: Poll,
    /// Listening socket
    listener: TcpListener,
    /// Connected clients (by mio token)
    clients: HashMap<Token, Client>,
    /// Identity → token routing
    registry: Registry,
    metrics: Arc<RelayMetrics>,
    config: ServerConfig,
    next_token: usize,
    read_buf: Vec<u8>,
    last_summary: Instant,
}

impl RelayServer {
    /// Bind the listening socket
    pub fn bind(config: ServerConfig) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(config.listen_addr)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        log::info!("Relay listening on {}", listener.local_addr()?);

        Ok(RelayServer {
            poll,
            listener,
            clients: HashMap::new(),
            registry: Registry::new(),
            metrics: Arc::new(RelayMetrics::new()),
            config,
            next_token: LISTENER_TOKEN.0 + 1,
            read_buf: vec![0u8; READ_CHUNK],
            last_summary: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn metrics(&self) -> Arc<RelayMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Serve until `shutdown` is set
    pub fn run(&mut self, shutdown: &AtomicBool) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);
        let tick = SHUTDOWN_CHECK_INTERVAL.min(self.config.stats_interval);

        while !shutdown.load(Ordering::Relaxed) {
            if let Err(e) = self.poll.poll(&mut events, Some(tick)) {
                // Signal delivery interrupts the wait
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_clients()?,
                    token => {
                        if event.is_readable() || event.is_read_closed() {
                            self.read_client(token);
                        }
                        if event.is_writable() {
                            self.flush_client(token);
                        }
                    }
                }
            }

            self.cleanup_closed();
            self.maybe_log_summary();
        }

        log::info!("Relay shutting down: {}", self.metrics.summary());
        self.write_metrics();
        Ok(())
    }

    fn accept_clients(&mut self) -> io::Result<()> {
        loop {
            let (mut stream, addr) = match self.listener.accept() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Out of descriptors and the like: keep serving existing clients
                    log::warn!("Failed to accept connection: {}", e);
                    return Ok(());
                }
            };

            let token = Token(self.next_token);
            self.next_token += 1;
            self.poll
                .registry()
                .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)?;

            log::info!("New connection from {} (conn={:?})", addr, token);
            self.clients.insert(token, Client::new(stream, addr));
            RelayMetrics::inc(&self.metrics.active_clients);
        }
    }

    fn read_client(&mut self, token: Token) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };

        let eof = match client.read_available(&mut self.read_buf) {
            Ok(eof) => eof,
            Err(e) => {
                log::debug!("Read error from {}: {}", client.label(), e);
                client.closed = true;
                return;
            }
        };

        self.process_lines(token);

        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };
        if client.inbound.len() > self.config.max_line_len {
            log::warn!(
                "Disconnecting {}: line exceeds {} bytes",
                client.label(),
                self.config.max_line_len
            );
            RelayMetrics::inc(&self.metrics.malformed_total);
            client.closed = true;
        }
        if eof {
            log::debug!("{} closed the connection", client.label());
            client.closed = true;
        }
    }

    fn flush_client(&mut self, token: Token) {
        if let Some(client) = self.clients.get_mut(&token) {
            if let Err(e) = client.flush() {
                log::debug!("Write error to {}: {}", client.label(), e);
                client.closed = true;
            }
        }
    }

    fn process_lines(&mut self, token: Token) {
        loop {
            let Some(client) = self.clients.get_mut(&token) else {
                return;
            };
            if client.closed {
                return;
            }
            let Some(line) = client.take_line() else {
                return;
            };

            match client.identity.clone() {
                None => self.handle_greeting(token, &line),
                Some(source) => self.relay_line(&source, &line),
            }
        }
    }

    /// First line: `<identity>` optionally followed by a space and payload
    fn handle_greeting(&mut self, token: Token, line: &[u8]) {
        let body = line.strip_suffix(b"\n").unwrap_or(line);
        let body = body.strip_suffix(b"\r").unwrap_or(body);
        let name = body.split(|&b| b == b' ').next().unwrap_or_default();

        let identity = std::str::from_utf8(name)
            .ok()
            .and_then(|s| PeerIdentity::new(s).ok());

        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };

        let Some(identity) = identity else {
            log::warn!(
                "Disconnecting {}: invalid greeting {:?}",
                client.label(),
                String::from_utf8_lossy(body)
            );
            RelayMetrics::inc(&self.metrics.malformed_total);
            client.closed = true;
            return;
        };

        client.identity = Some(identity.clone());
        self.registry.register(identity, token);
        RelayMetrics::inc(&self.metrics.registrations_total);
    }

    /// `<destination> <hex>` from `source` → `<source> <hex>` to destination
    fn relay_line(&mut self, source: &PeerIdentity, line: &[u8]) {
        let frame = match decode_frame(line) {
            Ok((frame, _)) => frame,
            Err(FrameError::Malformed { reason, .. }) => {
                log::warn!("Dropping malformed line from '{}': {}", source, reason);
                RelayMetrics::inc(&self.metrics.malformed_total);
                return;
            }
            Err(FrameError::Incomplete) => return,
        };

        let Some(dest_token) = self.registry.lookup(&frame.identity) else {
            log::warn!(
                "Dropping {} byte signal from '{}': '{}' is not registered",
                frame.signal.len(),
                source,
                frame.identity
            );
            RelayMetrics::inc(&self.metrics.frames_dropped_total);
            return;
        };

        let Some(dest) = self.clients.get_mut(&dest_token) else {
            RelayMetrics::inc(&self.metrics.frames_dropped_total);
            return;
        };

        log::debug!(
            "Relaying {} bytes '{}' -> '{}'",
            frame.signal.len(),
            source,
            frame.identity
        );
        let dropped = dest.queue(
            &encode_frame(source, &frame.signal),
            self.config.max_pending_bytes,
        );
        if dropped > 0 {
            log::warn!(
                "{} is not reading; dropped {} oldest frame(s)",
                dest.label(),
                dropped
            );
            RelayMetrics::add(&self.metrics.frames_dropped_total, dropped as u64);
        }
        RelayMetrics::inc(&self.metrics.frames_relayed_total);

        // Edge-triggered: the writable event may already have fired
        self.flush_client(dest_token);
    }

    fn cleanup_closed(&mut self) {
        let closed: Vec<Token> = self
            .clients
            .iter()
            .filter(|(_, c)| c.closed)
            .map(|(t, _)| *t)
            .collect();

        for token in closed {
            if let Some(mut client) = self.clients.remove(&token) {
                if let Err(e) = self.poll.registry().deregister(&mut client.stream) {
                    log::debug!("Failed to deregister {:?}: {}", token, e);
                }
                if let Some(identity) = &client.identity {
                    self.registry.unregister(identity, token);
                }
                log::info!("Connection closed: {}", client.label());
                RelayMetrics::dec(&self.metrics.active_clients);
            }
        }
    }

    fn maybe_log_summary(&mut self) {
        if self.last_summary.elapsed() >= self.config.stats_interval {
            log::info!("Relay stats: {}", self.metrics.summary());
            self.write_metrics();
            self.last_summary = Instant::now();
        }
    }

    /// Rewrite the Prometheus text file, if one is configured
    fn write_metrics(&self) {
        let Some(path) = &self.config.metrics_path else {
            return;
        };
        if let Err(e) = std::fs::write(path, self.metrics.render()) {
            log::warn!("Failed to write metrics to {}: {}", path.display(), e);
        }
    }

    /// Registered peer count
    pub fn registered_peers(&self) -> usize {
        self.registry.len()
    }
}

