//! Integration tests for the signaling relay
//!
//! The relay runs in-process on an ephemeral port. Tests talk to it either
//! with raw `std::net::TcpStream`s or with real `SignalingSession`s backed by
//! scripted engines.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rendezvous::testing::{FakeEngine, InboundBehavior};
use rendezvous::{ConnectionStatus, PeerIdentity, PeerRegistry, SessionConfig, SignalingSession};
use signaling_server::{RelayMetrics, RelayServer, ServerConfig};

// ============================================================================
// Helpers
// ============================================================================

/// Relay running on a background thread, stopped on drop
struct TestRelay {
    addr: SocketAddr,
    metrics: Arc<RelayMetrics>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<std::io::Result<()>>>,
}

impl TestRelay {
    fn start() -> Self {
        Self::start_with(ServerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..ServerConfig::default()
        })
    }

    fn start_with(config: ServerConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut server = RelayServer::bind(config).unwrap();
        let addr = server.local_addr().unwrap();
        let metrics = server.metrics();
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&shutdown);
        let handle = thread::spawn(move || server.run(&stop));

        TestRelay {
            addr,
            metrics,
            shutdown,
            handle: Some(handle),
        }
    }

    fn stop(&mut self) -> std::io::Result<()> {
        self.shutdown.store(true, Ordering::Relaxed);
        match self.handle.take() {
            Some(handle) => handle.join().unwrap(),
            None => Ok(()),
        }
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Raw line-protocol client
struct RawPeer {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl RawPeer {
    fn connect(relay: &TestRelay, greeting: &str) -> Self {
        let stream = TcpStream::connect(relay.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        let mut peer = RawPeer { stream, reader };
        peer.send(greeting);
        peer
    }

    fn send(&mut self, data: &str) {
        self.stream.write_all(data.as_bytes()).unwrap();
    }

    fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        line
    }

    /// True once the relay has closed the connection
    fn closed_by_relay(&mut self) -> bool {
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => true,
            Ok(_) => false,
            Err(e) => e.kind() == std::io::ErrorKind::ConnectionReset,
        }
    }
}

fn id(s: &str) -> PeerIdentity {
    PeerIdentity::new(s).unwrap()
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

fn fast_config() -> SessionConfig {
    SessionConfig {
        poll_interval: Duration::from_millis(10),
        ..SessionConfig::default()
    }
}

// ============================================================================
// Raw Protocol Tests
// ============================================================================

#[test]
fn test_relay_rewrites_source() {
    let relay = TestRelay::start();
    let mut a = RawPeer::connect(&relay, "peer_a \n");
    let mut b = RawPeer::connect(&relay, "peer_b\n");
    assert!(wait_for(|| RelayMetrics::get(&relay.metrics.registrations_total) == 2));

    a.send("peer_b deadbeef\n");
    assert_eq!(b.read_line(), "peer_a deadbeef\n");

    b.send("peer_a 0A0B\n");
    assert_eq!(a.read_line(), "peer_b 0a0b\n");
    assert_eq!(RelayMetrics::get(&relay.metrics.frames_relayed_total), 2);
}

#[test]
fn test_unknown_destination_dropped() {
    let relay = TestRelay::start();
    let mut a = RawPeer::connect(&relay, "peer_a \n");
    assert!(wait_for(|| RelayMetrics::get(&relay.metrics.registrations_total) == 1));

    a.send("ghost 0102\n");
    assert!(wait_for(|| RelayMetrics::get(&relay.metrics.frames_dropped_total) == 1));
    assert_eq!(RelayMetrics::get(&relay.metrics.frames_relayed_total), 0);
}

#[test]
fn test_malformed_line_skipped() {
    let relay = TestRelay::start();
    let mut a = RawPeer::connect(&relay, "peer_a \n");
    let mut b = RawPeer::connect(&relay, "peer_b \n");
    assert!(wait_for(|| RelayMetrics::get(&relay.metrics.registrations_total) == 2));

    a.send("peer_b zz\npeer_b 01\n");
    assert_eq!(b.read_line(), "peer_a 01\n");
    assert_eq!(RelayMetrics::get(&relay.metrics.malformed_total), 1);
}

#[test]
fn test_newest_registration_wins() {
    let relay = TestRelay::start();
    let mut sender = RawPeer::connect(&relay, "peer_a \n");
    let _old = RawPeer::connect(&relay, "peer_b \n");
    assert!(wait_for(|| RelayMetrics::get(&relay.metrics.registrations_total) == 2));
    let mut new = RawPeer::connect(&relay, "peer_b \n");
    assert!(wait_for(|| RelayMetrics::get(&relay.metrics.registrations_total) == 3));

    sender.send("peer_b 02\n");
    assert_eq!(new.read_line(), "peer_a 02\n");
}

#[test]
fn test_invalid_greeting_disconnects() {
    let relay = TestRelay::start();
    let mut bad = RawPeer::connect(&relay, " 0102\n");

    assert!(bad.closed_by_relay());
    assert_eq!(RelayMetrics::get(&relay.metrics.malformed_total), 1);
    assert!(wait_for(|| RelayMetrics::get(&relay.metrics.active_clients) == 0));
}

#[test]
fn test_oversized_line_disconnects() {
    let relay = TestRelay::start_with(ServerConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        max_line_len: 64,
        ..ServerConfig::default()
    });
    let mut peer = RawPeer::connect(&relay, "peer_a \n");
    assert!(wait_for(|| RelayMetrics::get(&relay.metrics.registrations_total) == 1));

    peer.send(&"a".repeat(200));
    assert!(peer.closed_by_relay());
}

#[test]
fn test_client_close_unregisters() {
    let relay = TestRelay::start();
    let mut a = RawPeer::connect(&relay, "peer_a \n");
    let b = RawPeer::connect(&relay, "peer_b \n");
    assert!(wait_for(|| RelayMetrics::get(&relay.metrics.active_clients) == 2));
    assert!(wait_for(|| RelayMetrics::get(&relay.metrics.registrations_total) == 2));

    drop(b);
    assert!(wait_for(|| RelayMetrics::get(&relay.metrics.active_clients) == 1));

    a.send("peer_b 01\n");
    assert!(wait_for(|| RelayMetrics::get(&relay.metrics.frames_dropped_total) == 1));
}

#[test]
fn test_slow_destination_drops_oldest() {
    let relay = TestRelay::start_with(ServerConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        max_pending_bytes: 256 * 1024,
        ..ServerConfig::default()
    });
    let mut a = RawPeer::connect(&relay, "peer_a \n");
    // Registers and never reads
    let _b = RawPeer::connect(&relay, "peer_b \n");
    let mut c = RawPeer::connect(&relay, "peer_c \n");
    assert!(wait_for(|| RelayMetrics::get(&relay.metrics.registrations_total) == 3));

    // ~30 MB, far more than the socket buffers and the relay will hold
    let frame = format!("peer_b {}\n", "ab".repeat(30_000));
    for _ in 0..500 {
        a.send(&frame);
    }

    assert!(wait_for(|| RelayMetrics::get(&relay.metrics.frames_relayed_total) == 500));
    assert!(RelayMetrics::get(&relay.metrics.frames_dropped_total) > 0);

    a.send("peer_c 01\n");
    assert_eq!(c.read_line(), "peer_a 01\n");
}

#[test]
fn test_metrics_file_written_on_shutdown() {
    let path = std::env::temp_dir().join(format!(
        "rendezvous-metrics-{}.prom",
        std::process::id()
    ));
    let mut relay = TestRelay::start_with(ServerConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        metrics_path: Some(path.clone()),
        ..ServerConfig::default()
    });
    let _peer = RawPeer::connect(&relay, "peer_a \n");
    assert!(wait_for(|| RelayMetrics::get(&relay.metrics.registrations_total) == 1));

    relay.stop().unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    let _ = std::fs::remove_file(&path);

    assert!(text.contains("rendezvous_registrations_total 1"));
    assert!(text.contains("# TYPE rendezvous_active_clients gauge"));
}

#[test]
fn test_shutdown_flag_stops_server() {
    let mut relay = TestRelay::start();
    let _peer = RawPeer::connect(&relay, "peer_a \n");
    assert!(relay.stop().is_ok());
}

// ============================================================================
// End-to-End Session Tests
// ============================================================================

#[test]
fn test_two_sessions_exchange_signals() {
    let relay = TestRelay::start();
    let server = relay.addr.to_string();

    let engine_1 = FakeEngine::new("peer_1");
    engine_1.set_first_signal(b"ping");
    let engine_2 = FakeEngine::new("peer_2");
    engine_2.set_inbound_behavior(InboundBehavior::AcceptAndReply(b"pong".to_vec()));

    let mut session_1 = SignalingSession::new(engine_1.clone(), fast_config());
    let mut session_2 = SignalingSession::new(engine_2.clone(), fast_config());
    session_1.connect(&server).unwrap();
    session_2.connect(&server).unwrap();
    assert!(wait_for(|| RelayMetrics::get(&relay.metrics.registrations_total) == 2));
    assert_eq!(session_1.status(), ConnectionStatus::Connected);

    let mut registry = PeerRegistry::new(engine_1.clone(), session_1.outbox());
    registry.connect_to_peer(&id("peer_2")).unwrap();

    assert!(wait_for(|| !engine_2.delivered().is_empty()));
    assert_eq!(engine_2.delivered()[0], (id("peer_1"), b"ping".to_vec()));

    assert!(wait_for(|| !engine_1.delivered().is_empty()));
    assert_eq!(engine_1.delivered()[0], (id("peer_2"), b"pong".to_vec()));

    session_1.disconnect();
    session_2.disconnect();
    assert!(wait_for(|| RelayMetrics::get(&relay.metrics.active_clients) == 0));
}

#[test]
fn test_relay_shutdown_fails_sessions() {
    let mut relay = TestRelay::start();
    let mut session =
        SignalingSession::new(FakeEngine::new("peer_1"), fast_config());
    session.connect(&relay.addr.to_string()).unwrap();
    assert!(wait_for(|| RelayMetrics::get(&relay.metrics.registrations_total) == 1));

    relay.stop().unwrap();
    drop(relay);

    assert!(wait_for(|| session.status() == ConnectionStatus::FailedToConnect));
}
