//! Peer connection registry
//!
//! Maps peer identities to engine session handles. Owned by the application
//! thread; every call returns without blocking.
//!
//! Entries are created by [`PeerRegistry::connect_to_peer`] (we dial) or
//! [`PeerRegistry::register_inbound_connection`] (they dialed us) and live
//! until [`PeerRegistry::remove`], either called directly or triggered by a
//! terminal [`ConnectionEvent`]. Removing an entry releases its signal sender.

use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;

use crate::engine::{ConnectionEvent, PeerConnectionState, SessionHandle, TransportEngine};
use crate::identity::PeerIdentity;
use crate::sender::{SignalOutbox, SignalSender};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Engine would not create a session for this peer
    ConnectionRequestFailed(PeerIdentity),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::ConnectionRequestFailed(peer) => {
                write!(f, "engine refused connection request to '{}'", peer)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

// ============================================================================
// Registry
// ============================================================================

struct PeerEntry {
    handle: SessionHandle,
    /// None for inbound connections whose sender was never parked
    sender: Option<SignalSender>,
}

impl PeerEntry {
    fn release(&self) {
        if let Some(sender) = &self.sender {
            sender.release();
        }
    }
}

/// Identity → session handle map for one signaling session
pub struct PeerRegistry {
    engine: Arc<dyn TransportEngine>,
    outbox: SignalOutbox,
    peers: HashMap<PeerIdentity, PeerEntry>,
}

impl PeerRegistry {
    pub fn new(engine: Arc<dyn TransportEngine>, outbox: SignalOutbox) -> Self {
        PeerRegistry {
            engine,
            outbox,
            peers: HashMap::new(),
        }
    }

    /// Ask the engine to start connecting to `peer`
    ///
    /// An existing entry is returned as-is. On refusal no entry is created.
    pub fn connect_to_peer(&mut self, peer: &PeerIdentity) -> Result<SessionHandle, RegistryError> {
        if let Some(entry) = self.peers.get(peer) {
            log::debug!("Already connecting to '{}' ({})", peer, entry.handle);
            return Ok(entry.handle);
        }

        let sender = self.outbox.sender_for(peer.clone());
        let handle = match self.engine.begin_connection(peer, sender.clone()) {
            Some(handle) => handle,
            None => {
                sender.release();
                log::warn!("Engine refused connection to '{}'", peer);
                return Err(RegistryError::ConnectionRequestFailed(peer.clone()));
            }
        };

        log::info!("Connecting to peer '{}' ({})", peer, handle);
        self.peers.insert(
            peer.clone(),
            PeerEntry {
                handle,
                sender: Some(sender),
            },
        );
        Ok(handle)
    }

    /// Record a connection the remote side started
    pub fn register_inbound_connection(&mut self, peer: &PeerIdentity, handle: SessionHandle) {
        let sender = self.outbox.take_inbound_sender(peer);
        log::info!("Peer '{}' connected to us ({})", peer, handle);

        let previous = self.peers.insert(peer.clone(), PeerEntry { handle, sender });
        if let Some(old) = previous {
            if old.handle != handle {
                // Both sides dialed at once; the inbound connection wins
                log::debug!("Replacing {} for '{}'", old.handle, peer);
                old.release();
                self.engine.close_connection(old.handle);
            }
        }
    }

    /// Forget `peer`, releasing its signal sender and any sender still
    /// waiting to be claimed for it. Returns its handle.
    pub fn remove(&mut self, peer: &PeerIdentity) -> Option<SessionHandle> {
        self.release_unclaimed(peer);
        let entry = self.peers.remove(peer)?;
        entry.release();
        log::info!("Removed peer '{}' ({})", peer, entry.handle);
        Some(entry.handle)
    }

    fn release_unclaimed(&self, peer: &PeerIdentity) {
        if let Some(sender) = self.outbox.take_inbound_sender(peer) {
            log::debug!("Releasing unclaimed signal sender for '{}'", peer);
            sender.release();
        }
    }

    /// Send application data to one peer. Returns false if it was skipped.
    pub fn send_to(&self, peer: &PeerIdentity, payload: &[u8]) -> bool {
        let Some(entry) = self.peers.get(peer) else {
            log::warn!("No session for '{}', dropping {} bytes", peer, payload.len());
            return false;
        };
        self.send_on(peer, entry.handle, payload)
    }

    /// Send application data to every registered peer. Returns how many
    /// sends the engine accepted.
    pub fn broadcast(&self, payload: &[u8]) -> usize {
        self.peers
            .iter()
            .filter(|(peer, entry)| self.send_on(peer, entry.handle, payload))
            .count()
    }

    fn send_on(&self, peer: &PeerIdentity, handle: SessionHandle, payload: &[u8]) -> bool {
        match self.engine.send_application_data(handle, payload) {
            Ok(()) => {
                log::trace!("Sent {} bytes to '{}'", payload.len(), peer);
                true
            }
            Err(e) => {
                log::warn!("Send to '{}' ({}) failed: {}", peer, handle, e);
                false
            }
        }
    }

    /// At most one pending message per peer
    pub fn poll_inbound(&self) -> Vec<(PeerIdentity, Vec<u8>)> {
        self.peers
            .iter()
            .filter_map(|(peer, entry)| {
                self.engine
                    .receive_application_data(entry.handle)
                    .map(|data| (peer.clone(), data))
            })
            .collect()
    }

    // ===== Connection State Events =====

    /// React to one engine state change
    pub fn handle_event(&mut self, event: &ConnectionEvent) {
        log::debug!(
            "Connection {} to '{}': {:?} -> {:?}",
            event.handle,
            event.remote,
            event.old_state,
            event.new_state
        );

        match event.new_state {
            PeerConnectionState::Connecting => {
                if self.session_handle(&event.remote) == Some(event.handle) {
                    return;
                }
                self.register_inbound_connection(&event.remote, event.handle);
                if let Err(e) = self.engine.accept_connection(event.handle) {
                    log::warn!("Failed to accept '{}': {}", event.remote, e);
                    self.engine.close_connection(event.handle);
                    self.remove(&event.remote);
                }
            }
            PeerConnectionState::Connected => {
                log::info!("Peer '{}' connected ({})", event.remote, event.handle);
            }
            PeerConnectionState::ClosedByPeer | PeerConnectionState::ProblemDetectedLocally => {
                log::info!(
                    "Connection to '{}' ended: {:?}",
                    event.remote,
                    event.new_state
                );
                self.engine.close_connection(event.handle);
                // A newer connection for the same peer keeps its entry
                match self.session_handle(&event.remote) {
                    Some(current) if current == event.handle => {
                        self.remove(&event.remote);
                    }
                    Some(_) => {}
                    None => self.release_unclaimed(&event.remote),
                }
            }
            PeerConnectionState::FindingRoute | PeerConnectionState::None => {}
        }
    }

    /// Apply every event already waiting on `events`. Returns how many.
    pub fn pump_events(&mut self, events: &Receiver<ConnectionEvent>) -> usize {
        let mut handled = 0;
        loop {
            match events.try_recv() {
                Ok(event) => {
                    self.handle_event(&event);
                    handled += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    log::debug!("Connection event channel closed");
                    break;
                }
            }
        }
        handled
    }

    // ===== Queries =====

    pub fn session_handle(&self, peer: &PeerIdentity) -> Option<SessionHandle> {
        self.peers.get(peer).map(|entry| entry.handle)
    }

    pub fn contains(&self, peer: &PeerIdentity) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Registered identities, sorted
    pub fn identities(&self) -> Vec<PeerIdentity> {
        let mut ids: Vec<_> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::engine::event_channel;
    use crate::session::SignalingSession;
    use crate::testing::FakeEngine;

    fn id(s: &str) -> PeerIdentity {
        PeerIdentity::new(s).unwrap()
    }

    fn event(handle: u32, remote: &str, new_state: PeerConnectionState) -> ConnectionEvent {
        ConnectionEvent {
            handle: SessionHandle(handle),
            remote: id(remote),
            old_state: PeerConnectionState::None,
            new_state,
        }
    }

    #[test]
    fn test_connect_to_peer_records_entry() {
        let engine = FakeEngine::new("peer_1");
        let mut registry = PeerRegistry::new(engine.clone(), SignalOutbox::detached());

        let handle = registry.connect_to_peer(&id("peer_2")).unwrap();

        assert_eq!(registry.session_handle(&id("peer_2")), Some(handle));
        assert_eq!(registry.len(), 1);
        let begun = engine.begun();
        assert_eq!(begun.len(), 1);
        assert_eq!(begun[0].0, id("peer_2"));
        assert_eq!(begun[0].1.peer(), &id("peer_2"));
    }

    #[test]
    fn test_connect_to_ghost_refused() {
        let engine = FakeEngine::new("peer_1");
        engine.refuse_connections(true);
        let mut registry = PeerRegistry::new(engine.clone(), SignalOutbox::detached());

        assert_eq!(
            registry.connect_to_peer(&id("ghost")),
            Err(RegistryError::ConnectionRequestFailed(id("ghost")))
        );
        assert!(!registry.contains(&id("ghost")));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_connect_twice_reuses_entry() {
        let engine = FakeEngine::new("peer_1");
        let mut registry = PeerRegistry::new(engine.clone(), SignalOutbox::detached());

        let first = registry.connect_to_peer(&id("peer_2")).unwrap();
        let second = registry.connect_to_peer(&id("peer_2")).unwrap();

        assert_eq!(first, second);
        assert_eq!(engine.begun().len(), 1);
    }

    #[test]
    fn test_engine_signal_reaches_session_queue() {
        let engine = FakeEngine::new("peer_1");
        engine.set_first_signal(&[0xDE, 0xAD, 0xBE, 0xEF]);
        let session = SignalingSession::new(engine.clone(), SessionConfig::default());
        let mut registry = PeerRegistry::new(engine.clone(), session.outbox());

        registry.connect_to_peer(&id("peer_2")).unwrap();

        assert_eq!(session.pending_frames(), vec!["peer_2 deadbeef\n"]);
    }

    #[test]
    fn test_remove_releases_sender() {
        let engine = FakeEngine::new("peer_1");
        let mut registry = PeerRegistry::new(engine.clone(), SignalOutbox::detached());
        let handle = registry.connect_to_peer(&id("peer_2")).unwrap();
        let sender = engine.begun()[0].1.clone();

        assert_eq!(registry.remove(&id("peer_2")), Some(handle));
        assert!(sender.is_released());
        assert_eq!(registry.remove(&id("peer_2")), None);
    }

    #[test]
    fn test_send_to_and_broadcast() {
        let engine = FakeEngine::new("peer_1");
        let mut registry = PeerRegistry::new(engine.clone(), SignalOutbox::detached());
        let h2 = registry.connect_to_peer(&id("peer_2")).unwrap();
        let h3 = registry.connect_to_peer(&id("peer_3")).unwrap();

        assert!(registry.send_to(&id("peer_2"), b"direct"));
        assert!(!registry.send_to(&id("nobody"), b"lost"));
        assert_eq!(registry.broadcast(b"all"), 2);

        let sent = engine.sent();
        assert_eq!(sent[0], (h2, b"direct".to_vec()));
        assert!(sent.contains(&(h2, b"all".to_vec())));
        assert!(sent.contains(&(h3, b"all".to_vec())));
        assert_eq!(sent.len(), 3);
    }

    #[test]
    fn test_send_failure_is_skipped() {
        let engine = FakeEngine::new("peer_1");
        let mut registry = PeerRegistry::new(engine.clone(), SignalOutbox::detached());
        registry.connect_to_peer(&id("peer_2")).unwrap();
        engine.fail_sends(true);

        assert!(!registry.send_to(&id("peer_2"), b"x"));
        assert_eq!(registry.broadcast(b"x"), 0);
    }

    #[test]
    fn test_poll_inbound_one_per_peer() {
        let engine = FakeEngine::new("peer_1");
        let mut registry = PeerRegistry::new(engine.clone(), SignalOutbox::detached());
        let h2 = registry.connect_to_peer(&id("peer_2")).unwrap();
        engine.push_inbox(h2, b"one");
        engine.push_inbox(h2, b"two");

        assert_eq!(registry.poll_inbound(), vec![(id("peer_2"), b"one".to_vec())]);
        assert_eq!(registry.poll_inbound(), vec![(id("peer_2"), b"two".to_vec())]);
        assert!(registry.poll_inbound().is_empty());
    }

    #[test]
    fn test_inbound_connecting_event_registers_and_accepts() {
        let engine = FakeEngine::new("peer_1");
        let mut registry = PeerRegistry::new(engine.clone(), SignalOutbox::detached());

        registry.handle_event(&event(9, "peer_3", PeerConnectionState::Connecting));

        assert_eq!(registry.session_handle(&id("peer_3")), Some(SessionHandle(9)));
        assert_eq!(engine.accepted(), vec![SessionHandle(9)]);
    }

    #[test]
    fn test_outbound_connecting_event_not_accepted() {
        let engine = FakeEngine::new("peer_1");
        let mut registry = PeerRegistry::new(engine.clone(), SignalOutbox::detached());
        let handle = registry.connect_to_peer(&id("peer_2")).unwrap();

        registry.handle_event(&event(handle.0, "peer_2", PeerConnectionState::Connecting));

        assert!(engine.accepted().is_empty());
    }

    #[test]
    fn test_terminal_event_removes_entry() {
        let engine = FakeEngine::new("peer_1");
        let mut registry = PeerRegistry::new(engine.clone(), SignalOutbox::detached());
        let handle = registry.connect_to_peer(&id("peer_2")).unwrap();

        registry.handle_event(&event(handle.0, "peer_2", PeerConnectionState::ClosedByPeer));

        assert!(registry.is_empty());
        assert_eq!(engine.closed(), vec![handle]);
    }

    #[test]
    fn test_stale_terminal_event_keeps_newer_entry() {
        let engine = FakeEngine::new("peer_1");
        let mut registry = PeerRegistry::new(engine.clone(), SignalOutbox::detached());
        registry.register_inbound_connection(&id("peer_2"), SessionHandle(5));

        registry.handle_event(&event(4, "peer_2", PeerConnectionState::ProblemDetectedLocally));

        assert_eq!(registry.session_handle(&id("peer_2")), Some(SessionHandle(5)));
        assert_eq!(engine.closed(), vec![SessionHandle(4)]);
    }

    #[test]
    fn test_pump_events() {
        let engine = FakeEngine::new("peer_1");
        let mut registry = PeerRegistry::new(engine.clone(), SignalOutbox::detached());
        let (tx, rx) = event_channel();

        tx.send(event(3, "peer_3", PeerConnectionState::Connecting)).unwrap();
        tx.send(event(3, "peer_3", PeerConnectionState::Connected)).unwrap();
        tx.send(event(4, "peer_4", PeerConnectionState::Connecting)).unwrap();

        assert_eq!(registry.pump_events(&rx), 3);
        assert_eq!(registry.identities(), vec![id("peer_3"), id("peer_4")]);
        assert_eq!(registry.pump_events(&rx), 0);

        drop(tx);
        assert_eq!(registry.pump_events(&rx), 0);
    }

    #[test]
    fn test_inbound_registration_claims_parked_sender() {
        let engine = FakeEngine::new("peer_1");
        let session = SignalingSession::new(engine.clone(), SessionConfig::default());
        let outbox = session.outbox();
        let parked = outbox.sender_for_inbound(id("peer_3"));
        let mut registry = PeerRegistry::new(engine.clone(), outbox);

        registry.register_inbound_connection(&id("peer_3"), SessionHandle(1));
        registry.remove(&id("peer_3"));

        assert!(parked.is_released());
        assert!(session.outbox().take_inbound_sender(&id("peer_3")).is_none());
    }

    #[test]
    fn test_simultaneous_dial_closes_outbound_handle() {
        let engine = FakeEngine::new("peer_1");
        let mut registry = PeerRegistry::new(engine.clone(), SignalOutbox::detached());
        let outbound = registry.connect_to_peer(&id("peer_2")).unwrap();
        let outbound_sender = engine.begun()[0].1.clone();

        registry.handle_event(&event(99, "peer_2", PeerConnectionState::Connecting));

        assert_eq!(registry.session_handle(&id("peer_2")), Some(SessionHandle(99)));
        assert_eq!(engine.closed(), vec![outbound]);
        assert_eq!(engine.accepted(), vec![SessionHandle(99)]);
        assert!(outbound_sender.is_released());
    }

    #[test]
    fn test_remove_releases_unclaimed_sender() {
        let engine = FakeEngine::new("peer_1");
        let session = SignalingSession::new(engine.clone(), SessionConfig::default());
        let outbox = session.outbox();
        let mut registry = PeerRegistry::new(engine.clone(), outbox.clone());
        registry.connect_to_peer(&id("peer_2")).unwrap();
        let parked = outbox.sender_for_inbound(id("peer_2"));

        registry.remove(&id("peer_2"));

        assert!(parked.is_released());
        assert_eq!(session.parked_senders(), 0);
    }

    #[test]
    fn test_remove_unknown_peer_releases_unclaimed_sender() {
        let engine = FakeEngine::new("peer_1");
        let session = SignalingSession::new(engine.clone(), SessionConfig::default());
        let outbox = session.outbox();
        let mut registry = PeerRegistry::new(engine.clone(), outbox.clone());
        let parked = outbox.sender_for_inbound(id("peer_3"));

        assert_eq!(registry.remove(&id("peer_3")), None);
        assert!(parked.is_released());
    }

    #[test]
    fn test_terminal_event_for_unregistered_peer_releases_sender() {
        let engine = FakeEngine::new("peer_1");
        let session = SignalingSession::new(engine.clone(), SessionConfig::default());
        let outbox = session.outbox();
        let mut registry = PeerRegistry::new(engine.clone(), outbox.clone());
        let parked = outbox.sender_for_inbound(id("peer_3"));

        registry.handle_event(&event(7, "peer_3", PeerConnectionState::ProblemDetectedLocally));

        assert!(parked.is_released());
        assert_eq!(session.parked_senders(), 0);
        assert_eq!(engine.closed(), vec![SessionHandle(7)]);
    }

    #[test]
    fn test_stale_terminal_event_keeps_parked_sender() {
        let engine = FakeEngine::new("peer_1");
        let session = SignalingSession::new(engine.clone(), SessionConfig::default());
        let outbox = session.outbox();
        let mut registry = PeerRegistry::new(engine.clone(), outbox.clone());
        registry.register_inbound_connection(&id("peer_2"), SessionHandle(5));
        let parked = outbox.sender_for_inbound(id("peer_2"));

        registry.handle_event(&event(4, "peer_2", PeerConnectionState::ClosedByPeer));

        assert!(!parked.is_released());
        assert_eq!(session.parked_senders(), 1);
    }
}
