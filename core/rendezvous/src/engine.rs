//! Capability interface of the external P2P transport engine
//!
//! The engine owns NAT traversal, candidate negotiation and the data channel.
//! This crate only needs it to:
//!
//! - name the local endpoint ([`TransportEngine::local_identity`])
//! - start a connection, given a sender for its outgoing signals
//! - consume inbound signal bytes
//! - move application data over established sessions
//! - report connection state changes as [`ConnectionEvent`]s
//!
//! Engine calls may come from any thread, and the engine may call back into
//! signal senders while inside [`TransportEngine::deliver_inbound_signal`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::mpsc;

use crate::identity::PeerIdentity;
use crate::sender::SignalSender;

// ============================================================================
// Session Handle
// ============================================================================

/// Engine-side connection handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(pub u32);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ============================================================================
// Engine Traits
// ============================================================================

/// Operations consumed from the P2P transport engine
pub trait TransportEngine: Send + Sync {
    /// Identity the engine was initialised with, if any
    fn local_identity(&self) -> Option<PeerIdentity>;

    /// Begin connecting to `remote`; signals for it go through `sender`.
    /// `None` means the engine refused to create a session.
    fn begin_connection(&self, remote: &PeerIdentity, sender: SignalSender)
        -> Option<SessionHandle>;

    /// Feed one inbound signal to the engine
    fn deliver_inbound_signal(
        &self,
        from: &PeerIdentity,
        signal: &[u8],
        ctx: &mut dyn SignalRecvContext,
    );

    /// Queue application data on an established session
    fn send_application_data(&self, handle: SessionHandle, data: &[u8])
        -> Result<(), EngineError>;

    /// Non-blocking receive of at most one application message
    fn receive_application_data(&self, handle: SessionHandle) -> Option<Vec<u8>>;

    /// Accept a connection the remote side initiated
    fn accept_connection(&self, handle: SessionHandle) -> Result<(), EngineError>;

    /// Release engine resources for a finished connection
    fn close_connection(&self, handle: SessionHandle);
}

/// Callbacks available to the engine while it processes an inbound signal
pub trait SignalRecvContext {
    /// The signal opens a new connection from `remote`; return the sender the
    /// engine should use for replies.
    fn on_connect_request(&mut self, remote: &PeerIdentity) -> SignalSender;

    /// The engine wants to reject `remote` with `signal`
    fn on_reject(&mut self, remote: &PeerIdentity, signal: &[u8]);
}

/// Engine-reported failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError(pub String);

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine error: {}", self.0)
    }
}

impl std::error::Error for EngineError {}

// ============================================================================
// Connection State Events
// ============================================================================

/// Engine-side state of one peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerConnectionState {
    /// Destroyed, or never existed
    None,
    /// Handshake in progress (also first state of an inbound request)
    Connecting,
    /// Signals exchanged, probing for a route
    FindingRoute,
    /// Data can flow
    Connected,
    /// Remote side closed
    ClosedByPeer,
    /// Local failure (timeout, route lost, ...)
    ProblemDetectedLocally,
}

impl PeerConnectionState {
    /// Connection is over and must be cleaned up
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PeerConnectionState::ClosedByPeer | PeerConnectionState::ProblemDetectedLocally
        )
    }
}

/// State change notification published by the engine binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub handle: SessionHandle,
    pub remote: PeerIdentity,
    pub old_state: PeerConnectionState,
    pub new_state: PeerConnectionState,
}

/// Channel the engine binding publishes [`ConnectionEvent`]s on
pub fn event_channel() -> (mpsc::Sender<ConnectionEvent>, mpsc::Receiver<ConnectionEvent>) {
    mpsc::channel()
}
