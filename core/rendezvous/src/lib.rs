//! Rendezvous signaling client
//!
//! This crate bootstraps direct peer-to-peer sessions by relaying a handful
//! of opaque handshake messages through a signaling server:
//! - Line framing of `(identity, signal)` pairs over a TCP control channel
//! - A bounded, oldest-drop outgoing queue
//! - A background I/O thread per server connection
//! - Dispatch of inbound signals into an external P2P transport engine
//! - An identity → session registry for the application
//!
//! # Architecture
//!
//! ```text
//!  application ──► PeerRegistry ──begin_connection──► TransportEngine
//!                                                      │        ▲
//!                                      SignalSender ◄──┘        │ deliver_inbound_signal
//!                                           │                   │
//!                                           ▼                   │
//!                     SignalingSession: OutgoingQueue ──► I/O thread ──► dispatch
//!                                                            │  ▲
//!                                                            ▼  │
//!                                                     signaling server
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod frame;
pub mod identity;
pub mod queue;
pub mod registry;
pub mod sender;
pub mod session;
pub mod stats;

/// Scripted engine for exercising the signaling path without a P2P stack
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{parse_server_address, ClientOptions, OptionsError, SessionConfig};
pub use dispatch::{dispatch_frames, DispatchSummary, InboundContext};
pub use engine::{
    event_channel, ConnectionEvent, EngineError, PeerConnectionState, SessionHandle,
    SignalRecvContext, TransportEngine,
};
pub use frame::{decode_frame, encode_frame, encode_greeting, Frame, FrameError, MalformedReason};
pub use identity::{IdentityError, PeerIdentity};
pub use queue::{OutgoingQueue, SendOutcome, DEFAULT_QUEUE_CAPACITY};
pub use registry::{PeerRegistry, RegistryError};
pub use sender::{SignalOutbox, SignalSender};
pub use session::{ConnectionStatus, SessionError, SignalingSession, TransportFault};
pub use stats::{SessionStats, StatsSnapshot};
