//! Per-peer signal senders
//!
//! The engine is handed one [`SignalSender`] per remote peer and calls
//! [`SignalSender::send_signal`] whenever it has handshake bytes for that
//! peer, from whatever thread it happens to be on. The sender frames the bytes
//! and pushes them onto the owning session's outgoing queue.
//!
//! Senders are reference counted. The registry keeps one clone per entry and
//! the engine keeps its own; when the registry drops an entry it calls
//! [`SignalSender::release`], after which every clone silently discards
//! signals. The back-reference to the session is weak, so a sender outliving
//! its session is harmless.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::frame::encode_frame;
use crate::identity::PeerIdentity;
use crate::session::SessionShared;

// ============================================================================
// Outbox
// ============================================================================

/// Non-owning handle to a session's outgoing queue
#[derive(Clone)]
pub struct SignalOutbox {
    shared: Weak<SessionShared>,
}

impl SignalOutbox {
    pub(crate) fn new(shared: &Arc<SessionShared>) -> Self {
        SignalOutbox {
            shared: Arc::downgrade(shared),
        }
    }

    /// Outbox not attached to any session; everything sent through it is dropped
    pub fn detached() -> Self {
        SignalOutbox {
            shared: Weak::new(),
        }
    }

    /// Create a sender bound to `peer`
    pub fn sender_for(&self, peer: PeerIdentity) -> SignalSender {
        log::debug!("Creating signal sender for peer '{}'", peer);
        SignalSender {
            inner: Arc::new(SenderInner {
                peer,
                outbox: self.clone(),
                released: AtomicBool::new(false),
            }),
        }
    }

    /// Create a sender for an inbound request and park a clone until the
    /// registry claims it with [`SignalOutbox::take_inbound_sender`]
    pub(crate) fn sender_for_inbound(&self, peer: PeerIdentity) -> SignalSender {
        let sender = self.sender_for(peer);
        if let Some(shared) = self.shared.upgrade() {
            shared.park_inbound_sender(sender.clone());
        }
        sender
    }

    /// Claim the sender created for an inbound request from `peer`
    pub fn take_inbound_sender(&self, peer: &PeerIdentity) -> Option<SignalSender> {
        self.shared.upgrade()?.take_inbound_sender(peer)
    }

    /// Whether the owning session still exists
    pub fn is_attached(&self) -> bool {
        self.shared.strong_count() > 0
    }

    fn push(&self, line: String) -> bool {
        match self.shared.upgrade() {
            Some(shared) => {
                shared.enqueue(line);
                true
            }
            None => false,
        }
    }
}

// ============================================================================
// Signal Sender
// ============================================================================

struct SenderInner {
    peer: PeerIdentity,
    outbox: SignalOutbox,
    released: AtomicBool,
}

/// Sends engine signals for one peer through the signaling server
#[derive(Clone)]
pub struct SignalSender {
    inner: Arc<SenderInner>,
}

impl SignalSender {
    /// Peer this sender is bound to
    pub fn peer(&self) -> &PeerIdentity {
        &self.inner.peer
    }

    /// Frame and enqueue `signal`. Returns `false` if the signal was dropped
    /// because the sender was released or the session is gone.
    pub fn send_signal(&self, signal: &[u8]) -> bool {
        if self.is_released() {
            log::debug!(
                "Dropping {} byte signal for '{}': sender released",
                signal.len(),
                self.inner.peer
            );
            return false;
        }

        log::trace!("Signal for '{}': {} bytes", self.inner.peer, signal.len());
        let queued = self.inner.outbox.push(encode_frame(&self.inner.peer, signal));
        if !queued {
            log::debug!(
                "Dropping signal for '{}': signaling session is gone",
                self.inner.peer
            );
        }
        queued
    }

    /// Stop forwarding signals, for this handle and all its clones
    pub fn release(&self) {
        if !self.inner.released.swap(true, Ordering::AcqRel) {
            log::debug!("Released signal sender for peer '{}'", self.inner.peer);
        }
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Whether `other` is a clone of this sender
    pub fn same_sender(&self, other: &SignalSender) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for SignalSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalSender")
            .field("peer", &self.inner.peer)
            .field("released", &self.is_released())
            .field("attached", &self.inner.outbox.is_attached())
            .finish()
    }
}
