//! Scripted in-memory [`TransportEngine`]
//!
//! Records every call it receives so the signaling path can be exercised
//! without a real P2P stack. Used by the unit tests here and by the
//! integration tests of this crate and the relay server.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::engine::{EngineError, SessionHandle, SignalRecvContext, TransportEngine};
use crate::identity::PeerIdentity;
use crate::sender::SignalSender;

/// What the fake does with an inbound signal besides recording it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundBehavior {
    /// Record only
    Record,
    /// Treat it as a connect request and answer through the new sender
    AcceptAndReply(Vec<u8>),
    /// Reject the sender with this payload
    Reject(Vec<u8>),
}

#[derive(Default)]
struct FakeState {
    begun: Vec<(PeerIdentity, SignalSender, SessionHandle)>,
    delivered: Vec<(PeerIdentity, Vec<u8>)>,
    inbound_senders: Vec<SignalSender>,
    sent: Vec<(SessionHandle, Vec<u8>)>,
    inbox: HashMap<SessionHandle, VecDeque<Vec<u8>>>,
    accepted: Vec<SessionHandle>,
    closed: Vec<SessionHandle>,
    first_signal: Option<Vec<u8>>,
    behavior: Option<InboundBehavior>,
}

/// Recording engine with scriptable responses
pub struct FakeEngine {
    identity: Option<PeerIdentity>,
    next_handle: AtomicU32,
    refuse_connections: AtomicBool,
    fail_sends: AtomicBool,
    state: Mutex<FakeState>,
}

impl FakeEngine {
    /// Engine named `identity`.
    ///
    /// # Panics
    /// If `identity` is not a valid peer identity.
    pub fn new(identity: &str) -> Arc<Self> {
        let identity = match PeerIdentity::new(identity) {
            Ok(id) => id,
            Err(e) => panic!("FakeEngine identity '{}': {}", identity, e),
        };
        Arc::new(Self::build(Some(identity)))
    }

    /// Engine that reports no local identity
    pub fn without_identity() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    fn build(identity: Option<PeerIdentity>) -> Self {
        FakeEngine {
            identity,
            next_handle: AtomicU32::new(1),
            refuse_connections: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            state: Mutex::new(FakeState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    // ===== Scripting =====

    /// Make `begin_connection` return no handle
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Make `send_application_data` fail
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Signal emitted through the sender as soon as a connection begins
    pub fn set_first_signal(&self, signal: &[u8]) {
        self.state().first_signal = Some(signal.to_vec());
    }

    pub fn set_inbound_behavior(&self, behavior: InboundBehavior) {
        self.state().behavior = Some(behavior);
    }

    /// Queue application data for `receive_application_data`
    pub fn push_inbox(&self, handle: SessionHandle, data: &[u8]) {
        self.state()
            .inbox
            .entry(handle)
            .or_default()
            .push_back(data.to_vec());
    }

    // ===== Inspection =====

    pub fn begun(&self) -> Vec<(PeerIdentity, SignalSender, SessionHandle)> {
        self.state().begun.clone()
    }

    pub fn delivered(&self) -> Vec<(PeerIdentity, Vec<u8>)> {
        self.state().delivered.clone()
    }

    pub fn inbound_senders(&self) -> Vec<SignalSender> {
        self.state().inbound_senders.clone()
    }

    pub fn sent(&self) -> Vec<(SessionHandle, Vec<u8>)> {
        self.state().sent.clone()
    }

    pub fn accepted(&self) -> Vec<SessionHandle> {
        self.state().accepted.clone()
    }

    pub fn closed(&self) -> Vec<SessionHandle> {
        self.state().closed.clone()
    }
}

impl TransportEngine for FakeEngine {
    fn local_identity(&self) -> Option<PeerIdentity> {
        self.identity.clone()
    }

    fn begin_connection(
        &self,
        remote: &PeerIdentity,
        sender: SignalSender,
    ) -> Option<SessionHandle> {
        if self.refuse_connections.load(Ordering::SeqCst) {
            return None;
        }

        let handle = SessionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let first = {
            let mut state = self.state();
            state.begun.push((remote.clone(), sender.clone(), handle));
            state.first_signal.clone()
        };
        if let Some(signal) = first {
            sender.send_signal(&signal);
        }
        Some(handle)
    }

    fn deliver_inbound_signal(
        &self,
        from: &PeerIdentity,
        signal: &[u8],
        ctx: &mut dyn SignalRecvContext,
    ) {
        let behavior = {
            let mut state = self.state();
            state.delivered.push((from.clone(), signal.to_vec()));
            state.behavior.clone()
        };

        match behavior {
            None | Some(InboundBehavior::Record) => {}
            Some(InboundBehavior::AcceptAndReply(reply)) => {
                let sender = ctx.on_connect_request(from);
                sender.send_signal(&reply);
                self.state().inbound_senders.push(sender);
            }
            Some(InboundBehavior::Reject(payload)) => ctx.on_reject(from, &payload),
        }
    }

    fn send_application_data(
        &self,
        handle: SessionHandle,
        data: &[u8],
    ) -> Result<(), EngineError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(EngineError(format!("send on {} refused", handle)));
        }
        self.state().sent.push((handle, data.to_vec()));
        Ok(())
    }

    fn receive_application_data(&self, handle: SessionHandle) -> Option<Vec<u8>> {
        self.state().inbox.get_mut(&handle)?.pop_front()
    }

    fn accept_connection(&self, handle: SessionHandle) -> Result<(), EngineError> {
        self.state().accepted.push(handle);
        Ok(())
    }

    fn close_connection(&self, handle: SessionHandle) {
        self.state().closed.push(handle);
    }
}
