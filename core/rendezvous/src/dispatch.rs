//! Inbound signal dispatch
//!
//! Pulls complete lines off the session's line buffer, decodes them and
//! feeds each signal to the engine. A malformed line is logged, counted and
//! dropped; the lines after it are still delivered.

use crate::engine::{SignalRecvContext, TransportEngine};
use crate::frame::{decode_frame, FrameError};
use crate::identity::PeerIdentity;
use crate::sender::{SignalOutbox, SignalSender};

/// What one dispatch pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Frames handed to the engine
    pub delivered: usize,
    /// Lines dropped
    pub malformed: usize,
}

/// Deliver every complete frame in `buf` to `engine`, leaving any trailing
/// partial line in place
pub fn dispatch_frames(
    buf: &mut Vec<u8>,
    engine: &dyn TransportEngine,
    outbox: &SignalOutbox,
) -> DispatchSummary {
    let mut summary = DispatchSummary::default();
    let mut offset = 0;

    loop {
        match decode_frame(&buf[offset..]) {
            Ok((frame, consumed)) => {
                offset += consumed;
                log::debug!(
                    "Signal from '{}': {} bytes",
                    frame.identity,
                    frame.signal.len()
                );
                let mut ctx = InboundContext { outbox };
                engine.deliver_inbound_signal(&frame.identity, &frame.signal, &mut ctx);
                summary.delivered += 1;
            }
            Err(FrameError::Incomplete) => break,
            Err(FrameError::Malformed { consumed, reason }) => {
                let line = &buf[offset..offset + consumed - 1];
                log::warn!(
                    "Dropping malformed signaling line ({}): {:?}",
                    reason,
                    preview(line)
                );
                offset += consumed;
                summary.malformed += 1;
            }
        }
    }

    buf.drain(..offset);
    summary
}

fn preview(line: &[u8]) -> String {
    const MAX: usize = 64;
    let text = String::from_utf8_lossy(&line[..line.len().min(MAX)]).into_owned();
    if line.len() > MAX {
        format!("{}...", text)
    } else {
        text
    }
}

// ============================================================================
// Receive Context
// ============================================================================

/// Context passed to the engine for one inbound signal
pub struct InboundContext<'a> {
    outbox: &'a SignalOutbox,
}

impl<'a> InboundContext<'a> {
    pub fn new(outbox: &'a SignalOutbox) -> Self {
        InboundContext { outbox }
    }
}

impl SignalRecvContext for InboundContext<'_> {
    fn on_connect_request(&mut self, remote: &PeerIdentity) -> SignalSender {
        log::info!("Accepting connection request from '{}'", remote);
        self.outbox.sender_for_inbound(remote.clone())
    }

    fn on_reject(&mut self, remote: &PeerIdentity, signal: &[u8]) {
        // Rejections are not relayed
        log::debug!(
            "Not relaying {} byte rejection to '{}'",
            signal.len(),
            remote
        );
    }
}
