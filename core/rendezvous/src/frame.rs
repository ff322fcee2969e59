//! Line framing for the signaling control channel
//!
//! # Wire Format
//!
//! Every signal travels as one text line:
//!
//! ```text
//! ┌──────────────┬───┬──────────────────────────┬────┐
//! │ identity     │ ' │ hex(signal), lowercase   │ \n │
//! └──────────────┴───┴──────────────────────────┴────┘
//! ```
//!
//! Outbound, `identity` names the destination; inbound, the server has
//! rewritten it to the source. An empty hex field is a zero-length signal,
//! which is what the registration greeting uses.
//!
//! Decoding is line-at-a-time: a bad line is reported as
//! [`FrameError::Malformed`] together with its length so the caller can drop
//! just that line and keep reading the stream.

use std::fmt;

use crate::identity::PeerIdentity;

// ============================================================================
// Constants
// ============================================================================

/// Line terminator
pub const FRAME_TERMINATOR: u8 = b'\n';

/// Separator between identity and payload
pub const FRAME_SEPARATOR: u8 = b' ';

// ============================================================================
// Frame
// ============================================================================

/// A decoded `(identity, signal)` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Peer the signal is for (outbound) or from (inbound)
    pub identity: PeerIdentity,
    /// Opaque engine payload
    pub signal: Vec<u8>,
}

// ============================================================================
// Encoding
// ============================================================================

/// Render `identity`, a space, the signal as lowercase hex, and `\n`
pub fn encode_frame(identity: &PeerIdentity, signal: &[u8]) -> String {
    let mut line = String::with_capacity(identity.as_str().len() + signal.len() * 2 + 2);
    line.push_str(identity.as_str());
    line.push(FRAME_SEPARATOR as char);
    line.push_str(&hex::encode(signal));
    line.push(FRAME_TERMINATOR as char);
    line
}

/// Registration greeting: our own identity with an empty payload
pub fn encode_greeting(identity: &PeerIdentity) -> String {
    encode_frame(identity, &[])
}

// ============================================================================
// Decoding
// ============================================================================

/// Return the first complete line (without `\n`) and the bytes it spans
pub fn next_line(buf: &[u8]) -> Option<(&[u8], usize)> {
    let end = buf.iter().position(|&b| b == FRAME_TERMINATOR)?;
    Some((&buf[..end], end + 1))
}

/// Decode the first frame in `buf`
///
/// Returns the frame and the number of bytes consumed, including the
/// terminator.
pub fn decode_frame(buf: &[u8]) -> Result<(Frame, usize), FrameError> {
    let (line, consumed) = next_line(buf).ok_or(FrameError::Incomplete)?;
    let malformed = |reason| FrameError::Malformed { consumed, reason };

    let split = line
        .iter()
        .position(|&b| b == FRAME_SEPARATOR)
        .ok_or_else(|| malformed(MalformedReason::MissingSeparator))?;

    let (identity, payload) = (&line[..split], &line[split + 1..]);
    if identity.is_empty() {
        return Err(malformed(MalformedReason::EmptyIdentity));
    }

    let identity = std::str::from_utf8(identity)
        .ok()
        .and_then(|s| PeerIdentity::new(s).ok())
        .ok_or_else(|| malformed(MalformedReason::InvalidIdentity))?;

    let signal = hex::decode(payload).map_err(|e| match e {
        hex::FromHexError::OddLength => malformed(MalformedReason::OddHexLength),
        _ => malformed(MalformedReason::InvalidHexDigit),
    })?;

    Ok((Frame { identity, signal }, consumed))
}

// ============================================================================
// Errors
// ============================================================================

/// Why a line could not be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedReason {
    /// No space before the newline
    MissingSeparator,
    /// Line starts with the separator
    EmptyIdentity,
    /// Identity is not a valid [`PeerIdentity`]
    InvalidIdentity,
    /// Hex payload has an odd number of digits
    OddHexLength,
    /// Hex payload contains a non-hex character
    InvalidHexDigit,
}

impl fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MalformedReason::MissingSeparator => write!(f, "missing separator"),
            MalformedReason::EmptyIdentity => write!(f, "empty identity"),
            MalformedReason::InvalidIdentity => write!(f, "invalid identity"),
            MalformedReason::OddHexLength => write!(f, "odd hex length"),
            MalformedReason::InvalidHexDigit => write!(f, "invalid hex digit"),
        }
    }
}

/// Frame decoding outcome other than success
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// No newline yet, wait for more bytes
    Incomplete,
    /// The first line is unusable; skip `consumed` bytes and continue
    Malformed {
        consumed: usize,
        reason: MalformedReason,
    },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Incomplete => write!(f, "incomplete frame"),
            FrameError::Malformed { consumed, reason } => {
                write!(f, "malformed frame ({} bytes): {}", consumed, reason)
            }
        }
    }
}

impl std::error::Error for FrameError {}

// ============================================================================
// Tests
// ============================================================================
