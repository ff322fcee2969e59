//! Peer identities
//!
//! An identity is the opaque printable token an endpoint registers with the
//! signaling server. It doubles as the registry key and as the first field of
//! every wire frame, so it can never contain whitespace.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Constants
// ============================================================================

/// Longest identity accepted, in bytes
pub const MAX_IDENTITY_LEN: usize = 128;

// ============================================================================
// PeerIdentity
// ============================================================================

/// Validated endpoint identity. Equality is byte equality of the string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerIdentity(String);

impl PeerIdentity {
    /// Validate and wrap an identity string
    pub fn new(value: impl Into<String>) -> Result<Self, IdentityError> {
        let value = value.into();
        validate(&value)?;
        Ok(PeerIdentity(value))
    }

    /// Canonical string form (what goes on the wire)
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate(value: &str) -> Result<(), IdentityError> {
    if value.is_empty() {
        return Err(IdentityError::Empty);
    }
    if value.len() > MAX_IDENTITY_LEN {
        return Err(IdentityError::TooLong(value.len()));
    }
    // Printable ASCII minus space
    if let Some(c) = value.chars().find(|c| !c.is_ascii_graphic()) {
        return Err(IdentityError::InvalidCharacter(c));
    }
    Ok(())
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerIdentity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PeerIdentity::new(s)
    }
}

impl TryFrom<String> for PeerIdentity {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        PeerIdentity::new(value)
    }
}

impl From<PeerIdentity> for String {
    fn from(identity: PeerIdentity) -> Self {
        identity.0
    }
}

impl AsRef<str> for PeerIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Reasons a string is not a usable identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// Zero-length identity
    Empty,
    /// Longer than [`MAX_IDENTITY_LEN`]
    TooLong(usize),
    /// Whitespace, control or non-ASCII character
    InvalidCharacter(char),
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityError::Empty => write!(f, "identity is empty"),
            IdentityError::TooLong(len) => {
                write!(f, "identity too long: {} bytes (max {})", len, MAX_IDENTITY_LEN)
            }
            IdentityError::InvalidCharacter(c) => {
                write!(f, "identity contains invalid character {:?}", c)
            }
        }
    }
}

impl std::error::Error for IdentityError {}
