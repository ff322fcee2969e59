//! Identity → connection routing table
//!
//! One entry per identity. A second registration for the same identity
//! replaces the first (the newest connection wins), and unregistering only
//! removes an entry that still points at the closing connection.

use std::collections::HashMap;

use mio::Token;
use rendezvous::PeerIdentity;

// ============================================================================
// Registry Structure
// ============================================================================

/// Routing table for the relay
#[derive(Default)]
pub struct Registry {
    peers: HashMap<PeerIdentity, Token>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            peers: HashMap::new(),
        }
    }

    /// Route `identity` to `token`. Returns the connection it replaced.
    pub fn register(&mut self, identity: PeerIdentity, token: Token) -> Option<Token> {
        let previous = self.peers.insert(identity.clone(), token);
        match previous {
            Some(old) if old != token => {
                log::info!(
                    "Peer '{}' re-registered (conn={:?} replaces conn={:?})",
                    identity,
                    token,
                    old
                );
            }
            _ => log::info!("Registered peer '{}' (conn={:?})", identity, token),
        }
        previous.filter(|old| *old != token)
    }

    /// Drop the route for `identity` if it still belongs to `token`
    pub fn unregister(&mut self, identity: &PeerIdentity, token: Token) -> bool {
        if self.peers.get(identity) == Some(&token) {
            self.peers.remove(identity);
            log::info!("Unregistered peer '{}' (conn={:?})", identity, token);
            true
        } else {
            false
        }
    }

    pub fn lookup(&self, identity: &PeerIdentity) -> Option<Token> {
        self.peers.get(identity).copied()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> PeerIdentity {
        PeerIdentity::new(s).unwrap()
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = Registry::new();
        assert!(registry.is_empty());

        assert_eq!(registry.register(id("peer_1"), Token(1)), None);
        assert_eq!(registry.lookup(&id("peer_1")), Some(Token(1)));
        assert_eq!(registry.lookup(&id("peer_2")), None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_newest_registration_wins() {
        let mut registry = Registry::new();
        registry.register(id("peer_1"), Token(1));

        assert_eq!(registry.register(id("peer_1"), Token(2)), Some(Token(1)));
        assert_eq!(registry.lookup(&id("peer_1")), Some(Token(2)));

        // The replaced connection closing must not remove the new route
        assert!(!registry.unregister(&id("peer_1"), Token(1)));
        assert_eq!(registry.lookup(&id("peer_1")), Some(Token(2)));

        assert!(registry.unregister(&id("peer_1"), Token(2)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_same_token_reregister() {
        let mut registry = Registry::new();
        registry.register(id("peer_1"), Token(1));
        assert_eq!(registry.register(id("peer_1"), Token(1)), None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_unknown() {
        let mut registry = Registry::new();
        assert!(!registry.unregister(&id("ghost"), Token(7)));
    }
}
