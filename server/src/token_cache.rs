//! Replay cache for connect tokens.
//!
//! A connect token may be presented by exactly one endpoint. The cache maps each
//! token signature the server has accepted to the endpoint that presented it,
//! so a token captured off the wire cannot be replayed from another address. Old
//! signatures age out in LRU order once the cache is full; by then the token they
//! belong to has normally expired anyway.

use std::net::SocketAddr;

use shared::crypto::SIGNATURE_BYTES;

use crate::lru::LruMap;

pub type TokenSignature = [u8; SIGNATURE_BYTES];

/// How a connection request relates to what the cache has seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenUse {
    /// Never seen; now recorded against the presenting endpoint.
    First,
    /// Seen before from the same endpoint, e.g. a resent connection request.
    Repeat,
    /// Seen before from a different endpoint.
    Replay { original: SocketAddr },
}

pub struct ConnectTokenCache {
    entries: LruMap<TokenSignature, SocketAddr>,
}

impl ConnectTokenCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LruMap::new(capacity),
        }
    }

    /// Classifies a presentation of `signature` from `endpoint`, recording it if new.
    pub fn observe(&mut self, signature: &TokenSignature, endpoint: SocketAddr) -> TokenUse {
        match self.entries.get(signature) {
            Some(&original) if original == endpoint => TokenUse::Repeat,
            Some(&original) => TokenUse::Replay { original },
            None => {
                self.entries.insert(*signature, endpoint);
                TokenUse::First
            }
        }
    }

    /// Records `signature` for `endpoint`, evicting the oldest entry if full.
    pub fn insert(&mut self, signature: TokenSignature, endpoint: SocketAddr) {
        self.entries.insert(signature, endpoint);
    }

    pub fn contains(&self, signature: &TokenSignature) -> bool {
        self.entries.contains_key(signature)
    }

    /// Endpoint that first presented `signature`.
    pub fn endpoint(&self, signature: &TokenSignature) -> Option<SocketAddr> {
        self.entries.peek(signature).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
