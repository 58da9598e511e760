//! Per-endpoint state for handshakes that have not completed yet.
//!
//! A verified connection request creates an [`EncryptionState`] keyed by the
//! requesting endpoint. It carries the session keys out of the connect token and
//! the challenge the endpoint must echo back, proving it can receive at the
//! address it claims. The state is promoted to a connected client once the
//! challenge is answered, or dropped when it times out.

use std::net::SocketAddr;

use shared::crypto::{self, SymmetricKey};
use shared::{PrivateConnectToken, ReplayBuffer, CHALLENGE_DATA_BYTES};

use crate::lru::LruMap;
use crate::token_cache::TokenSignature;

pub struct EncryptionState {
    pub client_id: u64,
    pub client_to_server_key: SymmetricKey,
    pub server_to_client_key: SymmetricKey,
    pub user_data: Vec<u8>,
    pub token_signature: TokenSignature,
    /// Unix seconds after which the token no longer admits anyone.
    pub expiration_time: u64,
    /// Seconds of silence tolerated before the handshake is abandoned.
    pub handshake_timeout: f64,
    pub last_packet_received: f64,
    pub last_packet_sent: f64,
    pub replay: ReplayBuffer,
    pub challenge_nonce: u64,
    pub challenge_data: Vec<u8>,
    sequence: u64,
}

impl EncryptionState {
    /// Builds the state for `token` and draws a fresh challenge.
    pub fn new(token: PrivateConnectToken, now: f64) -> Self {
        let mut challenge_data = vec![0u8; CHALLENGE_DATA_BYTES];
        crypto::random_bytes(&mut challenge_data);

        Self {
            client_id: token.client_id,
            client_to_server_key: token.client_to_server_key,
            server_to_client_key: token.server_to_client_key,
            user_data: token.user_data,
            token_signature: token.signature,
            expiration_time: token.expiration_time,
            handshake_timeout: token.handshake_timeout as f64,
            last_packet_received: now,
            last_packet_sent: f64::NEG_INFINITY,
            replay: ReplayBuffer::default(),
            challenge_nonce: crypto::random_u64(),
            challenge_data,
            sequence: 0,
        }
    }

    /// Sequence number for the next packet sent to this endpoint.
    pub fn next_sequence(&mut self) -> u64 {
        let sequence = self.sequence;
        self.sequence += 1;
        sequence
    }

    /// Sequence the next packet would use, without consuming it.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn challenge_matches(&self, nonce: u64, data: &[u8]) -> bool {
        nonce == self.challenge_nonce && data == self.challenge_data.as_slice()
    }

    pub fn is_expired(&self, now: f64, unix_now: u64) -> bool {
        now - self.last_packet_received > self.handshake_timeout || unix_now > self.expiration_time
    }
}

/// Bounded map of endpoints mid-handshake. The least recently heard-from
/// endpoint is dropped when a new one arrives at capacity.
pub struct PendingHandshakes {
    states: LruMap<SocketAddr, EncryptionState>,
}

impl PendingHandshakes {
    pub fn new(capacity: usize) -> Self {
        Self {
            states: LruMap::new(capacity),
        }
    }

    /// Returns the endpoint evicted to make room, if any.
    pub fn insert(&mut self, endpoint: SocketAddr, state: EncryptionState) -> Option<SocketAddr> {
        self.states
            .insert(endpoint, state)
            .map(|(evicted, _)| evicted)
    }

    pub fn get_mut(&mut self, endpoint: &SocketAddr) -> Option<&mut EncryptionState> {
        self.states.get_mut(endpoint)
    }

    pub fn contains(&self, endpoint: &SocketAddr) -> bool {
        self.states.contains_key(endpoint)
    }

    pub fn remove(&mut self, endpoint: &SocketAddr) -> Option<EncryptionState> {
        self.states.remove(endpoint)
    }

    /// Removes and returns every handshake that has gone quiet or outlived its token.
    pub fn expire(&mut self, now: f64, unix_now: u64) -> Vec<SocketAddr> {
        self.states
            .remove_where(|_, state| state.is_expired(now, unix_now))
            .into_iter()
            .map(|(endpoint, _)| endpoint)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::crypto::SIGNATURE_BYTES;

    fn token(handshake_timeout: u32, expiration_time: u64) -> PrivateConnectToken {
        PrivateConnectToken {
            application_id: 1,
            creation_time: 0,
            expiration_time,
            handshake_timeout,
            endpoints: vec![SocketAddr::from(([127, 0, 0, 1], 5000))],
            client_id: 42,
            client_to_server_key: SymmetricKey::generate(),
            server_to_client_key: SymmetricKey::generate(),
            user_data: vec![0u8; 256],
            signature: [7u8; SIGNATURE_BYTES],
        }
    }

    fn endpoint(port: u16) -> SocketAddr {
        SocketAddr::from(([192, 168, 0, 10], port))
    }

    #[test]
    fn test_new_state_draws_challenge() {
        let a = EncryptionState::new(token(5, 1000), 0.0);
        let b = EncryptionState::new(token(5, 1000), 0.0);
        assert_eq!(a.client_id, 42);
        assert_eq!(a.challenge_data.len(), CHALLENGE_DATA_BYTES);
        assert_ne!(a.challenge_data, b.challenge_data);
        assert!(a.challenge_matches(a.challenge_nonce, &a.challenge_data));
        assert!(!a.challenge_matches(a.challenge_nonce.wrapping_add(1), &a.challenge_data));
        assert!(!a.challenge_matches(a.challenge_nonce, &b.challenge_data));
    }

    #[test]
    fn test_sequence_increments() {
        let mut state = EncryptionState::new(token(5, 1000), 0.0);
        assert_eq!(state.next_sequence(), 0);
        assert_eq!(state.next_sequence(), 1);
        assert_eq!(state.sequence(), 2);
    }

    #[test]
    fn test_expiry_by_silence_and_token_lifetime() {
        let state = EncryptionState::new(token(5, 1000), 10.0);
        assert!(!state.is_expired(15.0, 999));
        assert!(state.is_expired(15.1, 999));
        assert!(state.is_expired(11.0, 1001));
    }

    #[test]
    fn test_pending_capacity_and_expire() {
        let mut pending = PendingHandshakes::new(2);
        assert_eq!(pending.insert(endpoint(1), EncryptionState::new(token(5, 1000), 0.0)), None);
        assert_eq!(pending.insert(endpoint(2), EncryptionState::new(token(1, 1000), 0.0)), None);
        assert_eq!(
            pending.insert(endpoint(3), EncryptionState::new(token(5, 1000), 0.0)),
            Some(endpoint(1))
        );

        let expired = pending.expire(2.0, 100);
        assert_eq!(expired, vec![endpoint(2)]);
        assert!(pending.contains(&endpoint(3)));
        assert_eq!(pending.len(), 1);
    }
}
