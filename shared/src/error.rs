//! Error types for each protocol layer.
//!
//! Packet-level faults ([`PacketError`], most [`AckError`]s) are meant to be
//! counted and dropped by the connection owner, never surfaced to the
//! application. Token and transport errors describe failures the caller can act on.

use thiserror::Error;

/// Failures from the AEAD and key-derivation wrappers.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption/authentication failed")]
    Authentication,
    #[error("key derivation failed")]
    KeyDerivation,
}

/// Reasons a connect token could not be minted or opened.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// Wrong size, unreadable section, version marker or application id mismatch.
    #[error("connect token is malformed or belongs to another application")]
    InvalidFormat,
    #[error("connect token has expired")]
    TokenExpired,
    /// The signature does not verify, or the secret section does not open.
    #[error("connect token signature is invalid")]
    SignatureInvalid,
    #[error("connect token must list at least one endpoint")]
    NoEndpoints,
    #[error("connect token lists too many endpoints ({0})")]
    TooManyEndpoints(usize),
    #[error("connect token user data has the wrong size ({0} bytes)")]
    InvalidUserData(usize),
    #[error("failed to encode connect token: {0}")]
    Encode(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Reasons an incoming datagram was rejected by the packet codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Size does not match what the packet type requires.
    #[error("malformed packet")]
    Malformed,
    #[error("unknown packet type {0}")]
    UnknownType(u8),
    /// Authentication tag mismatch: forged, corrupted, or sealed with another key.
    #[error("packet failed authentication")]
    Corrupt,
    /// Sequence number already seen or older than the replay window.
    #[error("stale or duplicate packet sequence {0}")]
    Stale(u64),
    #[error("packet of {0} bytes exceeds the maximum packet size")]
    TooLarge(usize),
    #[error("failed to encode packet: {0}")]
    Encode(String),
}

impl From<CryptoError> for PacketError {
    fn from(_: CryptoError) -> Self {
        PacketError::Corrupt
    }
}

/// Failures inside the ack engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AckError {
    #[error("packet of {size} bytes is larger than the ack engine limit of {max}")]
    TooLargeToSend { size: usize, max: usize },
    #[error("received packet of {0} bytes is larger than the ack engine limit")]
    TooLargeToReceive(usize),
    #[error("ack header is malformed")]
    Malformed,
    #[error("sequence {0} is too old to record")]
    Stale(u16),
    #[error("failed to encode ack header: {0}")]
    Encode(String),
}

/// Failures from the fragmentation transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("message of {size} bytes exceeds the single-send limit of {max} bytes")]
    TooLargeToSend { size: usize, max: usize },
    #[error("cannot send an empty message")]
    EmptyMessage,
    #[error("reliable send queue is full")]
    SendQueueFull,
    #[error("malformed fragment")]
    Malformed,
    #[error(transparent)]
    Ack(#[from] AckError),
}
