//! # Packet Codec
//!
//! Every datagram starts with a one-byte packet type. `ConnectionRequest` is the
//! only packet sent in the clear; its body is the connect token packet, which is
//! signed on its own. Every other packet looks like:
//!
//! ```text
//! [type: u8][sequence: u64 LE][ciphertext of body][tag: 16 bytes]
//! ```
//!
//! The body is sealed with ChaCha20-Poly1305 using the sender's per-direction key
//! and a nonce derived from `sequence`. The associated data binds the packet type,
//! the protocol version and the application id, so a packet cannot be replayed as
//! a different type or into another game.
//!
//! Receivers check the sequence against a [`ReplayBuffer`] before decrypting and
//! record it only after the packet authenticates.

use std::net::SocketAddr;

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::crypto::{self, SymmetricKey, MAC_BYTES};
use crate::error::PacketError;
use crate::replay::ReplayBuffer;
use crate::token::CONNECT_TOKEN_PACKET_BYTES;
use crate::wire;
use crate::{CHALLENGE_DATA_BYTES, PACKET_SIZE_MAX, PROTOCOL_VERSION, VERSION_INFO_BYTES};

/// Type byte plus sequence number.
pub const PACKET_HEADER_BYTES: usize = 1 + 8;
/// Largest `Payload` body that still fits in one datagram.
pub const PACKET_PAYLOAD_MAX: usize = PACKET_SIZE_MAX - PACKET_HEADER_BYTES - MAC_BYTES;

const ACCEPTED_BODY_BYTES: usize = 8 + 4 + 4;
const CHALLENGE_BODY_BYTES: usize = 8 + 8 + CHALLENGE_DATA_BYTES;
const AAD_BYTES: usize = 1 + VERSION_INFO_BYTES + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    ConnectionRequest = 0,
    ConnectionAccepted = 1,
    ConnectionDenied = 2,
    Keepalive = 3,
    Disconnect = 4,
    ChallengeRequest = 5,
    ChallengeResponse = 6,
    Payload = 7,
}

impl TryFrom<u8> for PacketType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => PacketType::ConnectionRequest,
            1 => PacketType::ConnectionAccepted,
            2 => PacketType::ConnectionDenied,
            3 => PacketType::Keepalive,
            4 => PacketType::Disconnect,
            5 => PacketType::ChallengeRequest,
            6 => PacketType::ChallengeResponse,
            7 => PacketType::Payload,
            other => return Err(PacketError::UnknownType(other)),
        })
    }
}

/// A decoded protocol packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Client -> server, unencrypted. Carries the connect token packet.
    ConnectionRequest { token: Vec<u8> },
    /// Server -> client once the challenge is answered.
    ConnectionAccepted {
        client_handle: u64,
        max_clients: u32,
        connection_timeout: u32,
    },
    ConnectionDenied,
    Keepalive,
    Disconnect,
    /// Server -> client proof-of-address challenge.
    ChallengeRequest { nonce: u64, data: Vec<u8> },
    /// Client -> server echo of the challenge.
    ChallengeResponse { nonce: u64, data: Vec<u8> },
    Payload { data: Vec<u8> },
}

#[derive(Serialize, Deserialize)]
struct AcceptedBody {
    client_handle: u64,
    max_clients: u32,
    connection_timeout: u32,
}

#[derive(Serialize, Deserialize)]
struct ChallengeBody {
    nonce: u64,
    data: Vec<u8>,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::ConnectionRequest { .. } => PacketType::ConnectionRequest,
            Packet::ConnectionAccepted { .. } => PacketType::ConnectionAccepted,
            Packet::ConnectionDenied => PacketType::ConnectionDenied,
            Packet::Keepalive => PacketType::Keepalive,
            Packet::Disconnect => PacketType::Disconnect,
            Packet::ChallengeRequest { .. } => PacketType::ChallengeRequest,
            Packet::ChallengeResponse { .. } => PacketType::ChallengeResponse,
            Packet::Payload { .. } => PacketType::Payload,
        }
    }

    fn body(&self) -> Result<Vec<u8>, PacketError> {
        let to_error = |e: bincode::Error| PacketError::Encode(e.to_string());
        match self {
            Packet::ConnectionAccepted {
                client_handle,
                max_clients,
                connection_timeout,
            } => wire::serialize(&AcceptedBody {
                client_handle: *client_handle,
                max_clients: *max_clients,
                connection_timeout: *connection_timeout,
            })
            .map_err(to_error),
            Packet::ChallengeRequest { nonce, data } | Packet::ChallengeResponse { nonce, data } => {
                if data.len() != CHALLENGE_DATA_BYTES {
                    return Err(PacketError::Malformed);
                }
                wire::serialize(&ChallengeBody {
                    nonce: *nonce,
                    data: data.clone(),
                })
                .map_err(to_error)
            }
            Packet::Payload { data } => {
                if data.is_empty() {
                    return Err(PacketError::Malformed);
                }
                Ok(data.clone())
            }
            Packet::ConnectionDenied | Packet::Keepalive | Packet::Disconnect => Ok(Vec::new()),
            Packet::ConnectionRequest { token } => Ok(token.clone()),
        }
    }
}

fn body_len_is_valid(packet_type: PacketType, len: usize) -> bool {
    match packet_type {
        PacketType::ConnectionRequest => len == CONNECT_TOKEN_PACKET_BYTES,
        PacketType::ConnectionAccepted => len == ACCEPTED_BODY_BYTES,
        PacketType::ConnectionDenied | PacketType::Keepalive | PacketType::Disconnect => len == 0,
        PacketType::ChallengeRequest | PacketType::ChallengeResponse => len == CHALLENGE_BODY_BYTES,
        PacketType::Payload => (1..=PACKET_PAYLOAD_MAX).contains(&len),
    }
}

fn associated_data(packet_type: PacketType, application_id: u64) -> [u8; AAD_BYTES] {
    let mut aad = [0u8; AAD_BYTES];
    aad[0] = packet_type as u8;
    aad[1..1 + VERSION_INFO_BYTES].copy_from_slice(&PROTOCOL_VERSION);
    aad[1 + VERSION_INFO_BYTES..].copy_from_slice(&application_id.to_le_bytes());
    aad
}

/// Reads the type byte without touching the rest of the datagram.
pub fn peek_type(bytes: &[u8]) -> Result<PacketType, PacketError> {
    let first = *bytes.first().ok_or(PacketError::Malformed)?;
    PacketType::try_from(first)
}

/// Builds a `ConnectionRequest` datagram around a connect token packet.
pub fn encode_connection_request(token_packet: &[u8]) -> Result<Vec<u8>, PacketError> {
    if token_packet.len() != CONNECT_TOKEN_PACKET_BYTES {
        return Err(PacketError::Malformed);
    }
    let mut out = Vec::with_capacity(1 + CONNECT_TOKEN_PACKET_BYTES);
    out.push(PacketType::ConnectionRequest as u8);
    out.extend_from_slice(token_packet);
    Ok(out)
}

/// Returns the connect token packet carried by a `ConnectionRequest` datagram.
pub fn read_connection_request(bytes: &[u8]) -> Result<&[u8], PacketError> {
    if peek_type(bytes)? != PacketType::ConnectionRequest {
        return Err(PacketError::Malformed);
    }
    let token = &bytes[1..];
    if token.len() != CONNECT_TOKEN_PACKET_BYTES {
        return Err(PacketError::Malformed);
    }
    Ok(token)
}

/// Encodes and seals `packet` with `key` under `sequence`.
///
/// `ConnectionRequest` ignores `key` and `sequence` and goes out in the clear.
pub fn encode(
    packet: &Packet,
    application_id: u64,
    sequence: u64,
    key: &SymmetricKey,
) -> Result<Vec<u8>, PacketError> {
    if let Packet::ConnectionRequest { token } = packet {
        return encode_connection_request(token);
    }

    let packet_type = packet.packet_type();
    let body = packet.body()?;
    let size = PACKET_HEADER_BYTES + body.len() + MAC_BYTES;
    if size > PACKET_SIZE_MAX {
        return Err(PacketError::TooLarge(size));
    }

    let aad = associated_data(packet_type, application_id);
    let sealed = crypto::encrypt(key, sequence, &aad, &body).map_err(|_| {
        PacketError::Encode(format!("failed to seal {:?} packet", packet_type))
    })?;

    let mut out = Vec::with_capacity(size);
    out.push(packet_type as u8);
    out.extend_from_slice(&sequence.to_le_bytes());
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Authenticates and decodes one datagram.
///
/// With a `replay` buffer, stale sequences are rejected before decryption and the
/// sequence is recorded once the packet has authenticated.
pub fn decode(
    bytes: &[u8],
    application_id: u64,
    key: &SymmetricKey,
    replay: Option<&mut ReplayBuffer>,
) -> Result<Packet, PacketError> {
    if bytes.len() > PACKET_SIZE_MAX {
        return Err(PacketError::TooLarge(bytes.len()));
    }
    let packet_type = peek_type(bytes)?;
    if packet_type == PacketType::ConnectionRequest {
        let token = read_connection_request(bytes)?;
        return Ok(Packet::ConnectionRequest {
            token: token.to_vec(),
        });
    }

    if bytes.len() < PACKET_HEADER_BYTES + MAC_BYTES {
        return Err(PacketError::Malformed);
    }
    let body_len = bytes.len() - PACKET_HEADER_BYTES - MAC_BYTES;
    if !body_len_is_valid(packet_type, body_len) {
        return Err(PacketError::Malformed);
    }

    let mut sequence_bytes = [0u8; 8];
    sequence_bytes.copy_from_slice(&bytes[1..PACKET_HEADER_BYTES]);
    let sequence = u64::from_le_bytes(sequence_bytes);

    if let Some(replay) = replay.as_deref() {
        if replay.is_stale(sequence) {
            return Err(PacketError::Stale(sequence));
        }
    }

    let aad = associated_data(packet_type, application_id);
    let body = crypto::decrypt(key, sequence, &aad, &bytes[PACKET_HEADER_BYTES..])?;

    if let Some(replay) = replay {
        if !replay.accept(sequence) {
            return Err(PacketError::Stale(sequence));
        }
    }

    Ok(match packet_type {
        PacketType::ConnectionAccepted => {
            let accepted: AcceptedBody =
                wire::deserialize(&body).map_err(|_| PacketError::Malformed)?;
            Packet::ConnectionAccepted {
                client_handle: accepted.client_handle,
                max_clients: accepted.max_clients,
                connection_timeout: accepted.connection_timeout,
            }
        }
        PacketType::ChallengeRequest | PacketType::ChallengeResponse => {
            let challenge: ChallengeBody =
                wire::deserialize(&body).map_err(|_| PacketError::Malformed)?;
            if challenge.data.len() != CHALLENGE_DATA_BYTES {
                return Err(PacketError::Malformed);
            }
            if packet_type == PacketType::ChallengeRequest {
                Packet::ChallengeRequest {
                    nonce: challenge.nonce,
                    data: challenge.data,
                }
            } else {
                Packet::ChallengeResponse {
                    nonce: challenge.nonce,
                    data: challenge.data,
                }
            }
        }
        PacketType::ConnectionDenied => Packet::ConnectionDenied,
        PacketType::Keepalive => Packet::Keepalive,
        PacketType::Disconnect => Packet::Disconnect,
        PacketType::Payload => Packet::Payload { data: body },
        PacketType::ConnectionRequest => return Err(PacketError::Malformed),
    })
}

/// Logs a datagram the codec refused. Rejected packets are never answered, so
/// this is the only place forged and unknown packets can be told apart.
pub fn log_rejected(from: SocketAddr, error: &PacketError) {
    match error {
        PacketError::Stale(sequence) => trace!("Dropping stale packet {} from {}", sequence, from),
        PacketError::Corrupt => debug!("Dropping packet from {} that failed authentication", from),
        PacketError::UnknownType(value) => debug!("Dropping packet of unknown type {} from {}", value, from),
        other => debug!("Dropping packet from {}: {}", from, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const APP_ID: u64 = 77;

    fn challenge_data() -> Vec<u8> {
        (0..CHALLENGE_DATA_BYTES).map(|i| (i * 7) as u8).collect()
    }

    fn roundtrip(packet: Packet) {
        let key = SymmetricKey::generate();
        let mut replay = ReplayBuffer::default();
        let bytes = encode(&packet, APP_ID, 9, &key).unwrap();
        assert!(bytes.len() <= PACKET_SIZE_MAX);
        let decoded = decode(&bytes, APP_ID, &key, Some(&mut replay)).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_roundtrip_every_encrypted_type() {
        roundtrip(Packet::ConnectionAccepted {
            client_handle: 0xDEAD_BEEF,
            max_clients: 64,
            connection_timeout: 10,
        });
        roundtrip(Packet::ConnectionDenied);
        roundtrip(Packet::Keepalive);
        roundtrip(Packet::Disconnect);
        roundtrip(Packet::ChallengeRequest {
            nonce: 5,
            data: challenge_data(),
        });
        roundtrip(Packet::ChallengeResponse {
            nonce: 6,
            data: challenge_data(),
        });
        roundtrip(Packet::Payload { data: vec![1] });
        roundtrip(Packet::Payload {
            data: vec![0xAB; PACKET_PAYLOAD_MAX],
        });
    }

    #[test]
    fn test_fixed_sizes() {
        let key = SymmetricKey::generate();
        let keepalive = encode(&Packet::Keepalive, APP_ID, 0, &key).unwrap();
        assert_eq!(keepalive.len(), PACKET_HEADER_BYTES + MAC_BYTES);

        let full = encode(
            &Packet::Payload {
                data: vec![0; PACKET_PAYLOAD_MAX],
            },
            APP_ID,
            0,
            &key,
        )
        .unwrap();
        assert_eq!(full.len(), PACKET_SIZE_MAX);
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let key = SymmetricKey::generate();
        let packet = Packet::Payload {
            data: vec![0; PACKET_PAYLOAD_MAX + 1],
        };
        assert_eq!(
            encode(&packet, APP_ID, 0, &key).unwrap_err(),
            PacketError::TooLarge(PACKET_SIZE_MAX + 1)
        );
    }

    #[test]
    fn test_wrong_key_is_corrupt() {
        let key = SymmetricKey::generate();
        let other = SymmetricKey::generate();
        let bytes = encode(&Packet::Keepalive, APP_ID, 3, &key).unwrap();
        assert_eq!(decode(&bytes, APP_ID, &other, None).unwrap_err(), PacketError::Corrupt);
    }

    #[test]
    fn test_wrong_application_is_corrupt() {
        let key = SymmetricKey::generate();
        let bytes = encode(&Packet::Keepalive, APP_ID, 3, &key).unwrap();
        assert_eq!(decode(&bytes, APP_ID + 1, &key, None).unwrap_err(), PacketError::Corrupt);
    }

    #[test]
    fn test_retyped_packet_fails_authentication() {
        let key = SymmetricKey::generate();
        let mut bytes = encode(&Packet::Keepalive, APP_ID, 3, &key).unwrap();
        bytes[0] = PacketType::Disconnect as u8;
        assert_eq!(decode(&bytes, APP_ID, &key, None).unwrap_err(), PacketError::Corrupt);
    }

    #[test]
    fn test_replayed_packet_is_stale() {
        let key = SymmetricKey::generate();
        let mut replay = ReplayBuffer::default();
        let bytes = encode(&Packet::Keepalive, APP_ID, 11, &key).unwrap();

        assert!(decode(&bytes, APP_ID, &key, Some(&mut replay)).is_ok());
        assert_eq!(
            decode(&bytes, APP_ID, &key, Some(&mut replay)).unwrap_err(),
            PacketError::Stale(11)
        );
    }

    #[test]
    fn test_forged_packet_does_not_poison_replay_buffer() {
        let key = SymmetricKey::generate();
        let forger = SymmetricKey::generate();
        let mut replay = ReplayBuffer::default();

        let forged = encode(&Packet::Keepalive, APP_ID, 500, &forger).unwrap();
        assert_eq!(
            decode(&forged, APP_ID, &key, Some(&mut replay)).unwrap_err(),
            PacketError::Corrupt
        );
        assert_eq!(replay.highest_sequence_seen(), None);

        let genuine = encode(&Packet::Keepalive, APP_ID, 500, &key).unwrap();
        assert!(decode(&genuine, APP_ID, &key, Some(&mut replay)).is_ok());
    }

    #[test]
    fn test_unknown_type_and_truncation() {
        let key = SymmetricKey::generate();
        assert_eq!(decode(&[], APP_ID, &key, None).unwrap_err(), PacketError::Malformed);
        assert_eq!(
            decode(&[200, 0, 0], APP_ID, &key, None).unwrap_err(),
            PacketError::UnknownType(200)
        );

        let bytes = encode(&Packet::Keepalive, APP_ID, 1, &key).unwrap();
        assert_eq!(
            decode(&bytes[..bytes.len() - 1], APP_ID, &key, None).unwrap_err(),
            PacketError::Malformed
        );
    }

    #[test]
    fn test_connection_request_is_sent_in_clear() {
        let key = SymmetricKey::generate();
        let token = vec![0x5A; CONNECT_TOKEN_PACKET_BYTES];
        let bytes = encode(&Packet::ConnectionRequest { token: token.clone() }, APP_ID, 0, &key)
            .unwrap();
        assert_eq!(bytes.len(), 1 + CONNECT_TOKEN_PACKET_BYTES);
        assert_eq!(read_connection_request(&bytes).unwrap(), &token[..]);

        let other = SymmetricKey::generate();
        assert_eq!(
            decode(&bytes, APP_ID, &other, None).unwrap(),
            Packet::ConnectionRequest { token }
        );
        assert!(encode_connection_request(&[0; 10]).is_err());
    }
}
