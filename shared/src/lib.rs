//! # Shared Protocol Core
//!
//! Everything the client and the server must agree on byte-for-byte lives in this
//! crate: the connect token format, the encrypted packet codec, replay protection,
//! the ack/reliability engine and the fragmentation transport built on top of it.
//!
//! ## Layering
//!
//! From the bottom up:
//!
//! - [`crypto`] wraps the AEAD, signature and random primitives the protocol consumes.
//! - [`token`] mints and opens connect tokens, the signed credential a game backend
//!   hands to a client so it may join one of a list of servers.
//! - [`packet`] encodes and decodes every wire packet; [`replay`] rejects duplicated
//!   or stale sequence numbers after a packet authenticates.
//! - [`sequence_buffer`] and [`ack`] track which datagrams each side has seen and
//!   estimate round-trip time, loss and bandwidth.
//! - [`transport`] splits large messages into fragments and offers reliable-ordered
//!   and fire-and-forget channels over the ack engine.
//! - [`socket`] and [`simulator`] abstract the datagram socket, with an in-memory
//!   network for tests and an optional lossy/laggy simulator.
//!
//! ## Execution Model
//!
//! Nothing in this crate spawns threads, blocks or awaits. Every stateful type is
//! advanced by explicit `update(dt)` calls from the owner's main loop, and all
//! "waiting" is expressed as state kept across ticks.

pub mod ack;
pub mod bandwidth;
pub mod crypto;
pub mod error;
pub mod packet;
pub mod replay;
pub mod sequence_buffer;
pub mod simulator;
pub mod socket;
pub mod token;
pub mod transport;
mod wire;

pub use ack::{AckConfig, AckCounter, AckEngine, AckHeader, ConnectionStats};
pub use bandwidth::BandwidthBudget;
pub use crypto::{SigningKey, SymmetricKey, VerifyingKey};
pub use error::{AckError, CryptoError, PacketError, TokenError, TransportError};
pub use packet::{Packet, PacketType};
pub use replay::ReplayBuffer;
pub use simulator::NetworkSimulator;
pub use socket::{MemoryNetwork, MemorySocket, PacketIo, Socket};
pub use token::{ConnectToken, ConnectTokenParams, PrivateConnectToken};
pub use transport::{Transport, TransportConfig};

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Number of bytes in the protocol version marker.
pub const VERSION_INFO_BYTES: usize = 10;
/// Version marker written into every connect token and every packet's associated data.
pub const PROTOCOL_VERSION: [u8; VERSION_INFO_BYTES] = *b"SNET 1.00\0";

/// Largest datagram either side will ever put on the wire.
pub const PACKET_SIZE_MAX: usize = 1280;

/// How often keepalives go out on an otherwise idle connection, in seconds.
pub const KEEPALIVE_INTERVAL: f64 = 0.1;
/// Disconnect notifications are sent this many times to survive packet loss.
pub const DISCONNECT_REDUNDANT_PACKET_COUNT: usize = 10;
/// Bytes of random challenge data exchanged during the handshake.
pub const CHALLENGE_DATA_BYTES: usize = 256;
/// Default replay window, in sequence numbers.
pub const REPLAY_BUFFER_SIZE: usize = 256;

/// Current unix time in whole seconds, the unit connect tokens are stamped with.
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_marker_is_nul_terminated() {
        assert_eq!(PROTOCOL_VERSION.len(), VERSION_INFO_BYTES);
        assert_eq!(PROTOCOL_VERSION[VERSION_INFO_BYTES - 1], 0);
    }

    #[test]
    fn test_unix_timestamp_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(unix_timestamp() > 1_577_836_800);
    }

    #[test]
    fn test_payload_limit_leaves_room_for_header_and_tag() {
        assert_eq!(
            packet::PACKET_PAYLOAD_MAX + packet::PACKET_HEADER_BYTES + crypto::MAC_BYTES,
            PACKET_SIZE_MAX
        );
    }
}
