//! # Secure Game Client Library
//!
//! This library provides the client half of the secure connection protocol. The
//! client never authenticates itself to a server directly: it presents a connect
//! token minted by the game backend, proves it owns its address by echoing a
//! challenge, and from then on exchanges encrypted messages with the server.
//!
//! ## Connection Lifecycle
//!
//! ### Handshake
//! [`Client::connect`] opens the token and starts sending connection requests
//! to the first server it lists. Requests and challenge responses are resent
//! until the server answers or the token's handshake timeout passes, at which
//! point the next listed server is tried.
//!
//! ### Connected
//! Once accepted, messages go through a fragmentation transport with a
//! reliable-ordered and a fire-and-forget channel. Keepalives are sent whenever
//! the connection is otherwise idle, so the server never times out a quiet but
//! healthy client.
//!
//! ### Failure
//! Every failure ends in a distinct [`ClientState`], such as
//! `ConnectionDenied` or `ConnectionRequestTimedOut`, so a game can tell the
//! player what went wrong.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! The [`Client`] state machine, its configuration and errors.
//!
//! ### Network Stats Module (`network_stats`)
//! Sampled history of round-trip time, packet loss and bandwidth for
//! diagnostics displays.
//!
//! ## Usage Example
//!
//! ```no_run
//! use client::{Client, ClientConfig};
//! use shared::unix_timestamp;
//!
//! # fn token_from_backend() -> Vec<u8> { Vec::new() }
//! let mut client = Client::new(ClientConfig {
//!     application_id: 1,
//!     ..ClientConfig::default()
//! })?;
//! client.connect(&token_from_backend(), unix_timestamp())?;
//!
//! loop {
//!     client.update(1.0 / 60.0, unix_timestamp());
//!     if client.is_connected() {
//!         client.send(b"hello", true)?;
//!     }
//!     while let Some(message) = client.pop_packet() {
//!         println!("{} bytes from server", message.len());
//!     }
//!     if client.state().is_error() {
//!         break;
//!     }
//! #   break;
//! }
//! # Ok::<(), client::ClientError>(())
//! ```

pub mod network;
pub mod network_stats;

pub use network::{Client, ClientConfig, ClientError, ClientState};
pub use network_stats::{NetworkSample, NetworkStats};
