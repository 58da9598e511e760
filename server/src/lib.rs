//! # Secure Game Server Library
//!
//! This library provides the server half of the secure connection protocol. A
//! game backend issues signed connect tokens to the players it has
//! authenticated; the server admits whoever presents a valid token, without
//! running its own authentication, and then exchanges encrypted messages with
//! them.
//!
//! ## Core Responsibilities
//!
//! ### Admission
//! Every connection starts with a connect token. The server checks the token's
//! signature, expiry and endpoint list, remembers its signature so it cannot be
//! used from a second address, and proves the client owns its address with a
//! challenge before allocating anything.
//!
//! ### Client Management
//! Admitted clients occupy one of `max_clients` slots. Each slot hands out a
//! handle carrying a generation counter, so a handle kept after its client left
//! can never reach the client that reuses the slot.
//!
//! ### Message Delivery
//! Each client gets its own fragmentation transport: large messages are split
//! across packets and resent until acknowledged on the reliable channel, or sent
//! once on the fire-and-forget channel.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded, Explicitly Driven
//! The server never spawns threads or blocks. The embedding application calls
//! [`Server::update`] once per tick, which reads every waiting datagram, handles
//! timeouts and flushes queued traffic, then drains events with
//! [`Server::poll_event`].
//!
//! ### Nothing Answers a Bad Packet
//! Datagrams that fail authentication, arrive twice or carry an unknown type are
//! dropped and logged at debug level. A sender cannot tell these cases apart.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! The [`Server`] itself: socket handling, the handshake, events and sending.
//!
//! ### Client Manager Module (`client_manager`)
//! The slot arena of connected clients and their [`ClientHandle`]s.
//!
//! ### Handshake Module (`handshake`)
//! Per-endpoint encryption state for handshakes still in progress.
//!
//! ### Token Cache Module (`token_cache`)
//! The replay cache of connect token signatures.
//!
//! ### LRU Module (`lru`)
//! The fixed-capacity LRU map behind both the pending table and the token cache.

pub mod client_manager;
pub mod handshake;
pub mod lru;
pub mod network;
pub mod token_cache;

pub use client_manager::ClientHandle;
pub use network::{Server, ServerConfig, ServerError, ServerEvent};
