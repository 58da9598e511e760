//! Connected-client slots for the server
//!
//! This module owns every client that has completed the handshake:
//! - A fixed number of slots, one per allowed concurrent client
//! - Generation-checked handles so a slot reused by a new client can never be
//!   reached through a handle given out for the previous occupant
//! - Address lookup for routing incoming datagrams
//! - Timeout sweeps for clients that have gone silent
//!
//! Slots are an arena: freeing a client bumps its slot's generation and puts the
//! index back on a free list. Nothing here touches the socket.

use log::info;
use shared::{BandwidthBudget, ReplayBuffer, SymmetricKey, Transport};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use crate::handshake::EncryptionState;

/// Names one connected client: a slot index plus the slot's generation when
/// the client was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientHandle {
    pub index: u32,
    pub generation: u32,
}

impl ClientHandle {
    /// Packs the handle into the `u64` sent to the client in `ConnectionAccepted`.
    pub fn to_u64(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub fn from_u64(value: u64) -> Self {
        Self {
            index: value as u32,
            generation: (value >> 32) as u32,
        }
    }
}

impl fmt::Display for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// A client that completed the handshake
///
/// Each client carries:
/// - Session keys and the outgoing packet sequence
/// - The replay window for its incoming packets
/// - A fragmentation transport for application payloads
/// - Activity timestamps for keepalives and timeout detection
pub struct ConnectedClient {
    pub client_id: u64,
    pub addr: SocketAddr,
    pub client_to_server_key: SymmetricKey,
    pub server_to_client_key: SymmetricKey,
    pub user_data: Vec<u8>,
    pub replay: ReplayBuffer,
    pub transport: Transport,
    /// Drops incoming payload traffic beyond the configured rate.
    pub incoming_budget: BandwidthBudget,
    pub last_packet_received: f64,
    pub last_packet_sent: f64,
    sequence: u64,
}

impl ConnectedClient {
    /// Promotes a finished handshake
    ///
    /// Keys, packet sequence and replay window carry over, so packets the
    /// endpoint sent during the handshake cannot be replayed afterwards.
    pub fn from_handshake(
        addr: SocketAddr,
        state: EncryptionState,
        transport: Transport,
        incoming_budget: BandwidthBudget,
        now: f64,
    ) -> Self {
        Self {
            client_id: state.client_id,
            addr,
            sequence: state.sequence(),
            client_to_server_key: state.client_to_server_key,
            server_to_client_key: state.server_to_client_key,
            user_data: state.user_data,
            replay: state.replay,
            transport,
            incoming_budget,
            last_packet_received: now,
            last_packet_sent: state.last_packet_sent,
        }
    }

    /// Sequence number for the next packet sent to this client.
    pub fn next_sequence(&mut self) -> u64 {
        let sequence = self.sequence;
        self.sequence += 1;
        sequence
    }

    /// True once the client has been silent for more than `timeout` seconds.
    pub fn is_timed_out(&self, now: f64, timeout: f64) -> bool {
        now - self.last_packet_received > timeout
    }
}

struct Slot {
    generation: u32,
    client: Option<ConnectedClient>,
}

/// Fixed-size arena of client slots
///
/// A slot is either free (its index sits on the free list) or holds one
/// client. Removing a client bumps the slot generation, which invalidates
/// every [`ClientHandle`] minted for it before the slot is reused.
pub struct ClientManager {
    slots: Vec<Slot>,
    /// Free slot indices; the lowest index is handed out first.
    free: Vec<u32>,
    by_addr: HashMap<SocketAddr, ClientHandle>,
}

impl ClientManager {
    /// `max_clients` empty slots, all at generation 0.
    pub fn new(max_clients: usize) -> Self {
        let max_clients = max_clients.min(u32::MAX as usize);
        Self {
            slots: (0..max_clients)
                .map(|_| Slot {
                    generation: 0,
                    client: None,
                })
                .collect(),
            free: (0..max_clients as u32).rev().collect(),
            by_addr: HashMap::with_capacity(max_clients),
        }
    }

    /// Places `client` in the lowest free slot and returns its handle
    ///
    /// None if the arena is full or the client's address already holds a slot.
    pub fn add_client(&mut self, client: ConnectedClient) -> Option<ClientHandle> {
        if self.by_addr.contains_key(&client.addr) {
            return None;
        }
        let index = self.free.pop()?;
        let slot = self.slots.get_mut(index as usize)?;

        let handle = ClientHandle {
            index,
            generation: slot.generation,
        };
        info!(
            "Client {} (id {:#x}) connected from {}",
            handle, client.client_id, client.addr
        );
        self.by_addr.insert(client.addr, handle);
        slot.client = Some(client);
        Some(handle)
    }

    /// Frees a client's slot
    ///
    /// The slot's generation is bumped so `handle` and any copies of it go
    /// stale. Returns the removed client, or None if the handle was stale.
    pub fn remove_client(&mut self, handle: ClientHandle) -> Option<ConnectedClient> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let client = slot.client.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.by_addr.remove(&client.addr);
        info!("Client {} disconnected", handle);
        Some(client)
    }

    pub fn get(&self, handle: ClientHandle) -> Option<&ConnectedClient> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.client.as_ref())
    }

    pub fn get_mut(&mut self, handle: ClientHandle) -> Option<&mut ConnectedClient> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.client.as_mut())
    }

    pub fn is_connected(&self, handle: ClientHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Finds the client connected from `addr`
    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<ClientHandle> {
        self.by_addr.get(&addr).copied()
    }

    /// Lists clients silent for longer than `timeout` seconds
    ///
    /// The clients are left in place; the caller decides how to disconnect them.
    pub fn check_timeouts(&self, now: f64, timeout: f64) -> Vec<ClientHandle> {
        self.iter()
            .filter(|(_, client)| client.is_timed_out(now, timeout))
            .map(|(handle, _)| handle)
            .collect()
    }

    /// Handles of every connected client, in slot order
    pub fn handles(&self) -> Vec<ClientHandle> {
        self.iter().map(|(handle, _)| handle).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClientHandle, &ConnectedClient)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.client.as_ref().map(|client| {
                (
                    ClientHandle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    client,
                )
            })
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ClientHandle, &mut ConnectedClient)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let generation = slot.generation;
            slot.client.as_mut().map(|client| {
                (
                    ClientHandle {
                        index: index as u32,
                        generation,
                    },
                    client,
                )
            })
        })
    }

    /// Occupied slots.
    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.free.is_empty()
    }

    pub fn max_clients(&self) -> usize {
        self.slots.len()
    }
}
