//! Server connection manager
//!
//! The [`Server`] owns the socket and three tables, all mutated only from
//! [`Server::update`] and the send/disconnect calls on the same thread:
//!
//! - the connect-token cache, so a token admits one endpoint only
//! - pending handshakes, keyed by endpoint
//! - connected clients, in generation-checked slots
//!
//! A connection goes through three packets. The client sends its connect token
//! in a `ConnectionRequest`; the server verifies it and answers with an encrypted
//! `ChallengeRequest`; the client echoes the challenge back in a
//! `ChallengeResponse`, and the server admits it with `ConnectionAccepted` or
//! turns it away with `ConnectionDenied` when full. From then on application data
//! travels in `Payload` packets through each client's fragmentation transport.
//!
//! Packets that fail to decode are dropped and logged, never answered.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

use log::{debug, info, trace, warn};
use shared::packet;
use shared::socket::{self, Socket};
use shared::token;
use shared::{
    BandwidthBudget, ConnectionStats, NetworkSimulator, Packet, PacketIo, PacketType,
    SigningKey, SymmetricKey, Transport, TransportConfig, TransportError, VerifyingKey,
    DISCONNECT_REDUNDANT_PACKET_COUNT, KEEPALIVE_INTERVAL,
};
use thiserror::Error;

use crate::client_manager::{ClientHandle, ClientManager, ConnectedClient};
use crate::handshake::{EncryptionState, PendingHandshakes};
use crate::token_cache::{ConnectTokenCache, TokenUse};

/// Server settings. Build with [`ServerConfig::new`] and override fields as needed.
#[derive(Clone)]
pub struct ServerConfig {
    pub application_id: u64,
    pub max_clients: usize,
    /// Seconds of silence before a connected client is dropped.
    pub connection_timeout: f64,
    /// Seconds between keepalives on an otherwise idle connection.
    pub keepalive_interval: f64,
    /// Verifies connect token signatures.
    pub public_key: VerifyingKey,
    /// Opens connect token secret sections.
    pub secret_key: SigningKey,
    /// Per client. Zero means unlimited.
    pub max_incoming_bytes_per_second: usize,
    /// Per client. Zero means unlimited.
    pub max_outgoing_bytes_per_second: usize,
    pub event_queue_initial_capacity: usize,
    pub pending_capacity: usize,
    pub token_cache_capacity: usize,
    pub transport: TransportConfig,
}

impl ServerConfig {
    pub fn new(application_id: u64, public_key: VerifyingKey, secret_key: SigningKey) -> Self {
        let max_clients = 64;
        Self {
            application_id,
            max_clients,
            connection_timeout: 20.0,
            keepalive_interval: KEEPALIVE_INTERVAL,
            public_key,
            secret_key,
            max_incoming_bytes_per_second: 0,
            max_outgoing_bytes_per_second: 0,
            event_queue_initial_capacity: 256,
            pending_capacity: max_clients * 4,
            token_cache_capacity: max_clients * 4,
            transport: TransportConfig::default(),
        }
    }

    /// Sets `max_clients` and scales the pending and token cache capacities with it.
    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self.pending_capacity = max_clients.max(1) * 4;
        self.token_cache_capacity = max_clients.max(1) * 4;
        self
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("application_id", &self.application_id)
            .field("max_clients", &self.max_clients)
            .field("connection_timeout", &self.connection_timeout)
            .field("max_incoming_bytes_per_second", &self.max_incoming_bytes_per_second)
            .field("max_outgoing_bytes_per_second", &self.max_outgoing_bytes_per_second)
            .finish_non_exhaustive()
    }
}

/// Something the application should know about, drained with [`Server::poll_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    NewConnection {
        handle: ClientHandle,
        client_id: u64,
        endpoint: SocketAddr,
        /// The opaque user data from the client's connect token.
        user_data: Vec<u8>,
    },
    Disconnected {
        handle: ClientHandle,
    },
    /// A complete message, reliable messages in send order.
    PayloadPacket {
        handle: ClientHandle,
        data: Vec<u8>,
    },
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind server socket: {0}")]
    Bind(#[source] io::Error),
    #[error("server is not running")]
    NotRunning,
    #[error("no connected client for handle {0}")]
    InvalidHandle(ClientHandle),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct Server {
    config: ServerConfig,
    io: PacketIo,
    local_addr: SocketAddr,
    running: bool,
    time: f64,
    token_cache: ConnectTokenCache,
    pending: PendingHandshakes,
    clients: ClientManager,
    events: VecDeque<ServerEvent>,
}

impl Server {
    /// Binds a UDP socket at `addr` and starts accepting connections.
    pub fn start<A: ToSocketAddrs>(addr: A, config: ServerConfig) -> Result<Self, ServerError> {
        let socket = socket::bind_udp(addr).map_err(ServerError::Bind)?;
        Self::with_socket(Box::new(socket), config)
    }

    /// Starts on an already bound socket, such as a [`shared::MemorySocket`].
    pub fn with_socket(socket: Box<dyn Socket>, config: ServerConfig) -> Result<Self, ServerError> {
        let local_addr = socket.local_addr().map_err(ServerError::Bind)?;
        info!(
            "Server listening on {} (max {} clients, application {:#x})",
            local_addr, config.max_clients, config.application_id
        );

        Ok(Self {
            io: PacketIo::new(socket),
            local_addr,
            running: true,
            time: 0.0,
            token_cache: ConnectTokenCache::new(config.token_cache_capacity),
            pending: PendingHandshakes::new(config.pending_capacity),
            clients: ClientManager::new(config.max_clients),
            events: VecDeque::with_capacity(config.event_queue_initial_capacity),
            config,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Seconds of `update` time accumulated since start.
    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn max_clients(&self) -> usize {
        self.clients.max_clients()
    }

    pub fn is_client_connected(&self, handle: ClientHandle) -> bool {
        self.clients.is_connected(handle)
    }

    pub fn client_id(&self, handle: ClientHandle) -> Option<u64> {
        self.clients.get(handle).map(|client| client.client_id)
    }

    pub fn client_addr(&self, handle: ClientHandle) -> Option<SocketAddr> {
        self.clients.get(handle).map(|client| client.addr)
    }

    pub fn client_handles(&self) -> Vec<ClientHandle> {
        self.clients.handles()
    }

    pub fn connection_stats(&self, handle: ClientHandle) -> Option<ConnectionStats> {
        self.clients
            .get(handle)
            .map(|client| client.transport.ack().stats())
    }

    pub fn pending_handshake_count(&self) -> usize {
        self.pending.len()
    }

    /// Routes outgoing datagrams through a lossy, laggy link simulation.
    pub fn enable_network_simulator(
        &mut self,
        latency: f64,
        jitter: f64,
        drop_chance: f64,
        duplicate_chance: f64,
    ) {
        self.io.enable_simulator(NetworkSimulator::new(
            latency,
            jitter,
            drop_chance,
            duplicate_chance,
        ));
    }

    pub fn disable_network_simulator(&mut self) {
        self.io.disable_simulator();
    }

    /// Advances the server by `dt` seconds. `now` is the current unix time in
    /// seconds, used for connect token expiry.
    pub fn update(&mut self, dt: f64, now: u64) {
        if !self.running {
            return;
        }
        self.time += dt;
        self.io.update(dt);

        while let Some((from, datagram)) = self.io.recv() {
            self.process_datagram(from, &datagram, now);
        }

        for endpoint in self.pending.expire(self.time, now) {
            debug!("Handshake with {} timed out", endpoint);
        }

        for handle in self
            .clients
            .check_timeouts(self.time, self.config.connection_timeout)
        {
            info!("Client {} timed out", handle);
            self.remove_client(handle, false);
        }

        self.update_clients(dt);
    }

    pub fn poll_event(&mut self) -> Option<ServerEvent> {
        self.events.pop_front()
    }

    /// Queues `data` for one client and sends what the transport allows right away.
    pub fn send(&mut self, handle: ClientHandle, data: &[u8], reliable: bool) -> Result<(), ServerError> {
        if !self.running {
            return Err(ServerError::NotRunning);
        }
        let application_id = self.config.application_id;
        let time = self.time;
        let client = self
            .clients
            .get_mut(handle)
            .ok_or(ServerError::InvalidHandle(handle))?;
        client.transport.send(data, reliable)?;
        flush_transport(&mut self.io, application_id, time, client);
        Ok(())
    }

    /// Sends `data` to every connected client except `exclude`.
    ///
    /// Every client is attempted; the first failure is returned.
    pub fn broadcast(
        &mut self,
        data: &[u8],
        reliable: bool,
        exclude: Option<ClientHandle>,
    ) -> Result<(), ServerError> {
        if !self.running {
            return Err(ServerError::NotRunning);
        }
        let mut result = Ok(());
        for handle in self.clients.handles() {
            if Some(handle) == exclude {
                continue;
            }
            if let Err(e) = self.send(handle, data, reliable) {
                warn!("Broadcast to client {} failed: {}", handle, e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Drops a client. With `notify`, a burst of `Disconnect` packets goes out first.
    pub fn disconnect_client(&mut self, handle: ClientHandle, notify: bool) -> Result<(), ServerError> {
        if !self.running {
            return Err(ServerError::NotRunning);
        }
        if !self.clients.is_connected(handle) {
            return Err(ServerError::InvalidHandle(handle));
        }
        self.remove_client(handle, notify);
        Ok(())
    }

    /// Disconnects every client with notification and stops processing.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        for handle in self.clients.handles() {
            self.remove_client(handle, true);
        }
        self.pending.clear();
        self.token_cache.clear();
        self.running = false;
        info!("Server on {} stopped", self.local_addr);
    }

    fn process_datagram(&mut self, from: SocketAddr, datagram: &[u8], now: u64) {
        let packet_type = match packet::peek_type(datagram) {
            Ok(packet_type) => packet_type,
            Err(e) => {
                packet::log_rejected(from, &e);
                return;
            }
        };

        if packet_type == PacketType::ConnectionRequest {
            self.on_connection_request(from, datagram, now);
        } else if let Some(handle) = self.clients.find_client_by_addr(from) {
            self.on_client_packet(handle, datagram);
        } else if self.pending.contains(&from) {
            self.on_pending_packet(from, datagram);
        } else {
            trace!("Dropping {:?} packet from unknown endpoint {}", packet_type, from);
        }
    }

    fn on_connection_request(&mut self, from: SocketAddr, datagram: &[u8], now: u64) {
        if self.clients.find_client_by_addr(from).is_some() {
            trace!("Ignoring connection request from connected endpoint {}", from);
            return;
        }

        let token_packet = match packet::read_connection_request(datagram) {
            Ok(token_packet) => token_packet,
            Err(e) => {
                packet::log_rejected(from, &e);
                return;
            }
        };

        let token = match token::open_as_server(
            token_packet,
            &self.config.public_key,
            &self.config.secret_key,
            self.config.application_id,
            now,
        ) {
            Ok(token) => token,
            Err(e) => {
                debug!("Rejected connection request from {}: {}", from, e);
                return;
            }
        };

        if !token.endpoints.contains(&self.local_addr) {
            debug!(
                "Rejected connection request from {}: token does not list {}",
                from, self.local_addr
            );
            return;
        }

        match self.token_cache.observe(&token.signature, from) {
            TokenUse::First => {}
            TokenUse::Repeat => {
                if self.pending.contains(&from) {
                    self.send_challenge(from);
                } else {
                    trace!("Ignoring reused connect token from {}", from);
                }
                return;
            }
            TokenUse::Replay { original } => {
                debug!(
                    "Dropping connect token replayed from {} (first used by {})",
                    from, original
                );
                return;
            }
        }

        let client_id = token.client_id;
        if let Some(evicted) = self.pending.insert(from, EncryptionState::new(token, self.time)) {
            debug!("Pending handshake table full, dropped {}", evicted);
        }
        debug!("Challenging {} (client id {:#x})", from, client_id);
        self.send_challenge(from);
    }

    fn send_challenge(&mut self, to: SocketAddr) {
        let application_id = self.config.application_id;
        let Some(state) = self.pending.get_mut(&to) else {
            return;
        };
        state.last_packet_received = self.time;
        let challenge = Packet::ChallengeRequest {
            nonce: state.challenge_nonce,
            data: state.challenge_data.clone(),
        };
        let sequence = state.next_sequence();
        if send_packet(
            &mut self.io,
            to,
            &challenge,
            application_id,
            sequence,
            &state.server_to_client_key,
        ) {
            state.last_packet_sent = self.time;
        }
    }

    fn on_pending_packet(&mut self, from: SocketAddr, datagram: &[u8]) {
        let Some(state) = self.pending.get_mut(&from) else {
            return;
        };
        let decoded = packet::decode(
            datagram,
            self.config.application_id,
            &state.client_to_server_key,
            Some(&mut state.replay),
        );
        let packet = match decoded {
            Ok(packet) => packet,
            Err(e) => {
                packet::log_rejected(from, &e);
                return;
            }
        };
        state.last_packet_received = self.time;

        match packet {
            Packet::ChallengeResponse { nonce, data } => {
                if state.challenge_matches(nonce, &data) {
                    self.admit(from);
                } else {
                    debug!("Wrong challenge response from {}", from);
                }
            }
            Packet::Disconnect => {
                self.pending.remove(&from);
                debug!("Endpoint {} abandoned its handshake", from);
            }
            other => trace!(
                "Ignoring {:?} from {} during handshake",
                other.packet_type(),
                from
            ),
        }
    }

    /// Promotes the pending handshake for `from`, or denies it if the server is full.
    fn admit(&mut self, from: SocketAddr) {
        let Some(mut state) = self.pending.remove(&from) else {
            return;
        };

        if self.clients.is_full() {
            info!(
                "Denying {}: server is full ({} clients)",
                from,
                self.clients.max_clients()
            );
            let sequence = state.next_sequence();
            send_packet(
                &mut self.io,
                from,
                &Packet::ConnectionDenied,
                self.config.application_id,
                sequence,
                &state.server_to_client_key,
            );
            return;
        }

        let mut transport = Transport::new(self.config.transport.clone());
        transport.set_max_outgoing_bytes_per_second(self.config.max_outgoing_bytes_per_second);
        let client_id = state.client_id;
        let user_data = state.user_data.clone();
        let client = ConnectedClient::from_handshake(
            from,
            state,
            transport,
            BandwidthBudget::new(self.config.max_incoming_bytes_per_second),
            self.time,
        );

        let Some(handle) = self.clients.add_client(client) else {
            warn!("No slot available for {} despite free capacity", from);
            return;
        };
        self.events.push_back(ServerEvent::NewConnection {
            handle,
            client_id,
            endpoint: from,
            user_data,
        });
        self.send_accepted(handle);
    }

    fn send_accepted(&mut self, handle: ClientHandle) {
        let accepted = Packet::ConnectionAccepted {
            client_handle: handle.to_u64(),
            max_clients: self.clients.max_clients() as u32,
            connection_timeout: self.config.connection_timeout.ceil() as u32,
        };
        self.send_to_client(handle, &accepted);
    }

    fn send_to_client(&mut self, handle: ClientHandle, packet: &Packet) {
        let application_id = self.config.application_id;
        let Some(client) = self.clients.get_mut(handle) else {
            return;
        };
        let sequence = client.next_sequence();
        if send_packet(
            &mut self.io,
            client.addr,
            packet,
            application_id,
            sequence,
            &client.server_to_client_key,
        ) {
            client.last_packet_sent = self.time;
        }
    }

    fn on_client_packet(&mut self, handle: ClientHandle, datagram: &[u8]) {
        let Some(client) = self.clients.get_mut(handle) else {
            return;
        };
        let decoded = packet::decode(
            datagram,
            self.config.application_id,
            &client.client_to_server_key,
            Some(&mut client.replay),
        );
        let packet = match decoded {
            Ok(packet) => packet,
            Err(e) => {
                packet::log_rejected(client.addr, &e);
                return;
            }
        };
        client.last_packet_received = self.time;

        match packet {
            Packet::Payload { data } => {
                if !client.incoming_budget.try_consume(data.len()) {
                    trace!("Client {} is over its incoming budget, dropping payload", handle);
                    return;
                }
                if let Err(e) = client.transport.process_packet(&data) {
                    debug!("Dropping payload from client {}: {}", handle, e);
                }
                while let Some(data) = client.transport.receive_reliably_and_in_order() {
                    self.events.push_back(ServerEvent::PayloadPacket { handle, data });
                }
                while let Some(data) = client.transport.receive_fire_and_forget() {
                    self.events.push_back(ServerEvent::PayloadPacket { handle, data });
                }
            }
            Packet::Keepalive => {}
            Packet::ChallengeResponse { .. } => {
                trace!("Client {} repeated its challenge response, re-accepting", handle);
                self.send_accepted(handle);
            }
            Packet::Disconnect => {
                info!("Client {} sent disconnect", handle);
                self.remove_client(handle, false);
            }
            other => trace!(
                "Ignoring {:?} from client {}",
                other.packet_type(),
                handle
            ),
        }
    }

    fn remove_client(&mut self, handle: ClientHandle, notify: bool) {
        if notify {
            for _ in 0..DISCONNECT_REDUNDANT_PACKET_COUNT {
                self.send_to_client(handle, &Packet::Disconnect);
            }
        }
        if self.clients.remove_client(handle).is_some() {
            self.events.push_back(ServerEvent::Disconnected { handle });
        }
    }

    fn update_clients(&mut self, dt: f64) {
        let application_id = self.config.application_id;
        let keepalive_interval = self.config.keepalive_interval;
        let time = self.time;

        for (_, client) in self.clients.iter_mut() {
            client.incoming_budget.refill(dt);
            client.transport.update(dt);
            flush_transport(&mut self.io, application_id, time, client);

            if time - client.last_packet_sent >= keepalive_interval {
                let sequence = client.next_sequence();
                if send_packet(
                    &mut self.io,
                    client.addr,
                    &Packet::Keepalive,
                    application_id,
                    sequence,
                    &client.server_to_client_key,
                ) {
                    client.last_packet_sent = time;
                }
            }
        }
    }
}

/// Seals `packet` and hands it to the socket. Returns false if it could not be encoded.
fn send_packet(
    io: &mut PacketIo,
    to: SocketAddr,
    packet: &Packet,
    application_id: u64,
    sequence: u64,
    key: &SymmetricKey,
) -> bool {
    match io.send_packet(to, packet, application_id, sequence, key) {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to encode {:?} for {}: {}", packet.packet_type(), to, e);
            false
        }
    }
}

/// Drains a client's transport outbox into encrypted `Payload` packets.
fn flush_transport(io: &mut PacketIo, application_id: u64, time: f64, client: &mut ConnectedClient) {
    while let Some(data) = client.transport.pop_outgoing() {
        let sequence = client.next_sequence();
        if send_packet(
            io,
            client.addr,
            &Packet::Payload { data },
            application_id,
            sequence,
            &client.server_to_client_key,
        ) {
            client.last_packet_sent = time;
        }
    }
}
