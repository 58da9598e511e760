//! Client connection state machine
//!
//! A [`Client`] is handed a connect token by the game backend and walks through
//! the handshake with the servers the token lists:
//!
//! ```text
//! Disconnected -> SendingConnectionRequest -> SendingChallengeResponse -> Connected
//! ```
//!
//! Handshake packets are resent at `send_rate` until the server answers. If a
//! server denies the connection or stops answering, the next endpoint in the
//! token is tried; the client ends in a terminal error state only once every
//! endpoint has failed. A fresh [`Client::connect`] is needed to try again.
//!
//! Like the server, the client is driven entirely by [`Client::update`] and
//! never blocks.

use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

use log::{debug, info, trace, warn};
use shared::packet;
use shared::socket::{self, Socket};
use shared::token;
use shared::{
    BandwidthBudget, ConnectToken, ConnectionStats, NetworkSimulator, Packet, PacketIo,
    ReplayBuffer, TokenError, Transport, TransportConfig, TransportError,
    DISCONNECT_REDUNDANT_PACKET_COUNT, KEEPALIVE_INTERVAL,
};
use thiserror::Error;

use crate::network_stats::NetworkStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    TokenExpired,
    InvalidToken,
    ConnectionTimedOut,
    ChallengeResponseTimedOut,
    ConnectionRequestTimedOut,
    ConnectionDenied,
    Disconnected,
    SendingConnectionRequest,
    SendingChallengeResponse,
    Connected,
}

impl ClientState {
    /// True for the terminal failure states.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            ClientState::TokenExpired
                | ClientState::InvalidToken
                | ClientState::ConnectionTimedOut
                | ClientState::ChallengeResponseTimedOut
                | ClientState::ConnectionRequestTimedOut
                | ClientState::ConnectionDenied
        )
    }

    pub fn is_connecting(self) -> bool {
        matches!(
            self,
            ClientState::SendingConnectionRequest | ClientState::SendingChallengeResponse
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClientState::TokenExpired => "connect token expired",
            ClientState::InvalidToken => "invalid connect token",
            ClientState::ConnectionTimedOut => "connection timed out",
            ClientState::ChallengeResponseTimedOut => "challenge response timed out",
            ClientState::ConnectionRequestTimedOut => "connection request timed out",
            ClientState::ConnectionDenied => "connection denied",
            ClientState::Disconnected => "disconnected",
            ClientState::SendingConnectionRequest => "sending connection request",
            ClientState::SendingChallengeResponse => "sending challenge response",
            ClientState::Connected => "connected",
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub application_id: u64,
    pub bind_address: SocketAddr,
    /// Seconds of silence from the server before the connection is dropped.
    pub connection_timeout: f64,
    /// Handshake packets per second.
    pub send_rate: f64,
    pub keepalive_interval: f64,
    /// Zero means unlimited.
    pub max_incoming_bytes_per_second: usize,
    /// Zero means unlimited.
    pub max_outgoing_bytes_per_second: usize,
    pub transport: TransportConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            application_id: 0,
            bind_address: SocketAddr::from(([0, 0, 0, 0], 0)),
            connection_timeout: 20.0,
            send_rate: 10.0,
            keepalive_interval: KEEPALIVE_INTERVAL,
            max_incoming_bytes_per_second: 0,
            max_outgoing_bytes_per_second: 0,
            transport: TransportConfig::default(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("failed to bind client socket: {0}")]
    Bind(#[source] io::Error),
    #[error("connect token rejected: {0}")]
    Token(#[from] TokenError),
    #[error("client is not connected (state: {0})")]
    NotConnected(ClientState),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct Client {
    config: ClientConfig,
    io: PacketIo,
    state: ClientState,
    time: f64,

    token: Option<ConnectToken>,
    endpoint_index: usize,
    server_addr: Option<SocketAddr>,
    challenge: Option<(u64, Vec<u8>)>,
    client_handle: Option<u64>,
    server_max_clients: Option<u32>,

    sequence: u64,
    replay: ReplayBuffer,
    transport: Transport,
    incoming_budget: BandwidthBudget,
    last_packet_sent: f64,
    last_packet_received: f64,
    stats: NetworkStats,
}

impl Client {
    /// Binds a UDP socket at `config.bind_address`.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let socket = socket::bind_udp(config.bind_address).map_err(ClientError::Bind)?;
        Ok(Self::with_socket(Box::new(socket), config))
    }

    /// Binds a UDP socket at `addr`, overriding `config.bind_address`.
    pub fn bind<A: ToSocketAddrs>(addr: A, config: ClientConfig) -> Result<Self, ClientError> {
        let socket = socket::bind_udp(addr).map_err(ClientError::Bind)?;
        Ok(Self::with_socket(Box::new(socket), config))
    }

    /// Uses an already bound socket, such as a [`shared::MemorySocket`].
    pub fn with_socket(socket: Box<dyn Socket>, config: ClientConfig) -> Self {
        let mut transport = Transport::new(config.transport.clone());
        transport.set_max_outgoing_bytes_per_second(config.max_outgoing_bytes_per_second);
        Self {
            io: PacketIo::new(socket),
            state: ClientState::Disconnected,
            time: 0.0,
            token: None,
            endpoint_index: 0,
            server_addr: None,
            challenge: None,
            client_handle: None,
            server_max_clients: None,
            sequence: 0,
            replay: ReplayBuffer::default(),
            transport,
            incoming_budget: BandwidthBudget::new(config.max_incoming_bytes_per_second),
            last_packet_sent: f64::NEG_INFINITY,
            last_packet_received: 0.0,
            stats: NetworkStats::new(),
            config,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    /// The handle the server assigned in `ConnectionAccepted`.
    pub fn client_handle(&self) -> Option<u64> {
        self.client_handle
    }

    pub fn server_max_clients(&self) -> Option<u32> {
        self.server_max_clients
    }

    /// The server currently being connected to, or connected.
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server_addr
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.io.local_addr()
    }

    /// Client time, in seconds of `update`, when the server was last heard from.
    pub fn time_of_last_packet_received(&self) -> f64 {
        self.last_packet_received
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        self.transport.ack().stats()
    }

    /// Sampled history of [`connection_stats`](Self::connection_stats) while connected.
    pub fn network_stats(&self) -> &NetworkStats {
        &self.stats
    }

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

    /// Starts connecting with `token`, a full connect token from the backend.
    ///
    /// Only the token's format, application id and expiry are checked here. On
    /// failure the client enters `InvalidToken` or `TokenExpired`
    /// and the error is returned as well.
    pub fn connect(&mut self, token: &[u8], now: u64) -> Result<(), ClientError> {
        if self.state == ClientState::Connected || self.state.is_connecting() {
            self.disconnect();
        }

        let token = match token::open_as_client(token, self.config.application_id, now) {
            Ok(token) => token,
            Err(e) => {
                let failure = if e == TokenError::TokenExpired {
                    ClientState::TokenExpired
                } else {
                    ClientState::InvalidToken
                };
                self.reset_connection();
                self.set_state(failure);
                return Err(e.into());
            }
        };

        info!(
            "Connecting with token for {} endpoint(s), expires at {}",
            token.endpoints.len(),
            token.expiration_time
        );
        // The client-to-server key lives as long as the token, so the packet
        // sequence only restarts here, never when falling back to another endpoint.
        self.sequence = 0;
        self.token = Some(token);
        self.connect_to_endpoint(0);
        Ok(())
    }

    /// Advances the client by `dt` seconds. `now` is the current unix time in
    /// seconds, used for connect token expiry.
    pub fn update(&mut self, dt: f64, now: u64) {
        self.time += dt;
        self.io.update(dt);

        while let Some((from, datagram)) = self.io.recv() {
            if Some(from) != self.server_addr {
                trace!("Dropping datagram from unexpected endpoint {}", from);
                continue;
            }
            self.process_packet(from, &datagram);
        }

        match self.state {
            ClientState::SendingConnectionRequest | ClientState::SendingChallengeResponse => {
                self.update_handshake(now);
            }
            ClientState::Connected => self.update_connected(dt),
            _ => {}
        }
    }

    /// Queues `data` for the server and sends what the transport allows right away.
    pub fn send(&mut self, data: &[u8], reliable: bool) -> Result<(), ClientError> {
        if self.state != ClientState::Connected {
            return Err(ClientError::NotConnected(self.state));
        }
        self.transport.send(data, reliable)?;
        self.flush_transport();
        Ok(())
    }

    /// Next complete message from the server; reliable messages come first.
    pub fn pop_packet(&mut self) -> Option<Vec<u8>> {
        self.transport
            .receive_reliably_and_in_order()
            .or_else(|| self.transport.receive_fire_and_forget())
    }

    /// Sends a burst of `Disconnect` packets and drops the connection at once.
    pub fn disconnect(&mut self) {
        let notify = matches!(
            self.state,
            ClientState::Connected | ClientState::SendingChallengeResponse
        );
        if notify {
            for _ in 0..DISCONNECT_REDUNDANT_PACKET_COUNT {
                self.send_packet(&Packet::Disconnect);
            }
            self.io.update(0.0);
            info!("Disconnected from {:?}", self.server_addr);
        }
        self.reset_connection();
        self.set_state(ClientState::Disconnected);
    }

    fn connect_to_endpoint(&mut self, index: usize) {
        let Some(endpoint) = self
            .token
            .as_ref()
            .and_then(|token| token.endpoints.get(index).copied())
        else {
            self.set_state(ClientState::InvalidToken);
            return;
        };

        self.reset_connection();
        self.endpoint_index = index;
        self.server_addr = Some(endpoint);
        self.last_packet_received = self.time;
        info!("Sending connection requests to {}", endpoint);
        self.set_state(ClientState::SendingConnectionRequest);
        self.send_handshake_packet();
    }

    /// Moves on to the token's next endpoint, or settles in `failure`.
    fn next_endpoint_or(&mut self, failure: ClientState) {
        let endpoint_count = self.token.as_ref().map_or(0, |token| token.endpoints.len());
        if self.endpoint_index + 1 < endpoint_count {
            debug!(
                "{} on {:?}, trying next endpoint",
                failure, self.server_addr
            );
            self.connect_to_endpoint(self.endpoint_index + 1);
        } else {
            info!("Connection failed: {}", failure);
            self.reset_connection();
            self.set_state(failure);
        }
    }

    fn reset_connection(&mut self) {
        self.server_addr = None;
        self.challenge = None;
        self.client_handle = None;
        self.server_max_clients = None;
        self.replay.reset();
        self.transport.reset();
        self.incoming_budget = BandwidthBudget::new(self.config.max_incoming_bytes_per_second);
        self.last_packet_sent = f64::NEG_INFINITY;
        self.stats.clear();
    }

    fn set_state(&mut self, state: ClientState) {
        if self.state != state {
            debug!("Client state: {} -> {}", self.state, state);
            self.state = state;
        }
    }

    fn update_handshake(&mut self, now: u64) {
        let Some((expiration_time, handshake_timeout)) = self
            .token
            .as_ref()
            .map(|token| (token.expiration_time, token.handshake_timeout as f64))
        else {
            self.set_state(ClientState::InvalidToken);
            return;
        };

        if now > expiration_time {
            info!("Connect token expired during handshake");
            self.reset_connection();
            self.set_state(ClientState::TokenExpired);
            return;
        }

        if self.time - self.last_packet_received > handshake_timeout {
            let failure = if self.state == ClientState::SendingConnectionRequest {
                ClientState::ConnectionRequestTimedOut
            } else {
                ClientState::ChallengeResponseTimedOut
            };
            self.next_endpoint_or(failure);
            return;
        }

        if self.time - self.last_packet_sent >= 1.0 / self.config.send_rate.max(f64::EPSILON) {
            self.send_handshake_packet();
        }
    }

    fn update_connected(&mut self, dt: f64) {
        if self.time - self.last_packet_received > self.config.connection_timeout {
            info!("Connection to {:?} timed out", self.server_addr);
            self.reset_connection();
            self.set_state(ClientState::ConnectionTimedOut);
            return;
        }

        self.incoming_budget.refill(dt);
        self.transport.update(dt);
        self.flush_transport();
        self.stats.record(self.time, self.transport.ack().stats());

        if self.time - self.last_packet_sent >= self.config.keepalive_interval {
            self.send_packet(&Packet::Keepalive);
        }
    }

    fn send_handshake_packet(&mut self) {
        match self.state {
            ClientState::SendingConnectionRequest => {
                let (Some(addr), Some(token)) = (self.server_addr, self.token.as_ref()) else {
                    return;
                };
                match packet::encode_connection_request(&token.packet) {
                    Ok(bytes) => {
                        self.io.send(addr, bytes);
                        self.last_packet_sent = self.time;
                    }
                    Err(e) => warn!("Failed to encode connection request: {}", e),
                }
            }
            ClientState::SendingChallengeResponse => {
                let Some((nonce, data)) = self.challenge.clone() else {
                    return;
                };
                self.send_packet(&Packet::ChallengeResponse { nonce, data });
            }
            _ => {}
        }
    }

    /// Seals and sends one packet to the current server.
    fn send_packet(&mut self, packet: &Packet) {
        let (Some(addr), Some(token)) = (self.server_addr, self.token.as_ref()) else {
            return;
        };
        let sequence = self.sequence;
        match self.io.send_packet(
            addr,
            packet,
            self.config.application_id,
            sequence,
            &token.client_to_server_key,
        ) {
            Ok(()) => {
                self.sequence += 1;
                self.last_packet_sent = self.time;
            }
            Err(e) => warn!("Failed to encode {:?}: {}", packet.packet_type(), e),
        }
    }

    fn flush_transport(&mut self) {
        while let Some(data) = self.transport.pop_outgoing() {
            self.send_packet(&Packet::Payload { data });
        }
    }

    fn process_packet(&mut self, from: SocketAddr, datagram: &[u8]) {
        if !(self.state == ClientState::Connected || self.state.is_connecting()) {
            return;
        }
        let Some(token) = self.token.as_ref() else {
            return;
        };

        let packet = match packet::decode(
            datagram,
            self.config.application_id,
            &token.server_to_client_key,
            Some(&mut self.replay),
        ) {
            Ok(packet) => packet,
            Err(e) => {
                packet::log_rejected(from, &e);
                return;
            }
        };
        self.last_packet_received = self.time;

        match (self.state, packet) {
            (ClientState::SendingConnectionRequest, Packet::ChallengeRequest { nonce, data }) => {
                debug!("Received challenge from {}", from);
                self.challenge = Some((nonce, data));
                self.set_state(ClientState::SendingChallengeResponse);
                self.send_handshake_packet();
            }
            (state, Packet::ConnectionDenied) if state.is_connecting() => {
                info!("Server {} denied the connection", from);
                self.next_endpoint_or(ClientState::ConnectionDenied);
            }
            (
                ClientState::SendingChallengeResponse,
                Packet::ConnectionAccepted {
                    client_handle,
                    max_clients,
                    ..
                },
            ) => {
                info!("Connected to {} as client {:#x}", from, client_handle);
                self.client_handle = Some(client_handle);
                self.server_max_clients = Some(max_clients);
                self.set_state(ClientState::Connected);
            }
            (ClientState::Connected, Packet::Payload { data }) => {
                if !self.incoming_budget.try_consume(data.len()) {
                    trace!("Over incoming budget, dropping payload");
                    return;
                }
                if let Err(e) = self.transport.process_packet(&data) {
                    debug!("Dropping payload from {}: {}", from, e);
                }
            }
            (ClientState::Connected, Packet::Disconnect) => {
                info!("Server {} closed the connection", from);
                self.reset_connection();
                self.set_state(ClientState::Disconnected);
            }
            (_, other) => trace!("Ignoring {:?} in state {}", other.packet_type(), self.state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::crypto::{self, SymmetricKey};
    use shared::token::{ConnectTokenParams, USER_DATA_BYTES};
    use shared::MemoryNetwork;

    const APP_ID: u64 = 99;
    const NOW: u64 = 1_700_000_000;

    fn server_addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 1, 1, 1], port))
    }

    fn make_token(endpoints: &[SocketAddr], expires_in: u64) -> (Vec<u8>, SymmetricKey, SymmetricKey) {
        let signing_key = crypto::development_keys(3);
        let c2s = SymmetricKey::generate();
        let s2c = SymmetricKey::generate();
        let user_data = [0u8; USER_DATA_BYTES];
        let token = token::create(
            &ConnectTokenParams {
                application_id: APP_ID,
                creation_time: NOW,
                expiration_time: NOW + expires_in,
                handshake_timeout: 2,
                endpoints,
                client_id: 5,
                client_to_server_key: &c2s,
                server_to_client_key: &s2c,
                user_data: Some(&user_data[..]),
            },
            &signing_key,
        )
        .unwrap();
        (token, c2s, s2c)
    }

    fn test_client(network: &MemoryNetwork) -> Client {
        let config = ClientConfig {
            application_id: APP_ID,
            ..ClientConfig::default()
        };
        let socket = network.bind(SocketAddr::from(([10, 2, 2, 2], 0))).unwrap();
        Client::with_socket(Box::new(socket), config)
    }

    /// Hand-driven server side of a handshake.
    struct FakeServer {
        io: PacketIo,
        s2c: SymmetricKey,
        c2s: SymmetricKey,
        sequence: u64,
    }

    impl FakeServer {
        fn send(&mut self, to: SocketAddr, packet: Packet) {
            let sequence = self.sequence;
            self.sequence += 1;
            self.io.send_packet(to, &packet, APP_ID, sequence, &self.s2c).unwrap();
        }

        fn recv_types(&mut self) -> Vec<(SocketAddr, Packet)> {
            let mut packets = Vec::new();
            while let Some((from, bytes)) = self.io.recv() {
                if let Ok(packet) = packet::decode(&bytes, APP_ID, &self.c2s, None) {
                    packets.push((from, packet));
                }
            }
            packets
        }

        /// Sealed packets received, with the sequence each was sealed under.
        fn recv_sealed(&mut self) -> Vec<(u64, Packet)> {
            let mut packets = Vec::new();
            while let Some((_, bytes)) = self.io.recv() {
                if packet::peek_type(&bytes) == Ok(shared::PacketType::ConnectionRequest) {
                    continue;
                }
                let mut sequence = [0u8; 8];
                sequence.copy_from_slice(&bytes[1..9]);
                if let Ok(packet) = packet::decode(&bytes, APP_ID, &self.c2s, None) {
                    packets.push((u64::from_le_bytes(sequence), packet));
                }
            }
            packets
        }
    }

    fn challenge_response_sequences(packets: &[(u64, Packet)]) -> Vec<u64> {
        packets
            .iter()
            .filter(|(_, packet)| matches!(packet, Packet::ChallengeResponse { .. }))
            .map(|(sequence, _)| *sequence)
            .collect()
    }

    #[test]
    fn test_state_strings() {
        assert_eq!(ClientState::Connected.to_string(), "connected");
        assert!(ClientState::ConnectionDenied.is_error());
        assert!(!ClientState::Disconnected.is_error());
        assert!(ClientState::SendingChallengeResponse.is_connecting());
    }

    #[test]
    fn test_invalid_and_expired_tokens() {
        let network = MemoryNetwork::new();
        let mut client = test_client(&network);

        assert!(matches!(
            client.connect(&[0u8; 10], NOW),
            Err(ClientError::Token(TokenError::InvalidFormat))
        ));
        assert_eq!(client.state(), ClientState::InvalidToken);

        let (token, _, _) = make_token(&[server_addr(1)], 10);
        assert!(client.connect(&token, NOW + 11).is_err());
        assert_eq!(client.state(), ClientState::TokenExpired);
    }

    #[test]
    fn test_send_requires_connection() {
        let network = MemoryNetwork::new();
        let mut client = test_client(&network);
        assert!(matches!(
            client.send(b"hi", true),
            Err(ClientError::NotConnected(ClientState::Disconnected))
        ));
    }

    #[test]
    fn test_connection_requests_are_resent() {
        let network = MemoryNetwork::new();
        let server_socket = network.bind(server_addr(1)).unwrap();
        let mut client = test_client(&network);
        let (token, _, _) = make_token(&[server_addr(1)], 30);

        client.connect(&token, NOW).unwrap();
        assert_eq!(client.state(), ClientState::SendingConnectionRequest);
        client.update(0.05, NOW);
        assert_eq!(network.pending(server_addr(1)), 1);
        for _ in 0..5 {
            client.update(0.11, NOW);
        }
        assert_eq!(network.pending(server_addr(1)), 6);
        drop(server_socket);
    }

    #[test]
    fn test_handshake_with_fake_server() {
        let network = MemoryNetwork::new();
        let (token, c2s, s2c) = make_token(&[server_addr(1)], 30);
        let mut server = FakeServer {
            io: PacketIo::new(Box::new(network.bind(server_addr(1)).unwrap())),
            s2c,
            c2s,
            sequence: 0,
        };
        let mut client = test_client(&network);
        let client_addr = client.local_addr().unwrap();

        client.connect(&token, NOW).unwrap();
        server.send(
            client_addr,
            Packet::ChallengeRequest {
                nonce: 11,
                data: vec![3u8; shared::CHALLENGE_DATA_BYTES],
            },
        );
        client.update(0.01, NOW);
        assert_eq!(client.state(), ClientState::SendingChallengeResponse);
        assert!(server.recv_types().iter().any(|(_, p)| matches!(
            p,
            Packet::ChallengeResponse { nonce: 11, .. }
        )));

        server.send(
            client_addr,
            Packet::ConnectionAccepted {
                client_handle: 0x1_0000_0002,
                max_clients: 8,
                connection_timeout: 10,
            },
        );
        client.update(0.01, NOW);
        assert_eq!(client.state(), ClientState::Connected);
        assert_eq!(client.client_handle(), Some(0x1_0000_0002));
        assert_eq!(client.server_max_clients(), Some(8));

        client.disconnect();
        assert_eq!(client.state(), ClientState::Disconnected);
        let disconnects = server
            .recv_types()
            .into_iter()
            .filter(|(_, p)| *p == Packet::Disconnect)
            .count();
        assert_eq!(disconnects, DISCONNECT_REDUNDANT_PACKET_COUNT);
    }

    #[test]
    fn test_timeout_falls_back_to_next_endpoint() {
        let network = MemoryNetwork::new();
        let mut client = test_client(&network);
        let (token, _, _) = make_token(&[server_addr(1), server_addr(2)], 60);

        client.connect(&token, NOW).unwrap();
        assert_eq!(client.server_addr(), Some(server_addr(1)));

        for _ in 0..25 {
            client.update(0.1, NOW);
        }
        assert_eq!(client.server_addr(), Some(server_addr(2)));
        assert_eq!(client.state(), ClientState::SendingConnectionRequest);

        for _ in 0..25 {
            client.update(0.1, NOW);
        }
        assert_eq!(client.state(), ClientState::ConnectionRequestTimedOut);
    }

    #[test]
    fn test_denial_falls_back_then_fails() {
        let network = MemoryNetwork::new();
        let (token, c2s, s2c) = make_token(&[server_addr(1)], 30);
        let mut server = FakeServer {
            io: PacketIo::new(Box::new(network.bind(server_addr(1)).unwrap())),
            s2c,
            c2s,
            sequence: 0,
        };
        let mut client = test_client(&network);
        let client_addr = client.local_addr().unwrap();

        client.connect(&token, NOW).unwrap();
        server.send(client_addr, Packet::ConnectionDenied);
        client.update(0.01, NOW);
        assert_eq!(client.state(), ClientState::ConnectionDenied);
        assert!(client.state().is_error());
    }

    #[test]
    fn test_sequence_keeps_rising_across_endpoint_fallback() {
        let network = MemoryNetwork::new();
        let (token, c2s, s2c) = make_token(&[server_addr(1), server_addr(2)], 30);
        let mut first = FakeServer {
            io: PacketIo::new(Box::new(network.bind(server_addr(1)).unwrap())),
            s2c: s2c.clone(),
            c2s: c2s.clone(),
            sequence: 0,
        };
        let mut second = FakeServer {
            io: PacketIo::new(Box::new(network.bind(server_addr(2)).unwrap())),
            s2c,
            c2s,
            sequence: 0,
        };
        let mut client = test_client(&network);
        let client_addr = client.local_addr().unwrap();
        let challenge = |nonce| Packet::ChallengeRequest {
            nonce,
            data: vec![nonce as u8; shared::CHALLENGE_DATA_BYTES],
        };

        client.connect(&token, NOW).unwrap();
        first.send(client_addr, challenge(1));
        client.update(0.01, NOW);
        let first_sequences = challenge_response_sequences(&first.recv_sealed());
        assert_eq!(first_sequences.len(), 1);

        first.send(client_addr, Packet::ConnectionDenied);
        client.update(0.01, NOW);
        assert_eq!(client.server_addr(), Some(server_addr(2)));
        assert_eq!(client.state(), ClientState::SendingConnectionRequest);

        second.send(client_addr, challenge(2));
        client.update(0.01, NOW);
        assert_eq!(client.state(), ClientState::SendingChallengeResponse);
        let second_sequences = challenge_response_sequences(&second.recv_sealed());
        assert_eq!(second_sequences.len(), 1);
        assert!(second_sequences[0] > first_sequences[0]);
    }

    #[test]
    fn test_new_token_restarts_sequence() {
        let network = MemoryNetwork::new();
        let (token, c2s, s2c) = make_token(&[server_addr(1)], 30);
        let mut server = FakeServer {
            io: PacketIo::new(Box::new(network.bind(server_addr(1)).unwrap())),
            s2c,
            c2s,
            sequence: 0,
        };
        let mut client = test_client(&network);
        let client_addr = client.local_addr().unwrap();

        client.connect(&token, NOW).unwrap();
        server.send(
            client_addr,
            Packet::ChallengeRequest {
                nonce: 4,
                data: vec![0u8; shared::CHALLENGE_DATA_BYTES],
            },
        );
        client.update(0.01, NOW);
        client.disconnect();
        assert!(!server.recv_sealed().is_empty());

        let (fresh, c2s, s2c) = make_token(&[server_addr(1)], 30);
        server.c2s = c2s;
        server.s2c = s2c;
        server.sequence = 0;
        client.connect(&fresh, NOW).unwrap();
        server.send(
            client_addr,
            Packet::ChallengeRequest {
                nonce: 5,
                data: vec![0u8; shared::CHALLENGE_DATA_BYTES],
            },
        );
        client.update(0.01, NOW);
        assert_eq!(challenge_response_sequences(&server.recv_sealed()), vec![0]);
    }

    #[test]
    fn test_token_expiry_during_handshake() {
        let network = MemoryNetwork::new();
        let mut client = test_client(&network);
        let (token, _, _) = make_token(&[server_addr(1)], 5);

        client.connect(&token, NOW).unwrap();
        client.update(0.1, NOW + 6);
        assert_eq!(client.state(), ClientState::TokenExpired);
    }
}
