//! # Datagram Sockets
//!
//! The protocol only needs "send these bytes to that address" and "is there a
//! datagram waiting". [`Socket`] captures exactly that, implemented for a
//! non-blocking [`UdpSocket`] and for [`MemorySocket`], an in-process network
//! used by tests.
//!
//! [`PacketIo`] wraps a boxed socket together with an optional
//! [`NetworkSimulator`] and is what the client and server actually own.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::rc::Rc;

use log::{debug, trace};

use crate::crypto::SymmetricKey;
use crate::error::PacketError;
use crate::packet::{self, Packet};
use crate::simulator::NetworkSimulator;
use crate::PACKET_SIZE_MAX;

pub trait Socket {
    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Returns `Ok(None)` when no datagram is waiting. Never blocks.
    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Binds a UDP socket and switches it to non-blocking mode.
pub fn bind_udp<A: ToSocketAddrs>(addr: A) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind(addr)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

impl Socket for UdpSocket {
    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, data, addr)
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match UdpSocket::recv_from(self, buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            // ICMP port unreachable from an earlier send surfaces here on some platforms.
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

type Datagram = (SocketAddr, Vec<u8>);

#[derive(Default)]
struct MemoryNetworkState {
    queues: HashMap<SocketAddr, VecDeque<Datagram>>,
    next_port: u16,
}

/// An in-process datagram network. Clones share the same network.
///
/// Datagrams are delivered instantly and in order; sending to an address with no
/// bound socket silently drops the datagram, like UDP.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Rc<RefCell<MemoryNetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `addr` on this network. Port 0 picks a free port.
    pub fn bind(&self, addr: SocketAddr) -> io::Result<MemorySocket> {
        let mut state = self.state.borrow_mut();
        let mut addr = addr;
        if addr.port() == 0 {
            loop {
                let port = 40000u16.wrapping_add(state.next_port);
                state.next_port = state.next_port.wrapping_add(1);
                addr.set_port(port);
                if port != 0 && !state.queues.contains_key(&addr) {
                    break;
                }
            }
        }

        if state.queues.contains_key(&addr) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{} is already bound", addr),
            ));
        }
        state.queues.insert(addr, VecDeque::new());
        Ok(MemorySocket {
            addr,
            network: self.clone(),
        })
    }

    /// Datagrams waiting to be read at `addr`.
    pub fn pending(&self, addr: SocketAddr) -> usize {
        self.state
            .borrow()
            .queues
            .get(&addr)
            .map_or(0, VecDeque::len)
    }
}

pub struct MemorySocket {
    addr: SocketAddr,
    network: MemoryNetwork,
}

impl Socket for MemorySocket {
    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        let mut state = self.network.state.borrow_mut();
        if let Some(queue) = state.queues.get_mut(&addr) {
            queue.push_back((self.addr, data.to_vec()));
        }
        Ok(data.len())
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let mut state = self.network.state.borrow_mut();
        let Some((from, data)) = state.queues.get_mut(&self.addr).and_then(VecDeque::pop_front) else {
            return Ok(None);
        };
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(Some((len, from)))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

impl Drop for MemorySocket {
    fn drop(&mut self) {
        self.network.state.borrow_mut().queues.remove(&self.addr);
    }
}

/// A socket plus an optional simulator, with byte counters.
pub struct PacketIo {
    socket: Box<dyn Socket>,
    simulator: Option<NetworkSimulator>,
    buffer: Vec<u8>,
    bytes_sent: u64,
    bytes_received: u64,
}

impl PacketIo {
    pub fn new(socket: Box<dyn Socket>) -> Self {
        Self {
            socket,
            simulator: None,
            buffer: vec![0u8; PACKET_SIZE_MAX],
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Routes all future sends through `simulator`.
    pub fn enable_simulator(&mut self, simulator: NetworkSimulator) {
        self.simulator = Some(simulator);
    }

    pub fn disable_simulator(&mut self) {
        self.simulator = None;
    }

    /// Sends now, or hands the datagram to the simulator if one is enabled.
    pub fn send(&mut self, addr: SocketAddr, data: Vec<u8>) {
        if let Some(simulator) = self.simulator.as_mut() {
            simulator.send(addr, data);
            return;
        }
        match self.socket.send_to(&data, addr) {
            Ok(_) => self.bytes_sent += data.len() as u64,
            Err(e) => debug!("Failed to send {} bytes to {}: {}", data.len(), addr, e),
        }
    }

    /// Seals `packet` with `key` under `sequence` and sends it to `addr`.
    pub fn send_packet(
        &mut self,
        addr: SocketAddr,
        packet: &Packet,
        application_id: u64,
        sequence: u64,
        key: &SymmetricKey,
    ) -> Result<(), PacketError> {
        let bytes = packet::encode(packet, application_id, sequence, key)?;
        self.send(addr, bytes);
        Ok(())
    }

    /// Next waiting datagram, if any.
    pub fn recv(&mut self) -> Option<(SocketAddr, Vec<u8>)> {
        match self.socket.recv_from(&mut self.buffer) {
            Ok(Some((len, addr))) => {
                self.bytes_received += len as u64;
                Some((addr, self.buffer[..len].to_vec()))
            }
            Ok(None) => None,
            Err(e) => {
                debug!("Socket receive error: {}", e);
                None
            }
        }
    }

    /// Advances the simulator and flushes datagrams whose delay has elapsed.
    pub fn update(&mut self, dt: f64) {
        let Some(simulator) = self.simulator.as_mut() else {
            return;
        };
        simulator.update(dt);
        for (addr, data) in simulator.drain_ready() {
            match self.socket.send_to(&data, addr) {
                Ok(_) => self.bytes_sent += data.len() as u64,
                Err(e) => trace!("Simulated send to {} failed: {}", addr, e),
            }
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_memory_network_delivers_in_order() {
        let network = MemoryNetwork::new();
        let mut a = network.bind(addr(1000)).unwrap();
        let mut b = network.bind(addr(2000)).unwrap();

        a.send_to(b"one", addr(2000)).unwrap();
        a.send_to(b"two", addr(2000)).unwrap();
        assert_eq!(network.pending(addr(2000)), 2);

        let mut buf = [0u8; 64];
        assert_eq!(b.recv_from(&mut buf).unwrap(), Some((3, addr(1000))));
        assert_eq!(&buf[..3], b"one");
        assert_eq!(b.recv_from(&mut buf).unwrap(), Some((3, addr(1000))));
        assert_eq!(&buf[..3], b"two");
        assert_eq!(b.recv_from(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_memory_network_drops_unbound_destinations() {
        let network = MemoryNetwork::new();
        let mut a = network.bind(addr(1000)).unwrap();
        assert_eq!(a.send_to(b"void", addr(9999)).unwrap(), 4);
        assert_eq!(network.pending(addr(9999)), 0);
    }

    #[test]
    fn test_memory_bind_conflicts_and_release() {
        let network = MemoryNetwork::new();
        let first = network.bind(addr(1000)).unwrap();
        let err = network.bind(addr(1000)).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);

        drop(first);
        assert!(network.bind(addr(1000)).is_ok());
    }

    #[test]
    fn test_memory_bind_ephemeral_port() {
        let network = MemoryNetwork::new();
        let a = network.bind(addr(0)).unwrap();
        let b = network.bind(addr(0)).unwrap();
        assert_ne!(a.local_addr().unwrap().port(), 0);
        assert_ne!(a.local_addr().unwrap(), b.local_addr().unwrap());
    }

    #[test]
    fn test_packet_io_counts_bytes() {
        let network = MemoryNetwork::new();
        let mut a = PacketIo::new(Box::new(network.bind(addr(1000)).unwrap()));
        let mut b = PacketIo::new(Box::new(network.bind(addr(2000)).unwrap()));

        a.send(addr(2000), vec![7u8; 100]);
        assert_eq!(b.recv(), Some((addr(1000), vec![7u8; 100])));
        assert_eq!(b.recv(), None);
        assert_eq!(a.bytes_sent(), 100);
        assert_eq!(b.bytes_received(), 100);
    }

    #[test]
    fn test_packet_io_sends_sealed_packets() {
        let network = MemoryNetwork::new();
        let mut a = PacketIo::new(Box::new(network.bind(addr(1000)).unwrap()));
        let mut b = PacketIo::new(Box::new(network.bind(addr(2000)).unwrap()));
        let key = SymmetricKey::generate();

        a.send_packet(addr(2000), &Packet::Keepalive, 5, 3, &key).unwrap();
        let (from, bytes) = b.recv().unwrap();
        assert_eq!(from, addr(1000));
        assert_eq!(packet::decode(&bytes, 5, &key, None), Ok(Packet::Keepalive));
    }

    #[test]
    fn test_packet_io_simulated_latency() {
        let network = MemoryNetwork::new();
        let mut a = PacketIo::new(Box::new(network.bind(addr(1000)).unwrap()));
        let mut b = PacketIo::new(Box::new(network.bind(addr(2000)).unwrap()));
        a.enable_simulator(NetworkSimulator::with_seed(0.1, 0.0, 0.0, 0.0, 1));

        a.send(addr(2000), b"late".to_vec());
        a.update(0.05);
        assert_eq!(b.recv(), None);
        a.update(0.06);
        assert_eq!(b.recv(), Some((addr(1000), b"late".to_vec())));
    }

    #[test]
    fn test_udp_socket_is_nonblocking() {
        let mut socket = bind_udp("127.0.0.1:0").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(Socket::recv_from(&mut socket, &mut buf).unwrap(), None);

        let target = Socket::local_addr(&socket).unwrap();
        Socket::send_to(&mut socket, b"loop", target).unwrap();
        let mut received = None;
        for _ in 0..100 {
            if let Some(datagram) = Socket::recv_from(&mut socket, &mut buf).unwrap() {
                received = Some(datagram);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(received, Some((4, target)));
    }
}
