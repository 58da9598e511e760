//! Lossy, laggy network simulation for outgoing datagrams.
//!
//! Installed on a client or server through `enable_network_simulator`. Each
//! outgoing datagram may be dropped, duplicated, and is held back for
//! `latency ± jitter` seconds before it reaches the real socket.

use std::cmp::Ordering;
use std::net::SocketAddr;

use log::trace;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug)]
struct DelayedDatagram {
    deliver_at: f64,
    addr: SocketAddr,
    data: Vec<u8>,
}

#[derive(Debug)]
pub struct NetworkSimulator {
    latency: f64,
    jitter: f64,
    drop_chance: f64,
    duplicate_chance: f64,
    time: f64,
    in_flight: Vec<DelayedDatagram>,
    rng: StdRng,
}

impl NetworkSimulator {
    /// Latency and jitter in seconds; chances in `0.0..=1.0`.
    pub fn new(latency: f64, jitter: f64, drop_chance: f64, duplicate_chance: f64) -> Self {
        Self::with_rng(latency, jitter, drop_chance, duplicate_chance, StdRng::from_entropy())
    }

    /// Reproducible simulator for tests.
    pub fn with_seed(latency: f64, jitter: f64, drop_chance: f64, duplicate_chance: f64, seed: u64) -> Self {
        Self::with_rng(latency, jitter, drop_chance, duplicate_chance, StdRng::seed_from_u64(seed))
    }

    fn with_rng(latency: f64, jitter: f64, drop_chance: f64, duplicate_chance: f64, rng: StdRng) -> Self {
        Self {
            latency: latency.max(0.0),
            jitter: jitter.abs(),
            drop_chance: drop_chance.clamp(0.0, 1.0),
            duplicate_chance: duplicate_chance.clamp(0.0, 1.0),
            time: 0.0,
            in_flight: Vec::new(),
            rng,
        }
    }

    fn delay(&mut self) -> f64 {
        let jitter = if self.jitter > 0.0 {
            self.rng.gen_range(-self.jitter..=self.jitter)
        } else {
            0.0
        };
        (self.latency + jitter).max(0.0)
    }

    pub fn send(&mut self, addr: SocketAddr, data: Vec<u8>) {
        if self.rng.gen_bool(self.drop_chance) {
            trace!("Simulator dropped {} bytes to {}", data.len(), addr);
            return;
        }

        if self.rng.gen_bool(self.duplicate_chance) {
            let deliver_at = self.time + self.delay();
            self.in_flight.push(DelayedDatagram {
                deliver_at,
                addr,
                data: data.clone(),
            });
        }

        let deliver_at = self.time + self.delay();
        self.in_flight.push(DelayedDatagram {
            deliver_at,
            addr,
            data,
        });
    }

    pub fn update(&mut self, dt: f64) {
        self.time += dt;
    }

    /// Removes and returns every datagram due by now, earliest first.
    pub fn drain_ready(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        let mut ready = Vec::new();
        let mut index = 0;
        while index < self.in_flight.len() {
            if self.in_flight[index].deliver_at <= self.time {
                ready.push(self.in_flight.swap_remove(index));
            } else {
                index += 1;
            }
        }
        ready.sort_by(|a, b| a.deliver_at.partial_cmp(&b.deliver_at).unwrap_or(Ordering::Equal));
        ready.into_iter().map(|d| (d.addr, d.data)).collect()
    }

    /// Datagrams still being held back.
    pub fn pending(&self) -> usize {
        self.in_flight.len()
    }
}
