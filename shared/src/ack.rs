//! # Ack Engine
//!
//! Per-connection bookkeeping for an unreliable datagram stream. Every outgoing
//! packet is prefixed with an 8-byte header:
//!
//! ```text
//! [sequence: u16][ack: u16][ack_bits: u32]
//! ```
//!
//! `sequence` numbers this packet. `ack` is the newest sequence received from the
//! peer and bit `i` of `ack_bits` reports whether `ack - i` arrived too, so every
//! packet acknowledges up to 33 of the peer's packets and a lost ack is covered by
//! the next one.
//!
//! Acked packets feed a smoothed round-trip time. Packets that are still unacked
//! after a grace period, or that get pushed out of the sent window, count as lost.
//! Sent, received and acked bandwidth are measured over short windows and
//! smoothed the same way. All averages are exponential moving averages seeded by
//! their first sample.
//!
//! The engine owns no socket and no clock; it accumulates `dt` from [`AckEngine::update`].

use serde::{Deserialize, Serialize};

use crate::error::AckError;
use crate::sequence_buffer::SequenceBuffer;
use crate::wire;

pub const ACK_HEADER_BYTES: usize = 8;

/// Seconds between bandwidth samples.
const BANDWIDTH_SAMPLE_INTERVAL: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckHeader {
    pub sequence: u16,
    pub ack: u16,
    pub ack_bits: u32,
}

#[derive(Debug, Clone)]
pub struct AckConfig {
    /// Largest payload accepted by `send`, header excluded.
    pub max_packet_size: usize,
    pub sent_buffer_size: usize,
    pub received_buffer_size: usize,
    pub rtt_smoothing: f32,
    pub loss_smoothing: f32,
    pub bandwidth_smoothing: f32,
    /// Seconds an unacked packet may wait before it counts as lost.
    pub loss_grace_time: f64,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            max_packet_size: 1200,
            sent_buffer_size: 256,
            received_buffer_size: 256,
            rtt_smoothing: 0.05,
            loss_smoothing: 0.1,
            bandwidth_smoothing: 0.1,
            loss_grace_time: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SentPacket {
    pub time: f64,
    pub size: usize,
    pub acked: bool,
    /// Header-only packets exist to carry acks and are left out of loss figures.
    pub ack_only: bool,
}

/// Link quality as seen by one end of a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConnectionStats {
    /// Milliseconds.
    pub rtt: f32,
    pub packet_loss: f32,
    pub outgoing_kbps: f32,
    pub incoming_kbps: f32,
    pub acked_kbps: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckCounter {
    PacketsSent,
    PacketsReceived,
    PacketsAcked,
    PacketsStale,
    PacketsInvalid,
    PacketsTooLargeToSend,
    PacketsTooLargeToReceive,
    PacketsLost,
}

const COUNTER_COUNT: usize = 8;

impl AckCounter {
    fn index(self) -> usize {
        self as usize
    }
}

/// Exponential moving average seeded by its first sample.
#[derive(Debug, Clone, Copy, Default)]
struct Smoothed {
    value: Option<f32>,
}

impl Smoothed {
    fn sample(&mut self, sample: f32, factor: f32) {
        self.value = Some(match self.value {
            Some(current) => current + (sample - current) * factor,
            None => sample,
        });
    }

    fn get(&self) -> f32 {
        self.value.unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BandwidthWindow {
    elapsed: f64,
    sent_bytes: usize,
    received_bytes: usize,
    acked_bytes: usize,
}

pub struct AckEngine {
    config: AckConfig,
    time: f64,
    sequence: u16,
    sent: SequenceBuffer<SentPacket>,
    received: SequenceBuffer<()>,
    acks: Vec<u16>,
    rtt: Smoothed,
    packet_loss: Smoothed,
    outgoing_kbps: Smoothed,
    incoming_kbps: Smoothed,
    acked_kbps: Smoothed,
    window: BandwidthWindow,
    counters: [u64; COUNTER_COUNT],
}

impl AckEngine {
    pub fn new(config: AckConfig) -> Self {
        Self {
            sent: SequenceBuffer::with_capacity(config.sent_buffer_size),
            received: SequenceBuffer::with_capacity(config.received_buffer_size),
            config,
            time: 0.0,
            sequence: 0,
            acks: Vec::new(),
            rtt: Smoothed::default(),
            packet_loss: Smoothed::default(),
            outgoing_kbps: Smoothed::default(),
            incoming_kbps: Smoothed::default(),
            acked_kbps: Smoothed::default(),
            window: BandwidthWindow::default(),
            counters: [0; COUNTER_COUNT],
        }
    }

    pub fn config(&self) -> &AckConfig {
        &self.config
    }

    /// Stamps `payload` with the next sequence and the current ack state.
    ///
    /// Returns the sequence assigned and the bytes to hand to the wire.
    pub fn send(&mut self, payload: &[u8]) -> Result<(u16, Vec<u8>), AckError> {
        if payload.len() > self.config.max_packet_size {
            self.counters[AckCounter::PacketsTooLargeToSend.index()] += 1;
            return Err(AckError::TooLargeToSend {
                size: payload.len(),
                max: self.config.max_packet_size,
            });
        }

        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);

        let (ack, ack_bits) = self.received.generate_ack_bits();
        let mut packet = Vec::with_capacity(ACK_HEADER_BYTES + payload.len());
        wire::serialize_into(
            &mut packet,
            &AckHeader {
                sequence,
                ack,
                ack_bits,
            },
        )
        .map_err(|e| AckError::Encode(e.to_string()))?;
        packet.extend_from_slice(payload);

        let mut lost = 0;
        self.sent.insert_with(
            sequence,
            SentPacket {
                time: self.time,
                size: packet.len(),
                acked: false,
                ack_only: payload.is_empty(),
            },
            |_, evicted| {
                if !evicted.acked && !evicted.ack_only {
                    lost += 1;
                }
            },
        );
        self.counters[AckCounter::PacketsLost.index()] += lost;
        self.counters[AckCounter::PacketsSent.index()] += 1;
        self.window.sent_bytes += packet.len();

        Ok((sequence, packet))
    }

    /// Strips and processes the ack header, returning the sequence and payload.
    pub fn receive<'a>(&mut self, packet: &'a [u8]) -> Result<(u16, &'a [u8]), AckError> {
        if packet.len() < ACK_HEADER_BYTES {
            self.counters[AckCounter::PacketsInvalid.index()] += 1;
            return Err(AckError::Malformed);
        }
        if packet.len() > self.config.max_packet_size + ACK_HEADER_BYTES {
            self.counters[AckCounter::PacketsTooLargeToReceive.index()] += 1;
            return Err(AckError::TooLargeToReceive(packet.len()));
        }

        let header: AckHeader = match wire::deserialize(&packet[..ACK_HEADER_BYTES]) {
            Ok(header) => header,
            Err(_) => {
                self.counters[AckCounter::PacketsInvalid.index()] += 1;
                return Err(AckError::Malformed);
            }
        };

        self.on_receive(header.sequence, header.ack, header.ack_bits)?;
        self.window.received_bytes += packet.len();
        Ok((header.sequence, &packet[ACK_HEADER_BYTES..]))
    }

    /// Records `sequence` as received and applies the peer's acks.
    pub fn on_receive(&mut self, sequence: u16, ack: u16, ack_bits: u32) -> Result<(), AckError> {
        let time = self.time;
        if self.received.exists(sequence) || self.received.insert(sequence, ()).is_none() {
            self.counters[AckCounter::PacketsStale.index()] += 1;
            return Err(AckError::Stale(sequence));
        }
        self.counters[AckCounter::PacketsReceived.index()] += 1;

        for bit in 0..32u16 {
            if ack_bits & (1 << bit) == 0 {
                continue;
            }
            let acked_sequence = ack.wrapping_sub(bit);
            let sample = match self.sent.find_mut(acked_sequence) {
                Some(sent) if !sent.acked => {
                    sent.acked = true;
                    Some(((time - sent.time) * 1000.0, sent.size))
                }
                _ => None,
            };

            if let Some((rtt_ms, size)) = sample {
                self.acks.push(acked_sequence);
                self.counters[AckCounter::PacketsAcked.index()] += 1;
                self.window.acked_bytes += size;
                self.rtt.sample(rtt_ms as f32, self.config.rtt_smoothing);
            }
        }
        Ok(())
    }

    /// Advances time and refreshes the loss and bandwidth estimates.
    pub fn update(&mut self, dt: f64) {
        self.time += dt;
        self.update_packet_loss();

        self.window.elapsed += dt;
        if self.window.elapsed >= BANDWIDTH_SAMPLE_INTERVAL {
            let to_kbps = |bytes: usize, elapsed: f64| (bytes as f64 * 8.0 / 1000.0 / elapsed) as f32;
            let window = std::mem::take(&mut self.window);
            let factor = self.config.bandwidth_smoothing;
            self.outgoing_kbps
                .sample(to_kbps(window.sent_bytes, window.elapsed), factor);
            self.incoming_kbps
                .sample(to_kbps(window.received_bytes, window.elapsed), factor);
            self.acked_kbps
                .sample(to_kbps(window.acked_bytes, window.elapsed), factor);
        }
    }

    fn update_packet_loss(&mut self) {
        let mut settled = 0u32;
        let mut lost = 0u32;
        for (_, packet) in self.sent.iter() {
            if packet.ack_only {
                continue;
            }
            if packet.acked {
                settled += 1;
            } else if self.time - packet.time >= self.config.loss_grace_time {
                settled += 1;
                lost += 1;
            }
        }

        if settled > 0 {
            self.packet_loss
                .sample(lost as f32 / settled as f32, self.config.loss_smoothing);
        }
    }

    /// Sequences of our packets acked since the last [`take_acks`](Self::take_acks).
    pub fn acks(&self) -> &[u16] {
        &self.acks
    }

    pub fn take_acks(&mut self) -> Vec<u16> {
        std::mem::take(&mut self.acks)
    }

    pub fn clear_acks(&mut self) {
        self.acks.clear();
    }

    pub fn sent_packet(&self, sequence: u16) -> Option<&SentPacket> {
        self.sent.find(sequence)
    }

    /// The sequence the next `send` will use.
    pub fn next_sequence(&self) -> u16 {
        self.sequence
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    /// Smoothed round-trip time in milliseconds.
    pub fn rtt(&self) -> f32 {
        self.rtt.get()
    }

    /// Smoothed fraction of packets lost, `0.0..=1.0`.
    pub fn packet_loss(&self) -> f32 {
        self.packet_loss.get()
    }

    pub fn outgoing_kbps(&self) -> f32 {
        self.outgoing_kbps.get()
    }

    pub fn incoming_kbps(&self) -> f32 {
        self.incoming_kbps.get()
    }

    pub fn acked_kbps(&self) -> f32 {
        self.acked_kbps.get()
    }

    pub fn counter(&self, counter: AckCounter) -> u64 {
        self.counters[counter.index()]
    }

    /// Snapshot of the current estimates.
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            rtt: self.rtt(),
            packet_loss: self.packet_loss(),
            outgoing_kbps: self.outgoing_kbps(),
            incoming_kbps: self.incoming_kbps(),
            acked_kbps: self.acked_kbps(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_send_prefixes_header() {
        let mut engine = AckEngine::new(AckConfig::default());
        let (sequence, packet) = engine.send(b"hello").unwrap();
        assert_eq!(sequence, 0);
        assert_eq!(packet.len(), ACK_HEADER_BYTES + 5);
        assert_eq!(&packet[ACK_HEADER_BYTES..], b"hello");
        assert_eq!(engine.next_sequence(), 1);
        assert_eq!(engine.counter(AckCounter::PacketsSent), 1);
    }

    #[test]
    fn test_even_acks_give_half_loss() {
        let mut engine = AckEngine::new(AckConfig::default());
        for expected in 0..32u16 {
            let (sequence, _) = engine.send(&[expected as u8; 10]).unwrap();
            assert_eq!(sequence, expected);
        }

        engine.update(0.1);
        // Peer acks 31 down to 0; bit i covers 31 - i, so odd bits are the even sequences.
        engine.on_receive(0, 31, 0xAAAA_AAAA).unwrap();

        for sequence in 0..32u16 {
            let sent = engine.sent_packet(sequence).unwrap();
            assert_eq!(sent.acked, sequence % 2 == 0, "sequence {}", sequence);
        }
        assert_eq!(engine.acks().len(), 16);
        assert_eq!(engine.counter(AckCounter::PacketsAcked), 16);
        assert_approx_eq!(engine.rtt(), 100.0, 0.01);

        engine.update(2.0);
        assert_approx_eq!(engine.packet_loss(), 0.5, 0.001);
    }

    #[test]
    fn test_two_engines_ack_each_other() {
        let mut a = AckEngine::new(AckConfig::default());
        let mut b = AckEngine::new(AckConfig::default());

        let (sequence, packet) = a.send(b"ping").unwrap();
        a.update(0.05);
        b.update(0.05);

        let (received, payload) = b.receive(&packet).unwrap();
        assert_eq!(received, sequence);
        assert_eq!(payload, b"ping");

        let (_, reply) = b.send(b"pong").unwrap();
        let (_, payload) = a.receive(&reply).unwrap();
        assert_eq!(payload, b"pong");

        assert_eq!(a.take_acks(), vec![sequence]);
        assert!(a.acks().is_empty());
        assert!(a.sent_packet(sequence).unwrap().acked);
        assert_approx_eq!(a.rtt(), 50.0, 0.01);
    }

    #[test]
    fn test_duplicate_ack_is_counted_once() {
        let mut engine = AckEngine::new(AckConfig::default());
        engine.send(b"x").unwrap();
        engine.on_receive(0, 0, 1).unwrap();
        engine.on_receive(1, 0, 1).unwrap();
        assert_eq!(engine.counter(AckCounter::PacketsAcked), 1);
        assert_eq!(engine.acks(), &[0]);
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let mut engine = AckEngine::new(AckConfig::default());
        let payload = vec![0u8; 1201];
        assert_eq!(
            engine.send(&payload).unwrap_err(),
            AckError::TooLargeToSend {
                size: 1201,
                max: 1200
            }
        );
        assert_eq!(engine.counter(AckCounter::PacketsTooLargeToSend), 1);
        assert_eq!(engine.next_sequence(), 0);
    }

    #[test]
    fn test_malformed_and_stale_receives() {
        let mut engine = AckEngine::new(AckConfig::default());
        assert_eq!(engine.receive(&[1, 2, 3]).unwrap_err(), AckError::Malformed);
        assert_eq!(engine.counter(AckCounter::PacketsInvalid), 1);

        engine.on_receive(1000, 0, 0).unwrap();
        assert_eq!(engine.on_receive(10, 0, 0).unwrap_err(), AckError::Stale(10));
        assert_eq!(engine.counter(AckCounter::PacketsStale), 1);
    }

    #[test]
    fn test_evicted_unacked_packets_count_as_lost() {
        let mut engine = AckEngine::new(AckConfig::default());
        for _ in 0..300 {
            engine.send(b"data").unwrap();
        }
        assert_eq!(engine.counter(AckCounter::PacketsLost), 44);
    }

    #[test]
    fn test_ack_only_packets_are_not_lost() {
        let mut engine = AckEngine::new(AckConfig::default());
        engine.send(&[]).unwrap();
        engine.update(5.0);
        assert_eq!(engine.packet_loss(), 0.0);
    }

    #[test]
    fn test_bandwidth_estimates() {
        let mut engine = AckEngine::new(AckConfig::default());
        for _ in 0..10 {
            engine.send(&[0u8; 117]).unwrap();
        }
        engine.update(0.1);
        // 10 * 125 bytes over 0.1 s = 100 kbps.
        assert_approx_eq!(engine.outgoing_kbps(), 100.0, 0.01);
        assert_eq!(engine.incoming_kbps(), 0.0);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut engine = AckEngine::new(AckConfig::default());
        engine.send(b"x").unwrap();
        engine.update(1.0);
        engine.reset();
        assert_eq!(engine.next_sequence(), 0);
        assert_eq!(engine.counter(AckCounter::PacketsSent), 0);
        assert_eq!(engine.time(), 0.0);
    }
}
