//! # Fragmentation Transport
//!
//! Splits application messages into fragments that fit one packet and offers two
//! channels on top of the [`AckEngine`]:
//!
//! - **Reliable, in order.** Messages are queued and sent one at a time. The head
//!   message's fragments go out up to `max_fragments_in_flight` at once; any
//!   fragment whose ack has not come back after `resend_interval` is sent again.
//!   The next message starts only when every fragment of the current one has been
//!   acknowledged, which is what keeps delivery ordered.
//! - **Fire and forget.** Fragments are sent once. Incomplete reassembly groups
//!   are discarded after `fire_and_forget_timeout` without any error.
//!
//! Every fragment carries a 9-byte header:
//!
//! ```text
//! [reliable: u8][message_sequence: u16][fragment_count: u16][fragment_index: u16][fragment_size: u16]
//! ```
//!
//! The transport never touches a socket. Packets to send are queued in an outbox
//! drained with [`Transport::pop_outgoing`]; the connection owner seals them as
//! `Payload` packets. Received payloads come back in through
//! [`Transport::process_packet`].
//!
//! When a peer only receives, it still owes acks. After any tick in which a
//! fragment arrived and nothing went out, a header-only packet is queued to carry
//! the ack bits back.

use std::collections::VecDeque;

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use crate::ack::{AckConfig, AckEngine};
use crate::bandwidth::BandwidthBudget;
use crate::error::TransportError;
use crate::sequence_buffer::{sequence_less_than, SequenceBuffer};
use crate::wire;

pub const FRAGMENT_HEADER_BYTES: usize = 9;

/// Reassembly groups kept open at once on the fire-and-forget channel.
const FIRE_AND_FORGET_GROUPS: usize = 64;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Payload bytes per fragment. Must leave room for the fragment header
    /// inside `ack.max_packet_size`.
    pub fragment_size: usize,
    pub max_fragments_in_flight: usize,
    pub max_size_single_send: usize,
    /// Seconds before an unacked reliable fragment is sent again.
    pub resend_interval: f64,
    pub fire_and_forget_timeout: f64,
    /// Reliable messages that may wait behind the one being sent.
    pub send_queue_capacity: usize,
    pub ack: AckConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            fragment_size: 1100,
            max_fragments_in_flight: 8,
            max_size_single_send: 20 * 1024 * 1024,
            resend_interval: 0.1,
            fire_and_forget_timeout: 2.0,
            send_queue_capacity: 1024,
            ack: AckConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentHeader {
    pub reliable: bool,
    pub message_sequence: u16,
    pub fragment_count: u16,
    pub fragment_index: u16,
    /// Bytes of data in this fragment.
    pub fragment_size: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub header: FragmentHeader,
    pub data: Vec<u8>,
}

fn encode_fragment(header: &FragmentHeader, data: &[u8]) -> Result<Vec<u8>, TransportError> {
    let mut bytes = Vec::with_capacity(FRAGMENT_HEADER_BYTES + data.len());
    wire::serialize_into(&mut bytes, header).map_err(|_| TransportError::Malformed)?;
    bytes.extend_from_slice(data);
    Ok(bytes)
}

impl Fragment {
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        encode_fragment(&self.header, &self.data)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        if bytes.len() < FRAGMENT_HEADER_BYTES {
            return Err(TransportError::Malformed);
        }
        let header: FragmentHeader = wire::deserialize(&bytes[..FRAGMENT_HEADER_BYTES])
            .map_err(|_| TransportError::Malformed)?;
        let data = &bytes[FRAGMENT_HEADER_BYTES..];
        if data.len() != header.fragment_size as usize {
            return Err(TransportError::Malformed);
        }
        Ok(Self {
            header,
            data: data.to_vec(),
        })
    }
}

fn fragment_count(len: usize, fragment_size: usize) -> usize {
    (len + fragment_size - 1) / fragment_size
}

/// Cuts `data` into `fragment_size` pieces; only the last may be shorter.
pub fn split_into_fragments(
    message_sequence: u16,
    data: &[u8],
    fragment_size: usize,
    reliable: bool,
) -> Result<Vec<Fragment>, TransportError> {
    if data.is_empty() {
        return Err(TransportError::EmptyMessage);
    }
    if fragment_size == 0 {
        return Err(TransportError::Malformed);
    }
    let count = fragment_count(data.len(), fragment_size);
    if count > u16::MAX as usize || fragment_size > u16::MAX as usize {
        return Err(TransportError::TooLargeToSend {
            size: data.len(),
            max: u16::MAX as usize * fragment_size,
        });
    }

    Ok(data
        .chunks(fragment_size)
        .enumerate()
        .map(|(index, chunk)| Fragment {
            header: FragmentHeader {
                reliable,
                message_sequence,
                fragment_count: count as u16,
                fragment_index: index as u16,
                fragment_size: chunk.len() as u16,
            },
            data: chunk.to_vec(),
        })
        .collect())
}

/// Collects the fragments of one message, in any order, until it is whole.
#[derive(Debug)]
pub struct ReassemblyGroup {
    message_sequence: u16,
    fragment_size: usize,
    received: Vec<bool>,
    received_count: usize,
    buffer: Vec<u8>,
    final_len: usize,
    created_at: f64,
}

impl ReassemblyGroup {
    pub fn new(message_sequence: u16, fragment_count: u16, fragment_size: usize, created_at: f64) -> Self {
        Self {
            message_sequence,
            fragment_size,
            received: vec![false; fragment_count as usize],
            received_count: 0,
            buffer: Vec::new(),
            final_len: 0,
            created_at,
        }
    }

    pub fn message_sequence(&self) -> u16 {
        self.message_sequence
    }

    pub fn created_at(&self) -> f64 {
        self.created_at
    }

    /// Writes one fragment into place. Returns true once every fragment is in.
    pub fn insert(&mut self, fragment: &Fragment) -> Result<bool, TransportError> {
        let header = &fragment.header;
        let index = header.fragment_index as usize;
        if header.message_sequence != self.message_sequence
            || header.fragment_count as usize != self.received.len()
            || index >= self.received.len()
        {
            return Err(TransportError::Malformed);
        }

        let len = fragment.data.len();
        let last = index + 1 == self.received.len();
        if len == 0 || len > self.fragment_size || (!last && len != self.fragment_size) {
            return Err(TransportError::Malformed);
        }

        if self.received[index] {
            return Ok(self.is_complete());
        }

        let offset = index * self.fragment_size;
        let end = offset + len;
        if self.buffer.len() < end {
            self.buffer.resize(end, 0);
        }
        self.buffer[offset..end].copy_from_slice(&fragment.data);
        if last {
            self.final_len = end;
        }
        self.received[index] = true;
        self.received_count += 1;
        Ok(self.is_complete())
    }

    pub fn is_complete(&self) -> bool {
        self.received_count == self.received.len()
    }

    pub fn received_count(&self) -> usize {
        self.received_count
    }

    pub fn into_message(mut self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        self.buffer.truncate(self.final_len);
        Some(self.buffer)
    }
}

#[derive(Debug)]
struct OutgoingMessage {
    sequence: u16,
    data: Vec<u8>,
    acked: Vec<bool>,
    last_sent: Vec<Option<f64>>,
    acked_count: usize,
}

impl OutgoingMessage {
    fn new(sequence: u16, data: Vec<u8>, fragment_size: usize) -> Self {
        let count = fragment_count(data.len(), fragment_size);
        Self {
            sequence,
            data,
            acked: vec![false; count],
            last_sent: vec![None; count],
            acked_count: 0,
        }
    }

    fn fragment_bytes(&self, index: usize, fragment_size: usize) -> Result<Vec<u8>, TransportError> {
        let start = index * fragment_size;
        let end = (start + fragment_size).min(self.data.len());
        let data = &self.data[start..end];
        let header = FragmentHeader {
            reliable: true,
            message_sequence: self.sequence,
            fragment_count: self.acked.len() as u16,
            fragment_index: index as u16,
            fragment_size: data.len() as u16,
        };
        encode_fragment(&header, data)
    }

    fn in_flight(&self) -> usize {
        self.acked
            .iter()
            .zip(&self.last_sent)
            .filter(|(acked, sent)| !**acked && sent.is_some())
            .count()
    }

    fn is_complete(&self) -> bool {
        self.acked_count == self.acked.len()
    }
}

#[derive(Debug, Clone, Copy)]
struct SentFragment {
    message_sequence: u16,
    fragment_index: u16,
}

pub struct Transport {
    config: TransportConfig,
    time: f64,
    ack: AckEngine,
    max_outgoing_bytes_per_second: usize,
    outgoing_budget: BandwidthBudget,

    send_queue: VecDeque<OutgoingMessage>,
    next_reliable_sequence: u16,
    next_fire_and_forget_sequence: u16,
    sent_fragments: SequenceBuffer<SentFragment>,

    reliable_next: u16,
    reliable_group: Option<ReassemblyGroup>,
    fire_and_forget_groups: SequenceBuffer<ReassemblyGroup>,
    received_reliable: VecDeque<Vec<u8>>,
    received_fire_and_forget: VecDeque<Vec<u8>>,

    outbox: VecDeque<Vec<u8>>,
    ack_pending: bool,
}

impl Transport {
    pub fn new(mut config: TransportConfig) -> Self {
        config.fragment_size = config.fragment_size.clamp(1, u16::MAX as usize);
        Self {
            ack: AckEngine::new(config.ack.clone()),
            sent_fragments: SequenceBuffer::with_capacity(config.ack.sent_buffer_size),
            config,
            time: 0.0,
            max_outgoing_bytes_per_second: 0,
            outgoing_budget: BandwidthBudget::unlimited(),
            send_queue: VecDeque::new(),
            next_reliable_sequence: 0,
            next_fire_and_forget_sequence: 0,
            reliable_next: 0,
            reliable_group: None,
            fire_and_forget_groups: SequenceBuffer::with_capacity(FIRE_AND_FORGET_GROUPS),
            received_reliable: VecDeque::new(),
            received_fire_and_forget: VecDeque::new(),
            outbox: VecDeque::new(),
            ack_pending: false,
        }
    }

    /// Caps outgoing fragment traffic. Zero means unlimited.
    pub fn set_max_outgoing_bytes_per_second(&mut self, bytes_per_second: usize) {
        self.max_outgoing_bytes_per_second = bytes_per_second;
        self.outgoing_budget = BandwidthBudget::new(bytes_per_second);
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn ack(&self) -> &AckEngine {
        &self.ack
    }

    /// Queues `data` for delivery on the chosen channel.
    pub fn send(&mut self, data: &[u8], reliable: bool) -> Result<(), TransportError> {
        if data.is_empty() {
            return Err(TransportError::EmptyMessage);
        }
        if data.len() > self.config.max_size_single_send {
            return Err(TransportError::TooLargeToSend {
                size: data.len(),
                max: self.config.max_size_single_send,
            });
        }

        if reliable {
            if self.send_queue.len() >= self.config.send_queue_capacity {
                return Err(TransportError::SendQueueFull);
            }
            let sequence = self.next_reliable_sequence;
            self.next_reliable_sequence = sequence.wrapping_add(1);
            self.send_queue.push_back(OutgoingMessage::new(
                sequence,
                data.to_vec(),
                self.config.fragment_size,
            ));
            return self.flush_reliable();
        }

        let sequence = self.next_fire_and_forget_sequence;
        self.next_fire_and_forget_sequence = sequence.wrapping_add(1);
        if !self.outgoing_budget.try_consume(data.len()) {
            debug!("Dropping fire-and-forget message {}: over outgoing budget", sequence);
            return Ok(());
        }
        for fragment in split_into_fragments(sequence, data, self.config.fragment_size, false)? {
            let bytes = fragment.to_bytes()?;
            self.emit(&bytes)?;
        }
        Ok(())
    }

    fn emit(&mut self, payload: &[u8]) -> Result<u16, TransportError> {
        let (sequence, packet) = self.ack.send(payload)?;
        self.outbox.push_back(packet);
        self.ack_pending = false;
        Ok(sequence)
    }

    /// Sends new and overdue fragments of the message at the head of the queue.
    fn flush_reliable(&mut self) -> Result<(), TransportError> {
        let Some(message) = self.send_queue.front() else {
            return Ok(());
        };

        let mut in_flight = message.in_flight();
        let mut due = Vec::new();
        for index in 0..message.acked.len() {
            if message.acked[index] {
                continue;
            }
            match message.last_sent[index] {
                Some(sent_at) if self.time - sent_at < self.config.resend_interval => {}
                Some(_) => due.push(index),
                None if in_flight < self.config.max_fragments_in_flight => {
                    in_flight += 1;
                    due.push(index);
                }
                None => break,
            }
        }

        for index in due {
            let (message_sequence, bytes) = match self.send_queue.front() {
                Some(message) => (
                    message.sequence,
                    message.fragment_bytes(index, self.config.fragment_size)?,
                ),
                None => break,
            };
            if !self.outgoing_budget.try_consume(bytes.len()) {
                trace!("Outgoing budget exhausted, deferring reliable fragments");
                break;
            }

            let ack_sequence = self.emit(&bytes)?;
            self.sent_fragments.insert(
                ack_sequence,
                SentFragment {
                    message_sequence,
                    fragment_index: index as u16,
                },
            );
            if let Some(message) = self.send_queue.front_mut() {
                message.last_sent[index] = Some(self.time);
            }
        }
        Ok(())
    }

    fn process_acks(&mut self) {
        for ack_sequence in self.ack.take_acks() {
            let Some(sent) = self.sent_fragments.remove(ack_sequence) else {
                continue;
            };
            if let Some(message) = self.send_queue.front_mut() {
                let index = sent.fragment_index as usize;
                if message.sequence == sent.message_sequence
                    && index < message.acked.len()
                    && !message.acked[index]
                {
                    message.acked[index] = true;
                    message.acked_count += 1;
                }
            }
        }

        while self.send_queue.front().map_or(false, OutgoingMessage::is_complete) {
            if let Some(message) = self.send_queue.pop_front() {
                trace!(
                    "Reliable message {} ({} bytes) fully acknowledged",
                    message.sequence,
                    message.data.len()
                );
            }
        }
    }

    /// Feeds one received packet (ack header plus fragment) into the transport.
    pub fn process_packet(&mut self, packet: &[u8]) -> Result<(), TransportError> {
        let (_, payload) = self.ack.receive(packet)?;
        self.process_acks();
        if payload.is_empty() {
            return Ok(());
        }
        self.ack_pending = true;
        let fragment = Fragment::from_bytes(payload)?;
        self.on_receive_fragment(fragment)
    }

    pub fn on_receive_fragment(&mut self, fragment: Fragment) -> Result<(), TransportError> {
        let header = fragment.header;
        if header.fragment_count == 0
            || header.fragment_index >= header.fragment_count
            || (header.fragment_count as usize - 1) * self.config.fragment_size
                >= self.config.max_size_single_send
        {
            return Err(TransportError::Malformed);
        }

        if header.reliable {
            if header.message_sequence != self.reliable_next {
                if sequence_less_than(header.message_sequence, self.reliable_next) {
                    trace!("Ignoring fragment of already delivered message {}", header.message_sequence);
                } else {
                    debug!(
                        "Ignoring fragment of message {} while waiting for {}",
                        header.message_sequence, self.reliable_next
                    );
                }
                return Ok(());
            }

            let (fragment_size, time) = (self.config.fragment_size, self.time);
            let group = self.reliable_group.get_or_insert_with(|| {
                ReassemblyGroup::new(header.message_sequence, header.fragment_count, fragment_size, time)
            });
            if group.insert(&fragment)? {
                if let Some(message) = self.reliable_group.take().and_then(ReassemblyGroup::into_message) {
                    self.received_reliable.push_back(message);
                }
                self.reliable_next = self.reliable_next.wrapping_add(1);
            }
            return Ok(());
        }

        let sequence = header.message_sequence;
        if !self.fire_and_forget_groups.exists(sequence) {
            let group = ReassemblyGroup::new(sequence, header.fragment_count, self.config.fragment_size, self.time);
            if self.fire_and_forget_groups.insert(sequence, group).is_none() {
                trace!("Dropping fragment of stale fire-and-forget message {}", sequence);
                return Ok(());
            }
        }

        let complete = match self.fire_and_forget_groups.find_mut(sequence) {
            Some(group) => group.insert(&fragment)?,
            None => false,
        };
        if complete {
            if let Some(message) = self
                .fire_and_forget_groups
                .remove(sequence)
                .and_then(ReassemblyGroup::into_message)
            {
                self.received_fire_and_forget.push_back(message);
            }
        }
        Ok(())
    }

    /// Advances timers: resends overdue fragments, expires stale reassembly and
    /// queues an ack-only packet if one is owed.
    pub fn update(&mut self, dt: f64) {
        self.time += dt;
        self.ack.update(dt);
        self.outgoing_budget.refill(dt);
        self.process_acks();

        let (time, timeout) = (self.time, self.config.fire_and_forget_timeout);
        self.fire_and_forget_groups
            .retain(|_, group| time - group.created_at() < timeout);

        if let Err(e) = self.flush_reliable() {
            warn!("Failed to send reliable fragments: {}", e);
        }

        if self.ack_pending {
            if let Err(e) = self.emit(&[]) {
                warn!("Failed to send ack packet: {}", e);
            }
        }
    }

    /// Next packet to seal and put on the wire.
    pub fn pop_outgoing(&mut self) -> Option<Vec<u8>> {
        self.outbox.pop_front()
    }

    pub fn receive_reliably_and_in_order(&mut self) -> Option<Vec<u8>> {
        self.received_reliable.pop_front()
    }

    pub fn receive_fire_and_forget(&mut self) -> Option<Vec<u8>> {
        self.received_fire_and_forget.pop_front()
    }

    /// Fragments of queued reliable messages not yet acknowledged.
    pub fn unacked_fragment_count(&self) -> usize {
        self.send_queue
            .iter()
            .map(|message| message.acked.len() - message.acked_count)
            .sum()
    }

    pub fn reliable_messages_queued(&self) -> usize {
        self.send_queue.len()
    }

    pub fn reset(&mut self) {
        let max_outgoing = self.max_outgoing_bytes_per_second;
        *self = Self::new(self.config.clone());
        self.set_max_outgoing_bytes_per_second(max_outgoing);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 + i / 251) as u8).collect()
    }

    fn pump(from: &mut Transport, to: &mut Transport) -> usize {
        let mut moved = 0;
        while let Some(packet) = from.pop_outgoing() {
            to.process_packet(&packet).unwrap();
            moved += 1;
        }
        moved
    }

    fn exchange(a: &mut Transport, b: &mut Transport, ticks: usize) {
        for _ in 0..ticks {
            a.update(0.016);
            b.update(0.016);
            pump(a, b);
            pump(b, a);
        }
    }

    #[test]
    fn test_fragment_roundtrip_sizes() {
        for size in [1usize, 1100, 1101, 5000, 20 * 1024 * 1024] {
            let data = pattern(size);
            let mut fragments = split_into_fragments(3, &data, 1100, true).unwrap();
            assert_eq!(fragments.len(), (size + 1099) / 1100);
            fragments.reverse();

            let count = fragments[0].header.fragment_count;
            let mut group = ReassemblyGroup::new(3, count, 1100, 0.0);
            let mut complete = false;
            for fragment in &fragments {
                let bytes = fragment.to_bytes().unwrap();
                let decoded = Fragment::from_bytes(&bytes).unwrap();
                complete = group.insert(&decoded).unwrap();
            }
            assert!(complete);
            assert_eq!(group.into_message().unwrap(), data, "size {}", size);
        }
    }

    #[test]
    fn test_fragment_header_size() {
        let fragments = split_into_fragments(0, &[1, 2, 3], 1100, false).unwrap();
        let bytes = fragments[0].to_bytes().unwrap();
        assert_eq!(bytes.len(), FRAGMENT_HEADER_BYTES + 3);
    }

    #[test]
    fn test_reassembly_rejects_bad_fragments() {
        let data = pattern(2500);
        let fragments = split_into_fragments(1, &data, 1100, true).unwrap();
        let mut group = ReassemblyGroup::new(1, 3, 1100, 0.0);

        let mut short = fragments[0].clone();
        short.data.truncate(10);
        short.header.fragment_size = 10;
        assert_eq!(group.insert(&short), Err(TransportError::Malformed));

        let mut foreign = fragments[1].clone();
        foreign.header.message_sequence = 2;
        assert_eq!(group.insert(&foreign), Err(TransportError::Malformed));

        assert_eq!(group.insert(&fragments[1]), Ok(false));
        assert_eq!(group.insert(&fragments[1]), Ok(false));
        assert_eq!(group.received_count(), 1);
    }

    #[test]
    fn test_send_limits() {
        let mut transport = Transport::new(TransportConfig::default());
        assert_eq!(transport.send(&[], true), Err(TransportError::EmptyMessage));

        let too_big = vec![0u8; 20 * 1024 * 1024 + 1];
        assert_eq!(
            transport.send(&too_big, true),
            Err(TransportError::TooLargeToSend {
                size: 20 * 1024 * 1024 + 1,
                max: 20 * 1024 * 1024
            })
        );
        assert_eq!(transport.send(&too_big, false).unwrap_err(), TransportError::TooLargeToSend {
            size: 20 * 1024 * 1024 + 1,
            max: 20 * 1024 * 1024
        });
    }

    #[test]
    fn test_send_queue_capacity() {
        let config = TransportConfig {
            send_queue_capacity: 2,
            ..TransportConfig::default()
        };
        let mut transport = Transport::new(config);
        transport.send(b"one", true).unwrap();
        transport.send(b"two", true).unwrap();
        assert_eq!(transport.send(b"three", true), Err(TransportError::SendQueueFull));
    }

    #[test]
    fn test_in_flight_limit() {
        let mut transport = Transport::new(TransportConfig::default());
        transport.send(&pattern(20_000), true).unwrap();

        let mut sent = 0;
        while transport.pop_outgoing().is_some() {
            sent += 1;
        }
        assert_eq!(sent, 8);
        assert_eq!(transport.unacked_fragment_count(), 19);
    }

    #[test]
    fn test_reliable_messages_arrive_in_order() {
        let mut a = Transport::new(TransportConfig::default());
        let mut b = Transport::new(TransportConfig::default());

        let messages = vec![pattern(5000), b"small".to_vec(), pattern(12_345), pattern(1100)];
        for message in &messages {
            a.send(message, true).unwrap();
        }
        exchange(&mut a, &mut b, 60);

        for message in &messages {
            assert_eq!(b.receive_reliably_and_in_order().as_ref(), Some(message));
        }
        assert_eq!(b.receive_reliably_and_in_order(), None);
        assert_eq!(a.unacked_fragment_count(), 0);
        assert_eq!(a.reliable_messages_queued(), 0);
    }

    #[test]
    fn test_reliable_survives_loss() {
        let mut a = Transport::new(TransportConfig::default());
        let mut b = Transport::new(TransportConfig::default());
        let message = pattern(30_000);
        a.send(&message, true).unwrap();

        let mut counter = 0;
        for _ in 0..500 {
            a.update(0.016);
            b.update(0.016);
            while let Some(packet) = a.pop_outgoing() {
                counter += 1;
                if counter % 3 == 0 {
                    continue;
                }
                b.process_packet(&packet).unwrap();
            }
            pump(&mut b, &mut a);
        }

        assert_eq!(b.receive_reliably_and_in_order(), Some(message));
        assert_eq!(a.unacked_fragment_count(), 0);
    }

    #[test]
    fn test_fire_and_forget_delivery() {
        let mut a = Transport::new(TransportConfig::default());
        let mut b = Transport::new(TransportConfig::default());

        a.send(b"ping", false).unwrap();
        a.send(&pattern(4000), false).unwrap();
        pump(&mut a, &mut b);

        assert_eq!(b.receive_fire_and_forget(), Some(b"ping".to_vec()));
        assert_eq!(b.receive_fire_and_forget(), Some(pattern(4000)));
        assert_eq!(b.receive_fire_and_forget(), None);
        assert_eq!(b.receive_reliably_and_in_order(), None);
    }

    #[test]
    fn test_incomplete_fire_and_forget_expires() {
        let mut a = Transport::new(TransportConfig::default());
        let mut b = Transport::new(TransportConfig::default());

        a.send(&pattern(3000), false).unwrap();
        let first = a.pop_outgoing().unwrap();
        while a.pop_outgoing().is_some() {}

        b.process_packet(&first).unwrap();
        assert_eq!(b.fire_and_forget_groups.len(), 1);

        b.update(1.0);
        assert_eq!(b.fire_and_forget_groups.len(), 1);
        b.update(1.5);
        assert_eq!(b.fire_and_forget_groups.len(), 0);
        assert_eq!(b.receive_fire_and_forget(), None);
    }

    #[test]
    fn test_receiver_sends_ack_only_packet() {
        let mut a = Transport::new(TransportConfig::default());
        let mut b = Transport::new(TransportConfig::default());

        a.send(b"hello", true).unwrap();
        pump(&mut a, &mut b);
        assert!(b.pop_outgoing().is_none());

        b.update(0.016);
        let ack = b.pop_outgoing().unwrap();
        assert_eq!(ack.len(), crate::ack::ACK_HEADER_BYTES);
        a.process_packet(&ack).unwrap();
        assert_eq!(a.unacked_fragment_count(), 0);

        // Ack-only packets are not acknowledged in turn.
        a.update(0.016);
        assert!(a.pop_outgoing().is_none());
    }

    #[test]
    fn test_outgoing_budget_defers_fragments() {
        let mut a = Transport::new(TransportConfig::default());
        a.set_max_outgoing_bytes_per_second(2000);
        a.send(&pattern(5000), true).unwrap();

        let mut sent = 0;
        while a.pop_outgoing().is_some() {
            sent += 1;
        }
        assert_eq!(sent, 2);

        a.update(1.0);
        let mut resent = 0;
        while a.pop_outgoing().is_some() {
            resent += 1;
        }
        assert!(resent >= 1);
    }

    #[test]
    fn test_reset() {
        let mut transport = Transport::new(TransportConfig::default());
        transport.send(&pattern(5000), true).unwrap();
        transport.reset();
        assert_eq!(transport.unacked_fragment_count(), 0);
        assert!(transport.pop_outgoing().is_none());
        assert_eq!(transport.ack().next_sequence(), 0);
    }
}
