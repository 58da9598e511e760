//! Sliding-window replay protection for authenticated packets.

use crate::REPLAY_BUFFER_SIZE;

/// Remembers the last `window` packet sequence numbers seen on a connection.
///
/// A sequence is rejected when it is a duplicate, or when it falls at or below
/// `highest_seen - window`. A buffer that has seen nothing accepts anything.
///
/// Checking is split from recording so the packet codec can drop stale packets
/// before paying for decryption, and only record a sequence once the packet has
/// authenticated.
#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    highest: Option<u64>,
    entries: Vec<Option<u64>>,
}

impl ReplayBuffer {
    pub fn new(window: usize) -> Self {
        Self {
            highest: None,
            entries: vec![None; window.max(1)],
        }
    }

    pub fn window(&self) -> usize {
        self.entries.len()
    }

    pub fn highest_sequence_seen(&self) -> Option<u64> {
        self.highest
    }

    fn index(&self, sequence: u64) -> usize {
        (sequence % self.entries.len() as u64) as usize
    }

    /// True if `sequence` would be rejected.
    pub fn is_stale(&self, sequence: u64) -> bool {
        let Some(highest) = self.highest else {
            return false;
        };

        if sequence.saturating_add(self.entries.len() as u64) <= highest {
            return true;
        }

        matches!(self.entries[self.index(sequence)], Some(seen) if seen >= sequence)
    }

    /// Records `sequence` as seen. Returns false, changing nothing, if it is stale.
    pub fn accept(&mut self, sequence: u64) -> bool {
        if self.is_stale(sequence) {
            return false;
        }

        if self.highest.map_or(true, |highest| sequence > highest) {
            self.highest = Some(sequence);
        }
        let index = self.index(sequence);
        self.entries[index] = Some(sequence);
        true
    }

    pub fn reset(&mut self) {
        self.highest = None;
        self.entries.iter_mut().for_each(|entry| *entry = None);
    }
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new(REPLAY_BUFFER_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_buffer_accepts_anything() {
        let mut replay = ReplayBuffer::new(4);
        assert!(!replay.is_stale(1_000_000));
        assert!(replay.accept(1_000_000));
        assert_eq!(replay.highest_sequence_seen(), Some(1_000_000));
    }

    #[test]
    fn test_window_of_three() {
        let mut replay = ReplayBuffer::new(3);
        assert!(replay.accept(5));
        assert!(replay.accept(6));
        assert!(replay.accept(7));

        // Duplicate inside the window.
        assert!(!replay.accept(6));
        // 7 - 4 >= 3
        assert!(!replay.accept(4));
        assert!(replay.accept(8));
        // Window has moved on past 5.
        assert!(!replay.accept(5));
    }

    #[test]
    fn test_out_of_order_within_window_is_accepted() {
        let mut replay = ReplayBuffer::default();
        assert!(replay.accept(10));
        assert!(replay.accept(8));
        assert!(replay.accept(9));
        assert!(!replay.accept(8));
        assert_eq!(replay.highest_sequence_seen(), Some(10));
    }

    #[test]
    fn test_is_stale_does_not_record() {
        let mut replay = ReplayBuffer::new(8);
        assert!(!replay.is_stale(3));
        assert!(!replay.is_stale(3));
        assert!(replay.accept(3));
        assert!(replay.is_stale(3));
    }

    #[test]
    fn test_reset_forgets_history() {
        let mut replay = ReplayBuffer::new(8);
        replay.accept(100);
        replay.reset();
        assert_eq!(replay.highest_sequence_seen(), None);
        assert!(replay.accept(1));
    }
}
