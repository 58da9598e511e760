//! Fixed-capacity ring of entries keyed by wrapping 16-bit sequence numbers.
//!
//! The ack engine and the transport both need "what do I know about sequence N"
//! for a moving window of recent sequences. Entries are stored at `N % capacity`;
//! advancing the window clears the slots it moves over, handing any evicted value
//! back to the caller so it can be accounted for.

/// Wrap-aware `s1 > s2` for 16-bit sequence numbers.
pub fn sequence_greater_than(s1: u16, s2: u16) -> bool {
    ((s1 > s2) && (s1 - s2 <= 32768)) || ((s1 < s2) && (s2 - s1 > 32768))
}

pub fn sequence_less_than(s1: u16, s2: u16) -> bool {
    sequence_greater_than(s2, s1)
}

#[derive(Debug, Clone)]
struct Entry<T> {
    sequence: u16,
    value: T,
}

#[derive(Debug, Clone)]
pub struct SequenceBuffer<T> {
    /// One past the most recent sequence inserted.
    sequence: u16,
    entries: Vec<Option<Entry<T>>>,
}

impl<T> SequenceBuffer<T> {
    /// `capacity` is clamped to `1..=32768` so wrap comparisons stay unambiguous.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, 32768);
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, || None);
        Self { sequence: 0, entries }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// The sequence one past the newest entry ever inserted.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    fn index(&self, sequence: u16) -> usize {
        sequence as usize % self.entries.len()
    }

    /// True if `sequence` is older than the window and can no longer be stored.
    pub fn is_stale(&self, sequence: u16) -> bool {
        let oldest = self.sequence.wrapping_sub(self.entries.len() as u16);
        sequence_less_than(sequence, oldest)
    }

    pub fn insert(&mut self, sequence: u16, value: T) -> Option<&mut T> {
        self.insert_with(sequence, value, |_, _| {})
    }

    /// Stores `value` under `sequence`, returning `None` if the sequence is stale.
    ///
    /// Values pushed out of the window by this insert are passed to `on_evict`.
    pub fn insert_with<F>(&mut self, sequence: u16, value: T, mut on_evict: F) -> Option<&mut T>
    where
        F: FnMut(u16, T),
    {
        if self.is_stale(sequence) {
            return None;
        }

        if sequence_greater_than(sequence.wrapping_add(1), self.sequence) {
            self.clear_range(self.sequence, sequence, &mut on_evict);
            self.sequence = sequence.wrapping_add(1);
        }

        let index = self.index(sequence);
        if let Some(old) = self.entries[index].take() {
            if old.sequence != sequence {
                on_evict(old.sequence, old.value);
            }
        }
        self.entries[index] = Some(Entry { sequence, value });
        self.entries[index].as_mut().map(|entry| &mut entry.value)
    }

    fn clear_range<F>(&mut self, start: u16, finish: u16, on_evict: &mut F)
    where
        F: FnMut(u16, T),
    {
        let span = finish.wrapping_sub(start) as usize;
        if span < self.entries.len() {
            for offset in 0..=span {
                let index = self.index(start.wrapping_add(offset as u16));
                if let Some(old) = self.entries[index].take() {
                    on_evict(old.sequence, old.value);
                }
            }
        } else {
            for slot in self.entries.iter_mut() {
                if let Some(old) = slot.take() {
                    on_evict(old.sequence, old.value);
                }
            }
        }
    }

    pub fn exists(&self, sequence: u16) -> bool {
        self.find(sequence).is_some()
    }

    pub fn find(&self, sequence: u16) -> Option<&T> {
        match &self.entries[self.index(sequence)] {
            Some(entry) if entry.sequence == sequence => Some(&entry.value),
            _ => None,
        }
    }

    pub fn find_mut(&mut self, sequence: u16) -> Option<&mut T> {
        let index = self.index(sequence);
        match &mut self.entries[index] {
            Some(entry) if entry.sequence == sequence => Some(&mut entry.value),
            _ => None,
        }
    }

    pub fn remove(&mut self, sequence: u16) -> Option<T> {
        let index = self.index(sequence);
        match &self.entries[index] {
            Some(entry) if entry.sequence == sequence => {
                self.entries[index].take().map(|entry| entry.value)
            }
            _ => None,
        }
    }

    /// Keeps only entries for which `keep` returns true.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(u16, &T) -> bool,
    {
        for slot in self.entries.iter_mut() {
            if let Some(entry) = slot {
                if !keep(entry.sequence, &entry.value) {
                    *slot = None;
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &T)> {
        self.entries
            .iter()
            .filter_map(|slot| slot.as_ref().map(|entry| (entry.sequence, &entry.value)))
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|slot| slot.is_none())
    }

    /// Builds the `(ack, ack_bits)` pair describing the newest 33 sequences.
    ///
    /// `ack` is the newest sequence; bit `i` of `ack_bits` is set when
    /// `ack - i` is present.
    pub fn generate_ack_bits(&self) -> (u16, u32) {
        let ack = self.sequence.wrapping_sub(1);
        let mut ack_bits = 0u32;
        for bit in 0..32u16 {
            if self.exists(ack.wrapping_sub(bit)) {
                ack_bits |= 1 << bit;
            }
        }
        (ack, ack_bits)
    }

    pub fn reset(&mut self) {
        self.sequence = 0;
        self.entries.iter_mut().for_each(|slot| *slot = None);
    }
}
