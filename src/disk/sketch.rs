//! An approximate frequency filter for the read cache's admission policy.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    marker::PhantomData,
};

/// A probabilistic set of 4 bit counters that estimates how often a key has
/// been accessed, as used by the TinyLFU admission policy.
///
/// Each access increments four counters selected by independent hashes of the
/// key; the estimated frequency of a key is the minimum of its four counters.
/// Once the number of recorded accesses reaches the sample threshold, every
/// counter is halved, so popularity that is no longer refreshed decays over
/// time.
pub(super) struct FrequencySketch<K> {
    /// Each 64 bit word holds 16 counters of 4 bits each.
    table: Vec<u64>,
    /// The number of accesses recorded since the last reset.
    size: u32,
    /// The number of accesses at which all counters are halved.
    sample_size: u32,
    _marker: PhantomData<K>,
}

/// One multiplier per counter, to derive four independent hashes from one.
const SEEDS: [u64; 4] = [
    0xc3a5_c85c_97cb_3127,
    0xb492_b66f_be98_f273,
    0x9ae1_6a3b_2f90_404f,
    0xcbf2_9ce4_8422_2325,
];

impl<K: Hash> FrequencySketch<K> {
    /// Creates a sketch sized for a cache with the given entry capacity.
    pub fn new(capacity: usize) -> Self {
        let table_len = capacity.max(8).next_power_of_two();
        Self {
            table: vec![0; table_len],
            size: 0,
            sample_size: (10 * capacity).min(u32::MAX as usize) as u32,
            _marker: PhantomData,
        }
    }

    /// Resizes the sketch for a new cache capacity, losing gathered history.
    pub fn change_capacity(&mut self, capacity: usize) {
        *self = Self::new(capacity);
    }

    /// Records an access to the key.
    pub fn record_access(&mut self, key: &K) {
        let hash = self.hash(key);
        let mut incremented = false;
        for seed in SEEDS.iter() {
            incremented |= self.increment(hash, *seed);
        }
        if incremented {
            self.size += 1;
            if self.size >= self.sample_size {
                self.reset();
            }
        }
    }

    /// Returns the estimated access frequency of the key, at most 15.
    pub fn frequency(&self, key: &K) -> u8 {
        let hash = self.hash(key);
        SEEDS
            .iter()
            .map(|seed| self.counter(hash, *seed))
            .min()
            .unwrap_or(0)
    }

    fn hash(&self, key: &K) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    fn slot(&self, hash: u64, seed: u64) -> (usize, u32) {
        let spread = hash.wrapping_mul(seed);
        let spread = spread ^ (spread >> 32);
        let index = spread as usize & (self.table.len() - 1);
        // bit offset of one of the 16 counters within the word
        let offset = ((spread >> 32) as u32 & 0xf) * 4;
        (index, offset)
    }

    fn counter(&self, hash: u64, seed: u64) -> u8 {
        let (index, offset) = self.slot(hash, seed);
        ((self.table[index] >> offset) & 0xf) as u8
    }

    /// Increments one counter, returning false if it was already saturated.
    fn increment(&mut self, hash: u64, seed: u64) -> bool {
        let (index, offset) = self.slot(hash, seed);
        let counter = (self.table[index] >> offset) & 0xf;
        if counter < 15 {
            self.table[index] += 1 << offset;
            true
        } else {
            false
        }
    }

    /// Halves every counter in the sketch.
    fn reset(&mut self) {
        for word in self.table.iter_mut() {
            // shift each 4 bit counter right by one, masking out the bit
            // that would bleed in from the neighboring counter
            *word = (*word >> 1) & 0x7777_7777_7777_7777;
        }
        self.size /= 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frequency_tracks_accesses() {
        let mut sketch = FrequencySketch::new(64);
        assert_eq!(sketch.frequency(&"a"), 0);

        sketch.record_access(&"a");
        assert_eq!(sketch.frequency(&"a"), 1);

        for _ in 0..5 {
            sketch.record_access(&"a");
        }
        assert_eq!(sketch.frequency(&"a"), 6);
    }

    #[test]
    fn test_counters_saturate() {
        let mut sketch = FrequencySketch::new(64);
        for _ in 0..100 {
            sketch.record_access(&"a");
        }
        assert_eq!(sketch.frequency(&"a"), 15);
    }

    #[test]
    fn test_reset_halves_counters() {
        let mut sketch = FrequencySketch::new(64);
        for _ in 0..10 {
            sketch.record_access(&"a");
        }
        sketch.reset();
        assert_eq!(sketch.frequency(&"a"), 5);
    }

    #[test]
    fn test_sample_threshold_triggers_reset() {
        // capacity 8 gives a sample size of 80
        let mut sketch = FrequencySketch::new(8);
        let hot = 9999u32;
        for _ in 0..12 {
            sketch.record_access(&hot);
        }
        for key in 0..68u32 {
            sketch.record_access(&key);
        }
        // the reset must have roughly halved the hot key's frequency
        assert!(sketch.frequency(&hot) <= 8);
    }
}
