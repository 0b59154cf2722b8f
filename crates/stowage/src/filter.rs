//! In-memory approximate membership filter over entry short hashes.
//!
//! A counting Bloom filter: adding a short hash increments `HASH_COUNT`
//! counters, removing decrements them, and membership requires all of them
//! to be non-zero. False positives are possible and harmless (they cost one
//! disk probe); false negatives never occur for a key whose most recent
//! observed action was an add.

use xxhash_rust::xxh64::xxh64;

/// Number of counters in the table (2^20, one byte each).
const TABLE_SIZE: usize = 1 << 20;

/// Number of hash functions, seeded 0..HASH_COUNT.
const HASH_COUNT: u64 = 3;

/// Counting Bloom filter keyed by 32-bit short hashes.
pub struct ContentsFilter {
    counters: Vec<u8>,
}

impl ContentsFilter {
    /// Creates an empty filter.
    pub fn new() -> Self {
        Self {
            counters: vec![0u8; TABLE_SIZE],
        }
    }

    /// Records a short hash as present.
    pub fn add(&mut self, short_hash: u32) {
        for index in indices(short_hash) {
            self.counters[index] = self.counters[index].saturating_add(1);
        }
    }

    /// Removes one earlier add of the short hash.
    ///
    /// A saturated counter is never decremented; decrementing it would risk
    /// false negatives for the adds that overflowed it.
    pub fn remove(&mut self, short_hash: u32) {
        for index in indices(short_hash) {
            let counter = self.counters[index];
            if counter > 0 && counter < u8::MAX {
                self.counters[index] = counter - 1;
            }
        }
    }

    /// Returns true if the short hash may have been added. False positives
    /// are possible; false negatives are not.
    pub fn may_contain(&self, short_hash: u32) -> bool {
        indices(short_hash)
            .into_iter()
            .all(|index| self.counters[index] > 0)
    }

    /// Forgets everything.
    pub fn clear(&mut self) {
        self.counters.fill(0);
    }
}

impl Default for ContentsFilter {
    fn default() -> Self {
        Self::new()
    }
}

fn indices(short_hash: u32) -> [usize; HASH_COUNT as usize] {
    let key = short_hash.to_le_bytes();
    let mut out = [0usize; HASH_COUNT as usize];
    for (seed, slot) in out.iter_mut().enumerate() {
        *slot = (xxh64(&key, seed as u64) % TABLE_SIZE as u64) as usize;
    }
    out
}
