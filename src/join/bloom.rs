use std::hash::Hasher;

use siphasher::sip::SipHasher13;

/// Default filter width in bits.
pub const DEFAULT_FILTER_BITS: u64 = 1024;

const SEED_A: (u64, u64) = (0x626c6f6f, 0x6d5f6131);
const SEED_B: (u64, u64) = (0x626c6f6f, 0x6d5f6232);

/// Fixed-width Bloom filter with two independent hash positions per key.
/// Membership tests have no false negatives; probes use it to skip bucket
/// scans that cannot match.
pub struct BloomFilter {
    bits: Vec<u64>,
    nbits: u64,
}

impl BloomFilter {
    pub fn new(nbits: u64) -> Self {
        let words = nbits.div_ceil(64) as usize;
        Self {
            bits: vec![0; words.max(1)],
            nbits: nbits.max(64),
        }
    }

    pub fn insert(&mut self, key: i64) {
        for position in self.positions(key) {
            self.bits[(position / 64) as usize] |= 1u64 << (position % 64);
        }
    }

    pub fn contains(&self, key: i64) -> bool {
        self.positions(key)
            .iter()
            .all(|&position| self.bits[(position / 64) as usize] & (1u64 << (position % 64)) != 0)
    }

    fn positions(&self, key: i64) -> [u64; 2] {
        [
            seeded_hash(SEED_A, key) % self.nbits,
            seeded_hash(SEED_B, key) % self.nbits,
        ]
    }
}

fn seeded_hash(seed: (u64, u64), key: i64) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(seed.0, seed.1);
    hasher.write(&key.to_le_bytes());
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserted_keys_are_always_contained() {
        let mut filter = BloomFilter::new(DEFAULT_FILTER_BITS);
        for key in -500..500i64 {
            filter.insert(key);
        }
        for key in -500..500i64 {
            assert!(filter.contains(key));
        }
    }

    #[test]
    fn empty_filter_contains_nothing() {
        let filter = BloomFilter::new(DEFAULT_FILTER_BITS);
        assert!((0..100).all(|key| !filter.contains(key)));
    }
}
