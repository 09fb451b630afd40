//! Bloom filter for fast existence checks

use crate::{Result, TierError};
use xxhash_rust::xxh3::{xxh3_64, xxh3_64_with_seed};

const SECOND_HASH_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

/// Bloom filter over user keys
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: usize,
    num_hashes: usize,
}

impl BloomFilter {
    /// Create a new bloom filter
    pub fn new(num_keys: usize, bits_per_key: usize) -> Self {
        // Tiny filters have a very high false positive rate
        let num_bits = (num_keys * bits_per_key).max(64);
        let num_bytes = (num_bits + 7) / 8;

        // Optimal number of hash functions
        let num_hashes = ((bits_per_key as f64) * 0.69).round() as usize;
        let num_hashes = num_hashes.clamp(1, 30);

        Self {
            bits: vec![0u8; num_bytes],
            num_bits: num_bytes * 8,
            num_hashes,
        }
    }

    /// Hash of a key as stored by the table builder
    pub fn hash(key: &[u8]) -> u64 {
        xxh3_64(key)
    }

    /// Add a key to the filter
    pub fn add(&mut self, key: &[u8]) {
        self.add_hash(Self::hash(key));
    }

    /// Add a key by its precomputed [`BloomFilter::hash`]
    pub fn add_hash(&mut self, h1: u64) {
        let h2 = Self::second_hash(h1);
        for i in 0..self.num_hashes {
            let bit = self.bit_position(h1, h2, i);
            self.set_bit(bit);
        }
    }

    /// Check if a key may be in the set
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let h1 = Self::hash(key);
        let h2 = Self::second_hash(h1);
        (0..self.num_hashes).all(|i| self.get_bit(self.bit_position(h1, h2, i)))
    }

    /// Serialize as the bit array followed by the hash count
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bits.len() + 1);
        out.extend_from_slice(&self.bits);
        out.push(self.num_hashes as u8);
        out
    }

    /// Create from encoded data
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (num_hashes, bits) = match data.split_last() {
            Some((&k, bits)) if !bits.is_empty() && (1..=30).contains(&k) => (k as usize, bits),
            _ => return Err(TierError::Corruption("Invalid bloom filter block".into())),
        };
        Ok(Self {
            bits: bits.to_vec(),
            num_bits: bits.len() * 8,
            num_hashes,
        })
    }

    /// Get number of hash functions
    pub fn num_hashes(&self) -> usize {
        self.num_hashes
    }

    /// Estimated false positive rate
    pub fn false_positive_rate(&self, num_keys: usize) -> f64 {
        let k = self.num_hashes as f64;
        let m = self.num_bits as f64;
        let n = num_keys as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }

    fn second_hash(h1: u64) -> u64 {
        xxh3_64_with_seed(&h1.to_le_bytes(), SECOND_HASH_SEED)
    }

    fn bit_position(&self, h1: u64, h2: u64, i: usize) -> usize {
        let hash = h1.wrapping_add((i as u64).wrapping_mul(h2));
        (hash % self.num_bits as u64) as usize
    }

    fn set_bit(&mut self, bit: usize) {
        self.bits[bit / 8] |= 1 << (bit % 8);
    }

    fn get_bit(&self, bit: usize) -> bool {
        (self.bits[bit / 8] >> (bit % 8)) & 1 == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bloom_filter_basic() {
        let mut filter = BloomFilter::new(100, 10);

        for i in 0..100 {
            filter.add(format!("key-{}", i).as_bytes());
        }

        // All added keys should be found
        for i in 0..100 {
            assert!(filter.may_contain(format!("key-{}", i).as_bytes()));
        }

        // Count false positives for non-existent keys
        let false_positives = (100..1000)
            .filter(|i| filter.may_contain(format!("key-{}", i).as_bytes()))
            .count();

        // False positive rate should be around 1%
        let fp_rate = false_positives as f64 / 900.0;
        assert!(fp_rate < 0.05, "False positive rate too high: {}", fp_rate);
        assert!(filter.false_positive_rate(100) < 0.02);
    }

    #[test]
    fn test_bloom_filter_serialization() {
        let mut filter = BloomFilter::new(50, 10);
        for i in 0u32..50 {
            filter.add_hash(BloomFilter::hash(&i.to_le_bytes()));
        }

        let restored = BloomFilter::decode(&filter.encode()).unwrap();
        assert_eq!(restored.num_hashes(), filter.num_hashes());
        for i in 0u32..50 {
            assert!(restored.may_contain(&i.to_le_bytes()));
        }

        assert!(BloomFilter::decode(&[]).is_err());
        assert!(BloomFilter::decode(&[0xff, 0]).is_err());
    }
}
