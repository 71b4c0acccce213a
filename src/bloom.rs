use crc::{Crc, CRC_64_ECMA_182, CRC_64_XZ};

/// Number of probe positions per key.
const BLOOM_HASHES: u64 = 4;

const H1: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);
const H2: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// Fixed-size bloom filter over raw key bytes.
///
/// Probe positions come from double hashing two CRC-64 polynomials:
/// `g_i(x) = h1(x) + i * h2(x)`. The family is a pure function of the
/// input bytes, so a serialized filter read back by another process
/// with the same size answers identically.
#[derive(Debug, Clone)]
pub struct Bloom {
    bits: Vec<u8>,
}

impl Bloom {
    /// Empty filter of `size_bytes` bytes. `size_bytes` must be non-zero;
    /// the blob validates its configuration before constructing filters.
    pub fn new(size_bytes: usize) -> Self {
        Self {
            bits: vec![0u8; size_bytes],
        }
    }

    /// Rebuild a filter from its serialized bit array.
    pub fn from_bytes(bits: Vec<u8>) -> Self {
        Self { bits }
    }

    pub fn add(&mut self, data: &[u8]) {
        let nbits = (self.bits.len() * 8) as u64;
        let h1 = H1.checksum(data);
        let h2 = H2.checksum(data);
        for i in 0..BLOOM_HASHES {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % nbits;
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// May return a false positive, never a false negative.
    pub fn check(&self, data: &[u8]) -> bool {
        let nbits = (self.bits.len() * 8) as u64;
        let h1 = H1.checksum(data);
        let h2 = H2.checksum(data);
        for i in 0..BLOOM_HASHES {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % nbits;
            if self.bits[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn size(&self) -> usize {
        self.bits.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_false_negatives() {
        let mut bloom = Bloom::new(128);
        let keys: Vec<Vec<u8>> = (0..200).map(|i| format!("key-{i}").into_bytes()).collect();
        for key in &keys {
            bloom.add(key);
        }
        for key in &keys {
            assert!(bloom.check(key), "inserted key must test positive");
        }
    }

    #[test]
    fn test_rejects_most_absent_keys() {
        let mut bloom = Bloom::new(1024);
        for i in 0..100 {
            bloom.add(format!("present-{i}").as_bytes());
        }
        let misses = (0..1000)
            .filter(|i| !bloom.check(format!("absent-{i}").as_bytes()))
            .count();
        // 8192 bits for 100 keys; near all absent keys must miss.
        assert!(misses > 950, "only {misses} of 1000 absent keys rejected");
    }

    #[test]
    fn test_serialization_is_portable() {
        let mut bloom = Bloom::new(256);
        bloom.add(b"alpha");
        bloom.add(b"beta");

        let copy = Bloom::from_bytes(bloom.as_bytes().to_vec());
        assert_eq!(copy.size(), 256);
        assert!(copy.check(b"alpha"));
        assert!(copy.check(b"beta"));
        assert_eq!(copy.as_bytes(), bloom.as_bytes());
    }

    #[test]
    fn test_empty_filter_rejects() {
        let bloom = Bloom::new(64);
        assert!(!bloom.check(b"anything"));
    }
}
