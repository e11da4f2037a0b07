//! # Bloom Filter
//!
//! A space-efficient probabilistic data structure for set membership testing.
//!
//! A bloom filter can tell you with certainty that a key is **not** in the set
//! (no false negatives), but may occasionally report that a key **is** in the
//! set when it isn't (false positives). The false positive rate depends on the
//! number of bits and hash functions used.
//!
//! ## Usage in UndertowKV
//!
//! Each SSTable embeds a bloom filter built from its keys. During point
//! lookups the engine checks the bloom filter first -- if it says "not
//! present", the SSTable is skipped entirely, avoiding the sparse-index
//! lookup and the data-block scan.
//!
//! ## Example
//!
//! ```rust,no_run
//! use bloom::BloomFilter;
//!
//! let mut bf = BloomFilter::new(1000, 0.01);
//! bf.add(b"hello");
//! assert!(bf.may_contain(b"hello"));
//! ```
use std::io::{self, Read, Write};

/// Seed prepended to the key when deriving the second hash.
const H2_SEED: [u8; 4] = [0xde, 0xad, 0xbe, 0xef];

/// A bloom filter backed by a bit vector with `k` hash functions.
///
/// Uses double hashing: `h(i) = h1 + i * h2` where `h1` and `h2` are FNV-1a
/// over the key, the second seeded with [`H2_SEED`] and forced odd.
pub struct BloomFilter {
    /// The bit vector storing the filter state.
    bits: Vec<u8>,
    /// Number of bits in the filter.
    num_bits: u32,
    /// Number of hash functions (k).
    num_hashes: u32,
    /// Number of keys added so far.
    num_items: u32,
}

impl BloomFilter {
    /// Creates a new bloom filter sized for `expected_items` with the given
    /// target `false_positive_rate`.
    ///
    /// # Panics
    ///
    /// Panics if `false_positive_rate` is not in `(0, 1)`.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        assert!(
            false_positive_rate > 0.0 && false_positive_rate < 1.0,
            "false_positive_rate must be in (0, 1)"
        );

        // Optimal number of bits: m = -n * ln(p) / (ln(2)^2)
        let n = expected_items.max(1) as f64;
        let m = (-n * false_positive_rate.ln() / (std::f64::consts::LN_2.powi(2))).ceil() as u32;
        let m = m.max(8);

        // Optimal number of hashes: k = (m/n) * ln(2)
        let k = ((m as f64 / n) * std::f64::consts::LN_2).ceil() as u32;
        let k = k.max(1);

        let byte_len = ((m + 7) / 8) as usize;

        Self {
            bits: vec![0u8; byte_len],
            num_bits: m,
            num_hashes: k,
            num_items: 0,
        }
    }

    /// Creates a bloom filter from raw parts (used during deserialization).
    fn from_raw(bits: Vec<u8>, num_bits: u32, num_hashes: u32, num_items: u32) -> Self {
        Self {
            bits,
            num_bits,
            num_hashes,
            num_items,
        }
    }

    /// Adds a key to the bloom filter.
    pub fn add(&mut self, key: &[u8]) {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_hashes {
            let pos = self.bit_position(h1, h2, i);
            self.set_bit(pos);
        }
        self.num_items += 1;
    }

    /// Returns `true` if the key **might** be in the set, `false` if it is
    /// **definitely not** in the set.
    #[must_use]
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_hashes {
            let pos = self.bit_position(h1, h2, i);
            if !self.get_bit(pos) {
                return false;
            }
        }
        true
    }

    /// Returns the number of bits in the filter.
    #[must_use]
    pub fn num_bits(&self) -> u32 {
        self.num_bits
    }

    /// Returns the number of hash functions.
    #[must_use]
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Returns the number of keys added to the filter.
    #[must_use]
    pub fn num_items(&self) -> u32 {
        self.num_items
    }

    /// Estimates the current false positive rate: `(1 - e^(-k*n/m))^k`.
    #[must_use]
    pub fn estimated_fpr(&self) -> f64 {
        if self.num_items == 0 {
            return 0.0;
        }
        let k = self.num_hashes as f64;
        let n = self.num_items as f64;
        let m = self.num_bits as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }

    /// Returns the size of the serialized bloom filter in bytes.
    ///
    /// Layout: `num_bits(u32) + num_hashes(u32) + num_items(u32) + bits`.
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        12 + self.bits.len()
    }

    /// Serializes the bloom filter to a writer.
    ///
    /// Wire format (all big-endian):
    /// ```text
    /// [num_bits: u32][num_hashes: u32][num_items: u32][bits: bytes]
    /// ```
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.num_bits.to_be_bytes())?;
        w.write_all(&self.num_hashes.to_be_bytes())?;
        w.write_all(&self.num_items.to_be_bytes())?;
        w.write_all(&self.bits)?;
        Ok(())
    }

    /// Deserializes a bloom filter from a reader.
    ///
    /// The bit-array length is implied by `num_bits`.
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut buf4 = [0u8; 4];

        r.read_exact(&mut buf4)?;
        let num_bits = u32::from_be_bytes(buf4);

        r.read_exact(&mut buf4)?;
        let num_hashes = u32::from_be_bytes(buf4);

        r.read_exact(&mut buf4)?;
        let num_items = u32::from_be_bytes(buf4);

        if num_bits == 0 || num_hashes == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bloom filter with zero bits or hashes",
            ));
        }

        // Safety cap: bloom filter should not exceed 128 MiB
        const MAX_BLOOM_BYTES: usize = 128 * 1024 * 1024;
        let bits_len = ((num_bits as usize) + 7) / 8;
        if bits_len > MAX_BLOOM_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bloom filter too large: {} bytes", bits_len),
            ));
        }

        let mut bits = vec![0u8; bits_len];
        r.read_exact(&mut bits)?;

        Ok(Self::from_raw(bits, num_bits, num_hashes, num_items))
    }

    // ---- Internal helpers ----

    /// Double hashing: h(i) = (h1 + i * h2) mod num_bits.
    fn bit_position(&self, h1: u32, h2: u32, i: u32) -> u32 {
        h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits
    }

    fn set_bit(&mut self, pos: u32) {
        let byte_idx = (pos / 8) as usize;
        let bit_idx = (pos % 8) as u8;
        self.bits[byte_idx] |= 1 << bit_idx;
    }

    fn get_bit(&self, pos: u32) -> bool {
        let byte_idx = (pos / 8) as usize;
        let bit_idx = (pos % 8) as u8;
        (self.bits[byte_idx] >> bit_idx) & 1 == 1
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("num_bits", &self.num_bits)
            .field("num_hashes", &self.num_hashes)
            .field("num_items", &self.num_items)
            .finish()
    }
}

/// Computes the two hashes for double hashing.
///
/// `h1` is plain FNV-1a over the key; `h2` is FNV-1a over [`H2_SEED`]
/// followed by the key, forced odd so the probe sequence covers the whole
/// bit array even when `num_bits` is even.
fn hash_pair(key: &[u8]) -> (u32, u32) {
    let h1 = fnv1a_32(&[key]);
    let mut h2 = fnv1a_32(&[&H2_SEED, key]);
    if h2 % 2 == 0 {
        h2 = h2.wrapping_add(1);
    }
    (h1, h2)
}

/// FNV-1a 32-bit hash over the concatenation of `parts`.
fn fnv1a_32(parts: &[&[u8]]) -> u32 {
    const FNV_OFFSET: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;
    let mut hash = FNV_OFFSET;
    for part in parts {
        for &byte in *part {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    }
    hash
}
