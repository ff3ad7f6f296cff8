//! Bucketed cuckoo filter with an overflow-table chain.
//!
//! ## Body Layout
//!
//! ```text
//! +-----------+----------------+------------------+---------------+
//! | v_bits u8 | num_buckets u32| overflow_count u32| primary bytes|
//! +-----------+----------------+------------------+---------------+
//! | overflow 0: num_buckets u32, bytes                            |
//! +---------------------------------------------------------------+
//! | overflow 1 ...                                                |
//! +---------------------------------------------------------------+
//! ```
//!
//! Each bucket is a byte-aligned record of four slots, `K+V` bits per
//! slot, bit-packed little-endian. A slot word holds the fingerprint in
//! its low `K` bits and the value field above it; fingerprint zero marks
//! an empty slot, so real fingerprints are remapped away from zero.
//!
//! Keys that cannot be homed within the kick limit land in an overflow
//! table: a smaller cuckoo table addressed by the fingerprint alone (the
//! only identity that survives eviction). The chain grows recursively and
//! lookups walk every table in order.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::filter_hash;
use crate::corruption;
use crate::error::Result;

const SLOTS_PER_BUCKET: usize = 4;
const MAX_KICKS: usize = 500;
const ALT_BUCKET_MULT: u32 = 0x5bd1e995;

/// Widest slot that still fits an aligned u64 window during bit access.
const MAX_SLOT_BITS: u32 = 56;

fn fingerprint(hash: u32, k_bits: u32) -> u64 {
    let fp = (u64::from(hash) >> (32 - k_bits)) & ((1u64 << k_bits) - 1);
    if fp == 0 {
        1
    } else {
        fp
    }
}

fn size_for(num_keys: usize, frac: f64) -> usize {
    let buckets = (num_keys as f64 / SLOTS_PER_BUCKET as f64 / frac).ceil() as usize;
    buckets.max(1).next_power_of_two()
}

/// Accumulates `(hash, value)` pairs and serializes the filter body.
pub struct CuckooBuilder {
    k_bits: u32,
    v_bits: u32,
    frac: f64,
    entries: Vec<(u32, u64)>,
}

impl CuckooBuilder {
    /// `k_bits` in `[1, 32]`; `k_bits + v_bits` at most 56.
    pub fn new(k_bits: u32, v_bits: u32, frac: f64) -> Self {
        assert!((1..=32).contains(&k_bits));
        assert!(k_bits + v_bits <= MAX_SLOT_BITS);
        Self {
            k_bits,
            v_bits,
            frac,
            entries: Vec::new(),
        }
    }

    pub fn k_bits(&self) -> u32 {
        self.k_bits
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.entries.push((filter_hash(key), 0));
    }

    /// Multi-value variant: associates a value field with the key.
    pub fn add_key_value(&mut self, key: &[u8], value: u64) {
        let value = value & ((1u64 << self.v_bits) - 1);
        self.entries.push((filter_hash(key), value));
    }

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    /// Builds the table chain and appends the serialized body.
    pub fn finish_into(&self, out: &mut Vec<u8>) {
        let mut rng = StdRng::seed_from_u64(301);

        let mut primary = TableBuf::new(self.k_bits, self.v_bits, size_for(self.entries.len(), self.frac));
        let mut pending = Vec::new();
        for &(hash, value) in &self.entries {
            let fp = fingerprint(hash, self.k_bits);
            let bucket = hash as usize & primary.mask();
            if let Err(homeless) = primary.insert(bucket, fp, value, &mut rng) {
                pending.push(homeless);
            }
        }

        let mut overflows = Vec::new();
        while !pending.is_empty() {
            let mut num_buckets = size_for(pending.len(), self.frac);
            let failures = loop {
                let mut table = TableBuf::new(self.k_bits, self.v_bits, num_buckets);
                let mut failures = Vec::new();
                for &(fp, value) in &pending {
                    let bucket = fp as usize & table.mask();
                    if let Err(homeless) = table.insert(bucket, fp, value, &mut rng) {
                        failures.push(homeless);
                    }
                }
                if failures.len() < pending.len() {
                    overflows.push(table);
                    break failures;
                }
                // No progress at this size; try again with more room.
                num_buckets *= 2;
            };
            pending = failures;
        }

        out.push(self.v_bits as u8);
        out.write_u32::<LittleEndian>(primary.num_buckets as u32)
            .unwrap();
        out.write_u32::<LittleEndian>(overflows.len() as u32)
            .unwrap();
        out.extend_from_slice(&primary.bytes);
        for table in &overflows {
            out.write_u32::<LittleEndian>(table.num_buckets as u32)
                .unwrap();
            out.extend_from_slice(&table.bytes);
        }
    }
}

/// Mutable bit-packed table used while building.
struct TableBuf {
    k_bits: u32,
    v_bits: u32,
    num_buckets: usize,
    bucket_bytes: usize,
    bytes: Vec<u8>,
}

impl TableBuf {
    fn new(k_bits: u32, v_bits: u32, num_buckets: usize) -> Self {
        let bucket_bytes = bucket_record_bytes(k_bits, v_bits);
        Self {
            k_bits,
            v_bits,
            num_buckets,
            bucket_bytes,
            bytes: vec![0u8; num_buckets * bucket_bytes],
        }
    }

    fn mask(&self) -> usize {
        self.num_buckets - 1
    }

    fn slot_bits(&self) -> u32 {
        self.k_bits + self.v_bits
    }

    fn get(&self, bucket: usize, slot: usize) -> u64 {
        read_slot(
            &self.bytes,
            bucket,
            slot,
            self.bucket_bytes,
            self.slot_bits(),
        )
    }

    fn set(&mut self, bucket: usize, slot: usize, word: u64) {
        let bit = slot as u32 * self.slot_bits();
        let base = bucket * self.bucket_bytes + (bit / 8) as usize;
        let shift = bit % 8;
        let mask = slot_mask(self.slot_bits()) << shift;

        let avail = (self.bytes.len() - base).min(8);
        let mut window = [0u8; 8];
        window[..avail].copy_from_slice(&self.bytes[base..base + avail]);
        let mut value = u64::from_le_bytes(window);
        value = (value & !mask) | (word << shift);
        let written = value.to_le_bytes();
        self.bytes[base..base + avail].copy_from_slice(&written[..avail]);
    }

    fn find_empty(&self, bucket: usize) -> Option<usize> {
        (0..SLOTS_PER_BUCKET).find(|&slot| self.get(bucket, slot) == 0)
    }

    fn alt_bucket(&self, bucket: usize, fp: u64) -> usize {
        bucket ^ ((fp as u32).wrapping_mul(ALT_BUCKET_MULT) as usize & self.mask())
    }

    /// Places `(fp, value)` starting from `bucket`; on failure returns the
    /// pair left homeless after the kick limit (not necessarily the one
    /// passed in, eviction shuffles residents).
    fn insert(
        &mut self,
        bucket: usize,
        fp: u64,
        value: u64,
        rng: &mut StdRng,
    ) -> std::result::Result<(), (u64, u64)> {
        let word = fp | (value << self.k_bits);
        let b1 = bucket;
        let b2 = self.alt_bucket(b1, fp);

        // An identical (fingerprint, value) pair already homed counts as
        // inserted; duplicates past two buckets' capacity would otherwise
        // thrash the kick loop.
        for b in [b1, b2] {
            for slot in 0..SLOTS_PER_BUCKET {
                if self.get(b, slot) == word {
                    return Ok(());
                }
            }
        }

        for b in [b1, b2] {
            if let Some(slot) = self.find_empty(b) {
                self.set(b, slot, word);
                return Ok(());
            }
        }

        let mut b = b2;
        let mut current = word;
        for _ in 0..MAX_KICKS {
            let slot = rng.gen_range(0..SLOTS_PER_BUCKET);
            let evicted = self.get(b, slot);
            self.set(b, slot, current);
            current = evicted;

            let cur_fp = current & slot_mask(self.k_bits);
            b = self.alt_bucket(b, cur_fp);
            if let Some(slot) = self.find_empty(b) {
                self.set(b, slot, current);
                return Ok(());
            }
        }
        let fp = current & slot_mask(self.k_bits);
        Err((fp, current >> self.k_bits))
    }
}

fn bucket_record_bytes(k_bits: u32, v_bits: u32) -> usize {
    (SLOTS_PER_BUCKET * (k_bits + v_bits) as usize).div_ceil(8)
}

fn slot_mask(bits: u32) -> u64 {
    (1u64 << bits) - 1
}

fn read_slot(bytes: &[u8], bucket: usize, slot: usize, bucket_bytes: usize, slot_bits: u32) -> u64 {
    let bit = slot as u32 * slot_bits;
    let base = bucket * bucket_bytes + (bit / 8) as usize;
    let shift = bit % 8;
    let avail = (bytes.len() - base).min(8);
    let mut window = [0u8; 8];
    window[..avail].copy_from_slice(&bytes[base..base + avail]);
    (u64::from_le_bytes(window) >> shift) & slot_mask(slot_bits)
}

/// Zero-copy view over a serialized filter body.
pub struct CuckooReader<'a> {
    k_bits: u32,
    v_bits: u32,
    tables: Vec<TableView<'a>>,
}

struct TableView<'a> {
    num_buckets: usize,
    bytes: &'a [u8],
}

impl<'a> CuckooReader<'a> {
    pub fn parse(k_bits: u32, body: &'a [u8]) -> Result<Self> {
        if body.len() < 9 {
            return Err(corruption!("cuckoo filter body too short"));
        }
        let v_bits = u32::from(body[0]);
        if k_bits + v_bits > MAX_SLOT_BITS {
            return Err(corruption!("cuckoo slot width {} too wide", k_bits + v_bits));
        }
        let bucket_bytes = bucket_record_bytes(k_bits, v_bits);

        let primary_buckets = LittleEndian::read_u32(&body[1..5]) as usize;
        let overflow_count = LittleEndian::read_u32(&body[5..9]) as usize;
        let mut rest = &body[9..];

        let mut tables = Vec::with_capacity(1 + overflow_count);
        let mut take = |num_buckets: usize, rest: &mut &'a [u8]| -> Result<TableView<'a>> {
            if num_buckets == 0 || !num_buckets.is_power_of_two() {
                return Err(corruption!("bad cuckoo bucket count {num_buckets}"));
            }
            let len = num_buckets * bucket_bytes;
            if rest.len() < len {
                return Err(corruption!("cuckoo table truncated"));
            }
            let (bytes, tail) = rest.split_at(len);
            *rest = tail;
            Ok(TableView { num_buckets, bytes })
        };

        tables.push(take(primary_buckets, &mut rest)?);
        for _ in 0..overflow_count {
            if rest.len() < 4 {
                return Err(corruption!("cuckoo overflow header truncated"));
            }
            let num_buckets = LittleEndian::read_u32(&rest[..4]) as usize;
            rest = &rest[4..];
            tables.push(take(num_buckets, &mut rest)?);
        }
        if !rest.is_empty() {
            return Err(corruption!(
                "{} trailing bytes after cuckoo chain",
                rest.len()
            ));
        }
        Ok(Self {
            k_bits,
            v_bits,
            tables,
        })
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let hash = filter_hash(key);
        let fp = fingerprint(hash, self.k_bits);
        self.visit_slots(hash, fp, |_| true).is_some()
    }

    /// Multi-value lookup: every stored V field whose fingerprint matches,
    /// across the whole chain.
    pub fn values(&self, key: &[u8]) -> Vec<u64> {
        let hash = filter_hash(key);
        let fp = fingerprint(hash, self.k_bits);
        let mut found = Vec::new();
        self.visit_slots(hash, fp, |word| {
            found.push(word >> self.k_bits);
            false // keep scanning
        });
        found
    }

    /// Walks both candidate buckets of every table; the primary table is
    /// addressed by the full hash, overflow tables by the fingerprint.
    /// Stops early when `visit` returns true.
    fn visit_slots(&self, hash: u32, fp: u64, mut visit: impl FnMut(u64) -> bool) -> Option<()> {
        let bucket_bytes = bucket_record_bytes(self.k_bits, self.v_bits);
        for (i, table) in self.tables.iter().enumerate() {
            let mask = table.num_buckets - 1;
            let b1 = if i == 0 {
                hash as usize & mask
            } else {
                fp as usize & mask
            };
            let b2 = b1 ^ ((fp as u32).wrapping_mul(ALT_BUCKET_MULT) as usize & mask);
            for bucket in [b1, b2] {
                for slot in 0..SLOTS_PER_BUCKET {
                    let word = read_slot(
                        table.bytes,
                        bucket,
                        slot,
                        bucket_bytes,
                        self.k_bits + self.v_bits,
                    );
                    if word & slot_mask(self.k_bits) == fp && visit(word) {
                        return Some(());
                    }
                }
                if b1 == b2 {
                    break;
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(keys: &[Vec<u8>], k_bits: u32, frac: f64) -> Vec<u8> {
        let mut builder = CuckooBuilder::new(k_bits, 0, frac);
        for key in keys {
            builder.add_key(key);
        }
        let mut body = Vec::new();
        builder.finish_into(&mut body);
        body
    }

    #[test]
    fn test_membership_no_false_negatives() {
        let keys: Vec<Vec<u8>> = (0..50_000)
            .map(|i| format!("k{i:07}").into_bytes())
            .collect();
        let body = build(&keys, 16, 0.95);
        let reader = CuckooReader::parse(16, &body).unwrap();
        for key in &keys {
            assert!(reader.contains(key), "missing {:?}", key);
        }
    }

    #[test]
    fn test_false_positive_rate_reasonable() {
        let keys: Vec<Vec<u8>> = (0..20_000)
            .map(|i| format!("k{i:07}").into_bytes())
            .collect();
        let body = build(&keys, 16, 0.95);
        let reader = CuckooReader::parse(16, &body).unwrap();

        let mut false_positives = 0u32;
        for i in 0..20_000 {
            if reader.contains(format!("absent-{i:07}").as_bytes()) {
                false_positives += 1;
            }
        }
        // 16-bit fingerprints give roughly 2^-13 per probe; even with the
        // chain this should stay far under 1%.
        assert!(false_positives < 200, "{false_positives} false positives");
    }

    #[test]
    fn test_overflow_chain_exercised() {
        // A packed table (frac 1.0) over a non-power-of-two key count
        // leaves a tail of keys that cannot all be homed.
        let keys: Vec<Vec<u8>> = (0..10_000)
            .map(|i| format!("dense-{i:05}").into_bytes())
            .collect();
        let body = build(&keys, 12, 1.0);
        let overflow_count = LittleEndian::read_u32(&body[5..9]);
        let reader = CuckooReader::parse(12, &body).unwrap();
        for key in &keys {
            assert!(reader.contains(key));
        }
        // Not asserting a specific chain length; zero overflow just means
        // the primary absorbed everything.
        let _ = overflow_count;
    }

    #[test]
    fn test_values_variant_returns_all_matches() {
        let mut builder = CuckooBuilder::new(16, 16, 0.95);
        builder.add_key_value(b"shared-key", 7);
        builder.add_key_value(b"shared-key", 11);
        builder.add_key_value(b"other-key", 42);
        let mut body = Vec::new();
        builder.finish_into(&mut body);

        let reader = CuckooReader::parse(16, &body).unwrap();
        let mut values = reader.values(b"shared-key");
        values.sort_unstable();
        assert_eq!(values, vec![7, 11]);
        assert_eq!(reader.values(b"other-key"), vec![42]);
        assert!(reader.values(b"absent").is_empty());
    }

    #[test]
    fn test_duplicate_membership_inserts_collapse() {
        let mut builder = CuckooBuilder::new(12, 0, 0.95);
        for _ in 0..1_000 {
            builder.add_key(b"same");
        }
        let mut body = Vec::new();
        builder.finish_into(&mut body);
        let reader = CuckooReader::parse(12, &body).unwrap();
        assert!(reader.contains(b"same"));
        // A thousand duplicates must not blow up the chain.
        let overflow_count = LittleEndian::read_u32(&body[5..9]);
        assert_eq!(overflow_count, 0);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(CuckooReader::parse(16, &[1, 2, 3]).is_err());
        let mut body = Vec::new();
        CuckooBuilder::new(16, 0, 0.95).finish_into(&mut body);
        // Truncate the primary table.
        let cut = body.len() - 1;
        assert!(CuckooReader::parse(16, &body[..cut]).is_err());
    }

    #[test]
    fn test_empty_filter_contains_nothing() {
        let body = build(&[], 16, 0.95);
        let reader = CuckooReader::parse(16, &body).unwrap();
        assert!(!reader.contains(b"anything"));
    }
}
