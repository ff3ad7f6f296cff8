//! Approximate-membership filters attached to each sorted run.
//!
//! A filter block is framed as `[variant tag][body]`. Tag `0` is a bloom
//! filter; a nonzero tag is a cuckoo filter whose tag value is the
//! fingerprint width in bits. Filters guarantee no false negatives: a
//! negative answer means the key was never added.

pub mod bloom;
pub mod cuckoo;

use std::hash::Hasher as _;

use twox_hash::XxHash32;

use crate::corruption;
use crate::error::Result;
use crate::options::{DirOptions, FilterKind};

/// Tag byte identifying a bloom filter body.
pub const BLOOM_TAG: u8 = 0;

/// Seed for the filter key hash.
const FILTER_HASH_SEED: u32 = 0xbc9f1d34;

/// 32-bit key hash shared by both filter variants.
pub(crate) fn filter_hash(key: &[u8]) -> u32 {
    let mut hasher = XxHash32::with_seed(FILTER_HASH_SEED);
    hasher.write(key);
    hasher.finish() as u32
}

/// Accumulates the keys of one sorted run and serializes the configured
/// filter variant.
pub enum FilterBuilder {
    Bloom(bloom::BloomBuilder),
    Cuckoo(cuckoo::CuckooBuilder),
}

impl FilterBuilder {
    /// Returns `None` when the directory is configured without a filter
    /// (`FilterKind::None`, or bloom with zero bits per key).
    pub fn from_options(options: &DirOptions) -> Option<Self> {
        match options.filter {
            FilterKind::None => None,
            FilterKind::Bloom if options.bf_bits_per_key == 0 => None,
            FilterKind::Bloom => Some(FilterBuilder::Bloom(bloom::BloomBuilder::new(
                options.bf_bits_per_key,
            ))),
            FilterKind::Cuckoo => {
                let k_bits = options.bf_bits_per_key.clamp(1, 32) as u32;
                Some(FilterBuilder::Cuckoo(cuckoo::CuckooBuilder::new(
                    k_bits,
                    0,
                    options.cuckoo_frac,
                )))
            }
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        match self {
            FilterBuilder::Bloom(b) => b.add_key(key),
            FilterBuilder::Cuckoo(c) => c.add_key(key),
        }
    }

    /// Serializes the filter, tag byte included.
    pub fn finish(&self) -> Vec<u8> {
        match self {
            FilterBuilder::Bloom(b) => {
                let mut out = vec![BLOOM_TAG];
                b.finish_into(&mut out);
                out
            }
            FilterBuilder::Cuckoo(c) => {
                let mut out = vec![c.k_bits() as u8];
                c.finish_into(&mut out);
                out
            }
        }
    }
}

/// Tests a serialized filter. An empty slice means "no filter": the caller
/// must fall through to the index.
pub fn may_match(filter: &[u8], key: &[u8]) -> Result<bool> {
    if filter.is_empty() {
        return Ok(true);
    }
    let (tag, body) = (filter[0], &filter[1..]);
    match tag {
        BLOOM_TAG => bloom::may_match(body, key),
        k_bits @ 1..=32 => cuckoo::CuckooReader::parse(u32::from(k_bits), body)
            .map(|reader| reader.contains(key)),
        other => Err(corruption!("bad filter tag {other}")),
    }
}
