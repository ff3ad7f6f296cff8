//! Bloom filter over the keys of one sorted run.
//!
//! Sized at `bits_per_key` bits per key with `k = round(bits_per_key *
//! ln 2)` probes, clamped to `[1, 30]`. Probing is double hashing on a
//! single 32-bit hash: each round advances the hash by itself rotated
//! right 17 bits. The serialized body is the bit array followed by one
//! byte storing `k`; a stored `k` above 30 is reserved for future probe
//! schemes and matches everything.

use super::filter_hash;
use crate::error::Result;

/// Builds the bloom body for one run; key hashes are buffered so the bit
/// array can be sized from the final key count.
pub struct BloomBuilder {
    bits_per_key: usize,
    num_probes: u32,
    hashes: Vec<u32>,
}

impl BloomBuilder {
    pub fn new(bits_per_key: usize) -> Self {
        let num_probes = (bits_per_key as f64 * std::f64::consts::LN_2).round() as u32;
        Self {
            bits_per_key,
            num_probes: num_probes.clamp(1, 30),
            hashes: Vec::new(),
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.hashes.push(filter_hash(key));
    }

    /// Appends the serialized body (bit array + probe count byte).
    pub fn finish_into(&self, out: &mut Vec<u8>) {
        let bits = self.hashes.len() * self.bits_per_key;
        let bytes = bits.div_ceil(8);
        // Probe positions are taken modulo the allocated bits so the
        // reader, which only sees the byte length, agrees with us.
        let bits = bytes * 8;

        let base = out.len();
        out.resize(base + bytes, 0);
        for &hash in &self.hashes {
            let mut h = hash;
            let delta = h.rotate_right(17);
            for _ in 0..self.num_probes {
                let bit = (h as usize) % bits.max(1);
                out[base + bit / 8] |= 1 << (bit % 8);
                h = h.wrapping_add(delta);
            }
        }
        out.push(self.num_probes as u8);
    }
}

/// Tests a serialized bloom body.
pub fn may_match(body: &[u8], key: &[u8]) -> Result<bool> {
    if body.len() < 2 {
        // Room for the probe byte but no bits: an empty run matches nothing.
        return Ok(false);
    }
    let (bits_bytes, probes) = (&body[..body.len() - 1], body[body.len() - 1]);
    if probes > 30 {
        // Reserved encoding; err on the side of a false positive.
        return Ok(true);
    }
    let bits = bits_bytes.len() * 8;

    let mut h = filter_hash(key);
    let delta = h.rotate_right(17);
    for _ in 0..probes {
        let bit = (h as usize) % bits;
        if bits_bytes[bit / 8] & (1 << (bit % 8)) == 0 {
            return Ok(false);
        }
        h = h.wrapping_add(delta);
    }
    Ok(true)
}
