//! Directory configuration.

use crate::error::Result;
use crate::invalid_argument;

/// Block payload compression.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Snappy,
}

/// Approximate-membership filter attached to each sorted run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterKind {
    /// No filter block; the reader always consults the index.
    None,
    /// Classic bloom filter sized by `bf_bits_per_key`.
    Bloom,
    /// Bucketed cuckoo filter with an overflow chain.
    Cuckoo,
}

/// Configuration for one directory.
///
/// Plain data with builder-style setters; both the writer and the reader
/// take a copy at open time. The reader must be opened with the same
/// `lg_parts`, `filter`, and `unique_keys` the directory was written with.
#[derive(Clone, Debug)]
pub struct DirOptions {
    /// Log2 of the partition count.
    pub lg_parts: u8,

    /// Total memtable bytes across all partitions. Each partition's write
    /// buffer stops accepting records once it holds its share.
    pub total_memtable_budget: usize,

    /// Target size for one data block before compression.
    pub block_size: usize,

    /// Data blocks are staged and handed to the data log in batches of
    /// roughly this many bytes.
    pub block_batch_size: usize,

    /// Pad each data block with zeros up to the next `block_size` boundary.
    pub block_padding: bool,

    /// Keys between restart points in a block.
    pub restart_interval: u32,

    /// Compression for data blocks.
    pub compression: Compression,

    /// Accept any compressed block that is strictly smaller than its raw
    /// form, instead of requiring a one-eighth saving.
    pub force_compression: bool,

    /// Compression for index blocks.
    pub index_compression: Compression,

    /// Filter variant built per sorted run.
    pub filter: FilterKind,

    /// Bloom bits per key; `0` disables the filter block entirely.
    pub bf_bits_per_key: usize,

    /// Target load factor for the cuckoo filter's primary table.
    pub cuckoo_frac: f64,

    /// Read semantics: `true` returns only the last value written for a
    /// key (epochs scanned newest to oldest); `false` concatenates every
    /// value in insertion order across all epochs.
    pub unique_keys: bool,

    /// Maximum key length; with `fixed_kv`, the exact key length.
    pub key_size: usize,

    /// Expected value length; with `fixed_kv`, the exact value length.
    pub value_size: usize,

    /// Store memtable entries without varint length prefixes. Requires
    /// every key and value to be exactly `key_size` / `value_size` bytes.
    pub fixed_kv: bool,

    /// Verify block checksums on read.
    pub verify_checksums: bool,

    /// Extra invariant checks on the write path.
    pub paranoid_checks: bool,

    /// Index log write-buffer capacity.
    pub index_buffer: usize,
    /// Index log flush threshold.
    pub min_index_buffer: usize,
    /// Data log write-buffer capacity.
    pub data_buffer: usize,
    /// Data log flush threshold.
    pub min_data_buffer: usize,
}

impl Default for DirOptions {
    fn default() -> Self {
        Self {
            lg_parts: 0,
            total_memtable_budget: 32 << 20,
            block_size: 32 << 10,
            block_batch_size: 2 << 20,
            block_padding: false,
            restart_interval: 16,
            compression: Compression::None,
            force_compression: false,
            index_compression: Compression::None,
            filter: FilterKind::Bloom,
            bf_bits_per_key: 8,
            cuckoo_frac: 0.95,
            unique_keys: false,
            key_size: 8,
            value_size: 32,
            fixed_kv: false,
            verify_checksums: false,
            paranoid_checks: false,
            index_buffer: 2 << 20,
            min_index_buffer: 2 << 20,
            data_buffer: 4 << 20,
            min_data_buffer: 1 << 20,
        }
    }
}

impl DirOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lg_parts(mut self, lg: u8) -> Self {
        self.lg_parts = lg;
        self
    }

    pub fn total_memtable_budget(mut self, bytes: usize) -> Self {
        self.total_memtable_budget = bytes;
        self
    }

    pub fn block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    pub fn block_batch_size(mut self, bytes: usize) -> Self {
        self.block_batch_size = bytes;
        self
    }

    pub fn block_padding(mut self, enabled: bool) -> Self {
        self.block_padding = enabled;
        self
    }

    pub fn restart_interval(mut self, interval: u32) -> Self {
        self.restart_interval = interval;
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn force_compression(mut self, enabled: bool) -> Self {
        self.force_compression = enabled;
        self
    }

    pub fn index_compression(mut self, compression: Compression) -> Self {
        self.index_compression = compression;
        self
    }

    pub fn filter(mut self, filter: FilterKind) -> Self {
        self.filter = filter;
        self
    }

    pub fn bf_bits_per_key(mut self, bits: usize) -> Self {
        self.bf_bits_per_key = bits;
        self
    }

    pub fn cuckoo_frac(mut self, frac: f64) -> Self {
        self.cuckoo_frac = frac;
        self
    }

    pub fn unique_keys(mut self, unique: bool) -> Self {
        self.unique_keys = unique;
        self
    }

    pub fn key_size(mut self, bytes: usize) -> Self {
        self.key_size = bytes;
        self
    }

    pub fn value_size(mut self, bytes: usize) -> Self {
        self.value_size = bytes;
        self
    }

    pub fn fixed_kv(mut self, enabled: bool) -> Self {
        self.fixed_kv = enabled;
        self
    }

    pub fn verify_checksums(mut self, enabled: bool) -> Self {
        self.verify_checksums = enabled;
        self
    }

    pub fn paranoid_checks(mut self, enabled: bool) -> Self {
        self.paranoid_checks = enabled;
        self
    }

    pub fn index_buffer(mut self, bytes: usize) -> Self {
        self.index_buffer = bytes;
        self
    }

    pub fn min_index_buffer(mut self, bytes: usize) -> Self {
        self.min_index_buffer = bytes;
        self
    }

    pub fn data_buffer(mut self, bytes: usize) -> Self {
        self.data_buffer = bytes;
        self
    }

    pub fn min_data_buffer(mut self, bytes: usize) -> Self {
        self.min_data_buffer = bytes;
        self
    }

    /// Number of partitions implied by `lg_parts`.
    pub fn num_parts(&self) -> usize {
        1usize << self.lg_parts
    }

    /// Memtable byte budget for one partition buffer.
    pub fn per_part_budget(&self) -> usize {
        self.total_memtable_budget >> self.lg_parts
    }

    /// Rejects option combinations outside what the directory supports.
    pub fn validate(&self) -> Result<()> {
        if self.lg_parts > 10 {
            return Err(invalid_argument!(
                "lg_parts {} exceeds maximum of 10",
                self.lg_parts
            ));
        }
        if self.restart_interval == 0 {
            return Err(invalid_argument!("restart_interval must be at least 1"));
        }
        if self.per_part_budget() == 0 {
            return Err(invalid_argument!(
                "memtable budget {} too small for {} partitions",
                self.total_memtable_budget,
                self.num_parts()
            ));
        }
        if self.fixed_kv && self.key_size == 0 {
            return Err(invalid_argument!("fixed_kv requires a nonzero key_size"));
        }
        if !(self.cuckoo_frac > 0.0 && self.cuckoo_frac <= 1.0) {
            return Err(invalid_argument!(
                "cuckoo_frac {} outside (0, 1]",
                self.cuckoo_frac
            ));
        }
        Ok(())
    }
}
