//! Sorted-run emission and retrieval.
//!
//! One compaction turns one sealed memtable into one sorted run spread
//! over the partition's two logs:
//!
//! ```text
//! data log:  [block 0][block 1]...[block n]
//! index log: [filter block][index block][meta trailer]
//! ```
//!
//! Every block carries the 5-byte type+CRC32C trailer. Index entries map a
//! shortest-separator key to the `(offset, length)` of a data block, and
//! the meta trailer pins down the filter, the index, and the run's key
//! bounds. The trailer is the commit point: a run whose trailer never made
//! it to the index log is invisible to readers.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::block::{Block, BlockBuilder};
use crate::checksum::{
    append_trailer, crc32c, strip_trailer, BLOCK_TRAILER_LEN, TYPE_RAW, TYPE_SNAPPY,
};
use crate::coding::{get_varint32, get_varint64, put_varint32, put_varint64};
use crate::corruption;
use crate::env::{RandomAccessFile, WritableFile};
use crate::error::Result;
use crate::filter::{may_match, FilterBuilder};
use crate::options::{Compression, DirOptions};

/// Magic value opening every meta trailer.
pub const TABLE_MAGIC: u64 = 0x8c3a_5f0e_74b1_d92a;

/// Buffered writer over an append-only log file. Tracks the logical end
/// offset so builders can hand out block locations before bytes reach the
/// file.
pub struct LogSink {
    file: Box<dyn WritableFile>,
    buf: Vec<u8>,
    flush_threshold: usize,
    offset: u64,
}

impl LogSink {
    pub fn new(file: Box<dyn WritableFile>, capacity: usize, flush_threshold: usize) -> Self {
        Self {
            file,
            buf: Vec::with_capacity(capacity),
            flush_threshold,
            offset: 0,
        }
    }

    /// Logical end offset: everything written so far, buffered or not.
    pub fn ltell(&self) -> u64 {
        self.offset
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(data);
        self.offset += data.len() as u64;
        if self.buf.len() >= self.flush_threshold {
            self.file.append(&self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.file.append(&self.buf)?;
            self.buf.clear();
        }
        self.file.flush()
    }

    pub fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.file.sync()
    }

    pub fn close(&mut self) -> Result<()> {
        self.sync()?;
        self.file.close()
    }
}

/// Applies the configured compression to a finished block payload and
/// frames it with the type+CRC trailer.
///
/// A compressed payload is kept only when it is worth it: strictly smaller
/// under `force`, at least one-eighth smaller otherwise. Everything else
/// is stored raw with type `0`.
fn frame_block(payload: Vec<u8>, compression: Compression, force: bool) -> Vec<u8> {
    let (mut framed, ctype) = match compression {
        Compression::None => (payload, TYPE_RAW),
        Compression::Snappy => {
            match snap::raw::Encoder::new().compress_vec(&payload) {
                Ok(compressed) => {
                    let limit = if force {
                        payload.len()
                    } else {
                        payload.len() - payload.len() / 8
                    };
                    if compressed.len() < limit {
                        (compressed, TYPE_SNAPPY)
                    } else {
                        (payload, TYPE_RAW)
                    }
                }
                // Snappy refused the input; store it raw.
                Err(_) => (payload, TYPE_RAW),
            }
        }
    };
    append_trailer(&mut framed, 0, ctype);
    framed
}

/// Strips the trailer from a stored block and undoes its compression.
pub fn decode_block(stored: &[u8], verify: bool) -> Result<Vec<u8>> {
    let (payload, ctype) = strip_trailer(stored, verify)?;
    match ctype {
        TYPE_RAW => Ok(payload.to_vec()),
        TYPE_SNAPPY => snap::raw::Decoder::new()
            .decompress_vec(payload)
            .map_err(|e| corruption!("snappy decode failed: {e}")),
        other => Err(corruption!("unknown block type {other}")),
    }
}

/// Shortest key `r` with `a <= r < b`, used as the index entry for the
/// block ending at `a` when the next block starts at `b`.
pub fn separator(a: &[u8], b: &[u8]) -> Vec<u8> {
    let shared = a
        .iter()
        .zip(b.iter())
        .take_while(|(x, y)| x == y)
        .count();
    if shared < a.len().min(b.len()) {
        let byte = a[shared];
        if byte < 0xff && byte + 1 < b[shared] {
            let mut out = a[..=shared].to_vec();
            out[shared] += 1;
            return out;
        }
    }
    a.to_vec()
}

/// Shortest key >= `a`, used for the final block's index entry.
pub fn successor(a: &[u8]) -> Vec<u8> {
    for (i, &byte) in a.iter().enumerate() {
        if byte != 0xff {
            let mut out = a[..=i].to_vec();
            out[i] += 1;
            return out;
        }
    }
    a.to_vec()
}

/// Fixed-layout record closing one sorted run in the index log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableMeta {
    pub epoch: u32,
    pub filter_off: u64,
    pub filter_len: u64,
    pub index_off: u64,
    pub index_len: u64,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
}

impl TableMeta {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.min_key.len() + self.max_key.len());
        out.write_u64::<LittleEndian>(TABLE_MAGIC).unwrap();
        out.write_u32::<LittleEndian>(self.epoch).unwrap();
        out.write_u64::<LittleEndian>(self.filter_off).unwrap();
        out.write_u64::<LittleEndian>(self.filter_len).unwrap();
        out.write_u64::<LittleEndian>(self.index_off).unwrap();
        out.write_u64::<LittleEndian>(self.index_len).unwrap();
        put_varint32(&mut out, self.min_key.len() as u32);
        out.extend_from_slice(&self.min_key);
        put_varint32(&mut out, self.max_key.len() as u32);
        out.extend_from_slice(&self.max_key);
        let crc = crc32c(&out);
        out.write_u32::<LittleEndian>(crc).unwrap();
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 44 + 2 + 4 {
            return Err(corruption!("meta trailer too short: {} bytes", bytes.len()));
        }
        let body_len = bytes.len() - 4;
        let stored_crc = LittleEndian::read_u32(&bytes[body_len..]);
        let actual_crc = crc32c(&bytes[..body_len]);
        if stored_crc != actual_crc {
            return Err(corruption!("meta trailer checksum mismatch"));
        }
        let magic = LittleEndian::read_u64(&bytes[..8]);
        if magic != TABLE_MAGIC {
            return Err(corruption!("bad meta trailer magic {magic:#018x}"));
        }
        let epoch = LittleEndian::read_u32(&bytes[8..12]);
        let filter_off = LittleEndian::read_u64(&bytes[12..20]);
        let filter_len = LittleEndian::read_u64(&bytes[20..28]);
        let index_off = LittleEndian::read_u64(&bytes[28..36]);
        let index_len = LittleEndian::read_u64(&bytes[36..44]);

        let mut rest = &bytes[44..body_len];
        let min_len = get_varint32(&mut rest)? as usize;
        if min_len > rest.len() {
            return Err(corruption!("meta trailer min key overruns record"));
        }
        let min_key = rest[..min_len].to_vec();
        rest = &rest[min_len..];
        let max_len = get_varint32(&mut rest)? as usize;
        if max_len > rest.len() {
            return Err(corruption!("meta trailer max key overruns record"));
        }
        let max_key = rest[..max_len].to_vec();

        Ok(Self {
            epoch,
            filter_off,
            filter_len,
            index_off,
            index_len,
            min_key,
            max_key,
        })
    }
}

/// Streams one sorted memtable into the partition's logs.
pub struct TableBuilder<'a> {
    options: &'a DirOptions,
    data: &'a mut LogSink,
    index: &'a mut LogSink,
    epoch: u32,

    block: BlockBuilder,
    filter: Option<FilterBuilder>,
    /// Staged data blocks, handed to the data log a batch at a time.
    batch: Vec<u8>,
    /// Index entry for the previous data block, deferred until the next
    /// block's first key is known so the separator can be shortened.
    pending: Option<(Vec<u8>, u64, u64)>,
    index_entries: Vec<(Vec<u8>, u64, u64)>,

    min_key: Option<Vec<u8>>,
    last_key: Vec<u8>,
    num_entries: u64,
}

impl<'a> TableBuilder<'a> {
    pub fn new(
        options: &'a DirOptions,
        data: &'a mut LogSink,
        index: &'a mut LogSink,
        epoch: u32,
    ) -> Self {
        Self {
            options,
            data,
            index,
            epoch,
            block: BlockBuilder::new(options.restart_interval),
            filter: FilterBuilder::from_options(options),
            batch: Vec::new(),
            pending: None,
            index_entries: Vec::new(),
            min_key: None,
            last_key: Vec::new(),
            num_entries: 0,
        }
    }

    /// Logical offset the next data block would land at.
    fn data_offset(&self) -> u64 {
        self.data.ltell() + self.batch.len() as u64
    }

    /// Appends one record. Keys must arrive in non-decreasing order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.options.paranoid_checks && self.num_entries > 0 && key < self.last_key.as_slice() {
            return Err(corruption!("keys out of order during compaction"));
        }
        if self.block.is_empty() {
            if let Some((prev_last, off, len)) = self.pending.take() {
                let sep = separator(&prev_last, key);
                self.index_entries.push((sep, off, len));
            }
        }
        if self.min_key.is_none() {
            self.min_key = Some(key.to_vec());
        }
        self.last_key.clear();
        self.last_key.extend_from_slice(key);

        if let Some(filter) = &mut self.filter {
            filter.add_key(key);
        }
        self.block.add(key, value);
        self.num_entries += 1;

        if self.block.estimated_size() >= self.options.block_size {
            self.spill_block()?;
        }
        Ok(())
    }

    /// Closes the current data block and stages it in the batch buffer.
    fn spill_block(&mut self) -> Result<()> {
        let last_key = self.block.last_key().to_vec();
        let block = std::mem::replace(&mut self.block, BlockBuilder::new(self.options.restart_interval));
        let framed = frame_block(
            block.finish(),
            self.options.compression,
            self.options.force_compression,
        );

        let offset = self.data_offset();
        let stored_len = framed.len() as u64;
        self.batch.extend_from_slice(&framed);
        if self.options.block_padding {
            let align = self.options.block_size;
            let tail = framed.len() % align;
            if tail != 0 {
                self.batch.resize(self.batch.len() + (align - tail), 0);
            }
        }
        if self.batch.len() >= self.options.block_batch_size {
            self.data.write(&self.batch)?;
            self.batch.clear();
        }
        self.pending = Some((last_key, offset, stored_len));
        Ok(())
    }

    /// Emits the filter block, the index block, and the meta trailer.
    /// Returns the trailer's `(offset, length)` in the index log.
    pub fn finish(mut self) -> Result<(u64, u64, TableMeta)> {
        if !self.block.is_empty() {
            self.spill_block()?;
        }
        if !self.batch.is_empty() {
            self.data.write(&self.batch)?;
            self.batch.clear();
        }
        if let Some((last, off, len)) = self.pending.take() {
            self.index_entries.push((successor(&last), off, len));
        }

        // Filter block. Runs without keys skip it entirely.
        let (filter_off, filter_len) = match (&self.filter, self.num_entries) {
            (Some(filter), n) if n > 0 => {
                let framed = frame_block(filter.finish(), Compression::None, false);
                let off = self.index.ltell();
                self.index.write(&framed)?;
                (off, framed.len() as u64)
            }
            _ => (self.index.ltell(), 0),
        };

        // Index block; restart every entry so the binary search is exact.
        let mut index_block = BlockBuilder::new(1);
        for (key, off, len) in &self.index_entries {
            let mut handle = Vec::with_capacity(12);
            put_varint64(&mut handle, *off);
            put_varint64(&mut handle, *len);
            index_block.add(key, &handle);
        }
        let framed = frame_block(
            index_block.finish(),
            self.options.index_compression,
            self.options.force_compression,
        );
        let index_off = self.index.ltell();
        let index_len = framed.len() as u64;
        self.index.write(&framed)?;

        let meta = TableMeta {
            epoch: self.epoch,
            filter_off,
            filter_len,
            index_off,
            index_len,
            min_key: self.min_key.unwrap_or_default(),
            max_key: self.last_key.clone(),
        };
        let encoded = meta.encode();
        let meta_off = self.index.ltell();
        self.index.write(&encoded)?;
        Ok((meta_off, encoded.len() as u64, meta))
    }
}

/// One loaded sorted run on the read path: parsed trailer, filter bytes,
/// and the index block held in memory; data blocks are fetched on demand.
pub struct Table {
    pub meta: TableMeta,
    filter: Vec<u8>,
    index: Block,
    empty: bool,
}

impl Table {
    /// Loads a run from its meta trailer location in the index log.
    pub fn load(
        index_file: &dyn RandomAccessFile,
        meta_off: u64,
        meta_len: u64,
        options: &DirOptions,
    ) -> Result<Self> {
        let meta_bytes = index_file.read_at(meta_off, meta_len as usize)?;
        let meta = TableMeta::decode(&meta_bytes)?;

        let filter = if meta.filter_len > 0 {
            let stored = index_file.read_at(meta.filter_off, meta.filter_len as usize)?;
            decode_block(&stored, options.verify_checksums)?
        } else {
            Vec::new()
        };

        let stored = index_file.read_at(meta.index_off, meta.index_len as usize)?;
        let index = Block::new(decode_block(&stored, options.verify_checksums)?)?;
        let empty = match index.iter().next() {
            None => true,
            Some(entry) => {
                entry?;
                false
            }
        };

        Ok(Self {
            meta,
            filter,
            index,
            empty,
        })
    }

    /// Appends every value stored under `key`, in insertion order, to
    /// `out`. Returns the number of values found.
    pub fn lookup(
        &self,
        data_file: &dyn RandomAccessFile,
        key: &[u8],
        options: &DirOptions,
        out: &mut Vec<Vec<u8>>,
    ) -> Result<usize> {
        if self.empty {
            return Ok(0);
        }
        if key < self.meta.min_key.as_slice() || key > self.meta.max_key.as_slice() {
            return Ok(0);
        }
        if !may_match(&self.filter, key)? {
            return Ok(0);
        }

        let mut found = 0;
        let mut index_iter = self.index.iter();
        index_iter.seek(key)?;
        for entry in index_iter {
            let (_, handle) = entry?;
            let mut handle = handle.as_slice();
            let offset = get_varint64(&mut handle)?;
            let length = get_varint64(&mut handle)? as usize;
            if length < BLOCK_TRAILER_LEN {
                return Err(corruption!("index entry with undersized block"));
            }

            let stored = data_file.read_at(offset, length)?;
            let block = Block::new(decode_block(&stored, options.verify_checksums)?)?;
            let mut block_iter = block.iter();
            block_iter.seek(key)?;

            let mut exhausted_while_matching = false;
            let mut saw_any = false;
            for record in block_iter {
                let (k, v) = record?;
                saw_any = true;
                if k.as_slice() != key {
                    // Past the key; duplicates cannot continue elsewhere.
                    return Ok(found);
                }
                out.push(v);
                found += 1;
                exhausted_while_matching = true;
            }
            if !saw_any || !exhausted_while_matching {
                // Either the block held nothing at or after the key, or it
                // ended on a larger key; no point visiting further blocks.
                return Ok(found);
            }
            // The block ended exactly on the key; duplicates may spill
            // into the next block.
        }
        Ok(found)
    }
}
