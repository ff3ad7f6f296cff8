//! Key-sorted block encoding shared by data and index blocks.
//!
//! ## Block Layout
//!
//! ```text
//! +--------------------------------------------------+
//! | entry 0: varint shared | varint unshared |       |
//! |          varint value_len | key tail | value     |
//! +--------------------------------------------------+
//! | entry 1 ...                                      |
//! +--------------------------------------------------+
//! | restart offsets (u32 LE each)                    |
//! +--------------------------------------------------+
//! | restart count (u32 LE)                           |
//! +--------------------------------------------------+
//! ```
//!
//! Keys share a prefix with their predecessor; every `restart_interval`
//! entries the shared prefix resets to zero and the entry's offset is
//! recorded so readers can binary-search the restart array.
//!
//! The compression byte and CRC32C trailer are applied by the table layer
//! after the block payload is finished.

use std::cmp::Ordering;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::coding::{get_varint32, put_varint32};
use crate::corruption;
use crate::error::Result;

/// Builds one block. Create a fresh builder per block.
pub struct BlockBuilder {
    buf: Vec<u8>,
    restarts: Vec<u32>,
    restart_interval: u32,
    counter: u32,
    num_entries: u32,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(restart_interval: u32) -> Self {
        Self {
            buf: Vec::new(),
            restarts: Vec::new(),
            restart_interval,
            counter: 0,
            num_entries: 0,
            last_key: Vec::new(),
        }
    }

    /// Appends an entry. Keys must arrive in non-decreasing order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        let shared = if self.counter % self.restart_interval == 0 {
            self.restarts.push(self.buf.len() as u32);
            0
        } else {
            shared_prefix_len(&self.last_key, key)
        };

        put_varint32(&mut self.buf, shared as u32);
        put_varint32(&mut self.buf, (key.len() - shared) as u32);
        put_varint32(&mut self.buf, value.len() as u32);
        self.buf.extend_from_slice(&key[shared..]);
        self.buf.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.counter += 1;
        self.num_entries += 1;
    }

    /// Appends the restart array and returns the finished payload.
    pub fn finish(mut self) -> Vec<u8> {
        if self.restarts.is_empty() {
            self.restarts.push(0);
        }
        for &offset in &self.restarts {
            self.buf.write_u32::<LittleEndian>(offset).unwrap();
        }
        self.buf
            .write_u32::<LittleEndian>(self.restarts.len() as u32)
            .unwrap();
        self.buf
    }

    /// Payload size if `finish` were called now.
    pub fn estimated_size(&self) -> usize {
        self.buf.len() + self.restarts.len().max(1) * 4 + 4
    }

    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    pub fn num_entries(&self) -> u32 {
        self.num_entries
    }

    /// Last key added, used by the table layer to compute separators.
    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }
}

fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// A parsed, immutable block payload.
pub struct Block {
    data: Vec<u8>,
    /// Offset where the restart array begins (end of entry data).
    restarts_end: usize,
    num_restarts: usize,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        if data.len() < 4 {
            return Err(corruption!("block too short: {} bytes", data.len()));
        }
        let num_restarts = LittleEndian::read_u32(&data[data.len() - 4..]) as usize;
        let restart_bytes = num_restarts
            .checked_mul(4)
            .and_then(|b| b.checked_add(4))
            .ok_or_else(|| corruption!("bad restart count {num_restarts}"))?;
        if restart_bytes > data.len() {
            return Err(corruption!(
                "restart array ({num_restarts} entries) larger than block ({} bytes)",
                data.len()
            ));
        }
        let restarts_end = data.len() - restart_bytes;
        Ok(Self {
            data,
            restarts_end,
            num_restarts,
        })
    }

    fn restart_offset(&self, i: usize) -> usize {
        let pos = self.restarts_end + 4 * i;
        LittleEndian::read_u32(&self.data[pos..]) as usize
    }

    /// Key at a restart point (no shared prefix by construction).
    fn restart_key(&self, i: usize) -> Result<&[u8]> {
        let mut input = &self.data[self.restart_offset(i)..self.restarts_end];
        let shared = get_varint32(&mut input)? as usize;
        let unshared = get_varint32(&mut input)? as usize;
        let _value_len = get_varint32(&mut input)?;
        if shared != 0 {
            return Err(corruption!("restart entry has shared prefix {shared}"));
        }
        if unshared > input.len() {
            return Err(corruption!("restart key overruns block"));
        }
        Ok(&input[..unshared])
    }

    pub fn iter(&self) -> BlockIter<'_> {
        BlockIter {
            block: self,
            offset: 0,
            last_key: Vec::new(),
        }
    }
}

/// Sequential cursor over a block; `seek` positions it so the following
/// `next` returns the first entry with key >= target.
pub struct BlockIter<'a> {
    block: &'a Block,
    offset: usize,
    last_key: Vec<u8>,
}

impl<'a> BlockIter<'a> {
    pub fn seek_to_first(&mut self) {
        self.offset = 0;
        self.last_key.clear();
    }

    pub fn seek(&mut self, target: &[u8]) -> Result<()> {
        if self.block.restarts_end == 0 {
            // No entries; leave the iterator exhausted.
            self.offset = 0;
            self.last_key.clear();
            return Ok(());
        }
        // Greatest restart point whose key is < target; scanning forward
        // from there reaches the first entry >= target.
        let mut left = 0usize;
        let mut right = self.block.num_restarts;
        while left < right {
            let mid = left + (right - left) / 2;
            match self.block.restart_key(mid)?.cmp(target) {
                Ordering::Less => left = mid + 1,
                _ => right = mid,
            }
        }
        let restart = left.saturating_sub(1);

        self.offset = self.block.restart_offset(restart);
        self.last_key.clear();

        loop {
            let saved_offset = self.offset;
            let saved_key = self.last_key.clone();
            match self.next() {
                Some(Ok((key, _))) => {
                    if key.as_slice() >= target {
                        self.offset = saved_offset;
                        self.last_key = saved_key;
                        return Ok(());
                    }
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(()), // every key < target; iterator is exhausted
            }
        }
    }
}

impl<'a> Iterator for BlockIter<'a> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.block.restarts_end {
            return None;
        }
        let mut input = &self.block.data[self.offset..self.block.restarts_end];
        let before = input.len();

        let header = (|| -> Result<(usize, usize, usize)> {
            let shared = get_varint32(&mut input)? as usize;
            let unshared = get_varint32(&mut input)? as usize;
            let value_len = get_varint32(&mut input)? as usize;
            Ok((shared, unshared, value_len))
        })();
        let (shared, unshared, value_len) = match header {
            Ok(h) => h,
            Err(e) => return Some(Err(e)),
        };

        if shared > self.last_key.len() || unshared + value_len > input.len() {
            return Some(Err(corruption!("block entry out of bounds")));
        }

        let mut key = Vec::with_capacity(shared + unshared);
        key.extend_from_slice(&self.last_key[..shared]);
        key.extend_from_slice(&input[..unshared]);
        let value = input[unshared..unshared + value_len].to_vec();

        let consumed = (before - input.len()) + unshared + value_len;
        self.offset += consumed;
        self.last_key.clear();
        self.last_key.extend_from_slice(&key);

        Some(Ok((key, value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_block(entries: &[(&[u8], &[u8])], restart_interval: u32) -> Block {
        let mut builder = BlockBuilder::new(restart_interval);
        for (key, value) in entries {
            builder.add(key, value);
        }
        Block::new(builder.finish()).expect("valid block")
    }

    #[test]
    fn test_build_and_scan() {
        let entries: Vec<(&[u8], &[u8])> = vec![
            (b"apple", b"fruit"),
            (b"application", b"software"),
            (b"banana", b"fruit"),
            (b"band", b"music"),
            (b"bandana", b"clothing"),
        ];
        let block = build_block(&entries, 2);

        let collected: Vec<_> = block.iter().map(|e| e.unwrap()).collect();
        assert_eq!(collected.len(), entries.len());
        for ((key, value), (want_key, want_value)) in collected.iter().zip(&entries) {
            assert_eq!(key.as_slice(), *want_key);
            assert_eq!(value.as_slice(), *want_value);
        }
    }

    #[test]
    fn test_seek_exact_and_between() {
        let entries: Vec<(&[u8], &[u8])> = vec![
            (b"apple", b"fruit"),
            (b"application", b"software"),
            (b"banana", b"fruit"),
            (b"band", b"music"),
            (b"bandana", b"clothing"),
        ];
        let block = build_block(&entries, 2);

        let mut iter = block.iter();
        iter.seek(b"band").unwrap();
        let (key, value) = iter.next().unwrap().unwrap();
        assert_eq!(key, b"band");
        assert_eq!(value, b"music");

        let mut iter = block.iter();
        iter.seek(b"bana").unwrap();
        let (key, _) = iter.next().unwrap().unwrap();
        assert_eq!(key, b"banana");

        let mut iter = block.iter();
        iter.seek(b"zzz").unwrap();
        assert!(iter.next().is_none());

        let mut iter = block.iter();
        iter.seek(b"").unwrap();
        let (key, _) = iter.next().unwrap().unwrap();
        assert_eq!(key, b"apple");
    }

    #[test]
    fn test_seek_across_many_restarts() {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..200)
            .map(|i| {
                (
                    format!("key_{i:05}").into_bytes(),
                    format!("value_{i:05}").into_bytes(),
                )
            })
            .collect();
        let refs: Vec<(&[u8], &[u8])> = entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();
        let block = build_block(&refs, 16);

        for probe in [0usize, 1, 15, 16, 17, 99, 198, 199] {
            let target = format!("key_{probe:05}");
            let mut iter = block.iter();
            iter.seek(target.as_bytes()).unwrap();
            let (key, value) = iter.next().unwrap().unwrap();
            assert_eq!(key, target.as_bytes());
            assert_eq!(value, format!("value_{probe:05}").as_bytes());
        }
    }

    #[test]
    fn test_single_entry_block() {
        let block = build_block(&[(b"only", b"one")], 16);
        let mut iter = block.iter();
        iter.seek(b"only").unwrap();
        let (key, value) = iter.next().unwrap().unwrap();
        assert_eq!(key, b"only");
        assert_eq!(value, b"one");
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_duplicate_keys_scan_in_order() {
        let entries: Vec<(&[u8], &[u8])> =
            vec![(b"k1", b"v1"), (b"k1", b"v2"), (b"k1", b"v3"), (b"k2", b"v4")];
        let block = build_block(&entries, 2);

        let mut iter = block.iter();
        iter.seek(b"k1").unwrap();
        let values: Vec<_> = iter
            .by_ref()
            .map(|e| e.unwrap())
            .take_while(|(k, _)| k == b"k1")
            .map(|(_, v)| v)
            .collect();
        assert_eq!(values, vec![b"v1".to_vec(), b"v2".to_vec(), b"v3".to_vec()]);
    }

    #[test]
    fn test_empty_block_is_valid() {
        let builder = BlockBuilder::new(16);
        let block = Block::new(builder.finish()).unwrap();
        assert!(block.iter().next().is_none());
        let mut iter = block.iter();
        iter.seek(b"anything").unwrap();
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_truncated_block_is_corruption() {
        assert!(Block::new(vec![0u8; 2]).is_err());
        // Restart count pointing past the payload.
        let mut bogus = vec![0u8; 8];
        LittleEndian::write_u32(&mut bogus[4..], 100);
        assert!(Block::new(bogus).is_err());
    }
}
