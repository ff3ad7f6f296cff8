//! Directory writer and reader.
//!
//! A directory is a set of `2^lg_parts` independent partitions plus a
//! `MANIFEST` footer. The writer routes each append to a partition by key
//! hash, closes epochs on demand, and commits the footer on `finish`; the
//! reader loads the footer, then serves point lookups by walking a
//! partition's sorted runs.
//!
//! ## Directory Layout
//!
//! ```text
//! <dir>/MANIFEST            directory footer, written once on finish
//! <dir>/partition_<i>.data  data blocks
//! <dir>/partition_<i>.idx   filter/index blocks, meta trailers, epoch markers
//! <dir>/partition_<i>.side  opaque side-channel stream (partition 0 only)
//! ```
//!
//! ## Footer Layout
//!
//! ```text
//! +-----------+-------------+-------------+---------------+
//! | magic u64 | version u32 | lg_parts u32| num_epochs u32|
//! +-----------+-------------+-------------+---------------+
//! | per partition: count u32, count x (offset u64, len u64)|
//! +--------------------------------------------------------+
//! | crc32c u32 over everything above                       |
//! +--------------------------------------------------------+
//! ```

use std::hash::Hasher as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use twox_hash::XxHash32;

use crate::checksum::crc32c;
use crate::env::{FileSystem, PosixFs, RandomAccessFile, ThreadPool};
use crate::error::{Error, Result};
use crate::options::DirOptions;
use crate::partition::{data_file_name, index_file_name, side_file_name, Partition};
use crate::table::Table;
use crate::{corruption, invalid_argument};

/// Magic opening the directory footer.
pub const MANIFEST_MAGIC: u64 = 0x706c_6673_6469_7231;
/// On-disk format version the reader understands.
pub const FORMAT_VERSION: u32 = 1;
const MANIFEST_FILE: &str = "MANIFEST";

/// Key-to-partition router shared by the writer and the reader.
fn route(key: &[u8], lg_parts: u8) -> usize {
    if lg_parts == 0 {
        return 0;
    }
    let mut hasher = XxHash32::with_seed(0);
    hasher.write(key);
    hasher.finish() as usize & ((1usize << lg_parts) - 1)
}

/// Single-writer handle for one directory.
pub struct DirWriter {
    options: DirOptions,
    fs: Arc<dyn FileSystem>,
    dir: PathBuf,
    partitions: Vec<Partition>,
    /// Keeps the workers alive for the writer's lifetime; partitions hold
    /// their own handles for submission.
    _pool: Arc<ThreadPool>,
    epoch: u32,
    dirty: bool,
    finish_status: Option<Result<()>>,
}

impl DirWriter {
    /// Opens `dir` for writing with the default filesystem and a fresh
    /// pool of `2^lg_parts` compaction workers.
    pub fn open(options: DirOptions, dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(options, dir, PosixFs::shared(), None)
    }

    /// Opening with an injected filesystem and/or compaction pool.
    pub fn open_with(
        options: DirOptions,
        dir: impl AsRef<Path>,
        fs: Arc<dyn FileSystem>,
        pool: Option<Arc<ThreadPool>>,
    ) -> Result<Self> {
        options.validate()?;
        let dir = dir.as_ref().to_path_buf();
        fs.create_dir_all(&dir)?;
        let pool = pool.unwrap_or_else(|| Arc::new(ThreadPool::new_fixed(options.num_parts())));

        let partitions = (0..options.num_parts() as u32)
            .map(|part| Partition::create(&options, &fs, &dir, part, Arc::clone(&pool)))
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            dir = %dir.display(),
            parts = options.num_parts(),
            budget = options.total_memtable_budget,
            "directory opened for writing"
        );
        Ok(Self {
            options,
            fs,
            dir,
            partitions,
            _pool: pool,
            epoch: 0,
            dirty: false,
            finish_status: None,
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.finish_status.is_some() {
            return Err(Error::AlreadyFinished);
        }
        Ok(())
    }

    /// Appends one record to `epoch`, which must be the writer's current
    /// epoch. Blocks only when the target partition has both buffers in
    /// use.
    pub fn append(&mut self, key: &[u8], value: &[u8], epoch: u32) -> Result<()> {
        self.check_open()?;
        if epoch != self.epoch {
            return Err(invalid_argument!(
                "append to epoch {epoch}, current epoch is {}",
                self.epoch
            ));
        }
        if self.options.fixed_kv {
            if key.len() != self.options.key_size || value.len() != self.options.value_size {
                return Err(invalid_argument!(
                    "fixed_kv requires {}-byte keys and {}-byte values",
                    self.options.key_size,
                    self.options.value_size
                ));
            }
        } else if key.len() > self.options.key_size {
            return Err(invalid_argument!(
                "key length {} exceeds configured maximum {}",
                key.len(),
                self.options.key_size
            ));
        }

        let part = route(key, self.options.lg_parts);
        self.partitions[part].dbuf.add(key, value)?;
        self.dirty = true;
        Ok(())
    }

    /// Closes `epoch`: drains every partition, records the boundary in
    /// each index log, and advances the writer's epoch counter.
    pub fn epoch_flush(&mut self, epoch: u32) -> Result<()> {
        self.check_open()?;
        if epoch != self.epoch {
            return Err(invalid_argument!(
                "epoch flush for {epoch}, current epoch is {}",
                self.epoch
            ));
        }
        for partition in &self.partitions {
            partition.dbuf.flush(false)?;
        }
        for partition in &self.partitions {
            partition.dbuf.wait()?;
        }
        for partition in &self.partitions {
            partition.backend.write_epoch_marker(epoch)?;
        }
        self.epoch += 1;
        for partition in &self.partitions {
            partition.backend.set_epoch(self.epoch);
        }
        self.dirty = false;
        tracing::info!(epoch, "epoch closed");
        Ok(())
    }

    /// Forces a compaction of every partition's active buffer and waits
    /// for the pipeline to drain. Does not sync.
    pub fn flush(&mut self) -> Result<()> {
        self.check_open()?;
        for partition in &self.partitions {
            partition.dbuf.flush(false)?;
        }
        for partition in &self.partitions {
            partition.dbuf.wait()?;
        }
        Ok(())
    }

    /// Syncs data already scheduled for compaction to storage.
    pub fn sync(&mut self) -> Result<()> {
        self.check_open()?;
        for partition in &self.partitions {
            partition.dbuf.sync(false)?;
        }
        Ok(())
    }

    /// Appends opaque bytes to the directory's side stream.
    pub fn io_append(&mut self, data: &[u8]) -> Result<usize> {
        self.check_open()?;
        self.partitions[0].backend.io_append(data)
    }

    /// Flushes buffered side-stream bytes to the file.
    pub fn io_flush(&mut self) -> Result<()> {
        self.check_open()?;
        self.partitions[0].backend.io_flush()
    }

    /// Flushes and syncs the side stream.
    pub fn io_sync(&mut self) -> Result<()> {
        self.check_open()?;
        self.partitions[0].backend.io_sync()
    }

    /// Current epoch accepting appends.
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Finalizes the directory: closes the current epoch if it has
    /// unflushed appends, drains and closes every partition, then commits
    /// the footer. Idempotent; repeated calls return the first outcome.
    pub fn finish(&mut self) -> Result<()> {
        if let Some(status) = &self.finish_status {
            return status.clone();
        }
        let result = self.do_finish();
        self.finish_status = Some(result.clone());
        result
    }

    fn do_finish(&mut self) -> Result<()> {
        if self.dirty {
            self.epoch_flush(self.epoch)?;
        }
        for partition in &self.partitions {
            partition.dbuf.finish()?;
        }
        self.write_manifest()?;
        tracing::info!(dir = %self.dir.display(), epochs = self.epoch, "directory finished");
        Ok(())
    }

    fn write_manifest(&self) -> Result<()> {
        let mut out = Vec::new();
        out.write_u64::<LittleEndian>(MANIFEST_MAGIC).unwrap();
        out.write_u32::<LittleEndian>(FORMAT_VERSION).unwrap();
        out.write_u32::<LittleEndian>(u32::from(self.options.lg_parts))
            .unwrap();
        out.write_u32::<LittleEndian>(self.epoch).unwrap();
        for partition in &self.partitions {
            let tables = partition.backend.tables_snapshot();
            out.write_u32::<LittleEndian>(tables.len() as u32).unwrap();
            for (offset, len) in tables {
                out.write_u64::<LittleEndian>(offset).unwrap();
                out.write_u64::<LittleEndian>(len).unwrap();
            }
        }
        let crc = crc32c(&out);
        out.write_u32::<LittleEndian>(crc).unwrap();

        let mut file = self.fs.create(&self.dir.join(MANIFEST_FILE))?;
        file.append(&out)?;
        file.sync()?;
        file.close()
    }
}

/// Unfinished directories are not readable; make an abandoned writer
/// commit what it has. Errors cannot surface from `drop` and are logged
/// instead.
impl Drop for DirWriter {
    fn drop(&mut self) {
        if self.finish_status.is_none() {
            if let Err(err) = self.finish() {
                tracing::warn!(error = %err, "implicit finish on drop failed");
            }
        }
    }
}

struct PartitionReader {
    data: Box<dyn RandomAccessFile>,
    /// Sorted runs in compaction order, oldest first.
    tables: Vec<Table>,
}

/// Read-only handle for a finished directory.
pub struct DirReader {
    options: DirOptions,
    partitions: Vec<PartitionReader>,
    side: Option<Box<dyn RandomAccessFile>>,
    num_epochs: u32,
}

impl DirReader {
    pub fn open(options: DirOptions, dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(options, dir, PosixFs::shared())
    }

    pub fn open_with(
        options: DirOptions,
        dir: impl AsRef<Path>,
        fs: Arc<dyn FileSystem>,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        let manifest = fs.open(&dir.join(MANIFEST_FILE))?;
        let len = manifest.len()? as usize;
        let bytes = manifest.read_at(0, len)?;
        let (lg_parts, num_epochs, table_lists) = parse_manifest(&bytes)?;

        // The footer is authoritative for the partition count; everything
        // else follows the caller's options.
        let mut options = options;
        options.lg_parts = lg_parts;

        let mut partitions = Vec::with_capacity(table_lists.len());
        for (part, locations) in table_lists.into_iter().enumerate() {
            let part = part as u32;
            let index = fs.open(&dir.join(index_file_name(part)))?;
            let data = fs.open(&dir.join(data_file_name(part)))?;
            let mut tables = Vec::with_capacity(locations.len());
            for (offset, len) in locations {
                match Table::load(&*index, offset, len, &options) {
                    Ok(table) => tables.push(table),
                    // A run without a decodable trailer never committed;
                    // skip it the same way an epoch crash would be skipped.
                    Err(err) => {
                        tracing::warn!(
                            partition = part,
                            offset,
                            error = %err,
                            "skipping undecodable sorted run"
                        );
                    }
                }
            }
            partitions.push(PartitionReader { data, tables });
        }

        let side_path = dir.join(side_file_name(0));
        let side = if fs.exists(&side_path) {
            Some(fs.open(&side_path)?)
        } else {
            None
        };

        Ok(Self {
            options,
            partitions,
            side,
            num_epochs,
        })
    }

    /// Number of epochs the directory was finished with.
    pub fn epochs(&self) -> u32 {
        self.num_epochs
    }

    /// Looks up every value recorded under `key`.
    ///
    /// With `unique_keys`, runs are visited newest to oldest and the last
    /// value written in the newest epoch containing the key is returned.
    /// Otherwise every match across all epochs is concatenated in
    /// insertion order. Missing keys yield an empty buffer.
    pub fn read_all(&self, key: &[u8]) -> Result<Vec<u8>> {
        let part = &self.partitions[route(key, self.options.lg_parts)];
        let mut values: Vec<Vec<u8>> = Vec::new();
        if self.options.unique_keys {
            for table in part.tables.iter().rev() {
                table.lookup(&*part.data, key, &self.options, &mut values)?;
                if let Some(last) = values.pop() {
                    return Ok(last);
                }
            }
            Ok(Vec::new())
        } else {
            for table in &part.tables {
                table.lookup(&*part.data, key, &self.options, &mut values)?;
            }
            Ok(values.concat())
        }
    }

    /// Reads from the side-channel stream. Reads past the end are
    /// truncated, like `pread`.
    pub fn io_pread(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let side = self
            .side
            .as_ref()
            .ok_or_else(|| invalid_argument!("directory has no side log"))?;
        let total = side.len()?;
        if offset >= total {
            return Ok(Vec::new());
        }
        let len = len.min((total - offset) as usize);
        side.read_at(offset, len)
    }
}

type TableLists = Vec<Vec<(u64, u64)>>;

fn parse_manifest(bytes: &[u8]) -> Result<(u8, u32, TableLists)> {
    if bytes.len() < 24 {
        return Err(corruption!("manifest too short: {} bytes", bytes.len()));
    }
    let body_len = bytes.len() - 4;
    let stored_crc = LittleEndian::read_u32(&bytes[body_len..]);
    if stored_crc != crc32c(&bytes[..body_len]) {
        return Err(corruption!("manifest checksum mismatch"));
    }
    let magic = LittleEndian::read_u64(&bytes[..8]);
    if magic != MANIFEST_MAGIC {
        return Err(corruption!("bad manifest magic {magic:#018x}"));
    }
    let version = LittleEndian::read_u32(&bytes[8..12]);
    if version != FORMAT_VERSION {
        return Err(Error::NotSupported(format!(
            "manifest format version {version}"
        )));
    }
    let lg_parts = LittleEndian::read_u32(&bytes[12..16]);
    if lg_parts > 10 {
        return Err(corruption!("manifest lg_parts {lg_parts} out of range"));
    }
    let num_epochs = LittleEndian::read_u32(&bytes[16..20]);

    let mut rest = &bytes[20..body_len];
    let num_parts = 1usize << lg_parts;
    let mut table_lists = Vec::with_capacity(num_parts);
    for _ in 0..num_parts {
        if rest.len() < 4 {
            return Err(corruption!("manifest truncated in partition header"));
        }
        let count = LittleEndian::read_u32(&rest[..4]) as usize;
        rest = &rest[4..];
        if rest.len() < count * 16 {
            return Err(corruption!("manifest truncated in table list"));
        }
        let mut locations = Vec::with_capacity(count);
        for i in 0..count {
            let offset = LittleEndian::read_u64(&rest[i * 16..]);
            let len = LittleEndian::read_u64(&rest[i * 16 + 8..]);
            locations.push((offset, len));
        }
        rest = &rest[count * 16..];
        table_lists.push(locations);
    }
    if !rest.is_empty() {
        return Err(corruption!("{} trailing manifest bytes", rest.len()));
    }
    Ok((lg_parts as u8, num_epochs, table_lists))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::WritableFile;
    use crate::options::{Compression, FilterKind};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Test harness mirroring the writer/reader lifecycle: writes go to a
    /// lazily opened writer, the first read finishes it and opens the
    /// reader.
    struct DirHarness {
        // Declared before `tmp` so the writer's implicit finish still has
        // a directory to write into when the harness drops.
        writer: Option<DirWriter>,
        reader: Option<DirReader>,
        tmp: TempDir,
        options: DirOptions,
        epoch: u32,
    }

    impl DirHarness {
        fn new(options: DirOptions) -> Self {
            Self {
                writer: None,
                reader: None,
                tmp: tempfile::tempdir().unwrap(),
                options,
                epoch: 0,
            }
        }

        fn path(&self) -> PathBuf {
            self.tmp.path().join("plfs")
        }

        fn writer(&mut self) -> &mut DirWriter {
            if self.writer.is_none() {
                self.writer =
                    Some(DirWriter::open(self.options.clone(), self.path()).unwrap());
            }
            self.writer.as_mut().unwrap()
        }

        fn write(&mut self, key: &str, value: &str) {
            let epoch = self.epoch;
            self.writer()
                .append(key.as_bytes(), value.as_bytes(), epoch)
                .unwrap();
        }

        fn make_epoch(&mut self) {
            let epoch = self.epoch;
            self.writer().epoch_flush(epoch).unwrap();
            self.epoch += 1;
        }

        fn finish(&mut self) {
            if let Some(mut writer) = self.writer.take() {
                writer.finish().unwrap();
            }
        }

        fn read(&mut self, key: &str) -> String {
            self.finish();
            if self.reader.is_none() {
                self.reader =
                    Some(DirReader::open(self.options.clone(), self.path()).unwrap());
            }
            let bytes = self.reader.as_ref().unwrap().read_all(key.as_bytes()).unwrap();
            String::from_utf8(bytes).unwrap()
        }
    }

    fn small_options() -> DirOptions {
        DirOptions::new()
            .total_memtable_budget(1 << 20)
            .block_batch_size(256 << 10)
            .block_size(64 << 10)
            .verify_checksums(true)
            .paranoid_checks(true)
    }

    #[test]
    fn test_empty_directory() {
        let mut h = DirHarness::new(small_options());
        h.make_epoch();
        assert_eq!(h.read("non-exists"), "");
    }

    #[test]
    fn test_single_epoch_roundtrip() {
        let mut h = DirHarness::new(small_options());
        for i in 1..=6 {
            h.write(&format!("k{i}"), &format!("v{i}"));
        }
        h.make_epoch();
        for i in 1..=6 {
            assert_eq!(h.read(&format!("k{i}")), format!("v{i}"));
            assert_eq!(h.read(&format!("k{i}.1")), "");
        }
    }

    #[test]
    fn test_multi_epoch_accumulation() {
        let mut h = DirHarness::new(small_options());
        h.write("k1", "v1");
        h.write("k2", "v2");
        h.make_epoch();
        h.write("k1", "v3");
        h.write("k2", "v4");
        h.make_epoch();
        h.write("k1", "v5");
        h.write("k2", "v6");
        h.make_epoch();
        assert_eq!(h.read("k1"), "v1v3v5");
        assert_eq!(h.read("k1.1"), "");
        assert_eq!(h.read("k2"), "v2v4v6");
    }

    #[test]
    fn test_multi_epoch_snappy() {
        let mut h = DirHarness::new(
            small_options()
                .compression(Compression::Snappy)
                .force_compression(true),
        );
        h.write("k1", "v1");
        h.write("k2", "v2");
        h.make_epoch();
        h.write("k1", "v3");
        h.write("k2", "v4");
        h.make_epoch();
        h.write("k1", "v5");
        h.write("k2", "v6");
        h.make_epoch();
        assert_eq!(h.read("k1"), "v1v3v5");
        assert_eq!(h.read("k1.1"), "");
        assert_eq!(h.read("k2"), "v2v4v6");
    }

    #[test]
    fn test_no_filter() {
        let mut h = DirHarness::new(small_options().bf_bits_per_key(0));
        h.write("k1", "v1");
        h.write("k2", "v2");
        h.make_epoch();
        h.write("k3", "v3");
        h.write("k4", "v4");
        h.make_epoch();
        assert_eq!(h.read("k1"), "v1");
        assert_eq!(h.read("k2"), "v2");
        assert_eq!(h.read("k3"), "v3");
        assert_eq!(h.read("k4"), "v4");
        assert_eq!(h.read("k2.1"), "");
    }

    #[test]
    fn test_cuckoo_filter_directory() {
        let mut h = DirHarness::new(
            small_options()
                .filter(FilterKind::Cuckoo)
                .bf_bits_per_key(16),
        );
        for i in 0..64 {
            h.write(&format!("k{i:03}"), &format!("v{i:03}"));
        }
        h.make_epoch();
        for i in 0..64 {
            assert_eq!(h.read(&format!("k{i:03}")), format!("v{i:03}"));
        }
        assert_eq!(h.read("absent"), "");
    }

    #[test]
    fn test_duplicates_within_epoch() {
        let mut h = DirHarness::new(small_options());
        h.write("k1", "v1");
        h.write("k1", "v2");
        h.make_epoch();
        h.write("k0", "v3");
        h.write("k1", "v4");
        h.write("k1", "v5");
        h.make_epoch();
        h.write("k1", "v6");
        h.write("k1", "v7");
        h.write("k5", "v8");
        h.make_epoch();
        h.write("k1", "v9");
        h.make_epoch();
        assert_eq!(h.read("k1"), "v1v2v4v5v6v7v9");
        assert_eq!(h.read("k0"), "v3");
        assert_eq!(h.read("k5"), "v8");
    }

    #[test]
    fn test_unique_keys_newest_epoch_wins() {
        let mut h = DirHarness::new(small_options().unique_keys(true));
        h.write("k1", "v1");
        h.write("k2", "old");
        h.make_epoch();
        h.write("k1", "v2");
        h.make_epoch();
        h.write("k1", "v3a");
        h.write("k1", "v3b"); // same epoch: last write wins
        h.make_epoch();
        assert_eq!(h.read("k1"), "v3b");
        assert_eq!(h.read("k2"), "old");
        assert_eq!(h.read("k9"), "");
    }

    #[test]
    fn test_large_batch_two_epochs() {
        let mut h = DirHarness::new(
            DirOptions::new()
                .lg_parts(2)
                .total_memtable_budget(1 << 20)
                .block_size(4 << 10)
                .block_batch_size(64 << 10),
        );
        let value = "x".repeat(32);
        let batch = 64 << 10;
        for _ in 0..2 {
            for i in 0..batch {
                h.write(&format!("k{i:07}"), &value);
            }
            h.make_epoch();
        }
        for i in (0..batch).step_by(499) {
            assert_eq!(h.read(&format!("k{i:07}")).len(), 64, "k{i:07}");
        }
        assert_eq!(h.read(&format!("k{:07}", batch - 1)).len(), 64);
        assert_eq!(h.read("kx"), "");
    }

    #[test]
    fn test_reopen_is_deterministic() {
        let mut h = DirHarness::new(small_options());
        for i in 0..100 {
            h.write(&format!("key-{i:04}"), &format!("val-{i:04}"));
        }
        h.make_epoch();
        h.finish();

        let first = DirReader::open(h.options.clone(), h.path()).unwrap();
        let second = DirReader::open(h.options.clone(), h.path()).unwrap();
        for i in 0..100 {
            let key = format!("key-{i:04}");
            assert_eq!(
                first.read_all(key.as_bytes()).unwrap(),
                second.read_all(key.as_bytes()).unwrap()
            );
        }
        assert_eq!(first.epochs(), 1);
    }

    #[test]
    fn test_finish_is_idempotent() {
        let mut h = DirHarness::new(small_options());
        h.write("k1", "v1");
        h.make_epoch();
        let writer = h.writer();
        writer.finish().unwrap();
        writer.finish().unwrap(); // same outcome, no second footer

        assert_eq!(
            writer.append(b"k2", b"v2", 1),
            Err(Error::AlreadyFinished)
        );
        assert_eq!(writer.epoch_flush(1), Err(Error::AlreadyFinished));
        assert_eq!(writer.flush(), Err(Error::AlreadyFinished));
        assert_eq!(writer.sync(), Err(Error::AlreadyFinished));
        h.writer = None;
        assert_eq!(h.read("k1"), "v1");
    }

    #[test]
    fn test_epoch_ordering_enforced() {
        let mut h = DirHarness::new(small_options());
        h.write("k1", "v1");
        h.make_epoch();

        let writer = h.writer();
        assert!(matches!(
            writer.epoch_flush(0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            writer.append(b"k2", b"v2", 0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            writer.append(b"k2", b"v2", 5),
            Err(Error::InvalidArgument(_))
        ));
        writer.append(b"k2", b"v2", 1).unwrap();
    }

    #[test]
    fn test_key_length_limit() {
        let mut h = DirHarness::new(small_options().key_size(4));
        let writer = h.writer();
        writer.append(b"1234", b"v", 0).unwrap();
        assert!(matches!(
            writer.append(b"12345", b"v", 0),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_fixed_kv_sizes_enforced() {
        let mut h = DirHarness::new(
            small_options().fixed_kv(true).key_size(8).value_size(4),
        );
        let writer = h.writer();
        writer.append(b"12345678", b"abcd", 0).unwrap();
        assert!(matches!(
            writer.append(b"short", b"abcd", 0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            writer.append(b"12345678", b"toolong", 0),
            Err(Error::InvalidArgument(_))
        ));
        drop(h.writer.take());

        let reader = DirReader::open(h.options.clone(), h.path()).unwrap();
        assert_eq!(reader.read_all(b"12345678").unwrap(), b"abcd");
    }

    #[test]
    fn test_side_channel_roundtrip() {
        let mut h = DirHarness::new(small_options());
        {
            let writer = h.writer();
            assert_eq!(writer.io_append(b"particle frame 0|").unwrap(), 17);
            writer.io_flush().unwrap();
            assert_eq!(writer.io_append(b"particle frame 1").unwrap(), 16);
            writer.io_sync().unwrap();
            writer.append(b"k1", b"v1", 0).unwrap();
        }
        assert_eq!(h.read("k1"), "v1");

        let reader = h.reader.as_ref().unwrap();
        assert_eq!(reader.io_pread(0, 17).unwrap(), b"particle frame 0|");
        assert_eq!(reader.io_pread(17, 100).unwrap(), b"particle frame 1");
        assert!(reader.io_pread(500, 10).unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_data_block_detected() {
        let mut h = DirHarness::new(small_options());
        for i in 0..32 {
            h.write(&format!("k{i:02}"), &format!("value-{i:02}"));
        }
        h.make_epoch();
        h.finish();

        // Flip one byte inside the first (only) data block.
        let data_path = h.path().join(data_file_name(0));
        let mut bytes = std::fs::read(&data_path).unwrap();
        bytes[10] ^= 0x01;
        std::fs::write(&data_path, bytes).unwrap();

        let reader = DirReader::open(h.options.clone(), h.path()).unwrap();
        let mut hit_corruption = false;
        for i in 0..32 {
            if let Err(Error::Corruption(_)) =
                reader.read_all(format!("k{i:02}").as_bytes())
            {
                hit_corruption = true;
            }
        }
        assert!(hit_corruption, "damaged block must fail checksum");
    }

    #[test]
    fn test_unknown_manifest_version_not_supported() {
        let mut h = DirHarness::new(small_options());
        h.write("k1", "v1");
        h.finish();

        let manifest_path = h.path().join(MANIFEST_FILE);
        let mut bytes = std::fs::read(&manifest_path).unwrap();
        LittleEndian::write_u32(&mut bytes[8..12], 99);
        let body_len = bytes.len() - 4;
        let crc = crc32c(&bytes[..body_len]);
        LittleEndian::write_u32(&mut bytes[body_len..], crc);
        std::fs::write(&manifest_path, bytes).unwrap();

        assert!(matches!(
            DirReader::open(h.options.clone(), h.path()),
            Err(Error::NotSupported(_))
        ));
    }

    /// Filesystem that throttles appends, mimicking a slow burst-buffer
    /// link; exercises writer backpressure end to end.
    struct ThrottledFs {
        inner: PosixFs,
        delay: Duration,
    }

    struct ThrottledFile {
        inner: Box<dyn WritableFile>,
        delay: Duration,
    }

    impl WritableFile for ThrottledFile {
        fn append(&mut self, data: &[u8]) -> Result<()> {
            if !data.is_empty() {
                std::thread::sleep(self.delay);
            }
            self.inner.append(data)
        }
        fn flush(&mut self) -> Result<()> {
            self.inner.flush()
        }
        fn sync(&mut self) -> Result<()> {
            self.inner.sync()
        }
        fn close(&mut self) -> Result<()> {
            self.inner.close()
        }
    }

    impl FileSystem for ThrottledFs {
        fn create(&self, path: &Path) -> Result<Box<dyn WritableFile>> {
            Ok(Box::new(ThrottledFile {
                inner: self.inner.create(path)?,
                delay: self.delay,
            }))
        }
        fn open(&self, path: &Path) -> Result<Box<dyn RandomAccessFile>> {
            self.inner.open(path)
        }
        fn exists(&self, path: &Path) -> bool {
            self.inner.exists(path)
        }
        fn create_dir_all(&self, path: &Path) -> Result<()> {
            self.inner.create_dir_all(path)
        }
        fn remove_dir_all(&self, path: &Path) -> Result<()> {
            self.inner.remove_dir_all(path)
        }
    }

    #[test]
    fn test_backpressure_on_throttled_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("slow");
        let options = DirOptions::new()
            .total_memtable_budget(1024)
            .block_size(256)
            .block_batch_size(512)
            .data_buffer(512)
            .min_data_buffer(256)
            .index_buffer(512)
            .min_index_buffer(256);
        let fs: Arc<dyn FileSystem> = Arc::new(ThrottledFs {
            inner: PosixFs,
            delay: Duration::from_millis(2),
        });

        let mut writer =
            DirWriter::open_with(options.clone(), &dir, Arc::clone(&fs), None).unwrap();
        for i in 0..2000 {
            writer
                .append(format!("k{i:05}").as_bytes(), b"0123456789abcdef", 0)
                .unwrap();
        }
        writer.epoch_flush(0).unwrap();
        writer.finish().unwrap();
        drop(writer);

        let reader = DirReader::open_with(options, &dir, fs).unwrap();
        for i in (0..2000).step_by(37) {
            assert_eq!(
                reader.read_all(format!("k{i:05}").as_bytes()).unwrap(),
                b"0123456789abcdef",
                "k{i:05}"
            );
        }
    }
}
