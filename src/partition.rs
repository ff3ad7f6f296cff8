//! One partition: an independent write pipeline inside the directory.
//!
//! A partition owns a memtable pair coordinated by a [`DoubleBuffer`], an
//! append-only data log and index log, and an optional side log for the
//! opaque byte stream. It fulfills the [`CompactionBackend`] capability:
//! compactions sort-finalize a sealed memtable and stream it through a
//! [`TableBuilder`] into the two logs.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use byteorder::{LittleEndian, WriteBytesExt};

use crate::checksum::{append_trailer, TYPE_RAW};
use crate::doublebuf::{CompactionBackend, DoubleBuffer};
use crate::env::{FileSystem, ThreadPool};
use crate::error::Result;
use crate::memtable::MemTable;
use crate::options::DirOptions;
use crate::table::{LogSink, TableBuilder};

/// Magic opening each epoch-boundary marker in the index log.
pub const EPOCH_MARKER_MAGIC: u32 = 0x4550_4f43;

pub fn data_file_name(part: u32) -> String {
    format!("partition_{part}.data")
}

pub fn index_file_name(part: u32) -> String {
    format!("partition_{part}.idx")
}

pub fn side_file_name(part: u32) -> String {
    format!("partition_{part}.side")
}

pub(crate) struct Partition {
    pub dbuf: DoubleBuffer,
    pub backend: Arc<PartitionBackend>,
}

impl Partition {
    pub fn create(
        options: &DirOptions,
        fs: &Arc<dyn FileSystem>,
        dir: &Path,
        part: u32,
        pool: Arc<ThreadPool>,
    ) -> Result<Self> {
        let data_file = fs.create(&dir.join(data_file_name(part)))?;
        let index_file = fs.create(&dir.join(index_file_name(part)))?;
        let logs = PartitionLogs {
            data: LogSink::new(data_file, options.data_buffer, options.min_data_buffer),
            index: LogSink::new(index_file, options.index_buffer, options.min_index_buffer),
            side: None,
            pending_tables: Vec::new(),
            all_tables: Vec::new(),
        };
        let backend = Arc::new(PartitionBackend {
            part,
            options: options.clone(),
            fs: Arc::clone(fs),
            dir: dir.to_path_buf(),
            pool,
            epoch: AtomicU32::new(0),
            logs: Mutex::new(logs),
        });
        let dbuf = DoubleBuffer::new(
            backend.clone() as Arc<dyn CompactionBackend>,
            options.per_part_budget(),
            options.fixed_kv,
        );
        Ok(Self { dbuf, backend })
    }
}

struct PartitionLogs {
    data: LogSink,
    index: LogSink,
    side: Option<LogSink>,
    /// Meta trailer locations since the last epoch marker.
    pending_tables: Vec<(u64, u64)>,
    /// Every meta trailer location, in compaction order, for the footer.
    all_tables: Vec<(u64, u64)>,
}

pub(crate) struct PartitionBackend {
    part: u32,
    options: DirOptions,
    fs: Arc<dyn FileSystem>,
    dir: PathBuf,
    pool: Arc<ThreadPool>,
    /// Epoch stamped onto tables; only advanced while the partition's
    /// pipeline is drained, so an in-flight compaction never straddles a
    /// boundary.
    epoch: AtomicU32,
    logs: Mutex<PartitionLogs>,
}

impl PartitionBackend {
    pub fn set_epoch(&self, epoch: u32) {
        self.epoch.store(epoch, Ordering::SeqCst);
    }

    /// Records the boundary of `epoch` in the index log: the marker names
    /// every meta trailer the epoch produced. Requires a drained pipeline.
    pub fn write_epoch_marker(&self, epoch: u32) -> Result<()> {
        let mut logs = self.logs.lock().unwrap();
        let tables = std::mem::take(&mut logs.pending_tables);
        let mut payload = Vec::with_capacity(12 + tables.len() * 16);
        payload.write_u32::<LittleEndian>(EPOCH_MARKER_MAGIC).unwrap();
        payload.write_u32::<LittleEndian>(epoch).unwrap();
        payload
            .write_u32::<LittleEndian>(tables.len() as u32)
            .unwrap();
        for (offset, len) in &tables {
            payload.write_u64::<LittleEndian>(*offset).unwrap();
            payload.write_u64::<LittleEndian>(*len).unwrap();
        }
        append_trailer(&mut payload, 0, TYPE_RAW);
        logs.index.write(&payload)?;
        tracing::debug!(
            partition = self.part,
            epoch,
            tables = tables.len(),
            "epoch boundary recorded"
        );
        Ok(())
    }

    /// Appends to the partition's side log, creating it on first use.
    pub fn io_append(&self, data: &[u8]) -> Result<usize> {
        let mut logs = self.logs.lock().unwrap();
        if logs.side.is_none() {
            let file = self.fs.create(&self.dir.join(side_file_name(self.part)))?;
            // Write-through; the side channel does its own batching.
            logs.side = Some(LogSink::new(file, 0, 0));
        }
        logs.side.as_mut().expect("side log").write(data)?;
        Ok(data.len())
    }

    /// Flushes buffered side-log bytes to the file.
    pub fn io_flush(&self) -> Result<()> {
        match self.logs.lock().unwrap().side.as_mut() {
            Some(side) => side.flush(),
            None => Ok(()),
        }
    }

    /// Flushes and syncs the side log.
    pub fn io_sync(&self) -> Result<()> {
        match self.logs.lock().unwrap().side.as_mut() {
            Some(side) => side.sync(),
            None => Ok(()),
        }
    }

    /// Meta trailer locations of every table emitted so far.
    pub fn tables_snapshot(&self) -> Vec<(u64, u64)> {
        self.logs.lock().unwrap().all_tables.clone()
    }
}

impl CompactionBackend for PartitionBackend {
    fn compact(&self, buf: &mut MemTable) -> Result<()> {
        buf.finish_and_sort();
        let epoch = self.epoch.load(Ordering::SeqCst);

        let mut logs = self.logs.lock().unwrap();
        let PartitionLogs {
            data,
            index,
            pending_tables,
            all_tables,
            ..
        } = &mut *logs;

        let mut builder = TableBuilder::new(&self.options, data, index, epoch);
        let mut iter = buf.iter();
        iter.seek_to_first();
        while iter.valid() {
            builder.add(iter.key(), iter.value())?;
            iter.next();
        }
        let (offset, len, _meta) = builder.finish()?;
        pending_tables.push((offset, len));
        all_tables.push((offset, len));
        tracing::debug!(
            partition = self.part,
            epoch,
            entries = buf.num_entries(),
            bytes = buf.mem_bytes(),
            "memtable compacted into sorted run"
        );
        Ok(())
    }

    fn sync_backend(&self, close: bool) -> Result<()> {
        let mut logs = self.logs.lock().unwrap();
        if close {
            logs.data.close()?;
            logs.index.close()?;
            if let Some(side) = logs.side.as_mut() {
                side.close()?;
            }
        } else {
            logs.data.sync()?;
            logs.index.sync()?;
            if let Some(side) = logs.side.as_mut() {
                side.sync()?;
            }
        }
        Ok(())
    }

    fn submit(&self, job: Box<dyn FnOnce() + Send>) {
        self.pool.submit(job);
    }
}
