//! I/O context for the directory: file abstraction plus the shared
//! compaction thread pool.
//!
//! The writer and reader own no global state. They receive an
//! `Arc<dyn FileSystem>` at open time (defaulting to [`PosixFs`]) so tests
//! can substitute throttled or failing files, and the writer drives all
//! background work through an explicitly constructed [`ThreadPool`].

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam::channel::{unbounded, Sender};

use crate::error::Result;

/// An append-only output file.
pub trait WritableFile: Send {
    fn append(&mut self, data: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    fn sync(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

/// A read-only file addressed by absolute offset.
pub trait RandomAccessFile: Send + Sync {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>>;
    fn len(&self) -> Result<u64>;
}

/// Filesystem operations the directory core consumes.
pub trait FileSystem: Send + Sync {
    fn create(&self, path: &Path) -> Result<Box<dyn WritableFile>>;
    fn open(&self, path: &Path) -> Result<Box<dyn RandomAccessFile>>;
    fn exists(&self, path: &Path) -> bool;
    fn create_dir_all(&self, path: &Path) -> Result<()>;
    fn remove_dir_all(&self, path: &Path) -> Result<()>;

    /// Wall-clock microseconds; tests may substitute a synthetic clock.
    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }
}

/// `std::fs`-backed implementation used outside of tests.
pub struct PosixFs;

impl PosixFs {
    pub fn shared() -> Arc<dyn FileSystem> {
        Arc::new(PosixFs)
    }
}

struct PosixWritableFile {
    file: File,
}

impl WritableFile for PosixWritableFile {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

struct PosixRandomAccessFile {
    file: File,
}

impl RandomAccessFile for PosixRandomAccessFile {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

impl FileSystem for PosixFs {
    fn create(&self, path: &Path) -> Result<Box<dyn WritableFile>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Box::new(PosixWritableFile { file }))
    }

    fn open(&self, path: &Path) -> Result<Box<dyn RandomAccessFile>> {
        let file = File::open(path)?;
        Ok(Box::new(PosixRandomAccessFile { file }))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        Ok(())
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size worker pool draining a FIFO channel.
///
/// Jobs submitted from one producer run in submission order as long as at
/// most one of its jobs is in flight at a time, which is exactly the
/// guarantee each partition's double buffer maintains.
pub struct ThreadPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawns `num_threads` workers (at least one).
    pub fn new_fixed(num_threads: usize) -> Self {
        let (sender, receiver) = unbounded::<Job>();
        let workers = (0..num_threads.max(1))
            .map(|i| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("compaction-{i}"))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            job();
                        }
                    })
                    .expect("failed to spawn compaction worker")
            })
            .collect();
        Self {
            sender: Some(sender),
            workers,
        }
    }

    /// Enqueues a job. Silently dropped once the pool is shutting down.
    pub fn submit(&self, job: Job) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(job);
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
