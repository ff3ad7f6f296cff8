//! Write-optimized indexed log directory for parallel small-record
//! ingestion.
//!
//! A directory ingests massive streams of tiny key/value records from one
//! writer process and later serves point lookups and side-channel byte
//! reads. Internally it is partitioned into `2^lg_parts` independent
//! write pipelines:
//!
//! ```text
//! append(k, v, epoch)
//!     |
//!     v  hash(k)
//! ┌──────────────────────────────────────────────────────┐
//! │ partition i                                          │
//! │                                                      │
//! │  active memtable  <──swap──>  spare memtable         │
//! │        │                          │                  │
//! │        │ (budget reached)         │ (compaction done)│
//! │        v                          │                  │
//! │  background compaction ───────────┘                  │
//! │        │ sort + build                                │
//! │        v                                             │
//! │  partition_i.data   [block][block]...                │
//! │  partition_i.idx    [filter][index][meta trailer]    │
//! └──────────────────────────────────────────────────────┘
//!     |
//!     v  finish()
//! MANIFEST (directory footer)
//! ```
//!
//! Writers never block unless both of a partition's buffers are occupied,
//! and at most one compaction is in flight per partition. Epochs are
//! closed with [`DirWriter::epoch_flush`]; a [`DirReader`] then filters
//! and searches each epoch's sorted runs independently.

pub mod block;
pub mod checksum;
pub mod coding;
pub mod dir;
pub mod doublebuf;
pub mod env;
pub mod error;
pub mod filter;
pub mod memtable;
pub mod options;
pub mod partition;
pub mod table;

pub use dir::{DirReader, DirWriter};
pub use env::{FileSystem, PosixFs, RandomAccessFile, ThreadPool, WritableFile};
pub use error::{Error, Result};
pub use options::{Compression, DirOptions, FilterKind};
