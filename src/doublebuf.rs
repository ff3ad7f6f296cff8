//! Per-partition double-buffered compaction coordinator.
//!
//! Each partition owns exactly two memtables. One is active and receives
//! appends; the other is either spare or being compacted in the
//! background, so at most one compaction is ever in flight per partition.
//! Writers only block when both buffers are occupied, waiting on the
//! partition's condition variable for a completion.
//!
//! The coordinator is generic over a [`CompactionBackend`]: the partition
//! supplies the type-specific work (sort-finalize and persist a buffer,
//! sync the backing logs, reach the shared thread pool) while this module
//! owns scheduling, the monotone sequence counters, and the sticky
//! background status.
//!
//! # Locking
//!
//! A single mutex guards the buffer identities, the counters, and the
//! latched background error. It is released across the sort-and-write of a
//! scheduled compaction and across backend sync calls; the one exception
//! is an empty buffer, which is compacted inline on the calling thread
//! since there is nothing to sort and only a degenerate table to emit.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::memtable::MemTable;

/// Capability interface the partition fulfills for its coordinator.
pub trait CompactionBackend: Send + Sync {
    /// Sort-finalizes `buf` and emits one sorted run to the partition's
    /// logs. Called without the coordinator lock held, except for empty
    /// buffers which run inline.
    fn compact(&self, buf: &mut MemTable) -> Result<()>;

    /// Flushes and syncs the backing logs; `close` also closes them.
    fn sync_backend(&self, close: bool) -> Result<()>;

    /// Hands a job to the shared compaction pool. Must not run the job on
    /// the calling thread.
    fn submit(&self, job: Box<dyn FnOnce() + Send>);
}

struct State {
    active: Option<MemTable>,
    spares: VecDeque<MemTable>,
    num_scheduled: u32,
    num_completed: u32,
    bg_error: Option<Error>,
    finished: bool,
}

struct Inner {
    state: Mutex<State>,
    cv: Condvar,
    backend: Arc<dyn CompactionBackend>,
}

pub struct DoubleBuffer {
    inner: Arc<Inner>,
}

impl DoubleBuffer {
    pub fn new(backend: Arc<dyn CompactionBackend>, buffer_budget: usize, fixed_kv: bool) -> Self {
        let mut spares = VecDeque::with_capacity(1);
        spares.push_back(MemTable::new(buffer_budget, fixed_kv));
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    active: Some(MemTable::new(buffer_budget, fixed_kv)),
                    spares,
                    num_scheduled: 0,
                    num_completed: 0,
                    bg_error: None,
                    finished: false,
                }),
                cv: Condvar::new(),
                backend,
            }),
        }
    }

    /// Appends `(key, value)` into the active buffer, swapping buffers and
    /// scheduling a compaction first if the active one is full. Blocks
    /// only while both buffers are occupied.
    pub fn add(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let st = self.inner.state.lock().unwrap();
        if st.finished {
            return Err(latched(&st));
        }
        let (mut st, status) = Inner::prepare(&self.inner, st, false, key, value);
        status?;
        st.active.as_mut().expect("active buffer").add(key, value);
        Ok(())
    }

    /// Forces a buffer swap and compaction; with `wait`, blocks until the
    /// scheduled compaction completes. Does not sync.
    pub fn flush(&self, wait: bool) -> Result<()> {
        let st = self.inner.state.lock().unwrap();
        if st.finished {
            return Err(latched(&st));
        }
        let (st, status) = Inner::prepare(&self.inner, st, true, &[], &[]);
        let seq = status?;
        if wait {
            let st = Inner::wait_for(&self.inner, st, seq);
            if let Some(err) = &st.bg_error {
                return Err(err.clone());
            }
        }
        Ok(())
    }

    /// Syncs data already scheduled for compaction to storage; with
    /// `do_flush`, first schedules whatever sits in the active buffer.
    /// Waits out all outstanding compactions before syncing.
    pub fn sync(&self, do_flush: bool) -> Result<()> {
        let st = self.inner.state.lock().unwrap();
        if st.finished {
            return Err(latched(&st));
        }
        let (st, status) = Inner::prepare(&self.inner, st, do_flush, &[], &[]);
        let seq = status?;
        let st = Inner::wait_for(&self.inner, st, seq);
        let st = Inner::wait_for_all(&self.inner, st);
        if let Some(err) = &st.bg_error {
            return Err(err.clone());
        }
        drop(st); // sync without the partition lock
        let sync_result = self.inner.backend.sync_backend(false);
        let mut st = self.inner.state.lock().unwrap();
        if st.bg_error.is_none() {
            if let Err(err) = &sync_result {
                st.bg_error = Some(err.clone());
            }
        }
        sync_result
    }

    /// Blocks until no compaction is outstanding.
    pub fn wait(&self) -> Result<()> {
        let st = self.inner.state.lock().unwrap();
        if st.finished {
            return Err(latched(&st));
        }
        let st = Inner::wait_for_all(&self.inner, st);
        match &st.bg_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Schedules any remaining data, waits out the pipeline, then syncs
    /// and closes the backing logs. Further calls (and any other
    /// operation) return [`Error::AlreadyFinished`].
    pub fn finish(&self) -> Result<()> {
        let st = self.inner.state.lock().unwrap();
        if st.finished {
            return Err(latched(&st));
        }
        let (st, _ignored) = Inner::prepare(&self.inner, st, true, &[], &[]);
        let mut st = Inner::wait_for_all(&self.inner, st);

        let latched_error = st.bg_error.clone();
        let finish_result = match latched_error {
            Some(err) => Err(err),
            None => {
                drop(st);
                let result = self.inner.backend.sync_backend(true);
                st = self.inner.state.lock().unwrap();
                result
            }
        };
        st.finished = true;
        st.bg_error = Some(Error::AlreadyFinished);
        finish_result
    }

    /// Snapshot of `(num_scheduled, num_completed)`.
    #[cfg(test)]
    pub(crate) fn counters(&self) -> (u32, u32) {
        let st = self.inner.state.lock().unwrap();
        (st.num_scheduled, st.num_completed)
    }
}

fn latched(st: &State) -> Error {
    st.bg_error.clone().unwrap_or(Error::AlreadyFinished)
}

impl Inner {
    /// The scheduling kernel. Loops until the active buffer can take one
    /// more record (or, under `force`, until a swap has been scheduled),
    /// waiting on the condition variable when both buffers are busy.
    /// Returns the compaction sequence assigned to a swap, or zero when no
    /// swap was needed.
    fn prepare<'a>(
        this: &'a Arc<Inner>,
        mut st: MutexGuard<'a, State>,
        mut force: bool,
        key: &[u8],
        value: &[u8],
    ) -> (MutexGuard<'a, State>, Result<u32>) {
        let mut seq = 0;
        loop {
            if let Some(err) = &st.bg_error {
                let err = err.clone();
                return (st, Err(err));
            }
            if !force && st.active.as_ref().expect("active buffer").has_room(key, value) {
                return (st, Ok(seq));
            }
            if st.spares.is_empty() {
                // Both buffers busy; wait for the in-flight compaction.
                st = this.cv.wait(st).unwrap();
            } else {
                force = false; // the swap frees one slot
                st.num_scheduled += 1;
                seq = st.num_scheduled;
                let imm = st.active.take().expect("active buffer");
                let next = st.spares.pop_back().expect("spare buffer");
                st.active = Some(next);
                st = Inner::schedule(this, st, imm);
            }
        }
    }

    /// Dispatches one immutable buffer. Empty buffers compact inline on
    /// the calling thread; others go to the pool.
    fn schedule<'a>(
        this: &'a Arc<Inner>,
        st: MutexGuard<'a, State>,
        mut imm: MemTable,
    ) -> MutexGuard<'a, State> {
        if imm.is_empty() {
            let status = this.backend.compact(&mut imm);
            Inner::complete(this, st, imm, status)
        } else {
            tracing::debug!(
                entries = imm.num_entries(),
                bytes = imm.mem_bytes(),
                seq = st.num_scheduled,
                "scheduling compaction"
            );
            let worker = Arc::clone(this);
            this.backend.submit(Box::new(move || {
                Inner::run_compaction(worker, imm);
            }));
            st
        }
    }

    /// Pool-side body of one compaction.
    fn run_compaction(this: Arc<Inner>, mut imm: MemTable) {
        let status = this.backend.compact(&mut imm);
        let st = this.state.lock().unwrap();
        let _st = Inner::complete(&this, st, imm, status);
    }

    /// Bookkeeping after a compaction: latch the first error, return the
    /// emptied buffer to the spare queue, opportunistically schedule the
    /// next compaction, and wake every waiter.
    fn complete<'a>(
        this: &'a Arc<Inner>,
        mut st: MutexGuard<'a, State>,
        mut imm: MemTable,
        status: Result<()>,
    ) -> MutexGuard<'a, State> {
        st.num_completed += 1;
        if st.bg_error.is_none() {
            if let Err(err) = status {
                tracing::error!(error = %err, "background compaction failed");
                st.bg_error = Some(err);
            }
        }
        imm.clear();
        st.spares.push_back(imm);
        let (st, _overlap) = Inner::prepare(this, st, false, &[], &[]);
        this.cv.notify_all();
        st
    }

    fn wait_for<'a>(
        this: &'a Arc<Inner>,
        mut st: MutexGuard<'a, State>,
        seq: u32,
    ) -> MutexGuard<'a, State> {
        while st.num_completed < seq {
            st = this.cv.wait(st).unwrap();
        }
        st
    }

    fn wait_for_all<'a>(
        this: &'a Arc<Inner>,
        mut st: MutexGuard<'a, State>,
    ) -> MutexGuard<'a, State> {
        while st.num_completed < st.num_scheduled {
            st = this.cv.wait(st).unwrap();
        }
        st
    }
}
