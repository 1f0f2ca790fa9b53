// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The write-back block cache between the NBD layer and the backend.
//!
//! A cache file holds `entry_count` fixed-size slots plus a header
//! (`uuid || packed reverse table`) that survives restarts. At any moment
//! every slot is clean (resident in the clean queue, contents match the
//! backend), dirty (resident in the dirty queue, contents newer than the
//! backend) or busy (in neither queue while a pull or writeback operates
//! on it; further requests for the same block park in the delay map).
//! A single pull daemon drains the request queue and a single writeback
//! daemon drains dirty slots to the backend after a quiescence delay.

mod pull;
mod table;
#[cfg(test)]
mod tests;
mod writeback;

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use positioned_io::{ReadAt, WriteAt};
use tracing::{error, info};

pub(crate) use table::{EMPTY, TableState};

use crate::backend::Backend;
use crate::utils::{Priority, PriorityQueue, SlotQueue};
use crate::{Error, Result};

/// What a pull completion tells the pipeline about the slot it was handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyHint {
    /// The slot was only read; classify it by its previous state.
    Keep,
    /// The slot was modified and must reach the backend eventually.
    MarkDirty,
}

/// Continuation attached to a pull request. Runs with the slot busy, so
/// the slot's bytes in the cache file are stable for its duration. `data`
/// is present iff the request asked to read (or the miss path fetched the
/// block anyway).
pub(crate) type PullCompletion =
    Box<dyn FnOnce(Result<Option<Vec<u8>>>, usize) -> DirtyHint + Send>;

/// One unit of work for the pull daemon. `pull_data` brings the block in
/// from the backend on a miss; a caller clearing it promises to overwrite
/// the whole slot. `read_data` asks for the slot contents back. The
/// combination `!pull_data && read_data` is meaningless and rejected.
pub(crate) struct PullRequest {
    pub block: u64,
    pub pull_data: bool,
    pub read_data: bool,
    pub done: PullCompletion,
}

/// Cache tunables.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Treat loaded slots as dirty on attach; set when the previous run
    /// did not detach cleanly, so the writeback daemon re-pushes
    /// everything the cache holds.
    pub attach_dirty: bool,
    /// Quiescence window: a dirty slot is written back only once it has
    /// not been modified for this long, batching rapid rewrites.
    pub writeback_delay: Duration,
    /// Concurrent backend writes issued by the writeback daemon.
    pub writeback_concurrency: usize,
    /// Poll interval of `sync`.
    pub sync_poll: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions {
            attach_dirty: false,
            writeback_delay: Duration::from_millis(500),
            writeback_concurrency: 8,
            sync_poll: Duration::from_millis(50),
        }
    }
}

/// Derived sizes, fixed at attach.
pub(crate) struct Geometry {
    pub uuid: String,
    pub block_size: u64,
    pub block_count: u64,
    pub entry_count: usize,
    pub total_size: u64,
}

impl Geometry {
    /// Byte offset of a slot body in the cache file.
    fn slot_offset(&self, slot: usize) -> u64 {
        self.uuid.len() as u64 + 8 * self.entry_count as u64 + slot as u64 * self.block_size
    }
}

/// Counting gate bounding the writeback daemon's in-flight backend writes.
pub(crate) struct Gate {
    limit: usize,
    count: Mutex<usize>,
    cv: Condvar,
}

impl Gate {
    fn new(limit: usize) -> Self {
        assert!(limit > 0);
        Gate {
            limit,
            count: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn acquire(&self) {
        let mut count = self.count.lock();
        while *count >= self.limit {
            self.cv.wait(&mut count);
        }
        *count += 1;
    }

    pub(crate) fn release(&self) {
        *self.count.lock() -= 1;
        self.cv.notify_one();
    }
}

/// State shared between the device handle, the pull daemon, the writeback
/// daemon and backend-worker continuations.
pub(crate) struct Shared {
    pub geo: Geometry,
    pub opts: CacheOptions,
    pub file: Mutex<File>,
    pub table: Mutex<TableState>,
    pub clean: SlotQueue,
    pub dirty: SlotQueue,
    pub pull_queue: PriorityQueue<PullRequest>,
    pub backend: Backend,
    pub wb_gate: Gate,
    /// Requests submitted but not yet settled (queued, delayed or being
    /// processed), plus writeback jobs between dequeue and completion.
    /// `sync` samples it last: zero proves all previously observed work
    /// is finished.
    pub outstanding: AtomicUsize,
}

impl Shared {
    /// Read one whole slot body. The cache file is the only copy of dirty
    /// data, so local I/O failure is not recoverable.
    pub(crate) fn read_slot(&self, slot: usize) -> Vec<u8> {
        self.read_slot_range(slot, 0, self.geo.block_size as usize)
    }

    pub(crate) fn read_slot_range(&self, slot: usize, shift: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        let file = self.file.lock();
        file.read_exact_at(self.geo.slot_offset(slot) + shift, &mut buf)
            .unwrap_or_else(|e| panic!("cache file read failed at slot {slot}: {e}"));
        buf
    }

    pub(crate) fn write_slot(&self, slot: usize, data: &[u8]) {
        self.write_slot_range(slot, 0, data);
    }

    pub(crate) fn write_slot_range(&self, slot: usize, shift: u64, data: &[u8]) {
        let mut file = self.file.lock();
        file.write_all_at(self.geo.slot_offset(slot) + shift, data)
            .unwrap_or_else(|e| panic!("cache file write failed at slot {slot}: {e}"));
    }

    /// Classify a settled slot and hand the next delayed request for its
    /// block (if any) back to the pull queue at high priority.
    pub(crate) fn settle(&self, block: u64, slot: usize, dirty: bool) {
        if dirty {
            self.table.lock().last_modify[slot] = Some(std::time::Instant::now());
            self.dirty.put(slot);
        } else {
            self.clean.put(slot);
        }
        self.drain_delay(block);
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn drain_delay(&self, block: u64) {
        let mut table = self.table.lock();
        if let Some(queue) = table.delay.get_mut(&block) {
            let next = queue.pop_front();
            let emptied = queue.is_empty();
            if emptied {
                table.delay.remove(&block);
            }
            if let Some(next) = next {
                self.pull_queue.put(next, Priority::High);
            }
        }
    }
}

struct ReadGather {
    remaining: usize,
    parts: Vec<Option<Vec<u8>>>,
    failed: bool,
    done: Option<Box<dyn FnOnce(Result<Vec<u8>>) + Send>>,
}

struct WriteScatter {
    remaining: usize,
    failed: bool,
    done: Option<Box<dyn FnOnce(Result<()>) + Send>>,
}

/// A block device served from the local cache file, with misses pulled
/// from (and dirty slots eventually drained to) the [`Backend`].
pub struct CachedDevice {
    shared: Arc<Shared>,
    daemons: Mutex<Vec<JoinHandle<()>>>,
    ended: AtomicBool,
}

impl std::fmt::Debug for CachedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedDevice")
            .field("ended", &self.ended)
            .finish_non_exhaustive()
    }
}

impl CachedDevice {
    /// Attach `cache_path` to `backend`. The file must already exist; a
    /// zero-filled file attaches as empty, a previously used file must
    /// carry this backend's uuid and its slot map is reloaded (as clean,
    /// or as dirty with [`CacheOptions::attach_dirty`]).
    pub fn attach(cache_path: &Path, backend: Backend, opts: CacheOptions) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(cache_path)?;
        let file_size = file.metadata()?.len();
        let uuid = backend.uuid().to_string();
        let uuid_len = uuid.len() as u64;
        if file_size <= uuid_len {
            return Err(Error::CacheTooSmall(file_size));
        }
        let entry_count = ((file_size - uuid_len) / (backend.block_size() + 8)) as usize;
        if entry_count == 0 {
            return Err(Error::CacheTooSmall(file_size));
        }

        let geo = Geometry {
            block_size: backend.block_size(),
            block_count: backend.block_count(),
            entry_count,
            total_size: backend.total_size(),
            uuid,
        };

        let mut state = TableState::new(entry_count);
        let clean = SlotQueue::new(entry_count);
        let dirty = SlotQueue::new(entry_count);
        match table::load_map(&file, &geo.uuid, geo.block_count, entry_count)? {
            None => {
                for slot in 0..entry_count {
                    clean.put(slot);
                }
            }
            Some((forward, reverse)) => {
                for slot in 0..entry_count {
                    if reverse[slot] != EMPTY && opts.attach_dirty {
                        dirty.put(slot);
                    } else {
                        clean.put(slot);
                    }
                }
                state.forward = forward;
                state.reverse = reverse;
            }
        }
        info!(
            entry_count,
            mapped = state.forward.len(),
            dirty = opts.attach_dirty,
            "attached cache file"
        );

        let shared = Arc::new(Shared {
            wb_gate: Gate::new(opts.writeback_concurrency),
            opts,
            file: Mutex::new(file),
            table: Mutex::new(state),
            clean,
            dirty,
            pull_queue: PriorityQueue::new(),
            backend,
            outstanding: AtomicUsize::new(0),
            geo,
        });

        let mut daemons = Vec::with_capacity(2);
        for (name, run) in [
            ("gbd-pull", pull::run as fn(Arc<Shared>)),
            ("gbd-writeback", writeback::run as fn(Arc<Shared>)),
        ] {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(name.to_string())
                .spawn(move || run(shared))
                .expect("failed to spawn cache daemon");
            daemons.push(handle);
        }

        Ok(CachedDevice {
            shared,
            daemons: Mutex::new(daemons),
            ended: AtomicBool::new(false),
        })
    }

    pub fn block_size(&self) -> u64 {
        self.shared.geo.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.shared.geo.block_count
    }

    pub fn total_size(&self) -> u64 {
        self.shared.geo.total_size
    }

    fn check_range(&self, offset: u64, length: u64) -> Result<()> {
        if length == 0 {
            return Err(Error::ZeroLength);
        }
        let total_size = self.shared.geo.total_size;
        match offset.checked_add(length) {
            Some(end) if end <= total_size => Ok(()),
            _ => Err(Error::OutOfRange {
                offset,
                length,
                total_size,
            }),
        }
    }

    /// Enqueue one per-block request.
    fn pull(&self, block: u64, pull_data: bool, read_data: bool, done: PullCompletion) {
        debug_assert!(block < self.shared.geo.block_count);
        debug_assert!(pull_data || !read_data);
        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
        self.shared.pull_queue.put(
            PullRequest {
                block,
                pull_data,
                read_data,
                done,
            },
            Priority::Normal,
        );
    }

    /// Read `length` bytes at `offset`, completing through `done`. The
    /// range is split per block; sub-reads covering a whole block use the
    /// pulled bytes directly, partial ones slice the slot in the cache
    /// file. The first per-block error short-circuits the whole request.
    pub fn read_with(
        &self,
        offset: u64,
        length: u64,
        done: impl FnOnce(Result<Vec<u8>>) + Send + 'static,
    ) {
        if self.ended.load(Ordering::SeqCst) {
            return done(Err(Error::Closed));
        }
        if let Err(e) = self.check_range(offset, length) {
            return done(Err(e));
        }

        let bs = self.shared.geo.block_size;
        let idx_lo = offset / bs;
        let idx_hi = (offset + length - 1) / bs;
        let count = (idx_hi - idx_lo + 1) as usize;
        let gather = Arc::new(Mutex::new(ReadGather {
            remaining: count,
            parts: std::iter::repeat_with(|| None).take(count).collect(),
            failed: false,
            done: Some(Box::new(done)),
        }));

        for idx in idx_lo..=idx_hi {
            let rngl = offset.max(idx * bs);
            let rngr = (offset + length).min((idx + 1) * bs);
            let shift = rngl % bs;
            let to_read = (rngr - rngl) as usize;
            let full = to_read as u64 == bs;
            let part = (idx - idx_lo) as usize;
            let gather = Arc::clone(&gather);
            let shared = Arc::clone(&self.shared);
            self.pull(
                idx,
                true,
                full,
                Box::new(move |res, slot| {
                    let mut state = gather.lock();
                    if state.failed {
                        return DirtyHint::Keep;
                    }
                    match res {
                        Err(e) => {
                            state.failed = true;
                            let done = state.done.take().expect("read completion fired twice");
                            drop(state);
                            done(Err(e));
                        }
                        Ok(data) => {
                            let bytes = if full {
                                data.expect("full-block pull returned no data")
                            } else {
                                shared.read_slot_range(slot, shift, to_read)
                            };
                            state.parts[part] = Some(bytes);
                            state.remaining -= 1;
                            if state.remaining == 0 {
                                let done = state.done.take().expect("read completion fired twice");
                                let mut out = Vec::with_capacity(length as usize);
                                for piece in &mut state.parts {
                                    out.extend_from_slice(
                                        piece.as_deref().expect("missing read part"),
                                    );
                                }
                                drop(state);
                                done(Ok(out));
                            }
                        }
                    }
                    DirtyHint::Keep
                }),
            );
        }
    }

    /// Blocking form of [`Self::read_with`].
    pub fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let (tx, rx) = flume::bounded(1);
        self.read_with(offset, length, move |res| drop(tx.send(res)));
        rx.recv().map_err(|_| Error::Closed)?
    }

    /// Write `data` at `offset`, completing through `done`. Sub-writes
    /// covering a whole block skip the backend fetch on a miss; partial
    /// ones pull the existing bytes first. Each touched slot is marked
    /// dirty.
    pub fn write_with(
        &self,
        offset: u64,
        data: &[u8],
        done: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        if self.ended.load(Ordering::SeqCst) {
            return done(Err(Error::Closed));
        }
        let length = data.len() as u64;
        if let Err(e) = self.check_range(offset, length) {
            return done(Err(e));
        }

        let bs = self.shared.geo.block_size;
        let idx_lo = offset / bs;
        let idx_hi = (offset + length - 1) / bs;
        let scatter = Arc::new(Mutex::new(WriteScatter {
            remaining: (idx_hi - idx_lo + 1) as usize,
            failed: false,
            done: Some(Box::new(done)),
        }));

        for idx in idx_lo..=idx_hi {
            let rngl = offset.max(idx * bs);
            let rngr = (offset + length).min((idx + 1) * bs);
            let sub = data[(rngl - offset) as usize..(rngr - offset) as usize].to_vec();
            let shift = rngl % bs;
            let full = sub.len() as u64 == bs;
            let scatter = Arc::clone(&scatter);
            let shared = Arc::clone(&self.shared);
            self.pull(
                idx,
                !full,
                false,
                Box::new(move |res, slot| {
                    let mut state = scatter.lock();
                    if state.failed {
                        return DirtyHint::Keep;
                    }
                    match res {
                        Err(e) => {
                            state.failed = true;
                            let done = state.done.take().expect("write completion fired twice");
                            drop(state);
                            done(Err(e));
                            DirtyHint::Keep
                        }
                        Ok(_) => {
                            shared.write_slot_range(slot, shift, &sub);
                            state.remaining -= 1;
                            if state.remaining == 0 {
                                let done =
                                    state.done.take().expect("write completion fired twice");
                                drop(state);
                                done(Ok(()));
                            }
                            DirtyHint::MarkDirty
                        }
                    }
                }),
            );
        }
    }

    /// Blocking form of [`Self::write_with`].
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let (tx, rx) = flume::bounded(1);
        self.write_with(offset, data, move |res| drop(tx.send(res)));
        rx.recv().map_err(|_| Error::Closed)?
    }

    /// Block until every queued, delayed and in-flight request has
    /// settled and the dirty queue has drained, then drain the backend.
    pub fn sync(&self) {
        info!("flushing all requests to the backend");
        loop {
            let drained = self.shared.dirty.is_empty()
                && self.shared.pull_queue.is_empty()
                && self.shared.table.lock().delay.is_empty()
                && self.shared.outstanding.load(Ordering::SeqCst) == 0;
            if drained {
                break;
            }
            std::thread::sleep(self.shared.opts.sync_poll);
        }
        self.shared.backend.sync();
    }

    /// Shut the device down. Non-forced drains everything first; the slot
    /// map is persisted either way.
    pub fn end(&self, force: bool) -> Result<()> {
        if self.ended.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !force {
            self.sync();
        }
        self.shared.backend.end(true);
        self.shared.pull_queue.close();
        self.shared.clean.close();
        self.shared.dirty.close();
        for handle in self.daemons.lock().drain(..) {
            if handle.join().is_err() {
                error!("cache daemon panicked during shutdown");
            }
        }
        let table = self.shared.table.lock();
        table::save_map(&mut self.shared.file.lock(), &self.shared.geo.uuid, &table.reverse)?;
        info!("cache device stopped");
        Ok(())
    }
}
