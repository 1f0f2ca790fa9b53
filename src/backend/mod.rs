// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The remote side of the device: a flat array of fixed-size blocks stored
//! as one blob per nonzero block in a backend data directory, fronted by a
//! fixed pool of worker threads. Each worker owns its own store session;
//! operations are submitted with a priority and complete through a
//! callback on the worker thread. The pull pipeline guarantees that no two
//! operations target the same block concurrently.

mod fs;
mod memory;

use std::sync::Arc;
use std::thread::JoinHandle;

pub use fs::FsStore;
pub use memory::MemoryStore;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::{error, info};

use crate::utils::{Priority, PriorityQueue};
use crate::{Error, Result};

/// Name of the JSON blob describing the device geometry.
pub const CONFIG_BLOB: &str = "config";

/// Supported version of the config blob.
pub const CONFIG_VERSION: u32 = 1;

/// Blob name for a block index.
pub fn block_blob_name(idx: u64) -> String {
    format!("gbd_b{idx}")
}

/// Geometry record stored in the backend's `config` blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub version: u32,
    pub block_size: u64,
    pub block_count: u64,
}

/// A session against the remote blob folder. `get`/`put` address whole
/// blobs by name; `canonical_id` identifies the folder itself and seeds
/// the cache-file UUID. Implementations are cloned once per worker, so a
/// clone must denote the same folder (a fresh session, not a fresh store).
pub trait BlobStore: Send + 'static {
    fn canonical_id(&self) -> &str;
    fn get(&mut self, name: &str) -> Result<Option<Vec<u8>>>;
    fn put(&mut self, name: &str, data: &[u8]) -> Result<()>;
}

/// Tunables for [`Backend::open`].
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Number of worker threads, each with its own store session.
    pub workers: usize,
    /// Initialize a missing data directory instead of failing.
    pub create: bool,
    /// Block size used when initializing a new data directory.
    pub block_size: Option<u64>,
    /// Total device size used when initializing a new data directory.
    /// Rounded down to a whole number of blocks.
    pub total_size: Option<u64>,
}

impl Default for BackendOptions {
    fn default() -> Self {
        BackendOptions {
            workers: 8,
            create: false,
            block_size: None,
            total_size: None,
        }
    }
}

pub type ReadDone = Box<dyn FnOnce(Result<Vec<u8>>) + Send>;
pub type WriteDone = Box<dyn FnOnce(Result<()>) + Send>;

enum Job {
    Read { block: u64, done: ReadDone },
    Write { block: u64, data: Vec<u8>, done: WriteDone },
}

/// Counts submitted-but-unfinished jobs so `sync` can wait for a full
/// drain, queued and running alike.
#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Pending {
    fn submit(&self) {
        *self.count.lock() += 1;
    }

    fn finish(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.cv.notify_all();
        }
    }

    fn wait_drained(&self) {
        let mut count = self.count.lock();
        while *count != 0 {
            self.cv.wait(&mut count);
        }
    }
}

/// Worker pool over a [`BlobStore`]. All block operations are idempotent;
/// failures are reported through the completion callback and left to the
/// caller, which treats them as transient for that request.
pub struct Backend {
    uuid: String,
    block_size: u64,
    block_count: u64,
    queue: Arc<PriorityQueue<Job>>,
    pending: Arc<Pending>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("uuid", &self.uuid)
            .field("block_size", &self.block_size)
            .field("block_count", &self.block_count)
            .finish_non_exhaustive()
    }
}

impl Backend {
    /// Attach to the data directory behind `store`, loading (or, with
    /// `create`, initializing) its `config` blob, and start the worker
    /// pool.
    pub fn open<S: BlobStore + Clone>(store: S, opts: &BackendOptions) -> Result<Self> {
        let mut session = store.clone();
        let uuid = hex::encode(Sha1::digest(session.canonical_id().as_bytes()));

        let config = match session.get(CONFIG_BLOB)? {
            Some(raw) => serde_json::from_slice::<DeviceConfig>(&raw)
                .map_err(|e| Error::DataDir(format!("unreadable config blob: {e}")))?,
            None if opts.create => Self::init_data_dir(&mut session, opts)?,
            None => {
                return Err(Error::DataDir(
                    "no config blob; initialize the data directory first".into(),
                ));
            }
        };
        if config.version != CONFIG_VERSION {
            return Err(Error::VersionMismatch {
                found: config.version,
                supported: CONFIG_VERSION,
            });
        }

        let queue = Arc::new(PriorityQueue::new());
        let pending = Arc::new(Pending::default());
        let mut workers = Vec::with_capacity(opts.workers);
        for i in 0..opts.workers {
            let session = store.clone();
            let queue = Arc::clone(&queue);
            let pending = Arc::clone(&pending);
            let block_size = config.block_size;
            let handle = std::thread::Builder::new()
                .name(format!("gbd-backend-{i}"))
                .spawn(move || worker_loop(session, block_size, &queue, &pending))
                .expect("failed to spawn backend worker");
            workers.push(handle);
        }

        Ok(Backend {
            uuid,
            block_size: config.block_size,
            block_count: config.block_count,
            queue,
            pending,
            workers: Mutex::new(workers),
        })
    }

    fn init_data_dir<S: BlobStore>(session: &mut S, opts: &BackendOptions) -> Result<DeviceConfig> {
        let block_size = opts
            .block_size
            .ok_or_else(|| Error::DataDir("block size required to initialize".into()))?;
        let total_size = opts
            .total_size
            .ok_or_else(|| Error::DataDir("total size required to initialize".into()))?;
        if block_size == 0 || total_size < block_size {
            return Err(Error::DataDir(format!(
                "total size {total_size} cannot hold a single block of {block_size}"
            )));
        }

        let used_size = total_size / block_size * block_size;
        if used_size != total_size {
            info!("only using {used_size} bytes of the requested {total_size}");
        }
        let config = DeviceConfig {
            version: CONFIG_VERSION,
            block_size,
            block_count: used_size / block_size,
        };
        info!(
            block_size = config.block_size,
            block_count = config.block_count,
            "initializing data directory"
        );
        let raw = serde_json::to_vec(&config)
            .map_err(|e| Error::DataDir(format!("encoding config blob: {e}")))?;
        session.put(CONFIG_BLOB, &raw)?;
        Ok(config)
    }

    /// SHA-1 of the data directory's canonical identifier, hex encoded.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn total_size(&self) -> u64 {
        self.block_size * self.block_count
    }

    /// Fetch exactly one block; an absent blob reads as all zeros.
    pub fn read_block(&self, block: u64, priority: Priority, done: ReadDone) {
        debug_assert!(block < self.block_count);
        self.pending.submit();
        self.queue.put(Job::Read { block, done }, priority);
    }

    /// Store exactly one block, creating the blob if absent.
    pub fn write_block(&self, block: u64, data: Vec<u8>, priority: Priority, done: WriteDone) {
        debug_assert!(block < self.block_count);
        assert_eq!(data.len() as u64, self.block_size, "short block write");
        self.pending.submit();
        self.queue.put(Job::Write { block, data, done }, priority);
    }

    /// Blocking read, used by tools and tests.
    pub fn read_block_sync(&self, block: u64, priority: Priority) -> Result<Vec<u8>> {
        let (tx, rx) = flume::bounded(1);
        self.read_block(block, priority, Box::new(move |res| drop(tx.send(res))));
        rx.recv().map_err(|_| Error::Closed)?
    }

    /// Blocking write, used by tools and tests.
    pub fn write_block_sync(&self, block: u64, data: Vec<u8>, priority: Priority) -> Result<()> {
        let (tx, rx) = flume::bounded(1);
        self.write_block(block, data, priority, Box::new(move |res| drop(tx.send(res))));
        rx.recv().map_err(|_| Error::Closed)?
    }

    /// Block until every submitted operation has completed.
    pub fn sync(&self) {
        self.pending.wait_drained();
    }

    /// Quiesce and stop the workers. Non-forced drains the queue first.
    pub fn end(&self, force: bool) {
        if !force {
            self.sync();
        }
        self.queue.close();
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
        info!("backend stopped");
    }
}

fn worker_loop<S: BlobStore>(
    mut session: S,
    block_size: u64,
    queue: &PriorityQueue<Job>,
    pending: &Pending,
) {
    while let Some(job) = queue.get() {
        match job {
            Job::Read { block, done } => {
                let res = read_one(&mut session, block_size, block);
                if let Err(e) = &res {
                    error!(block, "backend read failed: {e}");
                }
                done(res);
            }
            Job::Write { block, data, done } => {
                let res = session.put(&block_blob_name(block), &data);
                if let Err(e) = &res {
                    error!(block, "backend write failed: {e}");
                }
                done(res);
            }
        }
        pending.finish();
    }
}

fn read_one<S: BlobStore>(session: &mut S, block_size: u64, block: u64) -> Result<Vec<u8>> {
    match session.get(&block_blob_name(block))? {
        Some(data) => {
            if data.len() as u64 != block_size {
                return Err(Error::Backend(format!(
                    "blob {} is {} bytes, expected {block_size}",
                    block_blob_name(block),
                    data.len()
                )));
            }
            Ok(data)
        }
        None => Ok(vec![0u8; block_size as usize]),
    }
}
