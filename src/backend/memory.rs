// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use ahash::HashMap;
use parking_lot::{Mutex, RwLock};

use crate::{Error, Result};

use super::BlobStore;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// A thread-safe in-memory blob store. Clones share the same folder, like
/// sessions against one remote directory. Carries failure injection and
/// per-blob write counters for exercising the retry and write-batching
/// behavior of the cache.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    id: String,
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    gets: Mutex<HashMap<String, usize>>,
    puts: Mutex<HashMap<String, usize>>,
    latency: Mutex<Option<Duration>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let n = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        MemoryStore {
            inner: Arc::new(Inner {
                id: format!("memory-{n}"),
                blobs: RwLock::new(HashMap::default()),
                gets: Mutex::new(HashMap::default()),
                puts: Mutex::new(HashMap::default()),
                latency: Mutex::new(None),
                fail_reads: AtomicBool::new(false),
                fail_writes: AtomicBool::new(false),
            }),
        }
    }

    /// Make subsequent `get` calls fail until cleared.
    pub fn fail_reads(&self, on: bool) {
        self.inner.fail_reads.store(on, Ordering::SeqCst);
    }

    /// Make subsequent `put` calls fail until cleared.
    pub fn fail_writes(&self, on: bool) {
        self.inner.fail_writes.store(on, Ordering::SeqCst);
    }

    /// Current contents of a blob, if present.
    pub fn blob(&self, name: &str) -> Option<Vec<u8>> {
        self.inner.blobs.read().get(name).cloned()
    }

    /// Seed a blob directly, bypassing the counters.
    pub fn insert(&self, name: &str, data: Vec<u8>) {
        self.inner.blobs.write().insert(name.to_string(), data);
    }

    /// Number of successful `put` calls against `name`.
    pub fn put_count(&self, name: &str) -> usize {
        self.inner.puts.lock().get(name).copied().unwrap_or(0)
    }

    /// Number of successful `get` calls against `name`.
    pub fn get_count(&self, name: &str) -> usize {
        self.inner.gets.lock().get(name).copied().unwrap_or(0)
    }

    /// Delay every `get` by `latency`, to hold blocks in flight long
    /// enough for concurrency tests.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.inner.latency.lock() = latency;
    }
}

impl BlobStore for MemoryStore {
    fn canonical_id(&self) -> &str {
        &self.inner.id
    }

    fn get(&mut self, name: &str) -> Result<Option<Vec<u8>>> {
        let latency = *self.inner.latency.lock();
        if let Some(latency) = latency {
            std::thread::sleep(latency);
        }
        if self.inner.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::Backend(format!("injected read failure for `{name}`")));
        }
        *self.inner.gets.lock().entry(name.to_string()).or_insert(0) += 1;
        Ok(self.inner.blobs.read().get(name).cloned())
    }

    fn put(&mut self, name: &str, data: &[u8]) -> Result<()> {
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Backend(format!(
                "injected write failure for `{name}`"
            )));
        }
        self.inner
            .blobs
            .write()
            .insert(name.to_string(), data.to_vec());
        *self.inner.puts.lock().entry(name.to_string()).or_insert(0) += 1;
        Ok(())
    }
}
