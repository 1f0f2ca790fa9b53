// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use quickcheck_macros::quickcheck;

use super::*;
use crate::backend::{Backend, BackendOptions, MemoryStore, block_blob_name};

struct Harness {
    device: CachedDevice,
    store: MemoryStore,
    cache: tempfile::NamedTempFile,
    block_size: u64,
}

fn open_backend(store: &MemoryStore, block_size: u64, block_count: u64, workers: usize) -> Backend {
    Backend::open(
        store.clone(),
        &BackendOptions {
            workers,
            create: true,
            block_size: Some(block_size),
            total_size: Some(block_size * block_count),
        },
    )
    .unwrap()
}

fn test_options(attach_dirty: bool) -> CacheOptions {
    CacheOptions {
        attach_dirty,
        writeback_delay: Duration::from_millis(15),
        writeback_concurrency: 8,
        sync_poll: Duration::from_millis(5),
    }
}

fn harness(block_size: u64, block_count: u64, entry_count: u64) -> Harness {
    let store = MemoryStore::new();
    let backend = open_backend(&store, block_size, block_count, 4);
    let cache = tempfile::NamedTempFile::new().unwrap();
    cache
        .as_file()
        .set_len(40 + entry_count * (block_size + 8))
        .unwrap();
    let device = CachedDevice::attach(cache.path(), backend, test_options(false)).unwrap();
    Harness {
        device,
        store,
        cache,
        block_size,
    }
}

impl Harness {
    /// End the device and attach the same cache file again.
    fn reattach(self, attach_dirty: bool) -> Harness {
        self.device.end(false).unwrap();
        let backend = open_backend(&self.store, self.block_size, 4, 4);
        let device =
            CachedDevice::attach(self.cache.path(), backend, test_options(attach_dirty)).unwrap();
        Harness {
            device,
            store: self.store,
            cache: self.cache,
            block_size: self.block_size,
        }
    }

    fn blob(&self, block: u64) -> Option<Vec<u8>> {
        self.store.blob(&block_blob_name(block))
    }
}

/// Slot-table invariants: forward/reverse mirror each other and no block
/// is mapped twice.
fn check_map(device: &CachedDevice) {
    let table = device.shared.table.lock();
    for (&block, &slot) in &table.forward {
        assert_eq!(table.reverse[slot], block, "forward/reverse disagree");
    }
    let mut seen = HashSet::new();
    for (slot, &block) in table.reverse.iter().enumerate() {
        if block != EMPTY {
            assert!(seen.insert(block), "block {block} mapped twice");
            assert_eq!(table.forward.get(&block), Some(&slot));
        }
    }
}

/// After a sync every slot must be clean: in exactly one queue, none busy,
/// and the backend must agree with the cache for every mapped slot.
fn check_synced(device: &CachedDevice, store: &MemoryStore) {
    assert!(device.shared.dirty.is_empty());
    assert!(device.shared.pull_queue.is_empty());
    assert!(device.shared.table.lock().delay.is_empty());
    for slot in 0..device.shared.geo.entry_count {
        assert!(
            device.shared.clean.contains(slot) && !device.shared.dirty.contains(slot),
            "slot {slot} is not clean after sync"
        );
    }
    let table = device.shared.table.lock();
    for (slot, &block) in table.reverse.iter().enumerate() {
        if block != EMPTY {
            let local = device.shared.read_slot(slot);
            let remote = store
                .blob(&block_blob_name(block))
                .unwrap_or_else(|| vec![0u8; local.len()]);
            assert_eq!(local, remote, "backend differs from cache for block {block}");
        }
    }
}

#[test]
fn write_then_read_then_sync_reaches_backend() {
    let h = harness(8, 4, 2);
    h.device.write(0, b"ABCDEFGH").unwrap();
    assert_eq!(h.device.read(0, 8).unwrap(), b"ABCDEFGH");
    h.device.sync();
    assert_eq!(h.blob(0).unwrap(), b"ABCDEFGH");
    check_map(&h.device);
    check_synced(&h.device, &h.store);
    h.device.end(false).unwrap();
}

#[test]
fn unaligned_write_reads_back_zero_padded() {
    let h = harness(8, 4, 2);
    h.device.write(4, b"abcdefgh").unwrap();
    assert_eq!(h.device.read(0, 16).unwrap(), b"\0\0\0\0abcdefgh\0\0\0\0");
    h.device.end(false).unwrap();
}

#[test]
fn eviction_refetches_from_backend() {
    let h = harness(8, 4, 2);
    h.device.write(0, b"AAAAAAAA").unwrap();
    h.device.write(8, b"BBBBBBBB").unwrap();
    // A third block exceeds the two slots; the LRU victim is evicted
    // once the writeback daemon has cleaned it.
    h.device.write(16, b"CCCCCCCC").unwrap();
    assert_eq!(h.device.read(0, 8).unwrap(), b"AAAAAAAA");
    assert_eq!(h.device.read(8, 8).unwrap(), b"BBBBBBBB");
    assert_eq!(h.device.read(16, 8).unwrap(), b"CCCCCCCC");
    check_map(&h.device);
    h.device.end(false).unwrap();
}

#[test]
fn four_blocks_through_two_slots() {
    let h = harness(8, 4, 2);
    for (i, chunk) in [b"AAAAAAAA", b"BBBBBBBB", b"CCCCCCCC", b"DDDDDDDD"]
        .iter()
        .enumerate()
    {
        h.device.write(i as u64 * 8, *chunk).unwrap();
    }
    h.device.sync();
    for (i, chunk) in [b"AAAAAAAA", b"BBBBBBBB", b"CCCCCCCC", b"DDDDDDDD"]
        .iter()
        .enumerate()
    {
        assert_eq!(h.device.read(i as u64 * 8, 8).unwrap(), *chunk);
        assert_eq!(h.blob(i as u64).unwrap(), *chunk);
    }
    check_map(&h.device);
    h.device.end(false).unwrap();
}

#[test]
fn concurrent_reads_coalesce_into_one_fetch() {
    let h = harness(8, 4, 2);
    h.store.insert(&block_blob_name(0), b"12345678".to_vec());
    h.store.set_latency(Some(Duration::from_millis(30)));
    std::thread::scope(|scope| {
        let a = scope.spawn(|| h.device.read(0, 8).unwrap());
        let b = scope.spawn(|| h.device.read(0, 8).unwrap());
        assert_eq!(a.join().unwrap(), b"12345678");
        assert_eq!(b.join().unwrap(), b"12345678");
    });
    h.store.set_latency(None);
    assert_eq!(h.store.get_count(&block_blob_name(0)), 1);
    h.device.end(false).unwrap();
}

#[test]
fn attach_dirty_repushes_cache_to_backend() {
    let h = harness(8, 4, 2);
    h.device.write(0, b"AAAAAAAA").unwrap();
    h.device.write(8, b"BBBBBBBB").unwrap();
    h.device.sync();

    // Rewind the backend behind the cache's back, then reattach with the
    // dirty flag: everything the cache holds must be pushed again.
    h.store.insert(&block_blob_name(0), b"xxxxxxxx".to_vec());
    h.store.insert(&block_blob_name(1), b"yyyyyyyy".to_vec());
    let h = h.reattach(true);
    h.device.sync();
    assert_eq!(h.blob(0).unwrap(), b"AAAAAAAA");
    assert_eq!(h.blob(1).unwrap(), b"BBBBBBBB");
    check_synced(&h.device, &h.store);
    h.device.end(false).unwrap();
}

#[test]
fn clean_reattach_serves_from_cache() {
    let h = harness(8, 4, 2);
    h.device.write(0, b"AAAAAAAA").unwrap();
    h.device.sync();
    let h = h.reattach(false);
    // Corrupt the backend copy: a cache hit must not notice.
    h.store.insert(&block_blob_name(0), b"xxxxxxxx".to_vec());
    assert_eq!(h.device.read(0, 8).unwrap(), b"AAAAAAAA");
    assert_eq!(h.store.get_count(&block_blob_name(0)), 0);
    h.device.end(false).unwrap();
}

#[test]
fn whole_device_round_trip() {
    let h = harness(8, 4, 2);
    let data: Vec<u8> = (0u8..32).collect();
    h.device.write(0, &data).unwrap();
    assert_eq!(h.device.read(0, 32).unwrap(), data);
    h.device.sync();
    check_synced(&h.device, &h.store);
    h.device.end(false).unwrap();
}

#[test]
fn single_byte_accesses_at_block_edges() {
    let h = harness(8, 4, 4);
    for offset in [0u64, 3, 7, 8, 15, 31] {
        h.device.write(offset, &[offset as u8 + 1]).unwrap();
        assert_eq!(h.device.read(offset, 1).unwrap(), [offset as u8 + 1]);
    }
    h.device.end(false).unwrap();
}

#[test]
fn range_with_one_byte_in_second_block() {
    let h = harness(8, 4, 2);
    h.device.write(4, b"vwxyz").unwrap();
    assert_eq!(h.device.read(4, 5).unwrap(), b"vwxyz");
    assert_eq!(h.device.read(8, 1).unwrap(), b"z");
    h.device.end(false).unwrap();
}

#[test]
fn single_slot_cache_evicts_continuously() {
    let h = harness(8, 4, 1);
    for block in 0u64..4 {
        h.device.write(block * 8, &[block as u8 + 1; 8]).unwrap();
    }
    for block in 0u64..4 {
        assert_eq!(h.device.read(block * 8, 8).unwrap(), [block as u8 + 1; 8]);
    }
    check_map(&h.device);
    h.device.end(false).unwrap();
}

#[test]
fn rapid_rewrites_issue_one_backend_write() {
    let store = MemoryStore::new();
    let backend = open_backend(&store, 8, 4, 4);
    let cache = tempfile::NamedTempFile::new().unwrap();
    cache.as_file().set_len(40 + 2 * (8 + 8)).unwrap();
    let device = CachedDevice::attach(
        cache.path(),
        backend,
        CacheOptions {
            writeback_delay: Duration::from_millis(50),
            sync_poll: Duration::from_millis(5),
            ..Default::default()
        },
    )
    .unwrap();

    for i in 0u8..5 {
        device.write(0, &[i; 8]).unwrap();
    }
    device.sync();
    // All five rewrites land inside one quiescence window, so the daemon
    // batches them: one write per window, two windows at most (a rewrite
    // racing the daemon's dequeue can ride into a second one).
    assert!(store.put_count(&block_blob_name(0)) <= 2);
    assert_eq!(store.blob(&block_blob_name(0)).unwrap(), [4u8; 8]);
    device.end(false).unwrap();
}

#[test]
fn same_block_requests_complete_in_enqueue_order() {
    let h = harness(8, 4, 2);
    let order = std::sync::Arc::new(Mutex::new(Vec::new()));
    for i in 0usize..20 {
        let order = std::sync::Arc::clone(&order);
        h.device.write_with(0, &[i as u8; 8], move |res| {
            res.unwrap();
            order.lock().unwrap().push(i);
        });
    }
    h.device.sync();
    let order = order.lock().unwrap();
    assert_eq!(*order, (0..20).collect::<Vec<_>>());
    assert_eq!(h.device.read(0, 8).unwrap(), [19u8; 8]);
    h.device.end(false).unwrap();
}

#[test]
fn pull_error_propagates_and_the_slot_recovers() {
    let h = harness(8, 4, 2);
    h.store.fail_reads(true);
    // A partial read needs the existing block, so the miss hits the
    // failing backend.
    let err = h.device.read(0, 1).unwrap_err();
    assert!(matches!(err, Error::Backend(_)));
    h.store.fail_reads(false);
    assert_eq!(h.device.read(0, 1).unwrap(), [0u8]);
    check_map(&h.device);
    h.device.end(false).unwrap();
}

#[test]
fn writeback_retries_until_the_backend_recovers() {
    let h = harness(8, 4, 2);
    h.store.fail_writes(true);
    h.device.write(0, b"AAAAAAAA").unwrap();
    std::thread::sleep(Duration::from_millis(40));
    assert_eq!(h.blob(0), None);
    h.store.fail_writes(false);
    h.device.sync();
    assert_eq!(h.blob(0).unwrap(), b"AAAAAAAA");
    h.device.end(false).unwrap();
}

#[test]
fn uuid_mismatch_refuses_to_attach() {
    let h = harness(8, 4, 2);
    h.device.write(0, b"AAAAAAAA").unwrap();
    h.device.end(false).unwrap();

    let other = MemoryStore::new();
    let backend = open_backend(&other, 8, 4, 1);
    let err = CachedDevice::attach(h.cache.path(), backend, test_options(false)).unwrap_err();
    assert!(matches!(err, Error::UuidMismatch { .. }));
}

#[test]
fn argument_errors_never_touch_state() {
    let h = harness(8, 4, 2);
    assert!(matches!(h.device.read(0, 0), Err(Error::ZeroLength)));
    assert!(matches!(h.device.write(0, b""), Err(Error::ZeroLength)));
    assert!(matches!(
        h.device.read(28, 8),
        Err(Error::OutOfRange { .. })
    ));
    assert!(matches!(
        h.device.write(u64::MAX, b"x"),
        Err(Error::OutOfRange { .. })
    ));
    // Nothing was pulled, queued or mapped.
    assert!(h.device.shared.table.lock().forward.is_empty());
    assert!(h.device.shared.pull_queue.is_empty());
    h.device.end(false).unwrap();
}

#[test]
fn map_survives_reattach() {
    let h = harness(8, 4, 2);
    h.device.write(0, b"AAAAAAAA").unwrap();
    h.device.write(8, b"BBBBBBBB").unwrap();
    h.device.sync();
    let before: Vec<u64> = h.device.shared.table.lock().reverse.clone();
    let h = h.reattach(false);
    assert_eq!(h.device.shared.table.lock().reverse, before);
    check_map(&h.device);
    h.device.end(false).unwrap();
}

#[quickcheck]
fn random_ranges_round_trip(ops: Vec<(u64, u8, u8)>) -> bool {
    const TOTAL: u64 = 64;
    let h = harness(8, 8, 4);
    let mut shadow = vec![0u8; TOTAL as usize];
    for (offset, len, value) in ops.into_iter().take(12) {
        let offset = offset % TOTAL;
        let len = 1 + u64::from(len) % (TOTAL - offset);
        h.device
            .write(offset, &vec![value; len as usize])
            .unwrap();
        shadow[offset as usize..(offset + len) as usize].fill(value);
    }
    let ok = h.device.read(0, TOTAL).unwrap() == shadow;
    h.device.sync();
    let synced = h
        .device
        .shared
        .dirty
        .is_empty();
    h.device.end(false).unwrap();
    ok && synced
}
