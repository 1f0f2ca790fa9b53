// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, trace, warn};

use crate::utils::Priority;
use crate::{Error, Result};

use super::{DirtyHint, EMPTY, PullCompletion, PullRequest, Shared};

/// Single consumer of the pull queue. Every dequeued request either
/// settles its slot (classifying it clean or dirty and draining one
/// delayed follower) or parks in the delay map behind a busy slot.
pub(crate) fn run(shared: Arc<Shared>) {
    while let Some(req) = shared.pull_queue.get() {
        handle(&shared, req);
    }
    debug!("pull daemon stopped");
}

fn handle(shared: &Arc<Shared>, req: PullRequest) {
    let block = req.block;
    let slot;
    let was_dirty;
    let new_block;

    let mut table = shared.table.lock();
    match table.forward.get(&block).copied() {
        Some(s) => {
            // At most one of the two queues holds the slot. Neither
            // holding it means a pull or writeback is mid-flight: park
            // the request, it is requeued when the slot settles.
            let in_clean = shared.clean.pop(s);
            let in_dirty = shared.dirty.pop(s);
            assert!(!(in_clean && in_dirty), "slot {s} linked in both queues");
            if !in_clean && !in_dirty {
                trace!(block, slot = s, "slot busy, delaying request");
                table.delay.entry(block).or_default().push_back(req);
                return;
            }
            drop(table);
            slot = s;
            was_dirty = in_dirty;
            new_block = false;
        }
        None => {
            // Miss. The victim wait must not hold the table lock: the
            // writeback daemon needs the table to turn dirty slots
            // clean, and with an all-dirty cache that is the only way
            // a victim ever appears.
            drop(table);
            let Some(s) = shared.clean.get() else {
                (req.done)(Err(Error::Closed), 0);
                shared.outstanding.fetch_sub(1, Ordering::SeqCst);
                return;
            };
            let mut table = shared.table.lock();
            let old = table.reverse[s];
            if old != EMPTY {
                debug!(block = old, slot = s, "evicting");
                let prev = table.forward.remove(&old);
                assert_eq!(prev, Some(s), "reverse map out of sync at slot {s}");
            }
            table.reverse[s] = block;
            table.forward.insert(block, s);
            slot = s;
            was_dirty = false;
            new_block = true;
        }
    }

    // The slot is busy from here until it settles.
    if !new_block {
        let data = if req.read_data {
            Some(shared.read_slot(slot))
        } else {
            None
        };
        let hint = (req.done)(Ok(data), slot);
        shared.settle(block, slot, was_dirty || hint == DirtyHint::MarkDirty);
    } else if req.pull_data || req.read_data {
        debug!(block, slot, "pull from backend");
        let continuation = {
            let shared = Arc::clone(shared);
            let done = req.done;
            Box::new(move |res| finish_fetch(&shared, block, slot, done, res))
        };
        shared.backend.read_block(block, Priority::Normal, continuation);
        // The continuation settles the slot.
    } else {
        // The caller overwrites the whole slot, so there is nothing to
        // fetch and the slot is dirty no matter what the completion says.
        let _ = (req.done)(Ok(None), slot);
        shared.settle(block, slot, true);
    }
}

/// Continuation of a miss that needed backend data; runs on a backend
/// worker thread.
fn finish_fetch(
    shared: &Arc<Shared>,
    block: u64,
    slot: usize,
    done: PullCompletion,
    res: Result<Vec<u8>>,
) {
    match res {
        Ok(data) => {
            shared.write_slot(slot, &data);
            let hint = done(Ok(Some(data)), slot);
            shared.settle(block, slot, hint == DirtyHint::MarkDirty);
        }
        Err(e) => {
            warn!(block, slot, "pull failed: {e}");
            // The fetch never reached the slot, so the mapping is
            // dropped and the slot freed; a later request for the block
            // misses and refetches.
            {
                let mut table = shared.table.lock();
                let prev = table.forward.remove(&block);
                assert_eq!(prev, Some(slot), "fetch target remapped while busy");
                table.reverse[slot] = EMPTY;
                table.last_modify[slot] = None;
            }
            done(Err(e), slot);
            shared.clean.put(slot);
            shared.drain_delay(block);
            shared.outstanding.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
