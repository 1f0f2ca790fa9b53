// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::utils::Priority;

use super::{EMPTY, Shared};

/// Drains dirty slots to the backend. A slot is written only once it has
/// quiesced for `writeback_delay`; a head that is still hot goes back to
/// the *head* of the dirty queue (preserving its order) and the daemon
/// sleeps out the remainder. Failed writes requeue the slot and retry
/// indefinitely; the gate and the queue depth provide the pacing.
pub(crate) fn run(shared: Arc<Shared>) {
    loop {
        shared.wb_gate.acquire();
        let counted = |_slot: usize| {
            shared.outstanding.fetch_add(1, Ordering::SeqCst);
        };
        let Some(slot) = shared.dirty.get_and(counted) else {
            shared.wb_gate.release();
            break;
        };

        let to_sleep = {
            let table = shared.table.lock();
            table.last_modify[slot]
                .map(|at| {
                    (at + shared.opts.writeback_delay).saturating_duration_since(Instant::now())
                })
                .filter(|d| !d.is_zero())
        };
        if let Some(d) = to_sleep {
            shared.dirty.unget(slot);
            shared.outstanding.fetch_sub(1, Ordering::SeqCst);
            shared.wb_gate.release();
            trace!(slot, "writeback waiting {d:?} for quiescence");
            std::thread::sleep(d);
            continue;
        }

        let block = {
            let table = shared.table.lock();
            let block = table.reverse[slot];
            assert_ne!(block, EMPTY, "dirty slot {slot} is unmapped");
            assert_eq!(
                table.forward.get(&block).copied(),
                Some(slot),
                "slot map out of sync at {slot}"
            );
            block
        };

        // The slot is busy now; its bytes are stable until reclassified.
        let data = shared.read_slot(slot);
        debug!(block, slot, "writeback");
        let completion = {
            let shared = Arc::clone(&shared);
            Box::new(move |res: crate::Result<()>| {
                match res {
                    Ok(()) => shared.clean.put(slot),
                    Err(e) => {
                        warn!(block, slot, "writeback failed, queued for retry: {e}");
                        shared.dirty.put(slot);
                    }
                }
                shared.drain_delay(block);
                shared.outstanding.fetch_sub(1, Ordering::SeqCst);
                shared.wb_gate.release();
            })
        };
        shared.backend.write_block(block, data, Priority::Low, completion);
    }
    debug!("writeback daemon stopped");
}
