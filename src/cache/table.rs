// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::VecDeque;
use std::fs::File;
use std::time::Instant;

use ahash::HashMap;
use byteorder::{BigEndian, ByteOrder};
use positioned_io::{ReadAt, WriteAt};
use tracing::{debug, info};

use crate::{Error, Result};

use super::PullRequest;

/// Reverse-table sentinel for an unassigned slot.
pub const EMPTY: u64 = 0xffff_ffff_ffff_ffff;

/// The in-memory slot table, guarded as one unit by the slot-table lock.
/// `forward` and `reverse` mirror each other; the delay map holds requests
/// parked behind busy slots and so belongs to the same critical sections.
pub(crate) struct TableState {
    /// `block index -> slot index`, present iff the block is cached.
    pub forward: HashMap<u64, usize>,
    /// `slot index -> block index`, [`EMPTY`] when unassigned. Only this
    /// side is persisted; `forward` is rebuilt on attach.
    pub reverse: Vec<u64>,
    /// Wall clock of the last local write per slot, consulted by the
    /// writeback quiescence delay.
    pub last_modify: Vec<Option<Instant>>,
    /// Per-block FIFO of requests waiting for a busy slot.
    pub delay: HashMap<u64, VecDeque<PullRequest>>,
}

impl TableState {
    pub fn new(entry_count: usize) -> Self {
        TableState {
            forward: HashMap::default(),
            reverse: vec![EMPTY; entry_count],
            last_modify: vec![None; entry_count],
            delay: HashMap::default(),
        }
    }
}

/// Read the persisted map from the cache-file header. Returns `None` for a
/// never-attached (all-zero uuid) file; verifies the uuid and the
/// injectivity of the stored table otherwise.
pub(crate) fn load_map(
    file: &File,
    uuid: &str,
    block_count: u64,
    entry_count: usize,
) -> Result<Option<(HashMap<u64, usize>, Vec<u64>)>> {
    let uuid_bytes = uuid.as_bytes();
    let mut header = vec![0u8; uuid_bytes.len()];
    file.read_exact_at(0, &mut header)?;
    if header.iter().all(|b| *b == 0) {
        info!("cache file is empty, not loading anything");
        return Ok(None);
    }
    if header.as_slice() != uuid_bytes {
        return Err(Error::UuidMismatch {
            expected: uuid.to_string(),
            found: String::from_utf8_lossy(&header).into_owned(),
        });
    }

    let mut packed = vec![0u8; 8 * entry_count];
    file.read_exact_at(uuid_bytes.len() as u64, &mut packed)?;

    let mut forward = HashMap::default();
    let mut reverse = vec![EMPTY; entry_count];
    for (slot, raw) in packed.chunks_exact(8).enumerate() {
        let entry = BigEndian::read_u64(raw);
        if entry == EMPTY {
            continue;
        }
        if entry >= block_count {
            return Err(Error::CorruptMap(format!(
                "slot {slot} maps block {entry}, device has only {block_count} blocks"
            )));
        }
        if forward.insert(entry, slot).is_some() {
            return Err(Error::CorruptMap(format!("block {entry} is mapped twice")));
        }
        reverse[slot] = entry;
        debug!("map {entry} => {slot}");
    }
    Ok(Some((forward, reverse)))
}

/// Persist `uuid || packed reverse` into the cache-file header. Slot
/// bodies are already in place, written lazily by normal operation.
pub(crate) fn save_map(file: &mut File, uuid: &str, reverse: &[u64]) -> Result<()> {
    info!("saving slot map");
    file.write_all_at(0, uuid.as_bytes())?;
    let mut packed = vec![0u8; 8 * reverse.len()];
    for (raw, entry) in packed.chunks_exact_mut(8).zip(reverse) {
        BigEndian::write_u64(raw, *entry);
    }
    file.write_all_at(uuid.len() as u64, &packed)?;
    file.sync_all()?;
    Ok(())
}
