// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use thiserror::Error;

/// Errors surfaced by the device, the cache and the backend.
///
/// Backend failures are transient: the writeback daemon retries them and
/// pulls report them to the caller. Everything touching the local cache
/// file is fatal, since the cache holds the only copy of dirty data.
#[derive(Debug, Error)]
pub enum Error {
    #[error("backend i/o failed: {0}")]
    Backend(String),
    #[error("cache file i/o failed: {0}")]
    Cache(#[from] std::io::Error),
    #[error("cache file belongs to another backend (cache uuid {found}, backend uuid {expected})")]
    UuidMismatch { expected: String, found: String },
    #[error("corrupt slot map: {0}")]
    CorruptMap(String),
    #[error("cache file too small: {0} bytes leave no room for a slot")]
    CacheTooSmall(u64),
    #[error(
        "request out of range: offset {offset} + length {length} exceeds device size {total_size}"
    )]
    OutOfRange {
        offset: u64,
        length: u64,
        total_size: u64,
    },
    #[error("zero-length request")]
    ZeroLength,
    #[error("backend data directory: {0}")]
    DataDir(String),
    #[error("backend config version mismatch: found {found}, supported {supported}")]
    VersionMismatch { found: u32, supported: u32 },
    #[error("device is shut down")]
    Closed,
}
