// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! GBD exposes a folder of fixed-size blobs in a remote store as a local
//! block device over the NBD protocol. Between the NBD server and the
//! remote backend sits a persistent write-back block cache on local disk:
//! a fixed-capacity slot table with LRU eviction, clean/dirty queues that
//! partition the slots, a delay map serializing requests against in-flight
//! slots, and a writeback daemon draining dirty slots after a quiescence
//! delay. The slot map survives restarts inside the cache file itself.

pub mod backend;
pub mod cache;
pub mod config;
mod error;
pub mod nbd;
pub mod utils;

pub use error::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;
