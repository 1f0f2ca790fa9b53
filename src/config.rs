// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

/// Daemon configuration file. Every field is optional; command-line flags
/// take precedence over values given here.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    /// Path of the local cache file.
    pub cache_file: Option<PathBuf>,
    /// Path of the backend data directory.
    pub data_dir: Option<PathBuf>,
    /// NBD listen address, e.g. `0.0.0.0:10809`.
    pub listen: Option<String>,
    pub create: Option<bool>,
    /// Geometry used when initializing a new data directory.
    pub block_size: Option<u64>,
    pub size: Option<u64>,
    /// Size of the cache file if it has to be created.
    pub cache_size: Option<u64>,
    /// Treat loaded cache entries as dirty on attach.
    pub attach_dirty: Option<bool>,
    pub workers: Option<usize>,
    /// Writeback quiescence delay in humantime form, e.g. `500ms`.
    pub writeback_delay: Option<String>,
    pub writeback_concurrency: Option<usize>,
    /// Turn NBD flush into a full backend sync.
    pub flush_sync: Option<bool>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config `{}`", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config `{}`", path.display()))
    }
}
