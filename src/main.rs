// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::net::TcpListener;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use gbd::backend::{Backend, BackendOptions, FsStore};
use gbd::cache::{CacheOptions, CachedDevice};
use gbd::config::ConfigFile;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Serve a remote blob folder as an NBD block device through a local
/// write-back cache.
#[derive(Debug, Parser)]
#[command(name = "gbd", version, about)]
struct Cli {
    /// TOML configuration file; flags given here override its values.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Local cache file. Created zero-filled (see --cache-size) if absent.
    #[arg(long)]
    cache_file: Option<PathBuf>,
    /// Backend data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// NBD listen address.
    #[arg(long)]
    listen: Option<String>,
    /// Initialize a missing data directory.
    #[arg(long)]
    create: bool,
    /// Block size in bytes, used when initializing the data directory.
    #[arg(long)]
    block_size: Option<u64>,
    /// Device size in bytes, used when initializing the data directory.
    #[arg(long)]
    size: Option<u64>,
    /// Cache file size in bytes, used when creating the cache file.
    #[arg(long)]
    cache_size: Option<u64>,
    /// Treat loaded cache entries as dirty (the previous run did not
    /// detach cleanly), so they are all written back to the backend.
    #[arg(long)]
    dirty: bool,
    /// Backend worker threads.
    #[arg(long)]
    workers: Option<usize>,
    /// Writeback quiescence delay, e.g. `500ms`.
    #[arg(long, value_parser = humantime::parse_duration)]
    writeback_delay: Option<Duration>,
    /// Concurrent backend writes issued by the writeback daemon.
    #[arg(long)]
    writeback_concurrency: Option<usize>,
    /// Turn NBD flush into a full backend sync instead of an immediate
    /// acknowledgement.
    #[arg(long)]
    flush_sync: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => ConfigFile::load(path)?,
        None => ConfigFile::default(),
    };

    let cache_file = cli
        .cache_file
        .or(cfg.cache_file)
        .context("--cache-file is required")?;
    let data_dir = cli.data_dir.or(cfg.data_dir).context("--data-dir is required")?;
    let listen = cli
        .listen
        .or(cfg.listen)
        .unwrap_or_else(|| "0.0.0.0:10809".to_string());
    let create = cli.create || cfg.create.unwrap_or(false);
    let writeback_delay = match cli.writeback_delay {
        Some(delay) => Some(delay),
        None => cfg
            .writeback_delay
            .as_deref()
            .map(humantime::parse_duration)
            .transpose()
            .context("writeback_delay in config file")?,
    };

    if !cache_file.exists() {
        let size = cli
            .cache_size
            .or(cfg.cache_size)
            .context("cache file does not exist; --cache-size is required to create it")?;
        if size == 0 {
            bail!("cache size must be positive");
        }
        info!(path = %cache_file.display(), size, "creating cache file");
        let file = std::fs::File::create(&cache_file)
            .with_context(|| format!("creating `{}`", cache_file.display()))?;
        file.set_len(size)?;
        file.sync_all()?;
    }

    let store = FsStore::open(&data_dir, create)?;
    let backend = Backend::open(
        store,
        &BackendOptions {
            workers: cli.workers.or(cfg.workers).unwrap_or(16),
            create,
            block_size: cli.block_size.or(cfg.block_size),
            total_size: cli.size.or(cfg.size),
        },
    )?;
    info!(
        uuid = backend.uuid(),
        block_size = backend.block_size(),
        block_count = backend.block_count(),
        "backend ready"
    );

    let mut cache_opts = CacheOptions {
        attach_dirty: cli.dirty || cfg.attach_dirty.unwrap_or(false),
        ..Default::default()
    };
    if let Some(delay) = writeback_delay {
        cache_opts.writeback_delay = delay;
    }
    if let Some(n) = cli.writeback_concurrency.or(cfg.writeback_concurrency) {
        cache_opts.writeback_concurrency = n;
    }
    let device = CachedDevice::attach(&cache_file, backend, cache_opts)?;

    let flush_sync = cli.flush_sync || cfg.flush_sync.unwrap_or(false);
    let listener = TcpListener::bind(&listen).with_context(|| format!("binding `{listen}`"))?;
    info!(
        addr = %listener.local_addr()?,
        size = device.total_size(),
        "NBD server listening"
    );
    let (conn, peer) = listener.accept()?;
    info!(%peer, "accepted client");
    let served = gbd::nbd::serve_connection(conn, &device, flush_sync);
    device.end(false)?;
    served
}
