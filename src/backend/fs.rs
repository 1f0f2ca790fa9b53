// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{Error, Result};

use super::BlobStore;

/// Blob store over a local directory, one file per blob. This is the
/// stand-in for the remote drive folder: the same layout (`config` +
/// `gbd_b<idx>`), addressed through the same narrow interface a cloud
/// client would implement.
#[derive(Debug, Clone)]
pub struct FsStore {
    dir: PathBuf,
    id: String,
}

impl FsStore {
    /// Open `dir` as a data directory, creating it when `create` is set.
    pub fn open(dir: &Path, create: bool) -> Result<Self> {
        if !dir.is_dir() {
            if !create {
                return Err(Error::DataDir(format!(
                    "can't locate data directory `{}`",
                    dir.display()
                )));
            }
            fs::create_dir_all(dir)
                .map_err(|e| Error::DataDir(format!("creating `{}`: {e}", dir.display())))?;
        }
        let canonical = dir
            .canonicalize()
            .map_err(|e| Error::DataDir(format!("resolving `{}`: {e}", dir.display())))?;
        let id = canonical.to_string_lossy().into_owned();
        Ok(FsStore {
            dir: canonical,
            id,
        })
    }
}

impl BlobStore for FsStore {
    fn canonical_id(&self) -> &str {
        &self.id
    }

    fn get(&mut self, name: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.dir.join(name)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Backend(format!("reading blob `{name}`: {e}"))),
        }
    }

    fn put(&mut self, name: &str, data: &[u8]) -> Result<()> {
        debug!(name, len = data.len(), "store blob");
        fs::write(self.dir.join(name), data)
            .map_err(|e| Error::Backend(format!("writing blob `{name}`: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_missing_without_create_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope");
        assert!(matches!(
            FsStore::open(&missing, false),
            Err(Error::DataDir(_))
        ));
        let mut store = FsStore::open(&missing, true).unwrap();
        assert_eq!(store.get("config").unwrap(), None);
    }

    #[test]
    fn put_get_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = FsStore::open(tmp.path(), false).unwrap();
        store.put("gbd_b0", b"12345678").unwrap();
        assert_eq!(store.get("gbd_b0").unwrap().unwrap(), b"12345678");
        assert_eq!(store.get("gbd_b1").unwrap(), None);
    }

    #[test]
    fn clones_share_the_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let mut a = FsStore::open(tmp.path(), false).unwrap();
        let mut b = a.clone();
        assert_eq!(a.canonical_id(), b.canonical_id());
        a.put("x", b"1").unwrap();
        assert_eq!(b.get("x").unwrap().unwrap(), b"1");
    }
}
