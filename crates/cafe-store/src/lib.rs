//! cafe-store: a content-addressed blob store on disk.
//!
//! Layout is `objects/<first-2-hex>/<remaining-38-hex>`, one immutable file
//! per hash. `store` is idempotent and prefers a rename over a copy when a
//! source path is given; written files are made read-only afterwards.
//! Grounded on `caflib/Cellar.py::Cellar.store`/`gc` and
//! `turborepo-cache::fs::FSCache`'s existence-check-before-work style.

use std::{
    collections::HashSet,
    fs,
    io,
    sync::Mutex,
};

use cafe_hash::Hash;
use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object {0} not found")]
    NotFound(Hash),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("stored blob {hash} does not match its content hash")]
    HashMismatch { hash: Hash },
}

/// Content-addressed blob store rooted at `<cafdir>/objects`.
pub struct FileStore {
    root: Utf8PathBuf,
    /// In-memory cache of hashes known to exist, avoiding a repeated `stat`
    /// for blobs we ourselves already stored this process.
    known: Mutex<HashSet<Hash>>,
}

impl FileStore {
    pub fn open(root: impl Into<Utf8PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            known: Mutex::new(HashSet::new()),
        })
    }

    pub fn path_for(&self, hash: &Hash) -> Utf8PathBuf {
        let (prefix, rest) = hash.shard();
        self.root.join(prefix).join(rest)
    }

    fn already_known(&self, hash: &Hash) -> bool {
        self.known.lock().expect("store lock poisoned").contains(hash)
    }

    fn remember(&self, hash: Hash) {
        self.known.lock().expect("store lock poisoned").insert(hash);
    }

    /// Stores `bytes` under `hash`. A no-op if the object already exists.
    #[tracing::instrument(skip(self, bytes))]
    pub fn store_bytes(&self, hash: Hash, bytes: &[u8]) -> Result<bool, StoreError> {
        if self.already_known(&hash) {
            return Ok(false);
        }
        let path = self.path_for(&hash);
        if path.is_file() {
            self.remember(hash);
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bytes)?;
        make_readonly(&path)?;
        self.remember(hash);
        debug!(%hash, "stored blob");
        Ok(true)
    }

    /// Stores the file at `source` under `hash`, moving it into place when
    /// possible (falls back to copy-then-remove across filesystems).
    #[tracing::instrument(skip(self))]
    pub fn store_path(&self, hash: Hash, source: &Utf8Path) -> Result<bool, StoreError> {
        if self.already_known(&hash) {
            return Ok(false);
        }
        let dest = self.path_for(&hash);
        if dest.is_file() {
            self.remember(hash);
            return Ok(false);
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::rename(source, &dest) {
            Ok(()) => {}
            Err(_) => {
                fs::copy(source, &dest)?;
                fs::remove_file(source)?;
            }
        }
        make_readonly(&dest)?;
        self.remember(hash);
        debug!(%hash, "stored blob (moved)");
        Ok(true)
    }

    /// Returns the path of the blob for `hash`, or `NotFound`.
    pub fn get(&self, hash: &Hash) -> Result<Utf8PathBuf, StoreError> {
        let path = self.path_for(hash);
        if path.is_file() {
            Ok(path)
        } else {
            Err(StoreError::NotFound(*hash))
        }
    }

    pub fn read(&self, hash: &Hash) -> Result<Vec<u8>, StoreError> {
        let path = self.get(hash)?;
        Ok(fs::read(path)?)
    }

    /// Deletes every object file whose hash is not in `retain`. Returns the
    /// number of files removed.
    #[tracing::instrument(skip(self, retain))]
    pub fn gc(&self, retain: &HashSet<Hash>) -> Result<usize, StoreError> {
        let mut removed = 0;
        for shard_entry in fs::read_dir(&self.root)? {
            let shard_entry = shard_entry?;
            if !shard_entry.file_type()?.is_dir() {
                continue;
            }
            let shard_path = shard_entry.path();
            for file_entry in fs::read_dir(&shard_path)? {
                let file_entry = file_entry?;
                let Some(shard) = shard_path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let Some(rest) = file_entry.file_name().to_str().map(str::to_owned) else {
                    continue;
                };
                let candidate = format!("{shard}{rest}");
                let Ok(hash) = candidate.parse::<Hash>() else {
                    continue;
                };
                if !retain.contains(&hash) {
                    fs::remove_file(file_entry.path())?;
                    removed += 1;
                }
            }
        }
        self.known
            .lock()
            .expect("store lock poisoned")
            .retain(|h| retain.contains(h));
        debug!(removed, "gc removed unreferenced blobs");
        Ok(removed)
    }
}

#[cfg(unix)]
fn make_readonly(path: &Utf8Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o444);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn make_readonly(path: &Utf8Path) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cafe_hash::hash_bytes;

    fn temp_store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().join("objects")).unwrap();
        let store = FileStore::open(root).unwrap();
        (dir, store)
    }

    #[test]
    fn store_and_get_round_trips_content() {
        let (_dir, store) = temp_store();
        let bytes = b"hello world";
        let hash = hash_bytes(bytes);
        assert!(store.store_bytes(hash, bytes).unwrap());
        assert_eq!(store.read(&hash).unwrap(), bytes);
    }

    #[test]
    fn store_is_idempotent() {
        let (_dir, store) = temp_store();
        let bytes = b"data";
        let hash = hash_bytes(bytes);
        assert!(store.store_bytes(hash, bytes).unwrap());
        assert!(!store.store_bytes(hash, bytes).unwrap());
    }

    #[test]
    fn get_missing_is_not_found() {
        let (_dir, store) = temp_store();
        let hash = hash_bytes(b"never stored");
        assert!(matches!(store.get(&hash), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn gc_retains_only_listed_hashes() {
        let (_dir, store) = temp_store();
        let keep = hash_bytes(b"keep");
        let drop = hash_bytes(b"drop");
        store.store_bytes(keep, b"keep").unwrap();
        store.store_bytes(drop, b"drop").unwrap();

        let mut retain = std::collections::HashSet::new();
        retain.insert(keep);
        let removed = store.gc(&retain).unwrap();

        assert_eq!(removed, 1);
        assert!(store.get(&keep).is_ok());
        assert!(store.get(&drop).is_err());
    }

    #[test]
    fn stored_file_is_read_only() {
        let (_dir, store) = temp_store();
        let hash = hash_bytes(b"ro");
        store.store_bytes(hash, b"ro").unwrap();
        let path = store.get(&hash).unwrap();
        let metadata = fs::metadata(path).unwrap();
        assert!(metadata.permissions().readonly());
    }
}
