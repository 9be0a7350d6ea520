use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::fs;

use crate::Result;

/// Digest of the effective request URL (path plus query). Forms the cache
/// file's base name; distinct URLs map to distinct keys.
pub fn cache_key(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())
}

/// Directory-backed durable tier. The directory listing is the index; there
/// is no manifest. Entries are never invalidated; source images are assumed
/// immutable for a given path.
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    /// Creates the cache directory (recursively) if it does not exist.
    pub async fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.webp"))
    }

    /// Non-empty regular file at `path`. Empty files are leftovers from a
    /// failed transcode and are treated as absent.
    pub async fn exists(&self, path: &Path) -> bool {
        match fs::metadata(path).await {
            Ok(meta) => meta.is_file() && meta.len() > 0,
            Err(_) => false,
        }
    }
}

/// Process-lifetime set of cache paths known to be servable, used to skip
/// the durable existence check. Populated only after a successful send and
/// evicted only when a send against an entry fails. Owned by the middleware
/// instance, never shared between instances.
#[derive(Default)]
pub struct FastPathCache {
    paths: Mutex<HashSet<PathBuf>>,
}

impl FastPathCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.lock().contains(path)
    }

    pub fn insert(&self, path: PathBuf) {
        self.lock().insert(path);
    }

    pub fn evict(&self, path: &Path) {
        self.lock().remove(path);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        self.paths.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
