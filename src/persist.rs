//! Key/blob persistence for exported association tables.
//!
//! The [`PersistentStore`] trait is deliberately small: the engine only
//! uses it to save and restore the output of
//! [`export`](crate::associations::FeedbackAssociationStore::export).
//! Nothing on the hot path touches it, and writes are best effort.
//!
//! | Implementation | Backing |
//! |----------------|---------|
//! | [`FileStore`] | one `<key>.json` file per key under a directory |
//! | [`MemoryStore`] | `HashMap` behind an `RwLock`, for tests |

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{bail, Context, Result};

/// Abstract key/blob store.
pub trait PersistentStore: Send + Sync {
    /// Fetch the blob stored under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `blob` under `key`, replacing any previous value.
    fn set(&self, key: &str, blob: &str) -> Result<()>;
}

/// Directory-backed store: `set("associations", ..)` writes
/// `<dir>/associations.json`.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            bail!("invalid store key: '{}'", key);
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }
}

impl PersistentStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key)?;
        if !path.exists() {
            return Ok(None);
        }
        let blob = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Some(blob))
    }

    fn set(&self, key: &str, blob: &str) -> Result<()> {
        let path = self.path_for(key)?;
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        std::fs::write(&path, blob)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistentStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let blobs = self
            .blobs
            .read()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        Ok(blobs.get(key).cloned())
    }

    fn set(&self, key: &str, blob: &str) -> Result<()> {
        let mut blobs = self
            .blobs
            .write()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        blobs.insert(key.to_string(), blob.to_string());
        Ok(())
    }
}
