//! Persistent resumption state, namespaced per file.
//!
//! The engine only needs a narrow key/value surface; the reserved
//! `"LOCATION"` key stores the server-side upload URL so an interrupted
//! transfer can resume in a later run (or another process).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

/// Narrow key/value interface backing resumption state for one file.
pub trait UploadCache: Send {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str);
    fn delete(&mut self, key: &str);

    /// Drops every entry in this namespace.
    fn truncate(&mut self);
}

/// Deterministic namespace for a file the caller did not name a cache for:
/// CRC32 over the first 1000 bytes of content followed by the file name.
pub(crate) fn cache_namespace(head: &[u8], file_name: &str) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(head);
    hasher.update(file_name.as_bytes());
    hasher.finalize()
}

/// On-disk store: one JSON document per namespace under a base directory.
pub struct FileCache {
    path: PathBuf,
    entries: HashMap<String, String>,
}

impl FileCache {
    pub fn new(namespace: &str, dir: impl Into<PathBuf>) -> std::io::Result<FileCache> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let path = dir.join(format!("{namespace}.json"));
        let entries = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => HashMap::new(),
        };

        Ok(FileCache { path, entries })
    }

    /// Opens the namespace under the default cache directory.
    pub fn open_default(namespace: &str) -> std::io::Result<FileCache> {
        FileCache::new(namespace, std::env::temp_dir().join("filelib-cache"))
    }

    fn persist(&self) {
        let serialized = match serde_json::to_vec(&self.entries) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to serialize upload cache");
                return;
            }
        };

        if let Err(e) = std::fs::write(&self.path, serialized) {
            warn!(path = %self.path.display(), error = %e, "failed to persist upload cache");
        }
    }
}

impl UploadCache for FileCache {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) {
        self.entries.insert(key.to_owned(), value.to_owned());
        self.persist();
    }

    fn delete(&mut self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.persist();
        }
    }

    fn truncate(&mut self) {
        self.entries.clear();

        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove upload cache file");
            }
        }
    }
}

/// In-memory store. Clones share the same entries, which lets callers keep
/// a handle for inspection after handing one to an engine.
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryCache {
    pub fn new() -> MemoryCache {
        MemoryCache::default()
    }
}

impl UploadCache for MemoryCache {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) {
        self.entries.lock().insert(key.to_owned(), value.to_owned());
    }

    fn delete(&mut self, key: &str) {
        self.entries.lock().remove(key);
    }

    fn truncate(&mut self) {
        self.entries.lock().clear();
    }
}
