//! Process-local read cache for session store files.
//!
//! A hit requires both TTL freshness and an unchanged source mtime, so another
//! process writing the file invalidates us on the next stat even inside the
//! TTL window. The cache is never shared across processes and never persisted.

use super::types::SessionStoreFile;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

struct CacheEntry {
    snapshot: SessionStoreFile,
    loaded_at: Instant,
    source_mtime: Option<SystemTime>,
}

/// Shared read cache, keyed by store path. One instance is created at process
/// start and injected into every [`super::store::SessionStore`].
#[derive(Default)]
pub struct StoreCache {
    entries: Mutex<HashMap<PathBuf, CacheEntry>>,
}

impl StoreCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a cached snapshot when it is still within `ttl` and the file's
    /// mtime matches what was observed at load time.
    pub fn get(
        &self,
        path: &Path,
        ttl: Duration,
        current_mtime: Option<SystemTime>,
    ) -> Option<SessionStoreFile> {
        let entries = self.entries.lock().ok()?;
        let entry = entries.get(path)?;
        if ttl.is_zero() || entry.loaded_at.elapsed() >= ttl {
            return None;
        }
        if entry.source_mtime != current_mtime {
            return None;
        }
        Some(entry.snapshot.clone())
    }

    pub fn put(&self, path: &Path, snapshot: SessionStoreFile, source_mtime: Option<SystemTime>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                path.to_path_buf(),
                CacheEntry {
                    snapshot,
                    loaded_at: Instant::now(),
                    source_mtime,
                },
            );
        }
    }

    /// Drop the cached snapshot for one path. Called on every save so readers
    /// immediately observe their own writes.
    pub fn invalidate(&self, path: &Path) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(path);
        }
    }

    /// Drop everything. Tests use this to force re-reads.
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}
