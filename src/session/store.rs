//! Durable session store: permissive load, atomic save, locked transactions.
//!
//! The store file maps session key → entry. Reads are fail-open: a missing,
//! corrupt, or non-object file yields an empty store and the next locked write
//! bootstraps a fresh file. All cross-process mutation goes through
//! [`SessionStore::transaction`], which re-reads under the advisory lock so no
//! concurrent writer is ever clobbered.

use super::cache::StoreCache;
use super::lock::StoreLock;
use super::types::{normalize_delivery, upgrade_entry, SessionEntry, SessionStoreFile};
use crate::config::{LockConfig, SessionConfig};
use anyhow::{Context, Result};
use serde_json::Value;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Options for [`SessionStore::load_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Bypass the read cache and hit the filesystem. Transactions always set
    /// this so the locked read observes other writers.
    pub skip_cache: bool,
}

#[derive(Clone)]
pub struct SessionStore {
    cache: Arc<StoreCache>,
    cache_ttl: Duration,
    lock: LockConfig,
}

impl SessionStore {
    pub fn new(cache: Arc<StoreCache>, config: &SessionConfig) -> Self {
        Self {
            cache,
            cache_ttl: Duration::from_millis(config.cache_ttl_ms),
            lock: config.lock.clone(),
        }
    }

    /// Load the store at `path`. Always returns an owned snapshot the caller
    /// may mutate freely; never fails.
    pub async fn load(&self, path: &Path) -> SessionStoreFile {
        self.load_with(path, LoadOptions::default()).await
    }

    pub async fn load_with(&self, path: &Path, opts: LoadOptions) -> SessionStoreFile {
        let mtime = source_mtime(path);

        if !opts.skip_cache {
            if let Some(snapshot) = self.cache.get(path, self.cache_ttl, mtime) {
                return snapshot;
            }
        }

        let entries = match fs::read_to_string(path) {
            Ok(raw) => parse_store_text(&raw, path),
            Err(err) => {
                if err.kind() != ErrorKind::NotFound {
                    tracing::warn!(store = %path.display(), %err, "unreadable session store, treating as empty");
                }
                SessionStoreFile::new()
            }
        };

        self.cache.put(path, entries.clone(), mtime);
        entries
    }

    /// Persist `entries` at `path`, normalizing delivery fields first.
    ///
    /// On Unix this writes a sibling temp file and renames it over the target
    /// so a crash mid-write never leaves a torn store. On Windows the rename
    /// step is skipped and the target is written in place: rename-over-open
    /// files is unreliable there under concurrent access, and the advisory
    /// lock already serializes writers.
    pub async fn save(&self, path: &Path, entries: &SessionStoreFile) -> Result<()> {
        self.cache.invalidate(path);

        let mut normalized = entries.clone();
        for entry in normalized.values_mut() {
            normalize_delivery(entry);
        }
        let data =
            serde_json::to_string_pretty(&normalized).context("serializing session store")?;

        match write_store_file(path, &data) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                // Store directory vanished mid-write. Recreate and retry once;
                // if it is gone again someone is actively deleting the
                // workspace and losing this write is acceptable.
                if let Some(parent) = path.parent() {
                    let _ = fs::create_dir_all(parent);
                }
                if let Err(retry_err) = write_store_file(path, &data) {
                    tracing::warn!(
                        store = %path.display(),
                        err = %retry_err,
                        "session store write lost, directory keeps disappearing"
                    );
                }
                Ok(())
            }
            Err(err) => {
                Err(err).with_context(|| format!("writing session store {}", path.display()))
            }
        }
    }

    /// Run `mutator` over a freshly-read store under the exclusive lock, then
    /// persist. Returns the mutator's result.
    pub async fn transaction<T>(
        &self,
        path: &Path,
        mutator: impl FnOnce(&mut SessionStoreFile) -> T,
    ) -> Result<T> {
        let lock = StoreLock::acquire(path, &self.lock).await?;
        // Locked read always bypasses the cache: another process may have
        // written inside our TTL window.
        let mut entries = self
            .load_with(path, LoadOptions { skip_cache: true })
            .await;
        let result = mutator(&mut entries);
        let saved = self.save(path, &entries).await;
        lock.release();
        saved?;
        Ok(result)
    }

    /// Lock-scoped update of a single entry. Returns the updated entry, or
    /// `None` (without creating anything) when `key` is absent.
    pub async fn update_entry(
        &self,
        path: &Path,
        key: &str,
        updater: impl FnOnce(&mut SessionEntry),
    ) -> Result<Option<SessionEntry>> {
        self.transaction(path, |entries| {
            let entry = entries.get_mut(key)?;
            updater(entry);
            Some(entry.clone())
        })
        .await
    }
}

fn source_mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn write_store_file(path: &Path, data: &str) -> std::io::Result<()> {
    if cfg!(windows) {
        return fs::write(path, data);
    }

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sessions.json".into());
    let tmp_path = parent.join(format!(".{file_name}.{}.tmp", std::process::id()));

    fs::write(&tmp_path, data)?;
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        // Session entries carry routing identities; keep the file private.
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    }

    Ok(())
}

/// Parse store text tolerantly: `//` and `/* */` comments plus trailing
/// commas are accepted. Anything unparseable, or a non-object top level,
/// yields an empty store.
fn parse_store_text(raw: &str, path: &Path) -> SessionStoreFile {
    let cleaned = strip_relaxed_json(raw);
    let value: Value = match serde_json::from_str(&cleaned) {
        Ok(v) => v,
        Err(err) => {
            tracing::warn!(store = %path.display(), %err, "unparseable session store, treating as empty");
            return SessionStoreFile::new();
        }
    };
    let Value::Object(map) = value else {
        tracing::warn!(store = %path.display(), "session store is not an object, treating as empty");
        return SessionStoreFile::new();
    };

    let mut entries = SessionStoreFile::new();
    for (key, entry_value) in map {
        let Value::Object(mut raw_entry) = entry_value else {
            tracing::warn!(store = %path.display(), session = %key, "skipping non-object entry");
            continue;
        };
        if upgrade_entry(&mut raw_entry) {
            tracing::debug!(session = %key, "upgraded legacy session entry fields");
        }
        match serde_json::from_value::<SessionEntry>(Value::Object(raw_entry)) {
            Ok(entry) => {
                entries.insert(key, entry);
            }
            Err(err) => {
                tracing::warn!(store = %path.display(), session = %key, %err, "skipping malformed entry");
            }
        }
    }
    entries
}

/// Strip comments and trailing commas so hand-edited store files survive a
/// round through `serde_json`. String contents (including escapes) are left
/// untouched.
fn strip_relaxed_json(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            ',' => {
                // Trailing comma if the next non-whitespace char closes a
                // container.
                let mut lookahead = chars.clone();
                let mut next_meaningful = None;
                for next in lookahead.by_ref() {
                    if !next.is_whitespace() {
                        next_meaningful = Some(next);
                        break;
                    }
                }
                if !matches!(next_meaningful, Some('}') | Some(']')) {
                    out.push(',');
                }
            }
            _ => out.push(c),
        }
    }
    out
}
