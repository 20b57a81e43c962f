//! Advisory cross-process lock for the session store.
//!
//! The lock is a sidecar file `<store>.lock` created with `create_new`, which
//! is atomic on every filesystem we care about. Contents are informational
//! (`{pid, startedAt}`); mutual exclusion comes from creation, not content.
//! A lock older than `stale_ms` is assumed to belong to a crashed holder and
//! is reclaimed.

use crate::config::LockConfig;
use crate::error::LockTimeoutError;
use crate::util::now_ms;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockInfo {
    pid: u32,
    started_at: i64,
}

/// Held advisory lock. Released on [`StoreLock::release`] or, best-effort,
/// on drop.
#[derive(Debug)]
pub struct StoreLock {
    lock_path: PathBuf,
    released: bool,
}

/// Sidecar lock path for a store file: `<path>.lock`.
pub fn lock_path_for(store_path: &Path) -> PathBuf {
    let mut os = store_path.as_os_str().to_os_string();
    os.push(".lock");
    PathBuf::from(os)
}

impl StoreLock {
    /// Acquire the lock, polling until `timeout_ms` elapses.
    ///
    /// A stale lock (holder recorded `startedAt` more than `stale_ms` ago) is
    /// deleted and acquisition retried immediately, so crash recovery does not
    /// burn the whole timeout budget.
    pub async fn acquire(store_path: &Path, config: &LockConfig) -> Result<Self> {
        let lock_path = lock_path_for(store_path);
        let started = Instant::now();

        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }

        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    let info = LockInfo {
                        pid: std::process::id(),
                        started_at: now_ms(),
                    };
                    // Content write failures are tolerable; the file existing
                    // is what excludes other writers.
                    if let Ok(raw) = serde_json::to_string(&info) {
                        let _ = file.write_all(raw.as_bytes());
                    }
                    return Ok(Self {
                        lock_path,
                        released: false,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if Self::reclaim_if_stale(&lock_path, config.stale_ms) {
                        continue;
                    }
                    let waited = started.elapsed();
                    if waited.as_millis() as u64 >= config.timeout_ms {
                        return Err(LockTimeoutError {
                            holder_pid: read_lock_info(&lock_path).map(|i| i.pid),
                            lock_path,
                            waited_ms: waited.as_millis() as u64,
                        }
                        .into());
                    }
                    tokio::time::sleep(Duration::from_millis(config.poll_ms)).await;
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("creating lock file {}", lock_path.display()));
                }
            }
        }
    }

    /// Delete the lock when its recorded age exceeds `stale_ms`. Returns true
    /// when a retry should happen immediately. An unreadable lock file falls
    /// back to the file mtime.
    fn reclaim_if_stale(lock_path: &Path, stale_ms: u64) -> bool {
        let age_ms = match read_lock_info(lock_path) {
            Some(info) => now_ms().saturating_sub(info.started_at).max(0) as u64,
            None => match lock_path.metadata().and_then(|m| m.modified()) {
                Ok(mtime) => mtime.elapsed().map(|d| d.as_millis() as u64).unwrap_or(0),
                // Vanished between the failed create and the stat: retry.
                Err(_) => return true,
            },
        };
        if age_ms <= stale_ms {
            return false;
        }
        tracing::warn!(
            lock = %lock_path.display(),
            age_ms,
            "reclaiming stale session store lock"
        );
        match fs::remove_file(lock_path) {
            Ok(()) => true,
            // Another waiter reclaimed it first.
            Err(err) if err.kind() == ErrorKind::NotFound => true,
            Err(err) => {
                tracing::warn!(lock = %lock_path.display(), %err, "failed to reclaim stale lock");
                false
            }
        }
    }

    /// Release the lock. Tolerates the file already being gone (a later
    /// staleness reclaim by a stuck peer, for instance).
    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = fs::remove_file(&self.lock_path) {
            if err.kind() != ErrorKind::NotFound {
                tracing::warn!(lock = %self.lock_path.display(), %err, "failed to release lock");
            }
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        self.remove();
    }
}

fn read_lock_info(lock_path: &Path) -> Option<LockInfo> {
    let raw = fs::read_to_string(lock_path).ok()?;
    serde_json::from_str(&raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LockTimeoutError;
    use tempfile::TempDir;

    fn fast_config() -> LockConfig {
        LockConfig {
            timeout_ms: 200,
            stale_ms: 30_000,
            poll_ms: 5,
        }
    }

    #[tokio::test]
    async fn acquire_creates_and_release_removes() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("sessions.json");
        let lock = StoreLock::acquire(&store, &fast_config()).await.unwrap();
        assert!(lock_path_for(&store).exists());
        lock.release();
        assert!(!lock_path_for(&store).exists());
    }

    #[tokio::test]
    async fn contended_lock_times_out() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("sessions.json");
        let _held = StoreLock::acquire(&store, &fast_config()).await.unwrap();

        let err = StoreLock::acquire(&store, &fast_config())
            .await
            .expect_err("second acquire should time out");
        let timeout = err.downcast_ref::<LockTimeoutError>().unwrap();
        assert!(timeout.waited_ms >= 200);
        assert_eq!(timeout.holder_pid, Some(std::process::id()));
    }

    #[tokio::test]
    async fn stale_lock_is_reclaimed_quickly() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("sessions.json");
        let lock_path = lock_path_for(&store);
        fs::write(
            &lock_path,
            format!(r#"{{"pid":999999,"startedAt":{}}}"#, now_ms() - 60_000),
        )
        .unwrap();

        let config = LockConfig {
            timeout_ms: 5_000,
            stale_ms: 1_000,
            poll_ms: 5,
        };
        let started = Instant::now();
        let lock = StoreLock::acquire(&store, &config).await.unwrap();
        // Reclaim happens on the first pass, far under the full timeout.
        assert!(started.elapsed() < Duration::from_millis(1_000));
        lock.release();
    }

    #[tokio::test]
    async fn fresh_lock_is_not_reclaimed() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("sessions.json");
        fs::write(
            lock_path_for(&store),
            format!(r#"{{"pid":999999,"startedAt":{}}}"#, now_ms()),
        )
        .unwrap();

        let err = StoreLock::acquire(&store, &fast_config())
            .await
            .expect_err("fresh foreign lock should win");
        assert!(err.downcast_ref::<LockTimeoutError>().is_some());
    }

    #[tokio::test]
    async fn drop_releases() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("sessions.json");
        {
            let _lock = StoreLock::acquire(&store, &fast_config()).await.unwrap();
        }
        assert!(!lock_path_for(&store).exists());
    }
}
