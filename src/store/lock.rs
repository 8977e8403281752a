//! Advisory file lock for cross-process mutual exclusion
//!
//! Every store operation holds an exclusive lock on `<path>.lock` for its
//! duration. Acquisition polls `try_lock_exclusive` instead of issuing a
//! blocking `flock`, so waiting never parks a runtime worker thread.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::constants;
use crate::{LoomError, Result};

/// Held exclusive lock on a lock file. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquires the lock, retrying until `timeout` elapses.
    ///
    /// The lock file is opened without truncation: the PID inside belongs to
    /// whoever holds the lock, and must not be wiped by a waiter.
    pub async fn acquire(path: &Path, timeout: Duration) -> Result<FileLock> {
        // ⚡ PERFORMANCE DECISION: Open the lock file on the blocking pool
        // Why: This runs on every store operation; a slow or contended
        // filesystem must not stall a shared tokio worker thread
        // Alternative: Inline open (rejected: blocks the executor on the hot
        // path), open once and cache (rejected: flock state is per-descriptor,
        // reuse across concurrent acquisitions would self-deadlock)
        let open_path = path.to_path_buf();
        let file = tokio::task::spawn_blocking(move || {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&open_path)
        })
        .await
        .map_err(anyhow::Error::from)??;

        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(err) => {
                    if Instant::now() >= deadline {
                        warn!("Lock on {:?} still contended after {:?}: {}", path, timeout, err);
                        return Err(LoomError::LockTimeout {
                            path: path.display().to_string(),
                            timeout_ms: timeout.as_millis() as u64,
                        });
                    }
                    sleep(Duration::from_millis(constants::LOCK_RETRY_INTERVAL_MS)).await;
                }
            }
        }

        // Now that the lock is held, stamp our PID for debugging stale locks.
        let mut file = file;
        if file.set_len(0).is_ok() {
            let _ = writeln!(file, "{}", std::process::id());
        }

        debug!("Acquired file lock on {:?}", path);
        Ok(FileLock {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            warn!("Failed to release file lock on {:?}: {}", self.path, err);
        } else {
            debug!("Released file lock on {:?}", self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("project.json.lock");

        let lock = FileLock::acquire(&path, Duration::from_secs(1)).await.unwrap();
        drop(lock);

        // Reacquirable after release.
        let _lock = FileLock::acquire(&path, Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_contended_lock_times_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("project.json.lock");

        let _held = FileLock::acquire(&path, Duration::from_secs(1)).await.unwrap();

        // A second handle in the same process contends on the flock.
        let result = FileLock::acquire(&path, Duration::from_millis(200)).await;
        assert!(matches!(result, Err(LoomError::LockTimeout { .. })));
    }
}
