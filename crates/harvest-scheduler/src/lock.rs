//! Exclusive run lock: one job instance per lock path.
//!
//! Backed by `flock(LOCK_EX)` through `fs2`, so exclusivity is enforced by the
//! OS and survives crashes: the kernel drops the lock when the descriptor
//! closes. The file is never deleted, only truncated, because unlinking a
//! lock file while another process waits on its old inode breaks exclusion.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use harvest_core::config::{LockConfig, LockMode};
use harvest_core::error::{HarvestError, Result};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Who holds the lock. Written into the lock file on acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Lock definition for one logical job.
#[derive(Debug, Clone)]
pub struct ExclusiveRunLock {
    path: PathBuf,
    mode: LockMode,
    timeout: Duration,
    poll_interval: Duration,
}

impl ExclusiveRunLock {
    pub fn new(path: impl Into<PathBuf>, mode: LockMode, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            mode,
            timeout,
            poll_interval: Duration::from_millis(250),
        }
    }

    pub fn from_config(config: &LockConfig, job: &str) -> Self {
        Self::new(config.resolve_path(job), config.mode, config.timeout())
    }

    /// How often blocking mode re-checks a contended lock.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Acquire according to the configured mode.
    pub async fn acquire(&self) -> Result<RunLockGuard> {
        self.acquire_with_cancel(&CancellationToken::new()).await
    }

    /// Acquire according to the configured mode; a blocking wait ends early
    /// with [`HarvestError::Cancelled`] when `cancel` fires.
    pub async fn acquire_with_cancel(&self, cancel: &CancellationToken) -> Result<RunLockGuard> {
        match self.mode {
            LockMode::FailFast => self.try_acquire()?.ok_or_else(|| self.busy()),
            LockMode::Blocking => self.acquire_blocking(cancel).await,
        }
    }

    /// Single non-blocking attempt. `Ok(None)` means another holder exists.
    pub fn try_acquire(&self) -> Result<Option<RunLockGuard>> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // No truncate here: the current holder's record must survive a failed attempt.
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if is_contended(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let holder = LockHolder {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(serde_json::to_string(&holder)?.as_bytes())?;
        file.sync_all()?;

        tracing::info!("🔒 Lock acquired: {} (pid {})", self.path.display(), holder.pid);
        Ok(Some(RunLockGuard {
            path: self.path.clone(),
            file: Some(file),
        }))
    }

    async fn acquire_blocking(&self, cancel: &CancellationToken) -> Result<RunLockGuard> {
        let start = Instant::now();
        let mut logged = false;
        loop {
            if let Some(guard) = self.try_acquire()? {
                return Ok(guard);
            }
            let waited = start.elapsed();
            if waited >= self.timeout {
                return Err(HarvestError::LockTimeout {
                    path: self.path.clone(),
                    waited,
                });
            }
            if !logged {
                tracing::info!(
                    "⏳ Waiting up to {:?} for lock {}{}",
                    self.timeout,
                    self.path.display(),
                    holder_suffix(&self.path)
                );
                logged = true;
            }
            let nap = self.poll_interval.min(self.timeout - waited);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(HarvestError::Cancelled("waiting for run lock".into()));
                }
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    fn busy(&self) -> HarvestError {
        tracing::warn!(
            "❌ Lock already held by another process: {}{}",
            self.path.display(),
            holder_suffix(&self.path)
        );
        HarvestError::LockBusy {
            path: self.path.clone(),
        }
    }
}

/// Scoped lock ownership. Dropping the guard releases the lock.
#[derive(Debug)]
pub struct RunLockGuard {
    path: PathBuf,
    file: Option<File>,
}

impl RunLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Release the lock. Safe to call more than once.
    pub fn release(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };
        // Clear the holder record while still holding the lock.
        if let Err(e) = file.set_len(0) {
            tracing::debug!("failed to clear lock record {}: {e}", self.path.display());
        }
        if let Err(e) = FileExt::unlock(&file) {
            tracing::debug!("explicit unlock of {} failed, closing instead: {e}", self.path.display());
        }
        tracing::info!("🔓 Lock released: {}", self.path.display());
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Read the holder record of a lock file, if any.
pub fn current_holder(path: &Path) -> Option<LockHolder> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(content.trim()).ok()
}

fn holder_suffix(path: &Path) -> String {
    match current_holder(path) {
        Some(h) => format!(" (held by pid {} since {})", h.pid, h.acquired_at.to_rfc3339()),
        None => String::new(),
    }
}

fn is_contended(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_at(dir: &Path, mode: LockMode, timeout_ms: u64) -> ExclusiveRunLock {
        ExclusiveRunLock::new(dir.join("locks").join("job.lock"), mode, Duration::from_millis(timeout_ms))
            .with_poll_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_fail_fast_second_attempt_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let first = lock_at(dir.path(), LockMode::FailFast, 0);
        let second = lock_at(dir.path(), LockMode::FailFast, 0);

        let guard = first.acquire().await.unwrap();
        assert!(guard.is_held());
        let err = second.acquire().await.unwrap_err();
        assert!(matches!(err, HarvestError::LockBusy { .. }));
        assert!(err.is_benign());

        drop(guard);
        assert!(second.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_holder_record_written_and_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_at(dir.path(), LockMode::FailFast, 0);
        let mut guard = lock.acquire().await.unwrap();

        let holder = current_holder(lock.path()).unwrap();
        assert_eq!(holder.pid, std::process::id());

        guard.release();
        guard.release();
        assert!(!guard.is_held());
        assert!(current_holder(lock.path()).is_none());
    }

    #[tokio::test]
    async fn test_blocking_waits_for_release() {
        let dir = tempfile::tempdir().unwrap();
        let holder = lock_at(dir.path(), LockMode::FailFast, 0);
        let waiter = lock_at(dir.path(), LockMode::Blocking, 5_000);

        let guard = holder.acquire().await.unwrap();
        let handle = tokio::spawn(async move { waiter.acquire().await.map(|g| g.is_held()) });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished());
        drop(guard);

        assert!(handle.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_blocking_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let holder = lock_at(dir.path(), LockMode::FailFast, 0);
        let waiter = lock_at(dir.path(), LockMode::Blocking, 80);

        let _guard = holder.acquire().await.unwrap();
        let err = waiter.acquire().await.unwrap_err();
        match err {
            HarvestError::LockTimeout { waited, .. } => assert!(waited >= Duration::from_millis(80)),
            other => panic!("expected LockTimeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_blocking_wait_is_cancellable() {
        let dir = tempfile::tempdir().unwrap();
        let holder = lock_at(dir.path(), LockMode::FailFast, 0);
        let waiter = lock_at(dir.path(), LockMode::Blocking, 60_000);

        let _guard = holder.acquire().await.unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let err = waiter.acquire_with_cancel(&token).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_release_on_panic_unwind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let result = std::panic::catch_unwind(|| {
            let lock = lock_at(&path, LockMode::FailFast, 0);
            let _guard = lock.try_acquire().unwrap().unwrap();
            panic!("run blew up");
        });
        assert!(result.is_err());
        let lock = lock_at(dir.path(), LockMode::FailFast, 0);
        assert!(lock.try_acquire().unwrap().is_some());
    }
}
