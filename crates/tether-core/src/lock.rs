//! Exclusive advisory lock held for the whole of a sync run.
//!
//! The lock file also records who holds it (`pid <n> since <timestamp>`),
//! so a timed-out run can name the competing process.

use chrono::Utc;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::ErrorCode;

const FIRST_POLL: Duration = Duration::from_millis(5);
const MAX_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("{}: {} still locked after {waited:?}{}", ErrorCode::LockContention.code(), path.display(), holder_suffix(holder.as_deref()))]
    Timeout {
        path: PathBuf,
        waited: Duration,
        /// Holder line read from the lock file, when there was one.
        holder: Option<String>,
    },
    #[error("{}: cannot open lock file {}: {source}", ErrorCode::BaselinePersistFailed.code(), path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn holder_suffix(holder: Option<&str>) -> String {
    holder.map_or_else(String::new, |h| format!(" (held by {h})"))
}

impl LockError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout { .. } => ErrorCode::LockContention,
            Self::Io { .. } => ErrorCode::BaselinePersistFailed,
        }
    }

    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}

/// Guard for the per-backend sync lock; unlocks on drop.
#[derive(Debug)]
pub struct SyncLock {
    file: File,
    path: PathBuf,
}

impl SyncLock {
    /// Take the lock at `path`, polling with a growing interval until
    /// `timeout` has passed.
    ///
    /// # Errors
    ///
    /// [`LockError::Timeout`] when another run keeps the lock,
    /// [`LockError::Io`] when the lock file cannot be created.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;

        let started = Instant::now();
        let mut poll = FIRST_POLL;
        while file.try_lock_exclusive().is_err() {
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    waited,
                    holder: read_holder(path),
                });
            }
            thread::sleep(poll.min(timeout.saturating_sub(waited)));
            poll = (poll * 2).min(MAX_POLL);
        }

        let mut lock = Self {
            file,
            path: path.to_path_buf(),
        };
        // the holder line is informational; a failed write keeps the lock
        let _ = lock.stamp_holder();
        Ok(lock)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn stamp_holder(&mut self) -> io::Result<()> {
        self.file.set_len(0)?;
        self.file.rewind()?;
        writeln!(
            self.file,
            "pid {} since {}",
            std::process::id(),
            Utc::now().to_rfc3339()
        )?;
        self.file.flush()
    }
}

impl Drop for SyncLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
    }
}

fn read_holder(path: &Path) -> Option<String> {
    let mut text = String::new();
    File::open(path).ok()?.read_to_string(&mut text).ok()?;
    let line = text.lines().next()?.trim();
    (!line.is_empty()).then(|| line.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_lock_can_be_retaken() -> Result<(), LockError> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("baseline").join("file.lock");
        let lock = SyncLock::acquire(&path, Duration::from_millis(50))?;
        assert_eq!(lock.path(), path.as_path());
        drop(lock);
        drop(SyncLock::acquire(&path, Duration::from_millis(50))?);
        Ok(())
    }

    #[test]
    fn contention_times_out_and_names_the_holder() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("file.lock");
        let _held = SyncLock::acquire(&path, Duration::from_millis(50)).expect("first lock");

        let err = SyncLock::acquire(&path, Duration::from_millis(30)).expect_err("must time out");
        assert_eq!(err.code(), ErrorCode::LockContention);
        assert!(err.hint().is_some());
        let LockError::Timeout { waited, holder, .. } = &err else {
            panic!("expected timeout, got {err}");
        };
        assert!(*waited >= Duration::from_millis(30));
        let holder = holder.as_deref().expect("holder line");
        assert!(holder.starts_with(&format!("pid {} since ", std::process::id())));
        assert!(err.to_string().contains("held by pid"));
    }

    #[test]
    fn holder_line_is_cleared_on_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("file.lock");
        drop(SyncLock::acquire(&path, Duration::from_millis(50)).expect("lock"));
        assert!(read_holder(&path).is_none());
    }
}
