//! Persisted baseline cache: one document per backend, written atomically.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::lock::{LockError, SyncLock};
use crate::model::BaselineSnapshot;
use crate::store::write_json_atomic;

/// The baseline written at the end of one successful sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaselineDocument {
    pub run_id: String,
    pub backend: String,
    pub synced_at: DateTime<Utc>,
    /// Local id → snapshot.
    #[serde(default)]
    pub snapshots: BTreeMap<String, BaselineSnapshot>,
}

/// Storage for the last successful baseline.
pub trait BaselineCache: Send + Sync {
    /// `Ok(None)` when no baseline has ever been saved.
    ///
    /// # Errors
    ///
    /// Returns an error if a cache exists but cannot be read or parsed.
    fn load(&self) -> Result<Option<BaselineDocument>>;

    /// Replace the stored baseline in one step.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be written; the previous
    /// baseline must then still be intact.
    fn save(&self, doc: &BaselineDocument) -> Result<()>;

    /// Remove the stored baseline. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the baseline exists but cannot be removed.
    fn clear(&self) -> Result<bool>;

    /// Take the exclusive run lock, if this cache supports one.
    ///
    /// # Errors
    ///
    /// Returns a [`LockError`] if the lock is held elsewhere past `timeout`.
    fn lock(&self, _timeout: Duration) -> Result<Option<SyncLock>, LockError> {
        Ok(None)
    }
}

/// Baseline stored at `.tether/baseline/<backend>.json`.
#[derive(Debug, Clone)]
pub struct FileBaselineCache {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileBaselineCache {
    #[must_use]
    pub fn new(dir: &Path, backend: &str) -> Self {
        Self {
            path: dir.join(format!("{backend}.json")),
            lock_path: dir.join(format!("{backend}.lock")),
        }
    }

    #[must_use]
    pub fn for_project(project_root: &Path, backend: &str) -> Self {
        Self::new(&project_root.join(".tether").join("baseline"), backend)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BaselineCache for FileBaselineCache {
    fn load(&self) -> Result<Option<BaselineDocument>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read {}", self.path.display()));
            }
        };
        let doc = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse baseline {}", self.path.display()))?;
        Ok(Some(doc))
    }

    fn save(&self, doc: &BaselineDocument) -> Result<()> {
        write_json_atomic(&self.path, doc)
    }

    fn clear(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => {
                Err(err).with_context(|| format!("failed to remove {}", self.path.display()))
            }
        }
    }

    fn lock(&self, timeout: Duration) -> Result<Option<SyncLock>, LockError> {
        SyncLock::acquire(&self.lock_path, timeout).map(Some)
    }
}

#[derive(Debug, Default)]
struct MemoryCacheState {
    doc: Option<BaselineDocument>,
    saves: usize,
    fail_saves: bool,
    corrupt: bool,
}

/// Baseline cache held in memory, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryBaselineCache {
    state: Mutex<MemoryCacheState>,
}

impl MemoryBaselineCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryCacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn document(&self) -> Option<BaselineDocument> {
        self.state().doc.clone()
    }

    /// Number of successful saves so far.
    #[must_use]
    pub fn saves(&self) -> usize {
        self.state().saves
    }

    /// Make every following save fail.
    pub fn fail_saves(&self) {
        self.state().fail_saves = true;
    }

    /// Make every following load report a corrupt cache.
    pub fn corrupt(&self) {
        self.state().corrupt = true;
    }
}

impl BaselineCache for MemoryBaselineCache {
    fn load(&self) -> Result<Option<BaselineDocument>> {
        let state = self.state();
        if state.corrupt {
            bail!("baseline cache is corrupt");
        }
        Ok(state.doc.clone())
    }

    fn save(&self, doc: &BaselineDocument) -> Result<()> {
        let mut state = self.state();
        if state.fail_saves {
            bail!("no space left on device");
        }
        state.doc = Some(doc.clone());
        state.saves += 1;
        Ok(())
    }

    fn clear(&self) -> Result<bool> {
        Ok(self.state().doc.take().is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Record;
    use chrono::TimeZone;

    fn doc() -> BaselineDocument {
        let at = Utc.with_ymd_and_hms(2024, 5, 5, 5, 0, 0).single().expect("ts");
        let mut record = Record::new("tt-1", "Write docs", at);
        record.link("file", "3");
        BaselineDocument {
            run_id: "run-1".into(),
            backend: "file".into(),
            synced_at: at,
            snapshots: BTreeMap::from([(
                "tt-1".to_string(),
                BaselineSnapshot::capture("tt-1", &record, at),
            )]),
        }
    }

    #[test]
    fn file_cache_save_load_clear() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = FileBaselineCache::for_project(dir.path(), "file");
        assert!(cache.load()?.is_none());

        cache.save(&doc())?;
        assert_eq!(cache.load()?, Some(doc()));
        assert!(cache.path().ends_with(".tether/baseline/file.json"));

        assert!(cache.clear()?);
        assert!(!cache.clear()?);
        assert!(cache.load()?.is_none());
        Ok(())
    }

    #[test]
    fn corrupt_file_cache_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = FileBaselineCache::new(dir.path(), "file");
        fs::write(cache.path(), b"{ truncated")?;
        let err = cache.load().expect_err("corrupt cache");
        assert!(format!("{err:#}").contains("failed to parse baseline"));
        Ok(())
    }

    #[test]
    fn file_cache_lock_is_exclusive() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = FileBaselineCache::new(dir.path(), "file");
        let held = cache.lock(Duration::from_millis(50))?;
        assert!(held.is_some());
        let second = cache.lock(Duration::from_millis(20));
        assert!(matches!(second, Err(LockError::Timeout { .. })));
        Ok(())
    }

    #[test]
    fn memory_cache_failed_save_keeps_previous_document() {
        let cache = MemoryBaselineCache::new();
        cache.save(&doc()).expect("first save");
        cache.fail_saves();
        let mut next = doc();
        next.run_id = "run-2".into();
        assert!(cache.save(&next).is_err());
        assert_eq!(cache.document().map(|d| d.run_id), Some("run-1".into()));
        assert_eq!(cache.saves(), 1);
    }
}
