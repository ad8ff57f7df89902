//! File-backed local store: one JSON document per record.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::backend::{Listing, LocalStore, SkippedRecord};
use crate::model::Record;

/// Serialize `value` as pretty JSON and move it into place atomically.
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut body = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    body.push(b'\n');

    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, body)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "failed to atomically move {} to {}",
            tmp_path.display(),
            path.display()
        )
    })?;
    Ok(())
}

/// Records stored as `<dir>/<id>.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Store rooted at `dir`; the directory is created on first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The conventional location inside a project: `.tether/records`.
    #[must_use]
    pub fn for_project(project_root: &Path) -> Self {
        Self::new(project_root.join(".tether").join("records"))
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

impl LocalStore for FileStore {
    fn list_all(&self) -> Result<Listing> {
        let mut listing = Listing::default();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(listing),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", self.dir.display()));
            }
        };

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to read {}", self.dir.display()))?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned());
            let parsed = fs::read(&path)
                .map_err(anyhow::Error::from)
                .and_then(|bytes| self.decode(&bytes));
            match parsed {
                Ok(record) => listing.records.push(record),
                Err(err) => {
                    warn!(path = %path.display(), error = %format!("{err:#}"), "skipping unreadable record");
                    listing.skipped.push(SkippedRecord {
                        id: stem,
                        source: path.display().to_string(),
                        reason: format!("{err:#}"),
                    });
                }
            }
        }
        Ok(listing)
    }

    fn write(&self, record: &Record) -> Result<()> {
        write_json_atomic(&self.record_path(&record.id), record)
    }

    fn delete(&self, id: &str) -> Result<()> {
        let path = self.record_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
        }
    }

    fn path_of(&self, id: &str) -> Option<PathBuf> {
        Some(self.record_path(id))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Record> {
        serde_json::from_slice(bytes).context("invalid record document")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn rec(id: &str) -> Record {
        let at = Utc.with_ymd_and_hms(2024, 4, 2, 8, 0, 0).single().expect("ts");
        Record::new(id, format!("title {id}"), at)
    }

    #[test]
    fn write_list_delete_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FileStore::new(dir.path().join("records"));
        assert!(store.list_all()?.records.is_empty());

        store.write(&rec("tt-2"))?;
        store.write(&rec("tt-1"))?;
        let ids: Vec<_> = store.list_all()?.records.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, ["tt-1", "tt-2"]);

        store.delete("tt-1")?;
        store.delete("tt-1")?;
        assert_eq!(store.list_all()?.records.len(), 1);
        Ok(())
    }

    #[test]
    fn corrupt_documents_are_skipped_not_fatal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FileStore::new(dir.path());
        store.write(&rec("good"))?;
        fs::write(dir.path().join("bad.json"), b"{ not json")?;

        let listing = store.list_all()?;
        assert_eq!(listing.records.len(), 1);
        assert_eq!(listing.skipped.len(), 1);
        assert_eq!(listing.skipped[0].id.as_deref(), Some("bad"));
        Ok(())
    }

    #[test]
    fn atomic_write_leaves_no_temp_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("doc.json");
        write_json_atomic(&path, &rec("x"))?;
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        Ok(())
    }
}
