use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Read access to earlier versions of local record files.
pub trait HistoryAccess: Send + Sync {
    /// The content of `path` as of `at`, or `None` if the file did not
    /// exist then.
    ///
    /// # Errors
    ///
    /// Returns an error if the history itself cannot be queried.
    fn content_at(&self, path: &Path, at: DateTime<Utc>) -> Result<Option<Vec<u8>>>;
}

/// A fixed set of file versions, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct RecordedHistory {
    versions: BTreeMap<PathBuf, BTreeMap<DateTime<Utc>, Vec<u8>>>,
}

impl RecordedHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `path` held `content` from `at` onwards.
    pub fn record(&mut self, path: impl Into<PathBuf>, at: DateTime<Utc>, content: impl Into<Vec<u8>>) {
        self.versions
            .entry(path.into())
            .or_default()
            .insert(at, content.into());
    }
}

impl HistoryAccess for RecordedHistory {
    fn content_at(&self, path: &Path, at: DateTime<Utc>) -> Result<Option<Vec<u8>>> {
        Ok(self
            .versions
            .get(path)
            .and_then(|versions| versions.range(..=at).next_back())
            .map(|(_, content)| content.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn returns_latest_version_at_or_before_timestamp() -> Result<()> {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("ts");
        let mut history = RecordedHistory::new();
        history.record("a.json", t0, "v1");
        history.record("a.json", t0 + Duration::days(2), "v2");

        let path = Path::new("a.json");
        assert_eq!(history.content_at(path, t0 - Duration::hours(1))?, None);
        assert_eq!(history.content_at(path, t0)?, Some(b"v1".to_vec()));
        assert_eq!(history.content_at(path, t0 + Duration::days(1))?, Some(b"v1".to_vec()));
        assert_eq!(history.content_at(path, t0 + Duration::days(3))?, Some(b"v2".to_vec()));
        assert_eq!(history.content_at(Path::new("b.json"), t0)?, None);
        Ok(())
    }
}
