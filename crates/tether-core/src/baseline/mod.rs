//! Last-known-synced snapshots: the common ancestor of every three-way
//! comparison.
//!
//! [`BaselineStore::load`] picks the best available source per record:
//!
//! 1. **Cache**: the document persisted at the end of the previous run.
//! 2. **History**: for linked local records the cache does not cover, the
//!    record file's content at its last `synced_at`, decoded by the store.
//! 3. **Absent**: first sync for that record.
//!
//! The store is only ever written back as a whole, once per run, through
//! [`BaselineStore::persist_all`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::backend::LocalStore;
use crate::error::SyncError;
use crate::model::{BaselineSnapshot, Record};

pub mod cache;
pub mod history;

pub use cache::{BaselineCache, BaselineDocument, FileBaselineCache, MemoryBaselineCache};
pub use history::{HistoryAccess, RecordedHistory};

/// Where the loaded baseline came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BaselineSource {
    Cache,
    History,
    /// Cache plus history reconstruction for cache misses.
    Mixed,
    /// Nothing found; every record is on its first sync.
    None,
}

impl BaselineSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::History => "history",
            Self::Mixed => "mixed",
            Self::None => "none",
        }
    }

    const fn from_parts(cache: bool, history: bool) -> Self {
        match (cache, history) {
            (true, true) => Self::Mixed,
            (true, false) => Self::Cache,
            (false, true) => Self::History,
            (false, false) => Self::None,
        }
    }
}

/// In-memory baseline for one run, keyed by local id.
#[derive(Debug, Clone)]
pub struct BaselineStore {
    snapshots: BTreeMap<String, BaselineSnapshot>,
    source: BaselineSource,
    run_id: Option<String>,
    reconstructed: usize,
}

impl Default for BaselineStore {
    fn default() -> Self {
        Self::empty()
    }
}

impl BaselineStore {
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            snapshots: BTreeMap::new(),
            source: BaselineSource::None,
            run_id: None,
            reconstructed: 0,
        }
    }

    /// A store seeded directly, as if loaded from the cache.
    #[must_use]
    pub fn from_snapshots(snapshots: impl IntoIterator<Item = BaselineSnapshot>) -> Self {
        Self {
            snapshots: snapshots.into_iter().map(|s| (s.id.clone(), s)).collect(),
            source: BaselineSource::Cache,
            run_id: None,
            reconstructed: 0,
        }
    }

    /// Load the baseline for `backend`.
    ///
    /// `locals` are the current local records; those linked to `backend`
    /// with a `synced_at` but missing from the cache are reconstructed from
    /// `history`. A reconstruction failure only makes that one record
    /// absent.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::BaselineLoad`] if the cache exists but cannot be
    /// read; the run must stop before mutating anything.
    pub fn load(
        cache: &dyn BaselineCache,
        history: Option<&dyn HistoryAccess>,
        store: &dyn LocalStore,
        locals: &[Record],
        backend: &str,
    ) -> Result<Self, SyncError> {
        let doc = cache.load().map_err(SyncError::BaselineLoad)?;
        let from_cache = doc.is_some();
        let (mut snapshots, run_id) = match doc {
            Some(doc) => {
                if doc.backend != backend {
                    warn!(
                        cached = %doc.backend,
                        backend,
                        "baseline cache belongs to another backend; ignoring"
                    );
                    (BTreeMap::new(), None)
                } else {
                    (doc.snapshots, Some(doc.run_id))
                }
            }
            None => (BTreeMap::new(), None),
        };

        let mut reconstructed = 0;
        if let Some(history) = history {
            for record in locals {
                if snapshots.contains_key(&record.id) || record.remote_id(backend).is_none() {
                    continue;
                }
                let Some(synced_at) = record.synced_at else {
                    continue;
                };
                if let Some(snapshot) = reconstruct(history, store, record, backend, synced_at) {
                    snapshots.insert(record.id.clone(), snapshot);
                    reconstructed += 1;
                }
            }
        }

        let source = BaselineSource::from_parts(from_cache && run_id.is_some(), reconstructed > 0);
        info!(
            source = source.as_str(),
            snapshots = snapshots.len(),
            reconstructed,
            "baseline loaded"
        );
        Ok(Self {
            snapshots,
            source,
            run_id,
            reconstructed,
        })
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&BaselineSnapshot> {
        self.snapshots.get(id)
    }

    pub fn put(&mut self, snapshot: BaselineSnapshot) {
        self.snapshots.insert(snapshot.id.clone(), snapshot);
    }

    pub fn clear(&mut self, id: &str) -> Option<BaselineSnapshot> {
        self.snapshots.remove(id)
    }

    #[must_use]
    pub const fn snapshots(&self) -> &BTreeMap<String, BaselineSnapshot> {
        &self.snapshots
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    #[must_use]
    pub const fn source(&self) -> BaselineSource {
        self.source
    }

    /// Run id of the cached baseline this store was loaded from.
    #[must_use]
    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    /// Snapshots rebuilt from history during [`load`](Self::load).
    #[must_use]
    pub const fn reconstructed(&self) -> usize {
        self.reconstructed
    }

    /// Replace the whole baseline with `snapshots` in one cache write.
    ///
    /// The in-memory view is only replaced once the write succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::BaselinePersist`] if the cache write fails.
    pub fn persist_all(
        &mut self,
        cache: &dyn BaselineCache,
        run_id: &str,
        backend: &str,
        synced_at: DateTime<Utc>,
        snapshots: BTreeMap<String, BaselineSnapshot>,
    ) -> Result<(), SyncError> {
        let doc = BaselineDocument {
            run_id: run_id.to_string(),
            backend: backend.to_string(),
            synced_at,
            snapshots,
        };
        cache.save(&doc).map_err(SyncError::BaselinePersist)?;
        debug!(run_id, snapshots = doc.snapshots.len(), "baseline persisted");
        self.snapshots = doc.snapshots;
        self.source = BaselineSource::Cache;
        self.run_id = Some(doc.run_id);
        self.reconstructed = 0;
        Ok(())
    }
}

fn reconstruct(
    history: &dyn HistoryAccess,
    store: &dyn LocalStore,
    record: &Record,
    backend: &str,
    synced_at: DateTime<Utc>,
) -> Option<BaselineSnapshot> {
    let path = store.path_of(&record.id)?;
    let bytes = match history.content_at(&path, synced_at) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return None,
        Err(err) => {
            warn!(id = %record.id, error = %format!("{err:#}"), "history lookup failed; treating as first sync");
            return None;
        }
    };
    let mut past = match store.decode(&bytes) {
        Ok(past) => past,
        Err(err) => {
            warn!(id = %record.id, error = %format!("{err:#}"), "historical record unreadable; treating as first sync");
            return None;
        }
    };
    if past.remote_id(backend).is_none() {
        if let Some(rid) = record.remote_id(backend) {
            past.link(backend, rid);
        }
    }
    Some(BaselineSnapshot::capture(&record.id, &past, synced_at))
}
