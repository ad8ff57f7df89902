//! In-memory collaborators for tests and embedding.

use anyhow::{Context, Result, bail};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{Listing, LocalStore, RemoteBackend, RemoteError, SkippedRecord};
use crate::model::{Record, Syncable};

#[derive(Debug, Default)]
struct RemoteState {
    records: BTreeMap<String, Record>,
    /// Archived remote id → the record it duplicates, if any.
    archived: BTreeMap<String, Option<String>>,
    next_id: u64,
    scripted: VecDeque<RemoteError>,
    rejected_titles: BTreeMap<String, RemoteError>,
}

/// A tracker held in memory with sequential numeric ids.
///
/// Failures can be scripted: [`fail_next`](Self::fail_next) queues errors
/// returned by the next calls, [`reject_title`](Self::reject_title) makes
/// every write of a given title fail.
#[derive(Debug)]
pub struct MemoryRemote {
    name: String,
    state: Mutex<RemoteState>,
    calls: AtomicUsize,
}

impl MemoryRemote {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(RemoteState {
                next_id: 1,
                ..RemoteState::default()
            }),
            calls: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed a record as if another client had created it; returns its id.
    pub fn insert(&self, mut record: Record) -> String {
        let mut state = self.state();
        let id = if record.id.is_empty() {
            let id = state.next_id.to_string();
            state.next_id += 1;
            id
        } else {
            if let Ok(n) = record.id.parse::<u64>() {
                state.next_id = state.next_id.max(n + 1);
            }
            record.id.clone()
        };
        record.id.clone_from(&id);
        state.records.insert(id.clone(), record);
        id
    }

    /// Change a stored record in place, as a remote user would.
    pub fn edit(&self, remote_id: &str, f: impl FnOnce(&mut Record)) -> bool {
        self.state().records.get_mut(remote_id).map(f).is_some()
    }

    /// Drop a record without archiving it.
    pub fn remove(&self, remote_id: &str) -> Option<Record> {
        self.state().records.remove(remote_id)
    }

    /// Queue an error for the next call (of any kind).
    pub fn fail_next(&self, err: RemoteError) {
        self.state().scripted.push_back(err);
    }

    /// Make every push/update of a record titled `title` fail with `err`.
    pub fn reject_title(&self, title: impl Into<String>, err: RemoteError) {
        self.state().rejected_titles.insert(title.into(), err);
    }

    /// Live (non-archived) records.
    #[must_use]
    pub fn records(&self) -> Vec<Record> {
        self.state().records.values().cloned().collect()
    }

    #[must_use]
    pub fn get(&self, remote_id: &str) -> Option<Record> {
        self.state().records.get(remote_id).cloned()
    }

    /// `Some(duplicate_of)` if `remote_id` was archived.
    #[must_use]
    pub fn archived(&self, remote_id: &str) -> Option<Option<String>> {
        self.state().archived.get(remote_id).cloned()
    }

    /// Number of calls that reached the backend.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn enter(&self, title: Option<&str>) -> Result<MutexGuard<'_, RemoteState>, RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if let Some(err) = state.scripted.pop_front() {
            return Err(err);
        }
        if let Some(err) = title.and_then(|t| state.rejected_titles.get(t)) {
            return Err(err.clone());
        }
        Ok(state)
    }
}

impl RemoteBackend for MemoryRemote {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch_all(&self) -> Result<Listing, RemoteError> {
        let state = self.enter(None)?;
        Ok(Listing::new(state.records.values().cloned().collect()))
    }

    fn push(&self, record: &Record) -> Result<String, RemoteError> {
        let mut state = self.enter(Some(&record.title))?;
        let id = state.next_id.to_string();
        state.next_id += 1;
        let mut stored = Record::new(id.clone(), record.title.clone(), record.created_at);
        stored.take_fields(record as &dyn Syncable);
        stored.updated_at = record.updated_at;
        state.records.insert(id.clone(), stored);
        Ok(id)
    }

    fn update(&self, remote_id: &str, record: &Record) -> Result<(), RemoteError> {
        let mut state = self.enter(Some(&record.title))?;
        let stored = state
            .records
            .get_mut(remote_id)
            .ok_or_else(|| RemoteError::NotFound(remote_id.to_string()))?;
        stored.take_fields(record as &dyn Syncable);
        stored.updated_at = record.updated_at.or(stored.updated_at);
        Ok(())
    }

    fn archive(&self, remote_id: &str, duplicate_of: Option<&str>) -> Result<(), RemoteError> {
        let mut state = self.enter(None)?;
        state
            .records
            .remove(remote_id)
            .ok_or_else(|| RemoteError::NotFound(remote_id.to_string()))?;
        state
            .archived
            .insert(remote_id.to_string(), duplicate_of.map(str::to_string));
        Ok(())
    }
}

/// A local store held in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, Record>>,
    skipped: Mutex<Vec<SkippedRecord>>,
    failing: Mutex<BTreeSet<String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_records(records: impl IntoIterator<Item = Record>) -> Self {
        let store = Self::new();
        for record in records {
            store.put(record);
        }
        store
    }

    fn map(&self) -> MutexGuard<'_, BTreeMap<String, Record>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace a record without going through [`LocalStore`].
    pub fn put(&self, record: Record) {
        self.map().insert(record.id.clone(), record);
    }

    /// Report an unreadable record in every listing.
    pub fn add_skipped(&self, skipped: SkippedRecord) {
        self.skipped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(skipped);
    }

    /// Make writes of `id` fail.
    pub fn fail_writes_for(&self, id: impl Into<String>) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.into());
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Record> {
        self.map().get(id).cloned()
    }

    #[must_use]
    pub fn records(&self) -> Vec<Record> {
        self.map().values().cloned().collect()
    }
}

impl LocalStore for MemoryStore {
    fn list_all(&self) -> Result<Listing> {
        Ok(Listing {
            records: self.records(),
            skipped: self
                .skipped
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        })
    }

    fn write(&self, record: &Record) -> Result<()> {
        if self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&record.id)
        {
            bail!("simulated write failure for {}", record.id);
        }
        self.put(record.clone());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.map().remove(id);
        Ok(())
    }

    fn path_of(&self, id: &str) -> Option<PathBuf> {
        Some(PathBuf::from(format!("{id}.json")))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Record> {
        serde_json::from_slice(bytes).context("failed to decode record")
    }
}
