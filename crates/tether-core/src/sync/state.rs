//! The keyed baseline/local/remote views for one classification pass.
//!
//! Local and remote records are brought under a common [`RecordKey`]
//! through the [`LinkIndex`]. Records hidden from this run (absorbed
//! duplicates, records held for review, unreadable records) are excluded
//! together with whatever they are linked to, and their baseline entries
//! are carried over untouched.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::warn;

use crate::baseline::BaselineStore;
use crate::model::{BaselineSnapshot, Record};

/// Identity of one record across the three views.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordKey {
    /// A local id known to the remote, through the record or its baseline.
    Linked(String),
    /// A local record never synced to this backend.
    UnlinkedLocal(String),
    /// A remote record (by remote id) with no local counterpart.
    UnlinkedRemote(String),
}

impl RecordKey {
    /// The local id this key stands for, if it has one.
    #[must_use]
    pub fn local_id(&self) -> Option<&str> {
        match self {
            Self::Linked(id) | Self::UnlinkedLocal(id) => Some(id),
            Self::UnlinkedRemote(_) => None,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linked(id) => write!(f, "linked:{id}"),
            Self::UnlinkedLocal(id) => write!(f, "unlinked-local:{id}"),
            Self::UnlinkedRemote(id) => write!(f, "unlinked-remote:{id}"),
        }
    }
}

impl Serialize for RecordKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Remote id → local id for one backend.
///
/// Entries are first-come: add the records that should win first.
#[derive(Debug, Clone, Default)]
pub struct LinkIndex {
    by_remote: BTreeMap<String, String>,
}

impl LinkIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_records<'r>(&mut self, backend: &str, records: impl IntoIterator<Item = &'r Record>) {
        for record in records {
            if let Some(rid) = record.remote_id(backend) {
                self.by_remote
                    .entry(rid.to_string())
                    .or_insert_with(|| record.id.clone());
            }
        }
    }

    /// Add links remembered by the baseline for ids with no local record.
    pub fn add_baseline(
        &mut self,
        backend: &str,
        baseline: &BaselineStore,
        local: &BTreeMap<String, Record>,
    ) {
        for (id, snapshot) in baseline.snapshots() {
            if local.contains_key(id) {
                continue;
            }
            if let Some(rid) = snapshot.remote_id(backend) {
                self.by_remote
                    .entry(rid.to_string())
                    .or_insert_with(|| id.clone());
            }
        }
    }

    #[must_use]
    pub fn local_for(&self, remote_id: &str) -> Option<&str> {
        self.by_remote.get(remote_id).map(String::as_str)
    }

    #[must_use]
    pub const fn as_map(&self) -> &BTreeMap<String, String> {
        &self.by_remote
    }
}

/// Inputs for [`SyncState::build`].
#[derive(Debug, Clone, Copy)]
pub struct StateInput<'a> {
    pub backend: &'a str,
    /// Every readable local record, by local id.
    pub local: &'a BTreeMap<String, Record>,
    /// Every readable remote record, by remote id.
    pub remote: &'a BTreeMap<String, Record>,
    pub baseline: &'a BaselineStore,
    /// Local ids kept out of this run.
    pub hidden_local: &'a BTreeSet<String>,
    /// Remote ids kept out of this run.
    pub hidden_remote: &'a BTreeSet<String>,
}

/// The three parallel views of one classification pass.
#[derive(Debug, Clone, Default)]
pub struct SyncState {
    pub baseline: BTreeMap<RecordKey, BaselineSnapshot>,
    pub local: BTreeMap<RecordKey, Record>,
    pub remote: BTreeMap<RecordKey, Record>,
    /// Baseline entries of excluded records, carried into the next baseline.
    pub carried: BTreeMap<String, BaselineSnapshot>,
    pub links: LinkIndex,
    pub excluded_local: BTreeSet<String>,
    pub excluded_remote: BTreeSet<String>,
}

impl SyncState {
    #[must_use]
    pub fn build(input: &StateInput<'_>) -> Self {
        let backend = input.backend;
        let mut links = LinkIndex::new();
        links.add_records(
            backend,
            input
                .local
                .values()
                .filter(|r| !input.hidden_local.contains(&r.id)),
        );
        links.add_records(
            backend,
            input
                .local
                .values()
                .filter(|r| input.hidden_local.contains(&r.id)),
        );
        links.add_baseline(backend, input.baseline, input.local);

        let mut excluded_local = input.hidden_local.clone();
        for record in input.local.values() {
            if record
                .remote_id(backend)
                .is_some_and(|rid| input.hidden_remote.contains(rid))
            {
                excluded_local.insert(record.id.clone());
            }
        }
        let mut excluded_remote = input.hidden_remote.clone();
        for rid in input.remote.keys() {
            if links
                .local_for(rid)
                .is_some_and(|lid| excluded_local.contains(lid))
            {
                excluded_remote.insert(rid.clone());
            }
        }

        let mut state = Self::default();
        for record in input.local.values() {
            if excluded_local.contains(&record.id) {
                continue;
            }
            let key = if record.remote_id(backend).is_some()
                || input.baseline.get(&record.id).is_some()
            {
                RecordKey::Linked(record.id.clone())
            } else {
                RecordKey::UnlinkedLocal(record.id.clone())
            };
            state.local.insert(key, record.clone());
        }

        for (rid, record) in input.remote {
            if excluded_remote.contains(rid) {
                continue;
            }
            let mut key = links
                .local_for(rid)
                .map_or_else(|| RecordKey::UnlinkedRemote(rid.clone()), |lid| RecordKey::Linked(lid.to_string()));
            if state.remote.contains_key(&key) {
                warn!(remote_id = %rid, %key, "two remote records claim one local record; treating as unlinked");
                key = RecordKey::UnlinkedRemote(rid.clone());
            }
            state.remote.insert(key, record.clone());
        }

        for (id, snapshot) in input.baseline.snapshots() {
            let hidden = excluded_local.contains(id)
                || snapshot
                    .remote_id(backend)
                    .is_some_and(|rid| excluded_remote.contains(rid));
            if hidden {
                state.carried.insert(id.clone(), snapshot.clone());
            } else {
                state
                    .baseline
                    .insert(RecordKey::Linked(id.clone()), snapshot.clone());
            }
        }

        state.links = links;
        state.excluded_local = excluded_local;
        state.excluded_remote = excluded_remote;
        state
    }

    /// Every key present in at least one view, each exactly once.
    #[must_use]
    pub fn keys(&self) -> BTreeSet<RecordKey> {
        self.baseline
            .keys()
            .chain(self.local.keys())
            .chain(self.remote.keys())
            .cloned()
            .collect()
    }
}
