//! Turning classifications into writes.
//!
//! Planning is pure: every [`PlannedChange`] carries the remote and local
//! operations for one key plus the baseline entry to record if all of them
//! succeed. The orchestrator executes the operations and folds the
//! outcomes back into one baseline.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use super::classify::{Classification, ConflictKind, Deletion, GroupChange, SyncCategory};
use super::conflict::{ConflictPrompt, ConflictRecord, ConflictResolver};
use super::state::{RecordKey, SyncState};
use crate::backend::{RemoteBackend, RemoteError};
use crate::dedup::AppliedActions;
use crate::model::{BaselineSnapshot, Record, Syncable};

/// Local id for a record pulled from `remote_id` on `backend`.
///
/// Derived from the remote identity, so pulling the same record twice
/// (for example after an interrupted run) lands on the same local id.
#[must_use]
pub fn pull_id(backend: &str, remote_id: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(backend.as_bytes());
    hasher.update(&[0]);
    hasher.update(remote_id.as_bytes());
    let hex = hasher.finalize().to_hex();
    format!("tt-{}", &hex[..8])
}

/// One call against the remote backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOp {
    Create { record: Record },
    Update { remote_id: String, record: Record },
    Archive {
        remote_id: String,
        duplicate_of: Option<String>,
    },
}

impl RemoteOp {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::Archive { .. } => "archive",
        }
    }

    /// Issue the call; creates return the new remote id.
    ///
    /// # Errors
    ///
    /// Returns the backend's [`RemoteError`].
    pub fn execute(&self, remote: &dyn RemoteBackend) -> Result<Option<String>, RemoteError> {
        match self {
            Self::Create { record } => remote.push(record).map(Some),
            Self::Update { remote_id, record } => remote.update(remote_id, record).map(|()| None),
            Self::Archive {
                remote_id,
                duplicate_of,
            } => remote
                .archive(remote_id, duplicate_of.as_deref())
                .map(|()| None),
        }
    }
}

/// One write against the local store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalOp {
    Write(Record),
    Delete(String),
}

/// Baseline entry for a key once its operations succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextBaseline {
    /// Snapshot this record, under the change's local id.
    Capture(Record),
    /// Use this snapshot as is.
    Snapshot(BaselineSnapshot),
    /// Keep whatever the previous baseline had.
    Keep,
    /// Drop the entry.
    Remove,
}

/// Everything one key needs this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedChange {
    pub key: RecordKey,
    pub category: SyncCategory,
    /// Local id the baseline entry is stored under.
    pub local_id: String,
    pub remote: Option<RemoteOp>,
    pub local: Option<LocalOp>,
    pub on_success: NextBaseline,
    /// The baseline entry before this run.
    pub previous: Option<BaselineSnapshot>,
    /// The local write brings remote values in.
    pub pull: bool,
    /// The operations propagate a deletion.
    pub deletion: bool,
}

impl PlannedChange {
    fn new(key: RecordKey, category: SyncCategory, local_id: String) -> Self {
        Self {
            key,
            category,
            local_id,
            remote: None,
            local: None,
            on_success: NextBaseline::Keep,
            previous: None,
            pull: false,
            deletion: false,
        }
    }

    /// Record the remote id returned by a successful create.
    pub fn bind_remote_id(&mut self, backend: &str, remote_id: &str) {
        if let Some(LocalOp::Write(record)) = &mut self.local {
            record.link(backend, remote_id);
        }
        if let NextBaseline::Capture(record) = &mut self.on_success {
            record.link(backend, remote_id);
        }
    }

    /// The baseline entry to record, given whether every operation succeeded.
    #[must_use]
    pub fn next_baseline(&self, succeeded: bool, synced_at: DateTime<Utc>) -> Option<BaselineSnapshot> {
        if !succeeded {
            return self.previous.clone();
        }
        match &self.on_success {
            NextBaseline::Capture(record) => {
                Some(BaselineSnapshot::capture(&self.local_id, record, synced_at))
            }
            NextBaseline::Snapshot(snapshot) => Some(snapshot.clone()),
            NextBaseline::Keep => self.previous.clone(),
            NextBaseline::Remove => None,
        }
    }
}

/// The full set of writes for one run.
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    pub changes: Vec<PlannedChange>,
    /// Dedup writes for records outside classification.
    pub standalone_remote: Vec<RemoteOp>,
    pub standalone_local: Vec<LocalOp>,
    /// Baseline entries of records excluded from this run.
    pub carried: BTreeMap<String, BaselineSnapshot>,
    pub conflicts: Vec<ConflictRecord>,
    /// Deletions not propagated because a side could not be fully read.
    pub suppressed_deletions: usize,
}

impl SyncPlan {
    #[must_use]
    pub fn remote_ops(&self) -> usize {
        self.changes.iter().filter(|c| c.remote.is_some()).count() + self.standalone_remote.len()
    }

    #[must_use]
    pub fn local_ops(&self) -> usize {
        self.changes.iter().filter(|c| c.local.is_some()).count() + self.standalone_local.len()
    }
}

/// Inputs the planner needs besides the classifications.
pub struct Planner<'a> {
    pub backend: &'a str,
    pub synced_at: DateTime<Utc>,
    pub resolver: ConflictResolver,
    pub prompt: Option<&'a dyn ConflictPrompt>,
    /// Local listing skipped records whose id is unknown.
    pub local_incomplete: bool,
    /// Remote listing skipped records whose id is unknown.
    pub remote_incomplete: bool,
}

impl Planner<'_> {
    /// Plan every classified key plus the dedup writes in `applied`.
    ///
    /// `local_view` and `remote_view` are the record views after dedup
    /// actions were applied (local by id, remote by remote id).
    #[must_use]
    pub fn plan(
        &self,
        state: &SyncState,
        classifications: &[Classification],
        applied: &AppliedActions,
        local_view: &BTreeMap<String, Record>,
        remote_view: &BTreeMap<String, Record>,
    ) -> SyncPlan {
        let mut plan = SyncPlan {
            carried: state.carried.clone(),
            ..SyncPlan::default()
        };
        let mut covered_local: BTreeSet<String> = BTreeSet::new();
        let mut covered_remote: BTreeSet<String> = BTreeSet::new();

        for c in classifications {
            let b = state.baseline.get(&c.key);
            let l = state.local.get(&c.key);
            let r = state.remote.get(&c.key);
            let mut change = self.plan_key(c, b, l, r, &mut plan);

            if let Some(l) = l {
                covered_local.insert(l.id.clone());
                if change.local.is_none() && applied.dirty_local.contains(&l.id) {
                    change.local = Some(LocalOp::Write(self.stamped(l.clone())));
                }
            }
            if let Some(r) = r {
                covered_remote.insert(r.id.clone());
                if change.remote.is_none() && applied.dirty_remote.contains(&r.id) {
                    change.remote = Some(RemoteOp::Update {
                        remote_id: r.id.clone(),
                        record: r.clone(),
                    });
                }
            }
            plan.changes.push(change);
        }

        for id in &applied.dirty_local {
            if covered_local.contains(id) {
                continue;
            }
            if let Some(record) = local_view.get(id) {
                plan.standalone_local.push(LocalOp::Write(record.clone()));
            }
        }
        for id in &applied.deleted_local {
            plan.standalone_local.push(LocalOp::Delete(id.clone()));
        }
        for (rid, canonical) in &applied.archived_remote {
            plan.standalone_remote.push(RemoteOp::Archive {
                remote_id: rid.clone(),
                duplicate_of: Some(canonical.clone()),
            });
        }
        for rid in &applied.dirty_remote {
            if covered_remote.contains(rid) {
                continue;
            }
            if let Some(record) = remote_view.get(rid) {
                plan.standalone_remote.push(RemoteOp::Update {
                    remote_id: rid.clone(),
                    record: record.clone(),
                });
            }
        }

        info!(
            changes = plan.changes.len(),
            remote_ops = plan.remote_ops(),
            local_ops = plan.local_ops(),
            conflicts = plan.conflicts.len(),
            "sync plan ready"
        );
        plan
    }

    fn stamped(&self, mut record: Record) -> Record {
        record.synced_at = Some(self.synced_at);
        record
    }

    /// A local copy of remote record `remote` under `local_id`.
    fn pulled(&self, local_id: &str, remote: &Record) -> Record {
        let mut record = Record::new(local_id, remote.title.clone(), remote.created_at);
        record.take_fields(remote as &dyn Syncable);
        record.updated_at = remote.updated_at;
        record.link(self.backend, &remote.id);
        self.stamped(record)
    }

    fn plan_key(
        &self,
        c: &Classification,
        b: Option<&BaselineSnapshot>,
        l: Option<&Record>,
        r: Option<&Record>,
        plan: &mut SyncPlan,
    ) -> PlannedChange {
        let local_id = c
            .key
            .local_id()
            .map(str::to_string)
            .or_else(|| l.map(|l| l.id.clone()))
            .unwrap_or_else(|| r.map_or_else(String::new, |r| pull_id(self.backend, &r.id)));
        let mut change = PlannedChange::new(c.key.clone(), c.category, local_id);
        change.previous = b.cloned();

        match (c.category, l, r) {
            (SyncCategory::NewLocal, Some(l), _) => self.push_new(&mut change, l),
            (SyncCategory::NewRemote, _, Some(r)) => self.pull_into(&mut change, r),
            (SyncCategory::UpToDate | SyncCategory::Converged, Some(l), Some(_)) => {
                change.on_success = NextBaseline::Capture(l.clone());
            }
            (SyncCategory::NeedsPush, Some(l), Some(r)) => {
                change.remote = Some(RemoteOp::Update {
                    remote_id: r.id.clone(),
                    record: l.clone(),
                });
                change.on_success = NextBaseline::Capture(l.clone());
            }
            (SyncCategory::NeedsPull, Some(l), Some(r)) => {
                let mut record = l.clone();
                record.take_fields(r as &dyn Syncable);
                record.updated_at = r.updated_at;
                let record = self.stamped(record);
                change.local = Some(LocalOp::Write(record.clone()));
                change.on_success = NextBaseline::Capture(record);
                change.pull = true;
            }
            (SyncCategory::Conflict, Some(l), Some(r)) => {
                let res = self
                    .resolver
                    .resolve(c, b, l, r, self.prompt, self.synced_at);
                if !res.for_local.same_fields(l) {
                    change.local = Some(LocalOp::Write(self.stamped(res.for_local.clone())));
                    change.pull = true;
                }
                if !res.for_remote.same_fields(r) {
                    change.remote = Some(RemoteOp::Update {
                        remote_id: r.id.clone(),
                        record: res.for_remote.clone(),
                    });
                }
                change.on_success = res
                    .baseline
                    .map_or(NextBaseline::Remove, NextBaseline::Snapshot);
                plan.conflicts.push(res.record);
            }
            (SyncCategory::Conflict, Some(l), None) => {
                // modified locally, gone remotely: the modification wins
                self.push_new(&mut change, l);
                plan.conflicts.push(restored(c));
            }
            (SyncCategory::Conflict, None, Some(r)) => {
                self.pull_into(&mut change, r);
                plan.conflicts.push(restored(c));
            }
            (SyncCategory::Deleted, l, r) => self.plan_deletion(&mut change, c.deletion, l, r, plan),
            _ => {
                debug!(key = %c.key, category = %c.category, "nothing to do");
            }
        }
        change
    }

    fn push_new(&self, change: &mut PlannedChange, local: &Record) {
        let record = self.stamped(local.clone());
        change.remote = Some(RemoteOp::Create {
            record: local.clone(),
        });
        change.local = Some(LocalOp::Write(record.clone()));
        change.on_success = NextBaseline::Capture(record);
    }

    fn pull_into(&self, change: &mut PlannedChange, remote: &Record) {
        let record = self.pulled(&change.local_id, remote);
        change.local = Some(LocalOp::Write(record.clone()));
        change.on_success = NextBaseline::Capture(record);
        change.pull = true;
    }

    fn plan_deletion(
        &self,
        change: &mut PlannedChange,
        deletion: Option<Deletion>,
        local: Option<&Record>,
        remote: Option<&Record>,
        plan: &mut SyncPlan,
    ) {
        match (deletion, local, remote) {
            (Some(Deletion::Remote), Some(l), None) => {
                if self.remote_incomplete {
                    plan.suppressed_deletions += 1;
                    return;
                }
                change.local = Some(LocalOp::Delete(l.id.clone()));
                change.on_success = NextBaseline::Remove;
                change.deletion = true;
            }
            (Some(Deletion::Local), None, Some(r)) => {
                if self.local_incomplete {
                    plan.suppressed_deletions += 1;
                    return;
                }
                change.remote = Some(RemoteOp::Archive {
                    remote_id: r.id.clone(),
                    duplicate_of: None,
                });
                change.on_success = NextBaseline::Remove;
                change.deletion = true;
            }
            _ => change.on_success = NextBaseline::Remove,
        }
    }
}

/// Conflict record for a delete-versus-modify conflict settled by restoring.
fn restored(c: &Classification) -> ConflictRecord {
    ConflictRecord {
        key: c.key.clone(),
        kind: c.conflict.unwrap_or(ConflictKind::DeletedRemotely),
        resolved: c
            .groups
            .iter()
            .filter(|(_, change)| !matches!(change, GroupChange::Unchanged))
            .map(|(group, _)| *group)
            .collect(),
        unresolved: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::BaselineStore;
    use crate::model::Status;
    use crate::sync::classify::classify_all;
    use crate::sync::state::StateInput;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 11, 5, 8, 0, 0).single().expect("ts")
    }

    fn rec(id: &str, title: &str) -> Record {
        Record::new(id, title, ts())
    }

    fn planner() -> Planner<'static> {
        Planner {
            backend: "file",
            synced_at: ts(),
            resolver: ConflictResolver::default(),
            prompt: None,
            local_incomplete: false,
            remote_incomplete: false,
        }
    }

    fn plan_for(
        planner: &Planner<'_>,
        local: Vec<Record>,
        remote: Vec<Record>,
        baseline: &BaselineStore,
    ) -> SyncPlan {
        let local: BTreeMap<_, _> = local.into_iter().map(|r| (r.id.clone(), r)).collect();
        let remote: BTreeMap<_, _> = remote.into_iter().map(|r| (r.id.clone(), r)).collect();
        let none = BTreeSet::new();
        let state = SyncState::build(&StateInput {
            backend: "file",
            local: &local,
            remote: &remote,
            baseline,
            hidden_local: &none,
            hidden_remote: &none,
        });
        let classes = classify_all(&state);
        planner.plan(&state, &classes, &AppliedActions::default(), &local, &remote)
    }

    #[test]
    fn pull_ids_are_stable_and_backend_scoped() {
        assert_eq!(pull_id("file", "7"), pull_id("file", "7"));
        assert_ne!(pull_id("file", "7"), pull_id("other", "7"));
        assert!(pull_id("file", "7").starts_with("tt-"));
        assert_eq!(pull_id("file", "7").len(), 11);
    }

    #[test]
    fn new_local_pushes_then_links() {
        let plan = plan_for(&planner(), vec![rec("L1", "Fix bug")], vec![], &BaselineStore::empty());
        assert_eq!(plan.changes.len(), 1);
        let mut change = plan.changes[0].clone();
        assert!(matches!(change.remote, Some(RemoteOp::Create { .. })));

        change.bind_remote_id("file", "12");
        let Some(LocalOp::Write(written)) = &change.local else {
            panic!("expected a local write");
        };
        assert_eq!(written.remote_id("file"), Some("12"));
        assert_eq!(written.synced_at, Some(ts()));
        let snap = change.next_baseline(true, ts()).expect("snapshot");
        assert_eq!(snap.remote_id("file"), Some("12"));
        assert!(change.next_baseline(false, ts()).is_none());
    }

    #[test]
    fn new_remote_pulls_under_derived_id() {
        let plan = plan_for(&planner(), vec![], vec![rec("4", "From tracker")], &BaselineStore::empty());
        let change = &plan.changes[0];
        assert!(change.pull);
        let Some(LocalOp::Write(pulled)) = &change.local else {
            panic!("expected a pull");
        };
        assert_eq!(pulled.id, pull_id("file", "4"));
        assert_eq!(pulled.remote_id("file"), Some("4"));
        assert_eq!(pulled.title, "From tracker");
    }

    #[test]
    fn deletion_is_suppressed_when_listing_incomplete() {
        let mut linked = rec("L1", "Gone remotely");
        linked.link("file", "3");
        let baseline = BaselineStore::from_snapshots([BaselineSnapshot::capture("L1", &linked, ts())]);

        let plan = plan_for(&planner(), vec![linked.clone()], vec![], &baseline);
        assert_eq!(plan.changes[0].local, Some(LocalOp::Delete("L1".into())));

        let cautious = Planner {
            remote_incomplete: true,
            ..planner()
        };
        let plan = plan_for(&cautious, vec![linked], vec![], &baseline);
        assert!(plan.changes[0].local.is_none());
        assert_eq!(plan.suppressed_deletions, 1);
        assert!(plan.changes[0].next_baseline(true, ts()).is_some());
    }

    #[test]
    fn modified_remote_restores_locally_deleted_record() {
        let mut linked = rec("L1", "Keep me");
        linked.link("file", "3");
        let baseline = BaselineStore::from_snapshots([BaselineSnapshot::capture("L1", &linked, ts())]);
        let mut remote = rec("3", "Keep me");
        remote.status = Status::Review;

        let plan = plan_for(&planner(), vec![], vec![remote], &baseline);
        let change = &plan.changes[0];
        let Some(LocalOp::Write(restored)) = &change.local else {
            panic!("expected a restore");
        };
        assert_eq!(restored.id, "L1");
        assert_eq!(restored.status, Status::Review);
        assert_eq!(plan.conflicts[0].kind, ConflictKind::DeletedLocally);
        assert!(plan.conflicts[0].is_resolved());
    }
}
