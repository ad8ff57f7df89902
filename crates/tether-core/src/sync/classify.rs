//! Three-way change classification.
//!
//! Every key of a [`SyncState`] gets exactly one [`SyncCategory`], decided
//! on whole-record equality, plus a [`GroupChange`] per field group so
//! uncontested group changes can still flow while another group is in
//! conflict.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::state::{RecordKey, SyncState};
use crate::model::{FieldGroup, Syncable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncCategory {
    NewLocal,
    NewRemote,
    UpToDate,
    NeedsPush,
    NeedsPull,
    /// Both sides changed the same way since the baseline.
    Converged,
    Conflict,
    Deleted,
}

impl SyncCategory {
    pub const ALL: [Self; 8] = [
        Self::NewLocal,
        Self::NewRemote,
        Self::UpToDate,
        Self::NeedsPush,
        Self::NeedsPull,
        Self::Converged,
        Self::Conflict,
        Self::Deleted,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NewLocal => "new-local",
            Self::NewRemote => "new-remote",
            Self::UpToDate => "up-to-date",
            Self::NeedsPush => "needs-push",
            Self::NeedsPull => "needs-pull",
            Self::Converged => "converged",
            Self::Conflict => "conflict",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for SyncCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How one field group moved since the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupChange {
    Unchanged,
    Local,
    Remote,
    Converged,
    Conflict,
}

/// Which side no longer has a baselined record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Deletion {
    Both,
    /// Deleted locally; the remote copy should be archived.
    Local,
    /// Gone remotely; the local copy should be deleted.
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    /// Both sides changed the baseline differently.
    Divergent,
    /// Both sides exist and differ, with no baseline to compare against.
    NoAncestor,
    /// Deleted locally, modified remotely.
    DeletedLocally,
    /// Modified locally, gone remotely.
    DeletedRemotely,
}

/// The verdict for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub key: RecordKey,
    pub category: SyncCategory,
    /// Per-group movement; empty when a side is missing entirely.
    pub groups: BTreeMap<FieldGroup, GroupChange>,
    pub deletion: Option<Deletion>,
    pub conflict: Option<ConflictKind>,
}

impl Classification {
    fn new(key: RecordKey, category: SyncCategory) -> Self {
        Self {
            key,
            category,
            groups: BTreeMap::new(),
            deletion: None,
            conflict: None,
        }
    }

    /// Groups whose change cannot be applied without a decision.
    pub fn conflicting_groups(&self) -> impl Iterator<Item = FieldGroup> + '_ {
        self.groups
            .iter()
            .filter(|(_, change)| **change == GroupChange::Conflict)
            .map(|(group, _)| *group)
    }
}

fn group_change(
    baseline: &dyn Syncable,
    local: &dyn Syncable,
    remote: &dyn Syncable,
    group: FieldGroup,
) -> GroupChange {
    let local_changed = !local.group_eq(baseline, group);
    let remote_changed = !remote.group_eq(baseline, group);
    match (local_changed, remote_changed) {
        (false, false) => GroupChange::Unchanged,
        (true, false) => GroupChange::Local,
        (false, true) => GroupChange::Remote,
        (true, true) if local.group_eq(remote, group) => GroupChange::Converged,
        (true, true) => GroupChange::Conflict,
    }
}

/// Classify one key from its baseline, local and remote values.
///
/// Returns `None` only when all three are absent.
#[must_use]
pub fn classify(
    key: RecordKey,
    baseline: Option<&dyn Syncable>,
    local: Option<&dyn Syncable>,
    remote: Option<&dyn Syncable>,
) -> Option<Classification> {
    let verdict = match (baseline, local, remote) {
        (None, None, None) => return None,
        (None, Some(_), None) => Classification::new(key, SyncCategory::NewLocal),
        (None, None, Some(_)) => Classification::new(key, SyncCategory::NewRemote),
        (None, Some(l), Some(r)) => {
            let mut c = if l.same_fields(r) {
                Classification::new(key, SyncCategory::UpToDate)
            } else {
                let mut c = Classification::new(key, SyncCategory::Conflict);
                c.conflict = Some(ConflictKind::NoAncestor);
                c
            };
            for group in FieldGroup::ALL {
                let change = if l.group_eq(r, group) {
                    GroupChange::Unchanged
                } else {
                    GroupChange::Conflict
                };
                c.groups.insert(group, change);
            }
            c
        }
        (Some(b), Some(l), Some(r)) => {
            let local_changed = !l.same_fields(b);
            let remote_changed = !r.same_fields(b);
            let category = match (local_changed, remote_changed) {
                (false, false) => SyncCategory::UpToDate,
                (true, false) => SyncCategory::NeedsPush,
                (false, true) => SyncCategory::NeedsPull,
                (true, true) if l.same_fields(r) => SyncCategory::Converged,
                (true, true) => SyncCategory::Conflict,
            };
            let mut c = Classification::new(key, category);
            if category == SyncCategory::Conflict {
                c.conflict = Some(ConflictKind::Divergent);
            }
            for group in FieldGroup::ALL {
                c.groups.insert(group, group_change(b, l, r, group));
            }
            c
        }
        (Some(_), None, None) => {
            let mut c = Classification::new(key, SyncCategory::Deleted);
            c.deletion = Some(Deletion::Both);
            c
        }
        (Some(b), Some(l), None) => one_sided(key, b, l, GroupChange::Local, Deletion::Remote),
        (Some(b), None, Some(r)) => one_sided(key, b, r, GroupChange::Remote, Deletion::Local),
    };
    Some(verdict)
}

/// One side kept the record, the other dropped it.
fn one_sided(
    key: RecordKey,
    baseline: &dyn Syncable,
    survivor: &dyn Syncable,
    moved: GroupChange,
    deletion: Deletion,
) -> Classification {
    if survivor.same_fields(baseline) {
        let mut c = Classification::new(key, SyncCategory::Deleted);
        c.deletion = Some(deletion);
        return c;
    }
    let mut c = Classification::new(key, SyncCategory::Conflict);
    c.conflict = Some(match deletion {
        Deletion::Local => ConflictKind::DeletedLocally,
        Deletion::Remote | Deletion::Both => ConflictKind::DeletedRemotely,
    });
    for group in FieldGroup::ALL {
        let change = if survivor.group_eq(baseline, group) {
            GroupChange::Unchanged
        } else {
            moved
        };
        c.groups.insert(group, change);
    }
    c
}

/// Classify every key of `state`, in key order.
#[must_use]
pub fn classify_all(state: &SyncState) -> Vec<Classification> {
    state
        .keys()
        .into_iter()
        .filter_map(|key| {
            let b = state.baseline.get(&key).map(|s| s as &dyn Syncable);
            let l = state.local.get(&key).map(|r| r as &dyn Syncable);
            let r = state.remote.get(&key).map(|r| r as &dyn Syncable);
            classify(key, b, l, r)
        })
        .collect()
}

/// Number of classifications per category, with every category present.
#[must_use]
pub fn category_counts(classifications: &[Classification]) -> BTreeMap<SyncCategory, usize> {
    let mut counts: BTreeMap<SyncCategory, usize> =
        SyncCategory::ALL.iter().map(|c| (*c, 0)).collect();
    for c in classifications {
        *counts.entry(c.category).or_default() += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BaselineSnapshot, Record, Status};
    use chrono::{TimeZone, Utc};

    fn rec(title: &str) -> Record {
        let at = Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).single().expect("ts");
        Record::new("L1", title, at)
    }

    fn snap(record: &Record) -> BaselineSnapshot {
        BaselineSnapshot::capture(&record.id, record, record.created_at)
    }

    fn key() -> RecordKey {
        RecordKey::Linked("L1".into())
    }

    fn run(b: Option<&BaselineSnapshot>, l: Option<&Record>, r: Option<&Record>) -> Classification {
        classify(
            key(),
            b.map(|s| s as &dyn Syncable),
            l.map(|x| x as &dyn Syncable),
            r.map(|x| x as &dyn Syncable),
        )
        .expect("some side present")
    }

    #[test]
    fn first_sync_is_classified_by_presence() {
        let l = rec("Fix bug");
        assert_eq!(run(None, Some(&l), None).category, SyncCategory::NewLocal);
        assert_eq!(run(None, None, Some(&l)).category, SyncCategory::NewRemote);
        assert!(classify(key(), None, None, None).is_none());
    }

    #[test]
    fn one_sided_changes_push_or_pull() {
        let base = rec("Fix bug");
        let b = snap(&base);
        let mut changed = base.clone();
        changed.status = Status::Done;

        assert_eq!(run(Some(&b), Some(&base), Some(&base)).category, SyncCategory::UpToDate);
        assert_eq!(run(Some(&b), Some(&changed), Some(&base)).category, SyncCategory::NeedsPush);
        let pull = run(Some(&b), Some(&base), Some(&changed));
        assert_eq!(pull.category, SyncCategory::NeedsPull);
        assert_eq!(pull.groups[&FieldGroup::Status], GroupChange::Remote);
        assert_eq!(pull.groups[&FieldGroup::Content], GroupChange::Unchanged);
        assert_eq!(run(Some(&b), Some(&changed), Some(&changed)).category, SyncCategory::Converged);
    }

    #[test]
    fn divergent_status_is_a_conflict() {
        let base = rec("Fix bug");
        let b = snap(&base);
        let mut l = base.clone();
        l.status = Status::Done;
        let mut r = base.clone();
        r.status = Status::Blocked;
        let c = run(Some(&b), Some(&l), Some(&r));
        assert_eq!(c.category, SyncCategory::Conflict);
        assert_eq!(c.conflict, Some(ConflictKind::Divergent));
        assert_eq!(c.conflicting_groups().collect::<Vec<_>>(), [FieldGroup::Status]);
    }

    #[test]
    fn disjoint_group_edits_conflict_without_conflicting_groups() {
        let base = rec("Fix bug");
        let b = snap(&base);
        let mut l = base.clone();
        l.status = Status::Done;
        let mut r = base.clone();
        r.labels.insert("ui".into());
        let c = run(Some(&b), Some(&l), Some(&r));
        assert_eq!(c.category, SyncCategory::Conflict);
        assert_eq!(c.conflicting_groups().count(), 0);
        assert_eq!(c.groups[&FieldGroup::Status], GroupChange::Local);
        assert_eq!(c.groups[&FieldGroup::Labels], GroupChange::Remote);
    }

    #[test]
    fn deletions_and_delete_modify_conflicts() {
        let base = rec("Fix bug");
        let b = snap(&base);
        let mut edited = base.clone();
        edited.title = "Fix the bug".into();

        let gone = run(Some(&b), None, None);
        assert_eq!(gone.deletion, Some(Deletion::Both));

        let remote_deleted = run(Some(&b), Some(&base), None);
        assert_eq!(remote_deleted.category, SyncCategory::Deleted);
        assert_eq!(remote_deleted.deletion, Some(Deletion::Remote));

        let local_deleted = run(Some(&b), None, Some(&base));
        assert_eq!(local_deleted.deletion, Some(Deletion::Local));

        let c = run(Some(&b), None, Some(&edited));
        assert_eq!(c.conflict, Some(ConflictKind::DeletedLocally));
        assert_eq!(c.groups[&FieldGroup::Content], GroupChange::Remote);

        let c = run(Some(&b), Some(&edited), None);
        assert_eq!(c.conflict, Some(ConflictKind::DeletedRemotely));
    }

    #[test]
    fn no_ancestor_compares_sides_directly() {
        let l = rec("Same");
        assert_eq!(run(None, Some(&l), Some(&l)).category, SyncCategory::UpToDate);
        let mut r = l.clone();
        r.assignee = Some("kim".into());
        let c = run(None, Some(&l), Some(&r));
        assert_eq!(c.conflict, Some(ConflictKind::NoAncestor));
        assert_eq!(c.conflicting_groups().collect::<Vec<_>>(), [FieldGroup::Assignee]);
    }

    #[test]
    fn counts_include_every_category() {
        let counts = category_counts(&[]);
        assert_eq!(counts.len(), SyncCategory::ALL.len());
        assert!(counts.values().all(|n| *n == 0));
    }
}
