//! The structured result of one sync run.

use serde::Serialize;
use std::collections::BTreeMap;

use super::classify::SyncCategory;
use super::conflict::ConflictRecord;
use crate::baseline::BaselineSource;
use crate::dedup::{DuplicateMatch, ResolutionAction};
use crate::error::SyncIssue;
use crate::model::Side;

/// What happened to one planned write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionOutcome {
    /// Dry run: the write would have been made.
    Planned,
    Applied,
    Failed,
    /// Not attempted, because a prerequisite failed or the run was cancelled.
    Skipped,
}

/// One entry of the write audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEntry {
    pub key: String,
    pub side: Side,
    pub op: String,
    /// Local id or remote id the write targets.
    pub target: String,
    pub outcome: ActionOutcome,
}

/// Summary of one sync run.
///
/// Counts describe records, not operations: `needs_push` counts records
/// that had something to push, `pushed` the remote writes that succeeded.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub run_id: String,
    pub backend: String,
    pub dry_run: bool,
    pub cancelled: bool,

    pub up_to_date: usize,
    pub needs_push: usize,
    pub needs_pull: usize,
    pub conflicts: usize,
    pub unresolved_conflicts: usize,
    pub duplicates_detected: usize,
    pub duplicates_auto_resolved: usize,
    pub issues_archived: usize,
    pub issues_deleted: usize,
    pub errors: usize,

    pub pushed: usize,
    pub pulled: usize,
    pub deletions_propagated: usize,
    pub deletions_suppressed: usize,

    pub category_counts: BTreeMap<SyncCategory, usize>,
    pub baseline_source: Option<BaselineSource>,
    pub baseline_reconstructed: usize,

    pub conflict_details: Vec<ConflictRecord>,
    pub duplicate_details: Vec<DuplicateMatch>,
    /// Duplicate-resolution steps decided this run.
    pub actions: Vec<ResolutionAction>,
    pub manual_review: Vec<DuplicateMatch>,
    /// Every planned write and what became of it.
    pub writes: Vec<ActionEntry>,
    pub error_details: Vec<SyncIssue>,
}

impl SyncReport {
    /// Whether the run left anything a human must look at.
    #[must_use]
    pub const fn has_unresolved(&self) -> bool {
        self.unresolved_conflicts > 0 || self.errors > 0
    }

    /// Whether the run changed nothing on either side.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.pushed == 0
            && self.pulled == 0
            && self.deletions_propagated == 0
            && self.issues_archived == 0
            && self.issues_deleted == 0
    }

    /// Count of records in `category`.
    #[must_use]
    pub fn count(&self, category: SyncCategory) -> usize {
        self.category_counts.get(&category).copied().unwrap_or(0)
    }

    pub(crate) fn fill_counts(&mut self, counts: BTreeMap<SyncCategory, usize>) {
        self.category_counts = counts;
        self.up_to_date = self.count(SyncCategory::UpToDate) + self.count(SyncCategory::Converged);
        self.needs_push = self.count(SyncCategory::NewLocal) + self.count(SyncCategory::NeedsPush);
        self.needs_pull = self.count(SyncCategory::NewRemote) + self.count(SyncCategory::NeedsPull);
        self.conflicts = self.count(SyncCategory::Conflict);
    }

    pub(crate) fn push_issue(&mut self, issue: SyncIssue) {
        self.errors += 1;
        self.error_details.push(issue);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorClass, ErrorCode};

    #[test]
    fn counts_fold_categories() {
        let mut report = SyncReport::default();
        report.fill_counts(BTreeMap::from([
            (SyncCategory::UpToDate, 3),
            (SyncCategory::Converged, 1),
            (SyncCategory::NewLocal, 2),
            (SyncCategory::NeedsPull, 4),
        ]));
        assert_eq!(report.up_to_date, 4);
        assert_eq!(report.needs_push, 2);
        assert_eq!(report.needs_pull, 4);
        assert_eq!(report.count(SyncCategory::Deleted), 0);
        assert!(!report.has_unresolved());
    }

    #[test]
    fn issues_make_the_run_unresolved() {
        let mut report = SyncReport::default();
        report.push_issue(SyncIssue::new(
            "linked:tt-1",
            ErrorClass::System,
            ErrorCode::LocalWriteFailed,
            "disk full",
        ));
        assert_eq!(report.errors, 1);
        assert!(report.has_unresolved());
    }

    #[test]
    fn serializes_camel_case() {
        let report = SyncReport {
            run_id: "r1".into(),
            needs_push: 1,
            ..SyncReport::default()
        };
        let json = serde_json::to_value(&report).expect("serialize");
        assert_eq!(json["runId"], "r1");
        assert_eq!(json["needsPush"], 1);
        assert!(json["errorDetails"].as_array().is_some_and(Vec::is_empty));
    }
}
