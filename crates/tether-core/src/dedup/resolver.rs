//! Turns duplicate clusters and cross matches into resolution actions.
//!
//! Resolution is split in two steps: [`DuplicateResolver::resolve`] only
//! produces [`ResolutionAction`] values, and [`apply_actions`] replays them
//! against in-memory record views. Nothing here touches a store or backend.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

use super::detector::{DuplicateMatch, MatchScope, MatchType, RecommendedAction, SelfDedup};
use crate::model::{Record, Side, Status, Syncable};

/// A single, auditable duplicate-resolution step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ResolutionAction {
    /// Record that `local_id` and `remote_id` are the same item.
    Link { local_id: String, remote_id: String },
    /// Fold the duplicate's labels and remote links into the canonical record.
    Merge {
        side: Side,
        canonical: String,
        duplicate: String,
    },
    /// Retire `id`, pointing it at `canonical`.
    Archive {
        side: Side,
        id: String,
        reason: String,
        canonical: String,
    },
    /// Remove `id` outright; only emitted for exact local copies when
    /// identical-copy deletion is enabled.
    Delete {
        side: Side,
        id: String,
        reason: String,
    },
}

impl fmt::Display for ResolutionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Link {
                local_id,
                remote_id,
            } => write!(f, "link {local_id} <-> {remote_id}"),
            Self::Merge {
                side,
                canonical,
                duplicate,
            } => write!(f, "merge {side} {duplicate} into {canonical}"),
            Self::Archive {
                side,
                id,
                canonical,
                ..
            } => write!(f, "archive {side} {id} (duplicate of {canonical})"),
            Self::Delete { side, id, reason } => write!(f, "delete {side} {id} ({reason})"),
        }
    }
}

/// Everything the resolver decided for one run.
#[derive(Debug, Clone, Default)]
pub struct DuplicatePlan {
    pub actions: Vec<ResolutionAction>,
    /// Matches that need a human decision; never applied automatically.
    pub manual_review: Vec<DuplicateMatch>,
    /// Local ids frozen for this run because a cross match awaits review.
    pub held_local: BTreeSet<String>,
    /// Remote ids frozen for this run because a cross match awaits review.
    pub held_remote: BTreeSet<String>,
    /// Remote duplicates left alone until their canonical has a local copy.
    pub deferred: Vec<String>,
    /// Duplicates settled without a human: retired records plus cross links.
    pub auto_resolved: usize,
}

impl DuplicatePlan {
    /// Count of duplicates this plan retires (archives or deletes).
    #[must_use]
    pub fn retired(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| {
                matches!(
                    a,
                    ResolutionAction::Archive { .. } | ResolutionAction::Delete { .. }
                )
            })
            .count()
    }
}

/// Read-only context the resolver needs to decide between link and merge.
#[derive(Debug, Clone, Copy)]
pub struct ResolverContext<'a> {
    pub backend: &'a str,
    /// Local records by local id.
    pub local: &'a BTreeMap<String, Record>,
    /// Remote records by remote id.
    pub remote: &'a BTreeMap<String, Record>,
    /// Remote id → linked local id.
    pub links: &'a BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy)]
pub struct DuplicateResolver {
    auto_resolve: bool,
    threshold: f64,
    delete_identical: bool,
}

impl DuplicateResolver {
    #[must_use]
    pub const fn new(auto_resolve: bool, threshold: f64) -> Self {
        Self {
            auto_resolve,
            threshold,
            delete_identical: false,
        }
    }

    /// Delete, rather than archive, unlinked local copies whose fingerprint
    /// equals their canonical's.
    #[must_use]
    pub const fn with_identical_copy_deletion(mut self, enabled: bool) -> Self {
        self.delete_identical = enabled;
        self
    }

    fn automatic(&self, confidence: f64) -> bool {
        self.auto_resolve && confidence >= self.threshold
    }

    /// Decide what to do with every detected duplicate.
    ///
    /// Cross matches only ever produce `link`: the remote record has no
    /// local copy yet, so merging or deleting against it would leave a
    /// dangling reference. Remote clusters whose canonical is not linked
    /// locally are deferred for the same reason. Records already retired
    /// by an earlier cluster are left alone by later ones.
    #[must_use]
    pub fn resolve(
        &self,
        ctx: &ResolverContext<'_>,
        local: &SelfDedup,
        remote: &SelfDedup,
        cross: &[DuplicateMatch],
    ) -> DuplicatePlan {
        let mut plan = DuplicatePlan::default();
        let mut retired_local: BTreeSet<&str> = BTreeSet::new();
        let mut retired_remote: BTreeSet<&str> = BTreeSet::new();

        for cluster in &local.clusters {
            let Some(canonical) = ctx.local.get(&cluster.canonical) else {
                continue;
            };
            for dup in &cluster.duplicates {
                let Some(record) = ctx.local.get(&dup.id) else {
                    continue;
                };
                if !self.automatic(dup.confidence) {
                    plan.manual_review.push(review(
                        MatchScope::Local,
                        &cluster.canonical,
                        dup.id.as_str(),
                        dup.match_type,
                        dup.confidence,
                    ));
                    continue;
                }
                plan.auto_resolved += 1;
                retired_local.insert(dup.id.as_str());
                if self.delete_identical
                    && record.remote_ids.is_empty()
                    && record.fingerprint() == canonical.fingerprint()
                {
                    plan.actions.push(ResolutionAction::Delete {
                        side: Side::Local,
                        id: dup.id.clone(),
                        reason: format!("identical copy of {}", cluster.canonical),
                    });
                    continue;
                }
                plan.actions.push(ResolutionAction::Merge {
                    side: Side::Local,
                    canonical: cluster.canonical.clone(),
                    duplicate: dup.id.clone(),
                });
                plan.actions.push(ResolutionAction::Archive {
                    side: Side::Local,
                    id: dup.id.clone(),
                    reason: format!("{} duplicate", dup.match_type),
                    canonical: cluster.canonical.clone(),
                });
                if let (Some(rd), Some(rc)) = (
                    record.remote_id(ctx.backend),
                    canonical.remote_id(ctx.backend),
                ) {
                    if rd != rc && ctx.remote.contains_key(rd) {
                        retired_remote.insert(rd);
                        plan.actions.push(ResolutionAction::Archive {
                            side: Side::Remote,
                            id: rd.to_string(),
                            reason: format!("remote copy of local duplicate {}", dup.id),
                            canonical: rc.to_string(),
                        });
                    }
                }
            }
        }

        for cluster in &remote.clusters {
            if retired_remote.contains(cluster.canonical.as_str()) {
                continue;
            }
            let canonical_local = ctx
                .links
                .get(&cluster.canonical)
                .filter(|lc| !retired_local.contains(lc.as_str()));
            let mut relinked = false;
            for dup in &cluster.duplicates {
                if !ctx.remote.contains_key(&dup.id) || retired_remote.contains(dup.id.as_str()) {
                    continue;
                }
                if !self.automatic(dup.confidence) {
                    plan.manual_review.push(review(
                        MatchScope::Remote,
                        &cluster.canonical,
                        dup.id.as_str(),
                        dup.match_type,
                        dup.confidence,
                    ));
                    continue;
                }
                let dup_local = ctx
                    .links
                    .get(&dup.id)
                    .filter(|ld| ctx.local.contains_key(*ld) && !retired_local.contains(ld.as_str()));
                let Some(lc) = canonical_local else {
                    // Point the duplicate's local copy at the canonical; the
                    // archive waits until that link has been synced once.
                    if let (false, Some(ld)) = (relinked, dup_local) {
                        plan.actions.push(ResolutionAction::Link {
                            local_id: ld.clone(),
                            remote_id: cluster.canonical.clone(),
                        });
                        relinked = true;
                    }
                    debug!(
                        canonical = %cluster.canonical,
                        duplicate = %dup.id,
                        "canonical has no local copy yet; deferring"
                    );
                    plan.deferred.push(dup.id.clone());
                    continue;
                };
                plan.auto_resolved += 1;
                plan.actions.push(ResolutionAction::Merge {
                    side: Side::Remote,
                    canonical: cluster.canonical.clone(),
                    duplicate: dup.id.clone(),
                });
                plan.actions.push(ResolutionAction::Archive {
                    side: Side::Remote,
                    id: dup.id.clone(),
                    reason: format!("{} duplicate", dup.match_type),
                    canonical: cluster.canonical.clone(),
                });
                if let Some(ld) = dup_local.filter(|ld| *ld != lc) {
                    retired_local.insert(ld.as_str());
                    plan.actions.push(ResolutionAction::Merge {
                        side: Side::Local,
                        canonical: lc.clone(),
                        duplicate: ld.clone(),
                    });
                    plan.actions.push(ResolutionAction::Archive {
                        side: Side::Local,
                        id: ld.clone(),
                        reason: format!("local copy of remote duplicate {}", dup.id),
                        canonical: lc.clone(),
                    });
                }
            }
        }

        for m in cross {
            if self.automatic(m.confidence) {
                plan.auto_resolved += 1;
                plan.actions.push(ResolutionAction::Link {
                    local_id: m.left.clone(),
                    remote_id: m.right.clone(),
                });
            } else {
                plan.held_local.insert(m.left.clone());
                plan.held_remote.insert(m.right.clone());
                plan.manual_review.push(DuplicateMatch {
                    recommended: RecommendedAction::ManualReview,
                    ..m.clone()
                });
            }
        }

        debug!(
            actions = plan.actions.len(),
            manual = plan.manual_review.len(),
            deferred = plan.deferred.len(),
            "duplicate resolution planned"
        );
        plan
    }
}

fn review(
    scope: MatchScope,
    canonical: &str,
    duplicate: &str,
    match_type: MatchType,
    confidence: f64,
) -> DuplicateMatch {
    DuplicateMatch {
        scope,
        left: canonical.to_string(),
        right: duplicate.to_string(),
        match_type,
        confidence,
        recommended: RecommendedAction::ManualReview,
    }
}

/// Which records changed when actions were replayed onto the views.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedActions {
    /// Local ids whose record must be written back.
    pub dirty_local: BTreeSet<String>,
    pub deleted_local: BTreeSet<String>,
    /// Local ids retired as duplicates; written back with `duplicate_of` set.
    pub archived_local: BTreeSet<String>,
    /// Remote ids whose record must be updated remotely.
    pub dirty_remote: BTreeSet<String>,
    /// Remote id → canonical remote id it was archived in favour of.
    pub archived_remote: BTreeMap<String, String>,
}

/// Replay `actions` onto the local (by id) and remote (by remote id) views.
///
/// Actions naming records missing from the views are skipped.
pub fn apply_actions(
    actions: &[ResolutionAction],
    backend: &str,
    local: &mut BTreeMap<String, Record>,
    remote: &mut BTreeMap<String, Record>,
) -> AppliedActions {
    let mut applied = AppliedActions::default();
    for action in actions {
        match action {
            ResolutionAction::Link {
                local_id,
                remote_id,
            } => {
                if let Some(record) = local.get_mut(local_id) {
                    record.link(backend, remote_id);
                    applied.dirty_local.insert(local_id.clone());
                }
            }
            ResolutionAction::Merge {
                side: Side::Local,
                canonical,
                duplicate,
            } => {
                let Some(dup) = local.get(duplicate).cloned() else {
                    continue;
                };
                let Some(target) = local.get_mut(canonical) else {
                    continue;
                };
                target.labels.extend(dup.labels.iter().cloned());
                let mut moved = Vec::new();
                for (name, rid) in &dup.remote_ids {
                    if !target.remote_ids.contains_key(name) {
                        target.link(name, rid);
                        moved.push(name.clone());
                    }
                }
                applied.dirty_local.insert(canonical.clone());
                if let Some(dup) = local.get_mut(duplicate) {
                    for name in moved {
                        dup.remote_ids.remove(&name);
                    }
                }
            }
            ResolutionAction::Merge {
                side: Side::Remote,
                canonical,
                duplicate,
            } => {
                let Some(labels) = remote.get(duplicate).map(|d| d.labels.clone()) else {
                    continue;
                };
                if let Some(target) = remote.get_mut(canonical) {
                    let before = target.labels.len();
                    target.labels.extend(labels);
                    if target.labels.len() != before {
                        applied.dirty_remote.insert(canonical.clone());
                    }
                }
            }
            ResolutionAction::Archive {
                side: Side::Local,
                id,
                canonical,
                ..
            } => {
                if let Some(record) = local.get_mut(id) {
                    record.status = Status::Archived;
                    record.duplicate_of = Some(canonical.clone());
                    applied.dirty_local.insert(id.clone());
                    applied.archived_local.insert(id.clone());
                }
            }
            ResolutionAction::Archive {
                side: Side::Remote,
                id,
                canonical,
                ..
            } => {
                if remote.remove(id).is_some() {
                    applied.dirty_remote.remove(id);
                    applied.archived_remote.insert(id.clone(), canonical.clone());
                }
            }
            ResolutionAction::Delete { side, id, .. } => {
                if *side == Side::Local && local.remove(id).is_some() {
                    applied.dirty_local.remove(id);
                    applied.archived_local.remove(id);
                    applied.deleted_local.insert(id.clone());
                }
            }
        }
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::{DedupConfig, DuplicateDetector};
    use chrono::{TimeZone, Utc};

    fn rec(id: &str, title: &str) -> Record {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).single().expect("ts");
        Record::new(id, title, at)
    }

    fn by_id(records: &[Record]) -> BTreeMap<String, Record> {
        records.iter().map(|r| (r.id.clone(), r.clone())).collect()
    }

    #[test]
    fn local_cluster_merges_and_archives_into_linked_canonical() {
        let mut a = rec("A", "Fix the login redirect loop on mobile safari");
        a.link("file", "42");
        let mut b = rec("B", "fix the login redirect loop on mobile safari");
        b.labels.insert("auth".into());
        let c = rec("C", "Fix the login redirect loop on mobile safary");
        let records = vec![a, b, c];
        let config = DedupConfig::default();
        let dedup = DuplicateDetector::new(&config)
            .self_dedup(MatchScope::Local, &records, |r| !r.remote_ids.is_empty());

        let mut local = by_id(&records);
        let mut remote = BTreeMap::new();
        let links = BTreeMap::from([("42".to_string(), "A".to_string())]);
        let ctx = ResolverContext {
            backend: "file",
            local: &local,
            remote: &remote,
            links: &links,
        };
        let plan = DuplicateResolver::new(true, 0.95).resolve(
            &ctx,
            &dedup,
            &SelfDedup::default(),
            &[],
        );
        assert!(plan.manual_review.is_empty());
        assert_eq!(plan.retired(), 2);

        let applied = apply_actions(&plan.actions, "file", &mut local, &mut remote);
        assert_eq!(local["B"].duplicate_of.as_deref(), Some("A"));
        assert_eq!(local["C"].duplicate_of.as_deref(), Some("A"));
        assert_eq!(local["C"].status, Status::Archived);
        assert!(local["A"].labels.contains("auth"));
        assert!(applied.dirty_local.contains("A"));
        assert_eq!(
            applied.archived_local.iter().map(String::as_str).collect::<Vec<_>>(),
            ["B", "C"]
        );
    }

    #[test]
    fn identical_unlinked_copy_is_archived_by_default() {
        let records = vec![rec("a", "Same"), rec("b", "Same")];
        let config = DedupConfig::default();
        let dedup = DuplicateDetector::new(&config).self_dedup(MatchScope::Local, &records, |_| false);
        let mut local = by_id(&records);
        let ctx = ResolverContext {
            backend: "file",
            local: &local,
            remote: &BTreeMap::new(),
            links: &BTreeMap::new(),
        };
        let plan =
            DuplicateResolver::new(true, 0.95).resolve(&ctx, &dedup, &SelfDedup::default(), &[]);
        assert!(
            !plan
                .actions
                .iter()
                .any(|a| matches!(a, ResolutionAction::Delete { .. }))
        );
        assert!(plan.actions.contains(&ResolutionAction::Archive {
            side: Side::Local,
            id: "b".into(),
            reason: "exact-title duplicate".into(),
            canonical: "a".into(),
        }));

        let applied = apply_actions(&plan.actions, "file", &mut local, &mut BTreeMap::new());
        assert!(applied.deleted_local.is_empty());
        assert_eq!(local["b"].status, Status::Archived);
        assert_eq!(local["b"].duplicate_of.as_deref(), Some("a"));
    }

    #[test]
    fn identical_unlinked_copy_is_deleted_when_enabled() {
        let records = vec![rec("a", "Same"), rec("b", "Same")];
        let config = DedupConfig::default();
        let dedup = DuplicateDetector::new(&config).self_dedup(MatchScope::Local, &records, |_| false);
        let local = by_id(&records);
        let ctx = ResolverContext {
            backend: "file",
            local: &local,
            remote: &BTreeMap::new(),
            links: &BTreeMap::new(),
        };
        let plan = DuplicateResolver::new(true, 0.95)
            .with_identical_copy_deletion(true)
            .resolve(&ctx, &dedup, &SelfDedup::default(), &[]);
        assert_eq!(plan.actions, vec![ResolutionAction::Delete {
            side: Side::Local,
            id: "b".into(),
            reason: "identical copy of a".into(),
        }]);
    }

    #[test]
    fn unlinked_remote_canonical_defers_instead_of_merging() {
        let remote_records = vec![rec("10", "Same"), rec("11", "same")];
        let config = DedupConfig::default();
        let dedup =
            DuplicateDetector::new(&config).self_dedup(MatchScope::Remote, &remote_records, |_| false);
        let remote = by_id(&remote_records);
        let ctx = ResolverContext {
            backend: "file",
            local: &BTreeMap::new(),
            remote: &remote,
            links: &BTreeMap::new(),
        };
        let plan =
            DuplicateResolver::new(true, 0.95).resolve(&ctx, &SelfDedup::default(), &dedup, &[]);
        assert!(plan.actions.is_empty());
        assert_eq!(plan.deferred, ["11"]);
    }

    #[test]
    fn linked_remote_canonical_archives_remote_duplicate() {
        let remote_records = vec![rec("10", "Same"), rec("11", "same")];
        let config = DedupConfig::default();
        let links = BTreeMap::from([("10".to_string(), "L1".to_string())]);
        let dedup = DuplicateDetector::new(&config)
            .self_dedup(MatchScope::Remote, &remote_records, |r| links.contains_key(&r.id));
        let local = by_id(&[rec("L1", "Same")]);
        let mut remote = by_id(&remote_records);
        let ctx = ResolverContext {
            backend: "file",
            local: &local,
            remote: &remote,
            links: &links,
        };
        let plan =
            DuplicateResolver::new(true, 0.95).resolve(&ctx, &SelfDedup::default(), &dedup, &[]);
        assert!(plan.actions.contains(&ResolutionAction::Archive {
            side: Side::Remote,
            id: "11".into(),
            reason: "exact-title duplicate".into(),
            canonical: "10".into(),
        }));

        let mut local = local;
        let applied = apply_actions(&plan.actions, "file", &mut local, &mut remote);
        assert_eq!(applied.archived_remote.get("11").map(String::as_str), Some("10"));
        assert!(!remote.contains_key("11"));
    }

    #[test]
    fn linked_duplicate_of_unlinked_canonical_is_relinked_not_archived() {
        let remote_records = vec![rec("10", "Same"), rec("11", "same")];
        let config = DedupConfig::default();
        let dedup =
            DuplicateDetector::new(&config).self_dedup(MatchScope::Remote, &remote_records, |_| false);
        let local = by_id(&[rec("L5", "Same")]);
        let remote = by_id(&remote_records);
        let links = BTreeMap::from([("11".to_string(), "L5".to_string())]);
        let ctx = ResolverContext {
            backend: "file",
            local: &local,
            remote: &remote,
            links: &links,
        };
        let plan =
            DuplicateResolver::new(true, 0.95).resolve(&ctx, &SelfDedup::default(), &dedup, &[]);
        assert_eq!(plan.actions, vec![ResolutionAction::Link {
            local_id: "L5".into(),
            remote_id: "10".into(),
        }]);
        assert_eq!(plan.deferred, ["11"]);
        assert_eq!(plan.auto_resolved, 0);
    }

    #[test]
    fn weak_cross_match_is_held_for_review() {
        let m = DuplicateMatch {
            scope: MatchScope::Cross,
            left: "L1".into(),
            right: "9".into(),
            match_type: MatchType::FuzzyTitle,
            confidence: 0.91,
            recommended: RecommendedAction::ManualReview,
        };
        let ctx = ResolverContext {
            backend: "file",
            local: &BTreeMap::new(),
            remote: &BTreeMap::new(),
            links: &BTreeMap::new(),
        };
        let resolver = DuplicateResolver::new(true, 0.95);
        let plan = resolver.resolve(&ctx, &SelfDedup::default(), &SelfDedup::default(), &[m.clone()]);
        assert!(plan.actions.is_empty());
        assert!(plan.held_local.contains("L1") && plan.held_remote.contains("9"));

        let strong = DuplicateMatch {
            confidence: 0.97,
            ..m
        };
        let plan = resolver.resolve(&ctx, &SelfDedup::default(), &SelfDedup::default(), &[strong]);
        assert_eq!(plan.actions, vec![ResolutionAction::Link {
            local_id: "L1".into(),
            remote_id: "9".into(),
        }]);
    }

    #[test]
    fn action_serializes_with_tag() {
        let action = ResolutionAction::Link {
            local_id: "L1".into(),
            remote_id: "9".into(),
        };
        let json = serde_json::to_value(&action).expect("serialize");
        assert_eq!(json["action"], "link");
        assert_eq!(json["localId"], "L1");
    }
}
