//! Field-level conflict resolution.
//!
//! [`resolve_group`] is a pure function of the policy, the group and the
//! two sides. [`ConflictResolver::resolve`] applies it across a record,
//! keeps uncontested group changes, and reports whatever stays open.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;

use super::classify::{Classification, ConflictKind, GroupChange};
use super::state::RecordKey;
use crate::model::{BaselineSnapshot, FieldGroup, Record, Status, Syncable};

/// Strategy for status and assignee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScalarStrategy {
    /// The side modified last wins; remote wins when that is unknown.
    #[default]
    MostRecent,
    RemoteWins,
    LocalWins,
}

/// Strategy for labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LabelStrategy {
    #[default]
    Union,
    RemoteWins,
    LocalWins,
}

/// Strategy for title and body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TextStrategy {
    /// Leave both sides alone and report the conflict.
    #[default]
    Manual,
    RemoteWins,
    LocalWins,
}

/// `[conflict]` section of the project config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictPolicy {
    pub scalar: ScalarStrategy,
    pub labels: LabelStrategy,
    pub text: TextStrategy,
}

/// Outcome for one conflicting group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupResolution {
    TakeLocal,
    TakeRemote,
    Labels(BTreeSet<String>),
    Unresolved,
}

/// Decide one conflicting group.
#[must_use]
pub fn resolve_group(
    policy: &ConflictPolicy,
    group: FieldGroup,
    local: &Record,
    remote: &Record,
) -> GroupResolution {
    match group {
        FieldGroup::Status | FieldGroup::Assignee => match policy.scalar {
            ScalarStrategy::LocalWins => GroupResolution::TakeLocal,
            ScalarStrategy::RemoteWins => GroupResolution::TakeRemote,
            ScalarStrategy::MostRecent => match (local.updated_at, remote.updated_at) {
                (Some(l), Some(r)) if l > r => GroupResolution::TakeLocal,
                _ => GroupResolution::TakeRemote,
            },
        },
        FieldGroup::Labels => match policy.labels {
            LabelStrategy::Union => {
                GroupResolution::Labels(local.labels.union(&remote.labels).cloned().collect())
            }
            LabelStrategy::RemoteWins => GroupResolution::TakeRemote,
            LabelStrategy::LocalWins => GroupResolution::TakeLocal,
        },
        FieldGroup::Content => match policy.text {
            TextStrategy::Manual => GroupResolution::Unresolved,
            TextStrategy::RemoteWins => GroupResolution::TakeRemote,
            TextStrategy::LocalWins => GroupResolution::TakeLocal,
        },
    }
}

/// The value of one field group, for reports and prompts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Content { title: String, body: String },
    Status(Status),
    Assignee(Option<String>),
    Labels(BTreeSet<String>),
}

impl FieldValue {
    #[must_use]
    pub fn of(record: &dyn Syncable, group: FieldGroup) -> Self {
        match group {
            FieldGroup::Content => Self::Content {
                title: record.title().to_string(),
                body: record.body().to_string(),
            },
            FieldGroup::Status => Self::Status(record.status()),
            FieldGroup::Assignee => Self::Assignee(record.assignee().map(str::to_string)),
            FieldGroup::Labels => Self::Labels(record.labels().clone()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Content { title, body } if body.is_empty() => write!(f, "{title:?}"),
            Self::Content { title, body } => write!(f, "{title:?} / {} chars of body", body.chars().count()),
            Self::Status(status) => write!(f, "{status}"),
            Self::Assignee(Some(who)) => f.write_str(who),
            Self::Assignee(None) => f.write_str("(unassigned)"),
            Self::Labels(labels) => {
                let joined: Vec<&str> = labels.iter().map(String::as_str).collect();
                write!(f, "[{}]", joined.join(", "))
            }
        }
    }
}

/// One field group left for a human.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldConflict {
    pub group: FieldGroup,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline: Option<FieldValue>,
    pub local: FieldValue,
    pub remote: FieldValue,
}

/// A conflicting record as reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub key: RecordKey,
    pub kind: ConflictKind,
    /// Groups settled automatically or by the prompt.
    pub resolved: Vec<FieldGroup>,
    pub unresolved: Vec<FieldConflict>,
}

impl ConflictRecord {
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Answer from an interactive conflict prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptChoice {
    Local,
    Remote,
    Skip,
}

/// Asks a human to settle one field group.
pub trait ConflictPrompt {
    fn choose(&self, key: &RecordKey, conflict: &FieldConflict) -> PromptChoice;
}

/// What to write after resolving one conflicting record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// The local record to keep (unresolved groups keep local values).
    pub for_local: Record,
    /// The values to send remotely (unresolved groups keep remote values).
    pub for_remote: Record,
    /// Next baseline for the record; `None` means leave it absent.
    pub baseline: Option<BaselineSnapshot>,
    pub record: ConflictRecord,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver {
    policy: ConflictPolicy,
}

impl ConflictResolver {
    #[must_use]
    pub const fn new(policy: ConflictPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub const fn policy(&self) -> &ConflictPolicy {
        &self.policy
    }

    /// Resolve a record present on both sides.
    ///
    /// `classification` supplies the per-group changes; `local` and
    /// `remote` are the two current values. Uncontested changes flow in
    /// their direction, conflicting groups go through the policy and then
    /// the prompt. With groups still open, the next baseline is the old
    /// one with only the settled groups moved forward, so the open groups
    /// stay in conflict on the next run.
    #[must_use]
    pub fn resolve(
        &self,
        classification: &Classification,
        baseline: Option<&BaselineSnapshot>,
        local: &Record,
        remote: &Record,
        prompt: Option<&dyn ConflictPrompt>,
        synced_at: DateTime<Utc>,
    ) -> Resolution {
        let mut merged = local.clone();
        let mut resolved = Vec::new();
        let mut unresolved = Vec::new();

        for (group, change) in &classification.groups {
            let group = *group;
            match change {
                GroupChange::Unchanged | GroupChange::Converged | GroupChange::Local => {}
                GroupChange::Remote => merged.take_group(remote, group),
                GroupChange::Conflict => {
                    let mut outcome = resolve_group(&self.policy, group, local, remote);
                    let detail = FieldConflict {
                        group,
                        baseline: baseline.map(|b| FieldValue::of(b, group)),
                        local: FieldValue::of(local, group),
                        remote: FieldValue::of(remote, group),
                    };
                    if outcome == GroupResolution::Unresolved {
                        if let Some(prompt) = prompt {
                            outcome = match prompt.choose(&classification.key, &detail) {
                                PromptChoice::Local => GroupResolution::TakeLocal,
                                PromptChoice::Remote => GroupResolution::TakeRemote,
                                PromptChoice::Skip => GroupResolution::Unresolved,
                            };
                        }
                    }
                    match outcome {
                        GroupResolution::TakeLocal => resolved.push(group),
                        GroupResolution::TakeRemote => {
                            merged.take_group(remote, group);
                            resolved.push(group);
                        }
                        GroupResolution::Labels(labels) => {
                            merged.labels = labels;
                            resolved.push(group);
                        }
                        GroupResolution::Unresolved => unresolved.push(detail),
                    }
                }
            }
        }

        let mut for_remote = merged.clone();
        for open in &unresolved {
            for_remote.take_group(remote, open.group);
        }

        let next_baseline = if unresolved.is_empty() {
            Some(BaselineSnapshot::capture(&local.id, &merged, synced_at))
        } else {
            baseline.map(|old| {
                let mut next = old.clone();
                next.synced_at = synced_at;
                for group in classification.groups.keys() {
                    if unresolved.iter().all(|u| u.group != *group) {
                        next.take_group(&merged, *group);
                    }
                }
                next
            })
        };

        if !unresolved.is_empty() {
            debug!(
                key = %classification.key,
                open = unresolved.len(),
                "conflict left for manual resolution"
            );
        }

        Resolution {
            for_local: merged,
            for_remote,
            baseline: next_baseline,
            record: ConflictRecord {
                key: classification.key.clone(),
                kind: classification.conflict.unwrap_or(ConflictKind::Divergent),
                resolved,
                unresolved,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::classify::classify;
    use chrono::{Duration, TimeZone};
    use std::cell::RefCell;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 1, 9, 0, 0).single().expect("ts")
    }

    fn base() -> Record {
        let mut r = Record::new("L1", "Fix bug", t0());
        r.link("file", "5");
        r
    }

    fn classify_pair(b: &BaselineSnapshot, l: &Record, r: &Record) -> Classification {
        classify(
            RecordKey::Linked("L1".into()),
            Some(b as &dyn Syncable),
            Some(l as &dyn Syncable),
            Some(r as &dyn Syncable),
        )
        .expect("classified")
    }

    #[test]
    fn most_recent_status_wins() {
        let b = BaselineSnapshot::capture("L1", &base(), t0());
        let mut l = base();
        l.status = Status::Done;
        l.updated_at = Some(t0() + Duration::hours(2));
        let mut r = base();
        r.status = Status::Blocked;
        r.updated_at = Some(t0() + Duration::hours(1));

        let c = classify_pair(&b, &l, &r);
        let res = ConflictResolver::default().resolve(&c, Some(&b), &l, &r, None, t0());
        assert_eq!(res.for_local.status, Status::Done);
        assert_eq!(res.for_remote.status, Status::Done);
        assert!(res.record.is_resolved());
        assert_eq!(res.baseline.map(|s| s.status), Some(Status::Done));
    }

    #[test]
    fn missing_timestamp_falls_back_to_remote() {
        let mut l = base();
        l.updated_at = None;
        let mut r = base();
        r.updated_at = Some(t0());
        let policy = ConflictPolicy::default();
        assert_eq!(
            resolve_group(&policy, FieldGroup::Status, &l, &r),
            GroupResolution::TakeRemote
        );
        l.updated_at = Some(t0());
        assert_eq!(
            resolve_group(&policy, FieldGroup::Assignee, &l, &r),
            GroupResolution::TakeRemote
        );
    }

    #[test]
    fn labels_union_and_text_stays_open() {
        let b = BaselineSnapshot::capture("L1", &base(), t0());
        let mut l = base();
        l.labels.insert("ui".into());
        l.title = "Fix bug in login".into();
        let mut r = base();
        r.labels.insert("auth".into());
        r.title = "Fix bug in logout".into();

        let c = classify_pair(&b, &l, &r);
        let res = ConflictResolver::default().resolve(&c, Some(&b), &l, &r, None, t0());
        assert_eq!(res.for_local.labels.len(), 2);
        assert_eq!(res.for_remote.labels.len(), 2);
        assert_eq!(res.for_local.title, "Fix bug in login");
        assert_eq!(res.for_remote.title, "Fix bug in logout");
        assert_eq!(res.record.unresolved.len(), 1);
        assert_eq!(res.record.unresolved[0].group, FieldGroup::Content);

        let next = res.baseline.expect("partial baseline");
        assert_eq!(next.title, "Fix bug");
        assert_eq!(next.labels.len(), 2);
    }

    #[test]
    fn uncontested_groups_flow_both_ways() {
        let b = BaselineSnapshot::capture("L1", &base(), t0());
        let mut l = base();
        l.status = Status::InProgress;
        let mut r = base();
        r.assignee = Some("ana".into());
        let c = classify_pair(&b, &l, &r);
        let res = ConflictResolver::default().resolve(&c, Some(&b), &l, &r, None, t0());
        assert_eq!(res.for_local.status, Status::InProgress);
        assert_eq!(res.for_local.assignee.as_deref(), Some("ana"));
        assert!(res.for_local.same_fields(&res.for_remote));
        assert!(res.record.resolved.is_empty());
    }

    struct Scripted(RefCell<Vec<PromptChoice>>);

    impl ConflictPrompt for Scripted {
        fn choose(&self, _key: &RecordKey, _conflict: &FieldConflict) -> PromptChoice {
            self.0.borrow_mut().pop().unwrap_or(PromptChoice::Skip)
        }
    }

    #[test]
    fn prompt_settles_manual_groups() {
        let b = BaselineSnapshot::capture("L1", &base(), t0());
        let mut l = base();
        l.body = "local notes".into();
        let mut r = base();
        r.body = "remote notes".into();
        let c = classify_pair(&b, &l, &r);

        let prompt = Scripted(RefCell::new(vec![PromptChoice::Remote]));
        let res = ConflictResolver::default().resolve(&c, Some(&b), &l, &r, Some(&prompt), t0());
        assert_eq!(res.for_local.body, "remote notes");
        assert!(res.record.is_resolved());
        assert_eq!(res.record.resolved, [FieldGroup::Content]);
    }

    #[test]
    fn policy_parses_from_toml() {
        let policy: ConflictPolicy =
            toml::from_str("scalar = \"local-wins\"\ntext = \"remote-wins\"").expect("parse");
        assert_eq!(policy.scalar, ScalarStrategy::LocalWins);
        assert_eq!(policy.labels, LabelStrategy::Union);
        assert_eq!(policy.text, TextStrategy::RemoteWins);
    }
}
