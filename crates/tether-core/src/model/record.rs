use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::{fmt, str::FromStr};

/// Lifecycle states shared by the local store and remote trackers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    Todo,
    InProgress,
    Blocked,
    Review,
    Done,
    Archived,
}

impl Status {
    pub const ALL: [Self; 6] = [
        Self::Todo,
        Self::InProgress,
        Self::Blocked,
        Self::Review,
        Self::Done,
        Self::Archived,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in-progress",
            Self::Blocked => "blocked",
            Self::Review => "review",
            Self::Done => "done",
            Self::Archived => "archived",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "todo" | "open" => Ok(Self::Todo),
            "in-progress" | "in_progress" | "doing" => Ok(Self::InProgress),
            "blocked" => Ok(Self::Blocked),
            "review" => Ok(Self::Review),
            "done" | "closed" => Ok(Self::Done),
            "archived" => Ok(Self::Archived),
            other => Err(ParseEnumError {
                expected: "status",
                got: other.to_string(),
            }),
        }
    }
}

/// Error returned when parsing an enum value from text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub expected: &'static str,
    pub got: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: '{}'", self.expected, self.got)
    }
}

impl std::error::Error for ParseEnumError {}

/// Groups of fields that are compared and resolved together.
///
/// Title and body travel as one `Content` group: a retitle and a body edit
/// on opposite sides are treated as competing edits of the same text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldGroup {
    Content,
    Status,
    Assignee,
    Labels,
}

impl FieldGroup {
    pub const ALL: [Self; 4] = [Self::Content, Self::Status, Self::Assignee, Self::Labels];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::Status => "status",
            Self::Assignee => "assignee",
            Self::Labels => "labels",
        }
    }
}

impl fmt::Display for FieldGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read access to the synchronized fields of a record or snapshot.
pub trait Syncable {
    fn title(&self) -> &str;
    fn body(&self) -> &str;
    fn status(&self) -> Status;
    fn assignee(&self) -> Option<&str>;
    fn labels(&self) -> &BTreeSet<String>;

    /// Content fingerprint over title, body and labels.
    fn fingerprint(&self) -> String {
        fingerprint(self.title(), self.body(), self.labels())
    }

    /// Whether `self` and `other` agree on every field in `group`.
    fn group_eq(&self, other: &dyn Syncable, group: FieldGroup) -> bool {
        match group {
            FieldGroup::Content => self.title() == other.title() && self.body() == other.body(),
            FieldGroup::Status => self.status() == other.status(),
            FieldGroup::Assignee => self.assignee() == other.assignee(),
            FieldGroup::Labels => self.labels() == other.labels(),
        }
    }

    /// Whether `self` and `other` agree on all field groups.
    fn same_fields(&self, other: &dyn Syncable) -> bool {
        FieldGroup::ALL.iter().all(|g| self.group_eq(other, *g))
    }
}

/// Compute the `blake3:` content fingerprint.
///
/// Titles are normalized (trimmed, case-folded, whitespace collapsed) so
/// cosmetic edits do not change the fingerprint; bodies are only trimmed.
#[must_use]
pub fn fingerprint(title: &str, body: &str, labels: &BTreeSet<String>) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(normalize_title(title).as_bytes());
    hasher.update(&[0x1f]);
    hasher.update(body.trim().as_bytes());
    for label in labels {
        hasher.update(&[0x1e]);
        hasher.update(label.as_bytes());
    }
    format!("blake3:{}", hasher.finalize().to_hex())
}

/// Trim, case-fold and collapse internal whitespace.
#[must_use]
pub fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// A work item as seen by one side of a sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Stable identifier. Local ids are assigned once and never reused;
    /// remote records carry the tracker's own identifier here.
    pub id: String,
    /// Backend name → remote identifier. At most one entry per backend.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub remote_ids: BTreeMap<String, String>,
    pub title: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<String>,
    /// When this record last took part in a successful sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
}

impl Record {
    /// A minimal `todo` record; mostly useful to collaborators and tests.
    pub fn new(id: impl Into<String>, title: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            remote_ids: BTreeMap::new(),
            title: title.into(),
            status: Status::Todo,
            assignee: None,
            labels: BTreeSet::new(),
            body: String::new(),
            created_at,
            updated_at: None,
            duplicate_of: None,
            synced_at: None,
        }
    }

    #[must_use]
    pub fn remote_id(&self, backend: &str) -> Option<&str> {
        self.remote_ids.get(backend).map(String::as_str)
    }

    /// Link this record to `remote_id` on `backend`, replacing any previous link.
    pub fn link(&mut self, backend: &str, remote_id: &str) {
        self.remote_ids
            .insert(backend.to_string(), remote_id.to_string());
    }

    /// Whether this record has been collapsed into another one.
    #[must_use]
    pub const fn is_resolved_duplicate(&self) -> bool {
        self.duplicate_of.is_some()
    }

    /// Copy every synchronized field group from `source`.
    pub fn take_fields(&mut self, source: &dyn Syncable) {
        for group in FieldGroup::ALL {
            self.take_group(source, group);
        }
    }

    /// Copy one synchronized field group from `source`.
    pub fn take_group(&mut self, source: &dyn Syncable, group: FieldGroup) {
        match group {
            FieldGroup::Content => {
                self.title = source.title().to_string();
                self.body = source.body().to_string();
            }
            FieldGroup::Status => self.status = source.status(),
            FieldGroup::Assignee => self.assignee = source.assignee().map(str::to_string),
            FieldGroup::Labels => self.labels = source.labels().clone(),
        }
    }

    /// Check the structural rules every stored record must satisfy.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] naming the first rule that fails.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::EmptyId);
        }
        if self.title.trim().is_empty() {
            return Err(ValidationError::EmptyTitle {
                id: self.id.clone(),
            });
        }
        if let Some((backend, _)) = self
            .remote_ids
            .iter()
            .find(|(backend, rid)| backend.trim().is_empty() || rid.trim().is_empty())
        {
            return Err(ValidationError::BlankRemoteId {
                id: self.id.clone(),
                backend: backend.clone(),
            });
        }
        if self.duplicate_of.as_deref() == Some(self.id.as_str()) {
            return Err(ValidationError::SelfDuplicate {
                id: self.id.clone(),
            });
        }
        Ok(())
    }
}

impl Syncable for Record {
    fn title(&self) -> &str {
        &self.title
    }
    fn body(&self) -> &str {
        &self.body
    }
    fn status(&self) -> Status {
        self.status
    }
    fn assignee(&self) -> Option<&str> {
        self.assignee.as_deref()
    }
    fn labels(&self) -> &BTreeSet<String> {
        &self.labels
    }
}

/// Structural problems found by [`Record::validate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("record has an empty id")]
    EmptyId,
    #[error("record {id} has an empty title")]
    EmptyTitle { id: String },
    #[error("record {id} has a blank remote id for backend '{backend}'")]
    BlankRemoteId { id: String, backend: String },
    #[error("record {id} is marked as a duplicate of itself")]
    SelfDuplicate { id: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 15, 10, 0, 0).single().expect("valid ts")
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in Status::ALL {
            assert_eq!(status.as_str().parse::<Status>(), Ok(status));
        }
        assert_eq!("Closed".parse::<Status>(), Ok(Status::Done));
        assert!("wontfix".parse::<Status>().is_err());
    }

    #[test]
    fn status_serde_is_kebab_case() {
        let json = serde_json::to_string(&Status::InProgress).expect("serialize");
        assert_eq!(json, "\"in-progress\"");
    }

    #[test]
    fn fingerprint_ignores_title_cosmetics_but_not_body() {
        let labels = BTreeSet::from(["bug".to_string()]);
        let a = fingerprint("Fix  Login", "body", &labels);
        let b = fingerprint("  fix login ", "body", &labels);
        let c = fingerprint("fix login", "other body", &labels);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("blake3:"));
    }

    #[test]
    fn fingerprint_depends_on_labels() {
        let none = BTreeSet::new();
        let some = BTreeSet::from(["ui".to_string()]);
        assert_ne!(fingerprint("t", "b", &none), fingerprint("t", "b", &some));
    }

    #[test]
    fn group_eq_compares_only_the_group() {
        let a = Record::new("a", "Same", ts());
        let mut b = a.clone();
        b.status = Status::Done;
        assert!(a.group_eq(&b, FieldGroup::Content));
        assert!(!a.group_eq(&b, FieldGroup::Status));
        assert!(!a.same_fields(&b));
    }

    #[test]
    fn validate_rejects_blank_title_and_self_duplicate() {
        let mut r = Record::new("tt-1", "  ", ts());
        assert!(matches!(
            r.validate(),
            Err(ValidationError::EmptyTitle { .. })
        ));
        r.title = "ok".into();
        r.duplicate_of = Some("tt-1".into());
        assert!(matches!(
            r.validate(),
            Err(ValidationError::SelfDuplicate { .. })
        ));
        r.duplicate_of = None;
        r.link("file", "");
        assert!(matches!(
            r.validate(),
            Err(ValidationError::BlankRemoteId { .. })
        ));
    }

    #[test]
    fn link_keeps_one_entry_per_backend() {
        let mut r = Record::new("tt-1", "x", ts());
        r.link("file", "1");
        r.link("file", "2");
        assert_eq!(r.remote_ids.len(), 1);
        assert_eq!(r.remote_id("file"), Some("2"));
    }
}
