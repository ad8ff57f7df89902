use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::record::{FieldGroup, Record, Status, Syncable};

/// A record's synchronized field values as of the last successful sync.
///
/// Snapshots are keyed by local id and carry the remote links that were
/// in effect, so a record deleted locally can still be matched to its
/// remote counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineSnapshot {
    pub id: String,
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
    pub synced_at: DateTime<Utc>,
}

impl BaselineSnapshot {
    /// Capture the synchronized fields of `record` under `id`.
    #[must_use]
    pub fn capture(id: &str, record: &Record, synced_at: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            remote_ids: record.remote_ids.clone(),
            title: record.title.clone(),
            status: record.status,
            assignee: record.assignee.clone(),
            labels: record.labels.clone(),
            body: record.body.clone(),
            synced_at,
        }
    }

    #[must_use]
    pub fn remote_id(&self, backend: &str) -> Option<&str> {
        self.remote_ids.get(backend).map(String::as_str)
    }

    /// Overwrite one field group with the values from `source`.
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
}

impl Syncable for BaselineSnapshot {
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn capture_matches_record_fields() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).single().expect("ts");
        let mut record = Record::new("tt-1", "Ship it", at);
        record.labels.insert("release".into());
        record.link("file", "7");

        let snap = BaselineSnapshot::capture("tt-1", &record, at);
        assert!(snap.same_fields(&record));
        assert_eq!(snap.fingerprint(), record.fingerprint());
        assert_eq!(snap.remote_id("file"), Some("7"));
    }
}
