//! A directory of JSON documents acting as a remote tracker.
//!
//! Each issue lives in `<root>/<n>.json` where `n` is a sequential numeric
//! id. Ids are claimed with `create_new`, so concurrent pushes never reuse
//! a number. Archiving sets a flag; archived issues are hidden from
//! listings but stay on disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

use super::{Listing, RemoteBackend, RemoteError, SkippedRecord};
use crate::model::{Record, Status};
use crate::store::write_json_atomic;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IssueDocument {
    id: String,
    title: String,
    status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    assignee: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    labels: BTreeSet<String>,
    #[serde(default)]
    body: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    archived: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    duplicate_of: Option<String>,
}

impl IssueDocument {
    fn into_record(self) -> Record {
        let mut record = Record::new(self.id, self.title, self.created_at);
        record.status = self.status;
        record.assignee = self.assignee;
        record.labels = self.labels;
        record.body = self.body;
        record.updated_at = Some(self.updated_at);
        record.duplicate_of = self.duplicate_of;
        record
    }

    fn apply(&mut self, record: &Record, now: DateTime<Utc>) {
        self.title.clone_from(&record.title);
        self.status = record.status;
        self.assignee.clone_from(&record.assignee);
        self.labels.clone_from(&record.labels);
        self.body.clone_from(&record.body);
        self.updated_at = now;
    }
}

/// File-backed tracker rooted at a directory.
#[derive(Debug, Clone)]
pub struct FileRemote {
    name: String,
    root: PathBuf,
}

impl FileRemote {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn issue_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    fn read(&self, id: &str) -> Result<IssueDocument, RemoteError> {
        let path = self.issue_path(id);
        let bytes = fs::read(&path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => RemoteError::NotFound(id.to_string()),
            _ => unreachable_error(&self.root, &err),
        })?;
        serde_json::from_slice(&bytes).map_err(|err| RemoteError::Shape(format!("{id}: {err}")))
    }

    fn save(&self, doc: &IssueDocument) -> Result<(), RemoteError> {
        write_json_atomic(&self.issue_path(&doc.id), doc)
            .map_err(|err| RemoteError::Unreachable(format!("{err:#}")))
    }

    fn numeric_ids(&self) -> Result<Vec<u64>, RemoteError> {
        let entries = fs::read_dir(&self.root).map_err(|err| unreachable_error(&self.root, &err))?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| unreachable_error(&self.root, &err))?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(n) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<u64>().ok())
                {
                    ids.push(n);
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Reserve the next free id by creating its file exclusively.
    fn claim_id(&self) -> Result<String, RemoteError> {
        let mut next = self.numeric_ids()?.last().map_or(1, |n| n + 1);
        loop {
            let id = next.to_string();
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(self.issue_path(&id))
            {
                Ok(_) => return Ok(id),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => next += 1,
                Err(err) => return Err(unreachable_error(&self.root, &err)),
            }
        }
    }
}

fn unreachable_error(root: &Path, err: &io::Error) -> RemoteError {
    RemoteError::Unreachable(format!("{}: {err}", root.display()))
}

impl RemoteBackend for FileRemote {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch_all(&self) -> Result<Listing, RemoteError> {
        let mut listing = Listing::default();
        for n in self.numeric_ids()? {
            let id = n.to_string();
            match self.read(&id) {
                Ok(doc) if doc.archived => {}
                Ok(doc) => listing.records.push(doc.into_record()),
                // a push is between claiming the id and writing the document
                Err(RemoteError::Shape(_))
                    if fs::metadata(self.issue_path(&id)).is_ok_and(|m| m.len() == 0) => {}
                Err(RemoteError::Shape(reason)) => {
                    warn!(remote_id = %id, %reason, "skipping malformed remote issue");
                    listing.skipped.push(SkippedRecord {
                        id: Some(id.clone()),
                        source: self.issue_path(&id).display().to_string(),
                        reason,
                    });
                }
                Err(RemoteError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(listing)
    }

    fn push(&self, record: &Record) -> Result<String, RemoteError> {
        fs::create_dir_all(&self.root).map_err(|err| unreachable_error(&self.root, &err))?;
        let id = self.claim_id()?;
        let now = Utc::now();
        let mut doc = IssueDocument {
            id: id.clone(),
            title: String::new(),
            status: Status::Todo,
            assignee: None,
            labels: BTreeSet::new(),
            body: String::new(),
            created_at: now,
            updated_at: now,
            archived: false,
            duplicate_of: None,
        };
        doc.apply(record, now);
        self.save(&doc)?;
        Ok(id)
    }

    fn update(&self, remote_id: &str, record: &Record) -> Result<(), RemoteError> {
        let mut doc = self.read(remote_id)?;
        if doc.archived {
            return Err(RemoteError::NotFound(remote_id.to_string()));
        }
        doc.apply(record, Utc::now());
        self.save(&doc)
    }

    fn archive(&self, remote_id: &str, duplicate_of: Option<&str>) -> Result<(), RemoteError> {
        let mut doc = self.read(remote_id)?;
        doc.archived = true;
        doc.duplicate_of = duplicate_of.map(str::to_string);
        doc.updated_at = Utc::now();
        self.save(&doc)
    }
}
