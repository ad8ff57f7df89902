//! Collaborator interfaces and the backend registry.
//!
//! The sync engine only talks to the outside world through the two traits
//! here. [`RemoteBackend`] calls may fail transiently and are always routed
//! through a [`ResiliencePolicy`](crate::resilience::ResiliencePolicy);
//! [`LocalStore`] failures are plain I/O errors.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ErrorCode, SyncError};
use crate::model::Record;

pub mod file;
pub mod memory;

pub use file::FileRemote;
pub use memory::{MemoryRemote, MemoryStore};

/// Failure of one remote call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("request timed out")]
    Timeout,
    #[error("remote unreachable: {0}")]
    Unreachable(String),
    #[error("rate limited{}", .retry_after.map(|d| format!(" (retry after {d:?})")).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
    #[error("request rejected ({status}): {message}")]
    Client { status: u16, message: String },
    #[error("remote record {0} not found")]
    NotFound(String),
    #[error("unexpected remote response: {0}")]
    Shape(String),
    #[error("circuit breaker open; call not attempted")]
    CircuitOpen,
    #[error("cancelled before the call was issued")]
    Cancelled,
}

impl RemoteError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Unreachable(_) | Self::RateLimited { .. } | Self::Server { .. }
        )
    }

    /// Server-provided wait hint, if any.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout | Self::Unreachable(_) | Self::RateLimited { .. } | Self::Server { .. } => {
                ErrorCode::RemoteUnavailable
            }
            Self::Client { .. } | Self::NotFound(_) => ErrorCode::RemoteRejected,
            Self::Shape(_) => ErrorCode::UnexpectedRemoteShape,
            Self::CircuitOpen => ErrorCode::CircuitOpen,
            Self::Cancelled => ErrorCode::Cancelled,
        }
    }
}

/// A record a collaborator could not produce, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRecord {
    /// Identifier when it could still be recovered (file stem, remote id).
    pub id: Option<String>,
    /// Where the record came from, for operators.
    pub source: String,
    pub reason: String,
}

/// Result of listing one side: the readable records plus the rejects.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub records: Vec<Record>,
    pub skipped: Vec<SkippedRecord>,
}

impl Listing {
    #[must_use]
    pub const fn new(records: Vec<Record>) -> Self {
        Self {
            records,
            skipped: Vec::new(),
        }
    }
}

/// A remote issue tracker.
///
/// Remote records carry the tracker's identifier in [`Record::id`].
/// Archived records are not returned by [`fetch_all`](Self::fetch_all).
pub trait RemoteBackend: Send + Sync {
    /// Backend identifier used as the key in [`Record::remote_ids`].
    fn name(&self) -> &str;

    /// # Errors
    ///
    /// Returns a [`RemoteError`] if the listing cannot be retrieved at all.
    fn fetch_all(&self) -> Result<Listing, RemoteError>;

    /// Create `record` remotely and return the new remote id.
    ///
    /// # Errors
    ///
    /// Returns a [`RemoteError`] if the tracker rejects or fails the call.
    fn push(&self, record: &Record) -> Result<String, RemoteError>;

    /// Overwrite the synchronized fields of `remote_id` with `record`'s.
    ///
    /// # Errors
    ///
    /// Returns a [`RemoteError`] if the tracker rejects or fails the call.
    fn update(&self, remote_id: &str, record: &Record) -> Result<(), RemoteError>;

    /// Close `remote_id`, optionally marking it a duplicate of another
    /// remote record. Trackers have no hard delete.
    ///
    /// # Errors
    ///
    /// Returns a [`RemoteError`] if the tracker rejects or fails the call.
    fn archive(&self, remote_id: &str, duplicate_of: Option<&str>) -> Result<(), RemoteError>;
}

/// The local, file-backed copy of the collection.
pub trait LocalStore: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the store itself cannot be read; unreadable
    /// individual records are reported in [`Listing::skipped`].
    fn list_all(&self) -> anyhow::Result<Listing>;

    /// # Errors
    ///
    /// Returns an error if the record cannot be persisted.
    fn write(&self, record: &Record) -> anyhow::Result<()>;

    /// Remove `id`; removing a missing record is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the record exists but cannot be removed.
    fn delete(&self, id: &str) -> anyhow::Result<()>;

    /// Where `id` lives on disk, for history lookups.
    fn path_of(&self, id: &str) -> Option<PathBuf>;

    /// Parse a record from the bytes this store writes.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` are not a valid record.
    fn decode(&self, bytes: &[u8]) -> anyhow::Result<Record>;
}

/// Remote backends selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// A directory of JSON documents acting as a tracker.
    File,
}

impl BackendKind {
    pub const ALL: [Self; 1] = [Self::File];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
        }
    }

    /// Look up a backend by name.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnknownBackend`] listing the registered names.
    pub fn from_name(name: &str) -> Result<Self, SyncError> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name.trim())
            .ok_or_else(|| SyncError::UnknownBackend {
                name: name.to_string(),
                known: Self::ALL.map(Self::as_str).join(", "),
            })
    }

    /// Build the backend rooted at `root` (relative paths resolve against
    /// `project_root`).
    #[must_use]
    pub fn open(self, project_root: &Path, root: &Path) -> Box<dyn RemoteBackend> {
        let root = if root.is_absolute() {
            root.to_path_buf()
        } else {
            project_root.join(root)
        };
        match self {
            Self::File => Box::new(FileRemote::new(self.as_str(), root)),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(RemoteError::Timeout.is_transient());
        assert!(
            RemoteError::Server {
                status: 503,
                message: "down".into()
            }
            .is_transient()
        );
        assert!(
            !RemoteError::Client {
                status: 422,
                message: "bad".into()
            }
            .is_transient()
        );
        assert!(!RemoteError::CircuitOpen.is_transient());
    }

    #[test]
    fn rate_limit_carries_retry_after() {
        let err = RemoteError::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(err.code(), ErrorCode::RemoteUnavailable);
        assert!(err.to_string().contains("retry after"));
    }

    #[test]
    fn unknown_backend_lists_known_names() {
        let err = BackendKind::from_name("jira").expect_err("unknown");
        assert!(err.to_string().contains("file"));
        assert_eq!(BackendKind::from_name(" file ").ok(), Some(BackendKind::File));
    }
}
