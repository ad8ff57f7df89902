use serde::Serialize;
use std::fmt;

use crate::backend::RemoteError;

/// Machine-readable error codes for agent-friendly decision making.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    InvalidOption,
    UnknownBackend,
    StoreUnavailable,
    InvalidRecord,
    CorruptRecord,
    UnexpectedRemoteShape,
    RemoteUnavailable,
    RemoteRejected,
    CircuitOpen,
    LocalWriteFailed,
    BaselineCorrupt,
    BaselinePersistFailed,
    LockContention,
    Cancelled,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1001",
            Self::InvalidOption => "E1002",
            Self::UnknownBackend => "E1003",
            Self::StoreUnavailable => "E1004",
            Self::InvalidRecord => "E2001",
            Self::CorruptRecord => "E2002",
            Self::UnexpectedRemoteShape => "E2003",
            Self::RemoteUnavailable => "E3001",
            Self::RemoteRejected => "E3002",
            Self::CircuitOpen => "E3003",
            Self::LocalWriteFailed => "E5001",
            Self::BaselineCorrupt => "E5002",
            Self::BaselinePersistFailed => "E5003",
            Self::LockContention => "E5004",
            Self::Cancelled => "E8001",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::InvalidOption => "Invalid sync option",
            Self::UnknownBackend => "Unknown remote backend",
            Self::StoreUnavailable => "Local store unavailable",
            Self::InvalidRecord => "Record failed validation",
            Self::CorruptRecord => "Stored record is corrupt",
            Self::UnexpectedRemoteShape => "Remote record has an unexpected shape",
            Self::RemoteUnavailable => "Remote backend unavailable",
            Self::RemoteRejected => "Remote backend rejected the request",
            Self::CircuitOpen => "Circuit breaker open",
            Self::LocalWriteFailed => "Local write failed",
            Self::BaselineCorrupt => "Baseline cache is corrupt",
            Self::BaselinePersistFailed => "Baseline persist failed",
            Self::LockContention => "Lock contention",
            Self::Cancelled => "Sync cancelled",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators and agents.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in .tether/config.toml and retry."),
            Self::InvalidOption => Some("Thresholds must lie in [0, 1] and workers must be >= 1."),
            Self::UnknownBackend => Some("Set [sync].backend to one of the registered backends."),
            Self::StoreUnavailable => Some("Check that the records directory exists and is readable."),
            Self::InvalidRecord => Some("Fix the record so it has an id and a non-empty title."),
            Self::CorruptRecord => Some("Repair or remove the unreadable record file."),
            Self::UnexpectedRemoteShape => None,
            Self::RemoteUnavailable => Some("Retry later; the remote may be down or rate-limiting."),
            Self::RemoteRejected => None,
            Self::CircuitOpen => Some("Wait for the breaker cooldown before retrying."),
            Self::LocalWriteFailed => Some("Check disk space and write permissions."),
            Self::BaselineCorrupt => Some("Run `tether baseline --clear` to force a first sync."),
            Self::BaselinePersistFailed => Some("Check disk space and write permissions."),
            Self::LockContention => Some("Retry after the other `tether` process releases its lock."),
            Self::Cancelled => Some("Re-run the sync; the previous baseline was kept."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

/// Error classes used to decide how a failure propagates through a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    /// Expected, user or data caused; the record is skipped.
    Operational,
    /// Bad setup; the run fails before touching the remote.
    Configuration,
    /// Corrupt or malformed record; skipped and reported.
    Data,
    /// Filesystem trouble; the write is abandoned, the baseline kept.
    System,
    /// Remote trouble; routed through the resilience policy.
    Infrastructure,
}

/// A per-record failure collected into the sync report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncIssue {
    pub key: String,
    pub class: ErrorClass,
    pub code: ErrorCode,
    pub message: String,
}

impl SyncIssue {
    pub fn new(
        key: impl Into<String>,
        class: ErrorClass,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            class,
            code,
            message: message.into(),
        }
    }

    /// Build an issue from a failed remote call.
    pub fn from_remote(key: impl Into<String>, err: &RemoteError) -> Self {
        Self::new(key, ErrorClass::Infrastructure, err.code(), err.to_string())
    }
}

/// Run-level failures. Any of these aborts the run before mutation
/// (or, for persistence, after mutation but without touching the baseline).
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("invalid configuration: {0:#}")]
    Config(anyhow::Error),
    #[error("invalid option: {0}")]
    InvalidOption(String),
    #[error("unknown backend '{name}' (known: {known})")]
    UnknownBackend { name: String, known: String },
    #[error("local store unavailable: {0:#}")]
    StoreUnavailable(anyhow::Error),
    #[error("failed to fetch remote records from '{backend}': {source}")]
    RemoteFetch {
        backend: String,
        #[source]
        source: RemoteError,
    },
    #[error("failed to load baseline: {0:#}")]
    BaselineLoad(anyhow::Error),
    #[error("failed to persist baseline: {0:#}")]
    BaselinePersist(anyhow::Error),
    #[error("baseline is locked by another run: {0}")]
    Locked(String),
    #[error("failed to start sync workers: {0}")]
    WorkerPool(String),
}

impl SyncError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Config(_) => ErrorCode::ConfigParseError,
            Self::InvalidOption(_) => ErrorCode::InvalidOption,
            Self::UnknownBackend { .. } => ErrorCode::UnknownBackend,
            Self::StoreUnavailable(_) => ErrorCode::StoreUnavailable,
            Self::RemoteFetch { source, .. } => source.code(),
            Self::BaselineLoad(_) => ErrorCode::BaselineCorrupt,
            Self::BaselinePersist(_) => ErrorCode::BaselinePersistFailed,
            Self::Locked(_) => ErrorCode::LockContention,
            Self::WorkerPool(_) => ErrorCode::InternalUnexpected,
        }
    }

    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Config(_)
            | Self::InvalidOption(_)
            | Self::UnknownBackend { .. }
            | Self::StoreUnavailable(_) => ErrorClass::Configuration,
            Self::RemoteFetch { .. } => ErrorClass::Infrastructure,
            Self::BaselineLoad(_) => ErrorClass::Data,
            Self::BaselinePersist(_) | Self::Locked(_) | Self::WorkerPool(_) => ErrorClass::System,
        }
    }

    /// Optional remediation hint for operators and agents.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const ALL: [ErrorCode; 16] = [
        ErrorCode::ConfigParseError,
        ErrorCode::InvalidOption,
        ErrorCode::UnknownBackend,
        ErrorCode::StoreUnavailable,
        ErrorCode::InvalidRecord,
        ErrorCode::CorruptRecord,
        ErrorCode::UnexpectedRemoteShape,
        ErrorCode::RemoteUnavailable,
        ErrorCode::RemoteRejected,
        ErrorCode::CircuitOpen,
        ErrorCode::LocalWriteFailed,
        ErrorCode::BaselineCorrupt,
        ErrorCode::BaselinePersistFailed,
        ErrorCode::LockContention,
        ErrorCode::Cancelled,
        ErrorCode::InternalUnexpected,
    ];

    #[test]
    fn all_codes_are_unique() {
        let mut seen = HashSet::new();
        for code in ALL {
            assert!(seen.insert(code.code()), "duplicate code {}", code.code());
        }
    }

    #[test]
    fn code_format_is_machine_friendly() {
        for code in ALL {
            let text = code.code();
            assert_eq!(text.len(), 5);
            assert!(text.starts_with('E'));
            assert!(text.chars().skip(1).all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn configuration_errors_are_classified_before_remote_ones() {
        let err = SyncError::UnknownBackend {
            name: "jira".into(),
            known: "file".into(),
        };
        assert_eq!(err.class(), ErrorClass::Configuration);
        assert_eq!(err.code(), ErrorCode::UnknownBackend);
        assert!(err.hint().is_some());
    }
}
