//! Work-item records and their baseline snapshots.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod record;
pub mod snapshot;

pub use record::{
    FieldGroup, ParseEnumError, Record, Status, Syncable, ValidationError, fingerprint,
    normalize_title,
};
pub use snapshot::BaselineSnapshot;

/// One side of a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Side {
    Local,
    Remote,
}

impl Side {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
