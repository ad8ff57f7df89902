//! Three-way sync between the local store and one remote backend.
//!
//! - [`state`]: keys the baseline, local and remote views.
//! - [`classify`]: one [`SyncCategory`] per key, with per-group changes.
//! - [`conflict`]: strategy and prompt driven conflict resolution.
//! - [`plan`]: turns classifications into remote and local writes.
//! - [`orchestrator`]: runs a whole sync and folds the outcome into the
//!   next baseline.
//! - [`report`]: the structured result of a run.

pub mod classify;
pub mod conflict;
pub mod orchestrator;
pub mod plan;
pub mod report;
pub mod state;

pub use classify::{
    Classification, ConflictKind, Deletion, GroupChange, SyncCategory, category_counts, classify,
    classify_all,
};
pub use conflict::{
    ConflictPolicy, ConflictPrompt, ConflictRecord, ConflictResolver, FieldConflict, FieldValue,
    LabelStrategy, PromptChoice, ScalarStrategy, TextStrategy,
};
pub use orchestrator::{SyncEngine, SyncOptions};
pub use plan::{LocalOp, PlannedChange, RemoteOp, SyncPlan, pull_id};
pub use report::{ActionEntry, ActionOutcome, SyncReport};
pub use state::{LinkIndex, RecordKey, StateInput, SyncState};
