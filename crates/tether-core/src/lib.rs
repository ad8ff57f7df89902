//! tether-core library.
//!
//! Three-way sync between a local work-item store and a remote issue
//! tracker. Entry point is [`sync::SyncEngine::run_sync`].
//!
//! # Conventions
//!
//! - **Errors**: run-level failures are [`error::SyncError`]; per-record
//!   failures are collected as [`error::SyncIssue`] in the report. I/O edges
//!   use `anyhow::Result` with context.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `debug!`).

pub mod backend;
pub mod baseline;
pub mod cancel;
pub mod config;
pub mod dedup;
pub mod error;
pub mod lock;
pub mod model;
pub mod resilience;
pub mod store;
pub mod sync;

pub use backend::{BackendKind, LocalStore, RemoteBackend, RemoteError};
pub use cancel::CancelToken;
pub use error::{ErrorClass, ErrorCode, SyncError, SyncIssue};
pub use model::{BaselineSnapshot, FieldGroup, Record, Side, Status, Syncable};
pub use store::FileStore;
pub use sync::{SyncEngine, SyncOptions, SyncReport};
