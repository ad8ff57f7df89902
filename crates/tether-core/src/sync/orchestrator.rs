//! One sync run, end to end.
//!
//! Phases run in a fixed order: preflight, fetch, self-dedup, baseline
//! load, classification, cross-dedup, duplicate and conflict resolution,
//! apply, persist. Everything before apply is read-only, so a failure there
//! leaves both sides and the baseline untouched. Remote writes run on a
//! bounded worker pool; their outcomes are folded into a single baseline
//! write at the end.

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, info_span, warn};

use super::classify::{SyncCategory, category_counts, classify_all};
use super::conflict::{ConflictPolicy, ConflictPrompt, ConflictResolver};
use super::plan::{LocalOp, Planner, RemoteOp, SyncPlan};
use super::report::{ActionEntry, ActionOutcome, SyncReport};
use super::state::{LinkIndex, StateInput, SyncState};
use crate::backend::{Listing, LocalStore, RemoteBackend, RemoteError};
use crate::baseline::{BaselineCache, BaselineStore, HistoryAccess};
use crate::cancel::CancelToken;
use crate::dedup::{
    DedupConfig, DuplicateDetector, DuplicateResolver, MatchScope, ResolverContext, apply_actions,
};
use crate::error::{ErrorClass, ErrorCode, SyncError, SyncIssue};
use crate::model::{Record, Side};
use crate::resilience::ResiliencePolicy;

/// Knobs for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOptions {
    /// Plan and report without writing anything.
    pub dry_run: bool,
    pub auto_resolve_duplicates: bool,
    /// Duplicates at or above this confidence are resolved automatically.
    pub duplicate_confidence_threshold: f64,
    /// Offer unresolved conflict groups to the engine's prompt.
    pub interactive: bool,
    /// Width of the remote worker pool.
    pub workers: usize,
    pub dedup: DedupConfig,
    pub conflict: ConflictPolicy,
    /// How long to wait for another run's lock.
    pub lock_timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            auto_resolve_duplicates: true,
            duplicate_confidence_threshold: 0.95,
            interactive: false,
            workers: 4,
            dedup: DedupConfig::default(),
            conflict: ConflictPolicy::default(),
            lock_timeout: Duration::from_secs(5),
        }
    }
}

impl SyncOptions {
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidOption`] naming the first bad value.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.workers == 0 {
            return Err(SyncError::InvalidOption(
                "worker count must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.duplicate_confidence_threshold) {
            return Err(SyncError::InvalidOption(format!(
                "duplicate confidence threshold {} is outside [0, 1]",
                self.duplicate_confidence_threshold
            )));
        }
        let bad = self.dedup.out_of_range();
        if !bad.is_empty() {
            return Err(SyncError::InvalidOption(format!(
                "dedup thresholds outside [0, 1]: {}",
                bad.join(", ")
            )));
        }
        Ok(())
    }
}

/// Where a remote job came from.
#[derive(Debug, Clone, Copy)]
enum JobRef {
    Change(usize),
    Standalone,
}

/// Records accepted from one listing.
struct Accepted {
    records: Vec<Record>,
    /// Ids that could not be read and must not be treated as deleted.
    unreadable: BTreeSet<String>,
    /// Some rejects carried no id at all.
    incomplete: bool,
}

/// Runs syncs between one local store and one remote backend.
pub struct SyncEngine<'a> {
    local: &'a dyn LocalStore,
    remote: &'a dyn RemoteBackend,
    cache: &'a dyn BaselineCache,
    history: Option<&'a dyn HistoryAccess>,
    prompt: Option<&'a dyn ConflictPrompt>,
    policy: ResiliencePolicy,
    cancel: CancelToken,
}

impl<'a> SyncEngine<'a> {
    #[must_use]
    pub fn new(
        local: &'a dyn LocalStore,
        remote: &'a dyn RemoteBackend,
        cache: &'a dyn BaselineCache,
    ) -> Self {
        Self {
            local,
            remote,
            cache,
            history: None,
            prompt: None,
            policy: ResiliencePolicy::default(),
            cancel: CancelToken::new(),
        }
    }

    /// Reconstruct missing baselines from version-control history.
    #[must_use]
    pub fn with_history(mut self, history: &'a dyn HistoryAccess) -> Self {
        self.history = Some(history);
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: ResiliencePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Prompt consulted for conflicts when the run is interactive.
    #[must_use]
    pub fn with_prompt(mut self, prompt: &'a dyn ConflictPrompt) -> Self {
        self.prompt = Some(prompt);
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub const fn policy(&self) -> &ResiliencePolicy {
        &self.policy
    }

    /// Run one sync.
    ///
    /// Per-record failures land in the report; only run-level failures are
    /// returned as errors.
    ///
    /// # Errors
    ///
    /// Returns a [`SyncError`] when the options are invalid, the lock is
    /// held, the local store or remote listing cannot be read, the baseline
    /// is unreadable, the worker pool cannot start, or the new baseline
    /// cannot be persisted.
    pub fn run_sync(&self, options: &SyncOptions) -> Result<SyncReport, SyncError> {
        let backend = self.remote.name().to_string();
        let span = info_span!("sync", backend = %backend, dry_run = options.dry_run);
        let _enter = span.enter();

        options.validate()?;
        let _lock = self
            .cache
            .lock(options.lock_timeout)
            .map_err(|err| SyncError::Locked(err.to_string()))?;

        let synced_at = Utc::now();
        let mut report = SyncReport {
            run_id: run_id(&backend, synced_at),
            backend: backend.clone(),
            dry_run: options.dry_run,
            ..SyncReport::default()
        };

        // ---- read both sides --------------------------------------------

        let local_listing = self.local.list_all().map_err(SyncError::StoreUnavailable)?;
        let remote_listing = self
            .policy
            .execute(&self.cancel, || self.remote.fetch_all())
            .map_err(|source| SyncError::RemoteFetch {
                backend: backend.clone(),
                source,
            })?;
        let local = accept(Side::Local, local_listing, &mut report);
        let remote = accept(Side::Remote, remote_listing, &mut report);
        info!(
            local = local.records.len(),
            remote = remote.records.len(),
            "records fetched"
        );

        // ---- self-dedup, baseline ---------------------------------------

        let detector = DuplicateDetector::new(&options.dedup);
        let local_dedup = detector.self_dedup(MatchScope::Local, &local.records, |r| {
            r.remote_id(&backend).is_some()
        });
        let mut local_links = LinkIndex::new();
        local_links.add_records(&backend, &local.records);
        let remote_dedup = detector.self_dedup(MatchScope::Remote, &remote.records, |r| {
            local_links.local_for(&r.id).is_some()
        });

        let mut baseline =
            BaselineStore::load(self.cache, self.history, self.local, &local.records, &backend)?;
        report.baseline_source = Some(baseline.source());
        report.baseline_reconstructed = baseline.reconstructed();

        let mut local_map: BTreeMap<String, Record> = local
            .records
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        let mut remote_map: BTreeMap<String, Record> = remote
            .records
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();

        let mut hidden_local = local.unreadable;
        hidden_local.extend(
            local_map
                .keys()
                .filter(|id| local_dedup.is_absorbed(id))
                .cloned(),
        );
        let mut hidden_remote = remote.unreadable;
        hidden_remote.extend(
            remote_map
                .keys()
                .filter(|id| remote_dedup.is_absorbed(id))
                .cloned(),
        );

        // ---- classify, cross-dedup, resolve duplicates ------------------

        let state = SyncState::build(&StateInput {
            backend: &backend,
            local: &local_map,
            remote: &remote_map,
            baseline: &baseline,
            hidden_local: &hidden_local,
            hidden_remote: &hidden_remote,
        });
        let first_pass = classify_all(&state);
        let new_local: Vec<&Record> = first_pass
            .iter()
            .filter(|c| c.category == SyncCategory::NewLocal)
            .filter_map(|c| state.local.get(&c.key))
            .collect();
        let new_remote: Vec<&Record> = first_pass
            .iter()
            .filter(|c| c.category == SyncCategory::NewRemote)
            .filter_map(|c| state.remote.get(&c.key))
            .collect();
        let cross = detector.cross_dedup(&new_local, &new_remote);

        let resolver = DuplicateResolver::new(
            options.auto_resolve_duplicates,
            options.duplicate_confidence_threshold,
        )
        .with_identical_copy_deletion(options.dedup.delete_identical_copies);
        let duplicates = resolver.resolve(
            &ResolverContext {
                backend: &backend,
                local: &local_map,
                remote: &remote_map,
                links: state.links.as_map(),
            },
            &local_dedup,
            &remote_dedup,
            &cross,
        );
        let applied = apply_actions(&duplicates.actions, &backend, &mut local_map, &mut remote_map);
        hidden_local.extend(duplicates.held_local.iter().cloned());
        hidden_remote.extend(duplicates.held_remote.iter().cloned());

        report.duplicates_detected =
            local_dedup.absorbed_count() + remote_dedup.absorbed_count() + cross.len();
        report.duplicates_auto_resolved = duplicates.auto_resolved;
        report.duplicate_details = local_dedup
            .matches
            .iter()
            .chain(&remote_dedup.matches)
            .chain(&cross)
            .cloned()
            .collect();
        report.manual_review.clone_from(&duplicates.manual_review);
        report.actions.clone_from(&duplicates.actions);

        // ---- reclassify and plan ----------------------------------------

        let state = SyncState::build(&StateInput {
            backend: &backend,
            local: &local_map,
            remote: &remote_map,
            baseline: &baseline,
            hidden_local: &hidden_local,
            hidden_remote: &hidden_remote,
        });
        let classifications = classify_all(&state);
        report.fill_counts(category_counts(&classifications));

        let planner = Planner {
            backend: &backend,
            synced_at,
            resolver: ConflictResolver::new(options.conflict),
            prompt: if options.interactive { self.prompt } else { None },
            local_incomplete: local.incomplete,
            remote_incomplete: remote.incomplete,
        };
        let mut plan = planner.plan(&state, &classifications, &applied, &local_map, &remote_map);
        report.unresolved_conflicts = plan.conflicts.iter().filter(|c| !c.is_resolved()).count();
        report.conflict_details.clone_from(&plan.conflicts);
        report.deletions_suppressed = plan.suppressed_deletions;

        if options.dry_run {
            record_planned(&plan, &mut report);
            info!(
                remote_ops = plan.remote_ops(),
                local_ops = plan.local_ops(),
                "dry run; nothing written"
            );
            return Ok(report);
        }

        // ---- apply --------------------------------------------------------

        let remote_ok = self.apply_remote(&mut plan, options.workers, &mut report)?;
        let local_ok = self.apply_local(&plan, &remote_ok, &applied.archived_local, &mut report);

        // ---- persist ------------------------------------------------------

        if self.cancel.is_cancelled() {
            report.cancelled = true;
            warn!("sync cancelled; baseline left unchanged");
            return Ok(report);
        }

        let mut next = plan.carried.clone();
        for (i, change) in plan.changes.iter().enumerate() {
            let succeeded = remote_ok[i] && local_ok[i];
            match change.next_baseline(succeeded, synced_at) {
                Some(snapshot) => {
                    next.insert(change.local_id.clone(), snapshot);
                }
                None => {
                    next.remove(&change.local_id);
                }
            }
        }
        for op in &plan.standalone_local {
            if let LocalOp::Delete(id) = op {
                next.remove(id);
            }
        }
        baseline.persist_all(self.cache, &report.run_id, &backend, synced_at, next)?;

        info!(
            pushed = report.pushed,
            pulled = report.pulled,
            deletions = report.deletions_propagated,
            conflicts = report.conflicts,
            unresolved = report.unresolved_conflicts,
            errors = report.errors,
            "sync finished"
        );
        Ok(report)
    }

    /// Issue every remote write on the worker pool.
    ///
    /// Returns, per planned change, whether its remote write (if any)
    /// succeeded. Created remote ids are bound into the change.
    fn apply_remote(
        &self,
        plan: &mut SyncPlan,
        workers: usize,
        report: &mut SyncReport,
    ) -> Result<Vec<bool>, SyncError> {
        let jobs: Vec<(JobRef, RemoteOp)> = plan
            .changes
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.remote.clone().map(|op| (JobRef::Change(i), op)))
            .chain(
                plan.standalone_remote
                    .iter()
                    .map(|op| (JobRef::Standalone, op.clone())),
            )
            .collect();
        let mut remote_ok = vec![true; plan.changes.len()];
        if jobs.is_empty() {
            return Ok(remote_ok);
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("tether-sync-{i}"))
            .build()
            .map_err(|err| SyncError::WorkerPool(err.to_string()))?;
        let remote = self.remote;
        let policy = &self.policy;
        let cancel = &self.cancel;
        debug!(jobs = jobs.len(), workers, "issuing remote writes");
        let outcomes: Vec<Result<Option<String>, RemoteError>> = pool.install(|| {
            jobs.par_iter()
                .map(|(_, op)| policy.execute(cancel, || op.execute(remote)))
                .collect()
        });

        for ((job, op), outcome) in jobs.into_iter().zip(outcomes) {
            let (key, deletion) = match job {
                JobRef::Change(i) => (plan.changes[i].key.to_string(), plan.changes[i].deletion),
                JobRef::Standalone => (format!("remote:{}", remote_target(&op)), false),
            };
            let outcome = match outcome {
                Ok(created) => {
                    match &op {
                        RemoteOp::Create { .. } | RemoteOp::Update { .. } => report.pushed += 1,
                        RemoteOp::Archive { .. } => {
                            report.issues_archived += 1;
                            if deletion {
                                report.deletions_propagated += 1;
                            }
                        }
                    }
                    if let (JobRef::Change(i), Some(rid)) = (job, created) {
                        plan.changes[i].bind_remote_id(&report.backend, &rid);
                    }
                    ActionOutcome::Applied
                }
                Err(RemoteError::Cancelled) => {
                    mark_failed(job, &mut remote_ok);
                    ActionOutcome::Skipped
                }
                Err(err) => {
                    mark_failed(job, &mut remote_ok);
                    warn!(%key, op = op.kind(), error = %err, "remote write failed");
                    report.push_issue(SyncIssue::from_remote(&key, &err));
                    ActionOutcome::Failed
                }
            };
            report.writes.push(ActionEntry {
                key,
                side: Side::Remote,
                op: op.kind().to_string(),
                target: remote_target(&op),
                outcome,
            });
        }
        Ok(remote_ok)
    }

    /// Apply local writes in plan order.
    ///
    /// A change whose remote write failed is skipped. After cancellation
    /// only writes that record a completed remote write still run.
    fn apply_local(
        &self,
        plan: &SyncPlan,
        remote_ok: &[bool],
        archived: &BTreeSet<String>,
        report: &mut SyncReport,
    ) -> Vec<bool> {
        let cancelled = self.cancel.is_cancelled();
        let mut local_ok = vec![true; plan.changes.len()];

        for (i, change) in plan.changes.iter().enumerate() {
            let Some(op) = &change.local else {
                continue;
            };
            let key = change.key.to_string();
            let depends_on_remote = change.remote.is_some();
            if !remote_ok[i] || (cancelled && !depends_on_remote) {
                local_ok[i] = false;
                report.writes.push(local_entry(key, op, ActionOutcome::Skipped));
                continue;
            }
            let outcome = self.write_local(&key, op, report);
            local_ok[i] = outcome == ActionOutcome::Applied;
            if local_ok[i] {
                match op {
                    LocalOp::Write(record) => {
                        if change.pull {
                            report.pulled += 1;
                        }
                        if archived.contains(&record.id) {
                            report.issues_archived += 1;
                        }
                    }
                    LocalOp::Delete(_) => {
                        report.issues_deleted += 1;
                        if change.deletion {
                            report.deletions_propagated += 1;
                        }
                    }
                }
            }
            report.writes.push(local_entry(key, op, outcome));
        }

        for op in &plan.standalone_local {
            let key = format!("local:{}", local_target(op));
            if cancelled {
                report.writes.push(local_entry(key, op, ActionOutcome::Skipped));
                continue;
            }
            let outcome = self.write_local(&key, op, report);
            if outcome == ActionOutcome::Applied {
                match op {
                    LocalOp::Write(record) if archived.contains(&record.id) => {
                        report.issues_archived += 1;
                    }
                    LocalOp::Write(_) => {}
                    LocalOp::Delete(_) => report.issues_deleted += 1,
                }
            }
            report.writes.push(local_entry(key, op, outcome));
        }
        local_ok
    }

    fn write_local(&self, key: &str, op: &LocalOp, report: &mut SyncReport) -> ActionOutcome {
        let result = match op {
            LocalOp::Write(record) => self.local.write(record),
            LocalOp::Delete(id) => self.local.delete(id),
        };
        match result {
            Ok(()) => ActionOutcome::Applied,
            Err(err) => {
                warn!(%key, error = %format!("{err:#}"), "local write failed");
                report.push_issue(SyncIssue::new(
                    key,
                    ErrorClass::System,
                    ErrorCode::LocalWriteFailed,
                    format!("{err:#}"),
                ));
                ActionOutcome::Failed
            }
        }
    }
}

/// Keep the valid records of a listing and report the rest.
fn accept(side: Side, listing: Listing, report: &mut SyncReport) -> Accepted {
    let mut accepted = Accepted {
        records: Vec::with_capacity(listing.records.len()),
        unreadable: BTreeSet::new(),
        incomplete: false,
    };
    let code = match side {
        Side::Local => ErrorCode::CorruptRecord,
        Side::Remote => ErrorCode::UnexpectedRemoteShape,
    };
    for skipped in listing.skipped {
        let key = format!("{side}:{}", skipped.id.as_deref().unwrap_or(&skipped.source));
        warn!(%key, reason = %skipped.reason, "unreadable record skipped");
        report.push_issue(SyncIssue::new(
            key,
            ErrorClass::Data,
            code,
            format!("{}: {}", skipped.source, skipped.reason),
        ));
        match skipped.id {
            Some(id) => {
                accepted.unreadable.insert(id);
            }
            None => accepted.incomplete = true,
        }
    }
    for record in listing.records {
        if let Err(err) = record.validate() {
            let key = format!("{side}:{}", record.id);
            warn!(%key, error = %err, "invalid record skipped");
            report.push_issue(SyncIssue::new(
                key,
                ErrorClass::Operational,
                ErrorCode::InvalidRecord,
                err.to_string(),
            ));
            if record.id.trim().is_empty() {
                accepted.incomplete = true;
            } else {
                accepted.unreadable.insert(record.id);
            }
            continue;
        }
        accepted.records.push(record);
    }
    accepted
}

fn record_planned(plan: &SyncPlan, report: &mut SyncReport) {
    for change in &plan.changes {
        let key = change.key.to_string();
        if let Some(op) = &change.remote {
            report.writes.push(ActionEntry {
                key: key.clone(),
                side: Side::Remote,
                op: op.kind().to_string(),
                target: remote_target(op),
                outcome: ActionOutcome::Planned,
            });
        }
        if let Some(op) = &change.local {
            report
                .writes
                .push(local_entry(key, op, ActionOutcome::Planned));
        }
    }
    for op in &plan.standalone_remote {
        let target = remote_target(op);
        report.writes.push(ActionEntry {
            key: format!("remote:{target}"),
            side: Side::Remote,
            op: op.kind().to_string(),
            target,
            outcome: ActionOutcome::Planned,
        });
    }
    for op in &plan.standalone_local {
        let key = format!("local:{}", local_target(op));
        report
            .writes
            .push(local_entry(key, op, ActionOutcome::Planned));
    }
}

fn mark_failed(job: JobRef, remote_ok: &mut [bool]) {
    if let JobRef::Change(i) = job {
        remote_ok[i] = false;
    }
}

fn remote_target(op: &RemoteOp) -> String {
    match op {
        RemoteOp::Create { record } => record.id.clone(),
        RemoteOp::Update { remote_id, .. } | RemoteOp::Archive { remote_id, .. } => {
            remote_id.clone()
        }
    }
}

fn local_target(op: &LocalOp) -> String {
    match op {
        LocalOp::Write(record) => record.id.clone(),
        LocalOp::Delete(id) => id.clone(),
    }
}

fn local_entry(key: String, op: &LocalOp, outcome: ActionOutcome) -> ActionEntry {
    ActionEntry {
        key,
        side: Side::Local,
        op: match op {
            LocalOp::Write(_) => "write",
            LocalOp::Delete(_) => "delete",
        }
        .to_string(),
        target: local_target(op),
        outcome,
    }
}

/// `<utc timestamp>-<8 hex>`; unique per backend and start instant.
fn run_id(backend: &str, started: DateTime<Utc>) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(backend.as_bytes());
    hasher.update(&started.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    let hex = hasher.finalize().to_hex();
    format!("{}-{}", started.format("%Y%m%dT%H%M%SZ"), &hex[..8])
}
