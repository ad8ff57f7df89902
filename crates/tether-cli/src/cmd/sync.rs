//! `tether sync`: one three-way sync against the configured backend.

use anyhow::Result;
use clap::Args;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use tether_core::baseline::FileBaselineCache;
use tether_core::config::EffectiveConfig;
use tether_core::resilience::{ResiliencePolicy, SystemClock};
use tether_core::sync::{ActionOutcome, SyncCategory};
use tether_core::{FileStore, SyncEngine, SyncOptions, SyncReport};
use tracing::info;

use crate::git_history::GitHistory;
use crate::output::{pretty_kv, pretty_section, render_mode};
use crate::prompt::LinePrompt;

#[derive(Args, Debug, Default)]
#[command(
    about = "Sync local records with the remote tracker",
    long_about = "Compare local records, remote records and the last agreed baseline, \
                  then push, pull, archive and resolve conflicts.\n\n\
                  Exit status is 0 on a clean run, 2 when conflicts or per-record \
                  errors remain and 1 when the run failed.",
    after_help = "EXAMPLES:\n    # Preview what a sync would do\n    tether sync --dry-run\n\n\
                  # Settle text conflicts by hand\n    tether sync --interactive\n\n\
                  # Machine-readable report\n    tether sync --json"
)]
pub struct SyncArgs {
    /// Plan only; write nothing on either side.
    #[arg(long)]
    pub dry_run: bool,

    /// Report duplicates without merging, archiving or linking them.
    #[arg(long)]
    pub no_auto_resolve: bool,

    /// Minimum confidence for automatic duplicate resolution.
    #[arg(long, value_name = "CONFIDENCE")]
    pub threshold: Option<f64>,

    /// Ask on the terminal for conflicts the policy leaves open.
    #[arg(short, long)]
    pub interactive: bool,

    /// Number of concurrent remote writes.
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,
}

impl SyncArgs {
    /// Apply flags on top of the configured options.
    fn overlay(&self, mut options: SyncOptions) -> SyncOptions {
        options.dry_run |= self.dry_run;
        options.interactive |= self.interactive;
        if self.no_auto_resolve {
            options.auto_resolve_duplicates = false;
        }
        if let Some(threshold) = self.threshold {
            options.duplicate_confidence_threshold = threshold;
        }
        if let Some(workers) = self.workers {
            options.workers = workers;
        }
        options
    }
}

/// Entry point wired from `main.rs`. Returns the finished report.
pub fn run_sync(args: &SyncArgs, config: &EffectiveConfig, project_root: &Path) -> Result<SyncReport> {
    let project = &config.project;
    project.validate()?;
    let kind = project.backend_kind()?;
    let remote = kind.open(project_root, project.backend_root(kind));
    let store = FileStore::for_project(project_root);
    let cache = FileBaselineCache::for_project(project_root, remote.name());
    let history = GitHistory::discover(project_root);
    let prompt = LinePrompt::new(io::stdin().lock(), io::stderr());
    let options = args.overlay(project.sync_options());

    let policy = ResiliencePolicy::from_config(&project.resilience, Arc::new(SystemClock::new()));
    let mut engine = SyncEngine::new(&store, remote.as_ref(), &cache).with_policy(policy);
    if let Some(history) = &history {
        engine = engine.with_history(history);
    }
    if options.interactive {
        engine = engine.with_prompt(&prompt);
    }

    let report = engine.run_sync(&options)?;
    info!(
        run_id = %report.run_id,
        pushed = report.pushed,
        pulled = report.pulled,
        errors = report.errors,
        "sync finished"
    );
    render_mode(config.output, &report, render_text, render_pretty)?;
    Ok(report)
}

fn render_text(report: &SyncReport, w: &mut dyn Write) -> io::Result<()> {
    writeln!(
        w,
        "run={} backend={} dry_run={} cancelled={}",
        report.run_id, report.backend, report.dry_run, report.cancelled
    )?;
    writeln!(
        w,
        "up_to_date={} needs_push={} needs_pull={} conflicts={} unresolved={} \
         duplicates={} auto_resolved={} archived={} deleted={} errors={}",
        report.up_to_date,
        report.needs_push,
        report.needs_pull,
        report.conflicts,
        report.unresolved_conflicts,
        report.duplicates_detected,
        report.duplicates_auto_resolved,
        report.issues_archived,
        report.issues_deleted,
        report.errors
    )?;
    for conflict in report.conflict_details.iter().filter(|c| !c.is_resolved()) {
        for open in &conflict.unresolved {
            writeln!(w, "conflict {} {}", conflict.key, open.group)?;
        }
    }
    for m in &report.manual_review {
        writeln!(w, "review {} {} {} {:.2}", m.left, m.right, m.match_type, m.confidence)?;
    }
    for issue in &report.error_details {
        writeln!(w, "error {} {} {}", issue.code, issue.key, issue.message)?;
    }
    Ok(())
}

fn render_pretty(report: &SyncReport, w: &mut dyn Write) -> io::Result<()> {
    let heading = if report.dry_run {
        format!("Sync plan ({}, dry run)", report.backend)
    } else {
        format!("Sync {} ({})", report.run_id, report.backend)
    };
    pretty_section(w, &heading)?;
    for category in SyncCategory::ALL {
        pretty_kv(w, &category.to_string(), report.count(category).to_string())?;
    }
    writeln!(w)?;
    pretty_kv(w, "pushed", report.pushed.to_string())?;
    pretty_kv(w, "pulled", report.pulled.to_string())?;
    pretty_kv(w, "archived", report.issues_archived.to_string())?;
    pretty_kv(w, "deleted", report.issues_deleted.to_string())?;
    pretty_kv(
        w,
        "duplicates",
        format!(
            "{} found, {} resolved",
            report.duplicates_detected, report.duplicates_auto_resolved
        ),
    )?;
    if let Some(source) = report.baseline_source {
        pretty_kv(w, "baseline", source.as_str())?;
    }
    if report.deletions_suppressed > 0 {
        pretty_kv(w, "held back", format!("{} deletions", report.deletions_suppressed))?;
    }

    if report.dry_run && !report.writes.is_empty() {
        writeln!(w)?;
        pretty_section(w, "Planned writes")?;
        for entry in report
            .writes
            .iter()
            .filter(|e| e.outcome == ActionOutcome::Planned)
        {
            writeln!(w, "  {:<6} {:<8} {}", entry.side, entry.op, entry.target)?;
        }
    }

    let open: Vec<_> = report
        .conflict_details
        .iter()
        .filter(|c| !c.is_resolved())
        .collect();
    if !open.is_empty() {
        writeln!(w)?;
        pretty_section(w, "Unresolved conflicts")?;
        for conflict in open {
            writeln!(w, "  {}", conflict.key)?;
            for field in &conflict.unresolved {
                writeln!(w, "    {}: local {} / remote {}", field.group, field.local, field.remote)?;
            }
        }
    }

    if !report.manual_review.is_empty() {
        writeln!(w)?;
        pretty_section(w, "Possible duplicates (not merged)")?;
        for m in &report.manual_review {
            writeln!(w, "  {} ~ {} ({}, {:.2})", m.left, m.right, m.match_type, m.confidence)?;
        }
    }

    if !report.error_details.is_empty() {
        writeln!(w)?;
        pretty_section(w, "Errors")?;
        for issue in &report.error_details {
            writeln!(w, "  [{}] {}: {}", issue.code, issue.key, issue.message)?;
        }
    }
    Ok(())
}
