//! `tether dedup`: report duplicate clusters among local records.
//!
//! Read-only: nothing is merged, archived or synced.

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::Path;
use tether_core::config::EffectiveConfig;
use tether_core::dedup::{DuplicateDetector, MatchScope, MatchType};
use tether_core::{FileStore, LocalStore, Record, SyncError};

use crate::output::{pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
#[command(
    about = "Report duplicate local records",
    long_about = "Cluster local records by shared remote ids, identical titles and \
                  near-identical titles, without syncing or changing anything.",
    after_help = "EXAMPLES:\n    # Scan with the configured thresholds\n    tether dedup\n\n\
                  # Looser title matching\n    tether dedup --threshold 0.85\n\n\
                  # Machine-readable output\n    tether dedup --json"
)]
pub struct DedupArgs {
    /// Minimum title similarity; defaults to `[dedup].fuzzy_title_threshold`.
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Maximum number of clusters to report.
    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterMember {
    pub id: String,
    pub title: String,
    pub match_type: MatchType,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterOutput {
    pub canonical: String,
    pub title: String,
    pub duplicates: Vec<ClusterMember>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DedupOutput {
    pub records: usize,
    pub unreadable: usize,
    /// Records already marked as duplicates of another.
    pub resolved: usize,
    pub clusters: Vec<ClusterOutput>,
}

pub fn run_dedup(args: &DedupArgs, config: &EffectiveConfig, project_root: &Path) -> Result<()> {
    let mut dedup = config.project.dedup.clone();
    if let Some(threshold) = args.threshold {
        dedup.fuzzy_title_threshold = threshold;
    }
    if !dedup.out_of_range().is_empty() {
        return Err(SyncError::InvalidOption(format!(
            "{} must be within [0, 1]",
            dedup.out_of_range().join(", ")
        ))
        .into());
    }
    let backend = config.project.sync.backend.clone();

    let store = FileStore::for_project(project_root);
    let listing = store.list_all().map_err(SyncError::StoreUnavailable)?;
    let out = scan(&listing.records, &backend, &DuplicateDetector::new(&dedup), args.limit);
    let out = DedupOutput {
        unreadable: listing.skipped.len(),
        ..out
    };
    render_mode(config.output, &out, render_text, render_pretty)
}

fn scan(records: &[Record], backend: &str, detector: &DuplicateDetector<'_>, limit: Option<usize>) -> DedupOutput {
    let found = detector.self_dedup(MatchScope::Local, records, |r| r.remote_id(backend).is_some());
    let titles: BTreeMap<&str, &str> = records
        .iter()
        .map(|r| (r.id.as_str(), r.title.as_str()))
        .collect();
    let title_of = |id: &str| titles.get(id).copied().unwrap_or_default().to_string();

    let clusters = found
        .clusters
        .iter()
        .take(limit.unwrap_or(usize::MAX))
        .map(|cluster| ClusterOutput {
            canonical: cluster.canonical.clone(),
            title: title_of(&cluster.canonical),
            duplicates: cluster
                .duplicates
                .iter()
                .map(|dup| ClusterMember {
                    id: dup.id.clone(),
                    title: title_of(&dup.id),
                    match_type: dup.match_type,
                    confidence: dup.confidence,
                })
                .collect(),
        })
        .collect();

    DedupOutput {
        records: records.len(),
        unreadable: 0,
        resolved: found.resolved.len(),
        clusters,
    }
}

fn render_text(out: &DedupOutput, w: &mut dyn Write) -> io::Result<()> {
    for cluster in &out.clusters {
        for dup in &cluster.duplicates {
            writeln!(
                w,
                "{}  {}  {}  {:.2}",
                cluster.canonical, dup.id, dup.match_type, dup.confidence
            )?;
        }
    }
    Ok(())
}

fn render_pretty(out: &DedupOutput, w: &mut dyn Write) -> io::Result<()> {
    pretty_section(w, "Duplicate scan")?;
    pretty_kv(w, "records", out.records.to_string())?;
    pretty_kv(w, "clusters", out.clusters.len().to_string())?;
    if out.resolved > 0 {
        pretty_kv(w, "resolved", out.resolved.to_string())?;
    }
    if out.unreadable > 0 {
        pretty_kv(w, "unreadable", out.unreadable.to_string())?;
    }
    for cluster in &out.clusters {
        writeln!(w)?;
        writeln!(w, "{}  {}", cluster.canonical, cluster.title)?;
        for dup in &cluster.duplicates {
            writeln!(
                w,
                "  {}  {}  ({}, {:.2})",
                dup.id, dup.title, dup.match_type, dup.confidence
            )?;
        }
    }
    if out.clusters.is_empty() {
        writeln!(w, "No duplicates found.")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tether_core::dedup::DedupConfig;

    fn rec(id: &str, title: &str, day: u32) -> Record {
        let at = Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).single().expect("ts");
        Record::new(id, title, at)
    }

    #[test]
    fn clusters_name_the_earliest_record() {
        let records = vec![
            rec("tt-b", "fix login  timeout", 2),
            rec("tt-a", "Fix login timeout", 1),
            rec("tt-c", "Write release notes", 3),
        ];
        let cfg = DedupConfig::default();
        let out = scan(&records, "file", &DuplicateDetector::new(&cfg), None);
        assert_eq!(out.records, 3);
        assert_eq!(out.clusters.len(), 1);
        let cluster = &out.clusters[0];
        assert_eq!(cluster.canonical, "tt-a");
        assert_eq!(cluster.title, "Fix login timeout");
        assert_eq!(cluster.duplicates[0].id, "tt-b");
        assert_eq!(cluster.duplicates[0].match_type, MatchType::ExactTitle);
    }

    #[test]
    fn linked_record_wins_canonical() {
        let mut linked = rec("tt-z", "Fix login timeout", 5);
        linked.link("file", "7");
        let records = vec![rec("tt-a", "Fix login timeout", 1), linked];
        let cfg = DedupConfig::default();
        let out = scan(&records, "file", &DuplicateDetector::new(&cfg), None);
        assert_eq!(out.clusters[0].canonical, "tt-z");
    }

    #[test]
    fn limit_caps_cluster_count() {
        let records = vec![
            rec("tt-1", "Alpha task", 1),
            rec("tt-2", "alpha task", 2),
            rec("tt-3", "Beta chore", 3),
            rec("tt-4", "beta chore", 4),
        ];
        let cfg = DedupConfig::default();
        let out = scan(&records, "file", &DuplicateDetector::new(&cfg), Some(1));
        assert_eq!(out.clusters.len(), 1);
    }
}
