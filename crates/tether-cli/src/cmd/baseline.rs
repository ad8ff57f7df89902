//! `tether baseline`: inspect or clear the persisted sync baseline.

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use serde::Serialize;
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;
use tether_core::SyncError;
use tether_core::baseline::{BaselineCache, FileBaselineCache};
use tether_core::config::EffectiveConfig;

use crate::output::{pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
#[command(
    about = "Show or clear the sync baseline",
    long_about = "Show the baseline the last successful sync agreed on. With --clear, \
                  remove it so the next sync runs with first-sync semantics.",
    after_help = "EXAMPLES:\n    # Show the current baseline\n    tether baseline\n\n\
                  # Forget it\n    tether baseline --clear"
)]
pub struct BaselineArgs {
    /// Remove the stored baseline.
    #[arg(long)]
    pub clear: bool,
}

#[derive(Debug, Serialize)]
pub struct BaselineView {
    pub backend: String,
    pub path: String,
    pub present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
    pub snapshots: usize,
    /// Set by `--clear`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleared: Option<bool>,
}

pub fn run_baseline(args: &BaselineArgs, config: &EffectiveConfig, project_root: &Path) -> Result<()> {
    let kind = config.project.backend_kind()?;
    let cache = FileBaselineCache::for_project(project_root, kind.as_str());
    let timeout = Duration::from_secs(config.project.sync.lock_timeout_secs);
    let view = if args.clear {
        clear(&cache, kind.as_str(), timeout)?
    } else {
        show(&cache, kind.as_str())?
    };
    render_mode(config.output, &view, render_text, render_pretty)
}

fn show(cache: &FileBaselineCache, backend: &str) -> Result<BaselineView> {
    let doc = cache.load().map_err(SyncError::BaselineLoad)?;
    Ok(BaselineView {
        backend: backend.to_string(),
        path: cache.path().display().to_string(),
        present: doc.is_some(),
        run_id: doc.as_ref().map(|d| d.run_id.clone()),
        synced_at: doc.as_ref().map(|d| d.synced_at),
        snapshots: doc.as_ref().map_or(0, |d| d.snapshots.len()),
        cleared: None,
    })
}

fn clear(cache: &FileBaselineCache, backend: &str, timeout: Duration) -> Result<BaselineView> {
    let _lock = cache
        .lock(timeout)
        .map_err(|err| SyncError::Locked(err.to_string()))?;
    let existed = cache.clear().context("failed to clear baseline")?;
    Ok(BaselineView {
        backend: backend.to_string(),
        path: cache.path().display().to_string(),
        present: false,
        run_id: None,
        synced_at: None,
        snapshots: 0,
        cleared: Some(existed),
    })
}

fn render_text(view: &BaselineView, w: &mut dyn Write) -> io::Result<()> {
    match view.cleared {
        Some(existed) => writeln!(w, "cleared={existed} backend={}", view.backend),
        None => writeln!(
            w,
            "backend={} present={} run={} synced_at={} snapshots={}",
            view.backend,
            view.present,
            view.run_id.as_deref().unwrap_or("-"),
            view.synced_at.map_or_else(|| "-".to_string(), |t| t.to_rfc3339()),
            view.snapshots
        ),
    }
}

fn render_pretty(view: &BaselineView, w: &mut dyn Write) -> io::Result<()> {
    if let Some(existed) = view.cleared {
        if existed {
            writeln!(w, "✓ Cleared baseline for {}", view.backend)?;
        } else {
            writeln!(w, "No baseline for {}; nothing to clear", view.backend)?;
        }
        return Ok(());
    }
    pretty_section(w, &format!("Baseline ({})", view.backend))?;
    pretty_kv(w, "path", &view.path)?;
    if view.present {
        pretty_kv(w, "run", view.run_id.as_deref().unwrap_or("-"))?;
        if let Some(at) = view.synced_at {
            pretty_kv(w, "synced at", at.to_rfc3339())?;
        }
        pretty_kv(w, "snapshots", view.snapshots.to_string())?;
    } else {
        writeln!(w, "No baseline yet; the next sync is a first sync.")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tether_core::baseline::BaselineDocument;

    #[test]
    fn show_then_clear() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let cache = FileBaselineCache::for_project(tmp.path(), "file");

        let empty = show(&cache, "file")?;
        assert!(!empty.present);
        assert_eq!(empty.snapshots, 0);

        cache.save(&BaselineDocument {
            run_id: "20240501T000000Z-deadbeef".into(),
            backend: "file".into(),
            synced_at: Utc::now(),
            snapshots: BTreeMap::new(),
        })?;
        let stored = show(&cache, "file")?;
        assert!(stored.present);
        assert_eq!(stored.run_id.as_deref(), Some("20240501T000000Z-deadbeef"));

        let cleared = clear(&cache, "file", Duration::from_secs(1))?;
        assert_eq!(cleared.cleared, Some(true));
        assert!(!show(&cache, "file")?.present);
        assert_eq!(clear(&cache, "file", Duration::from_secs(1))?.cleared, Some(false));
        Ok(())
    }

    #[test]
    fn corrupt_baseline_is_reported_with_a_code() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cache = FileBaselineCache::for_project(tmp.path(), "file");
        std::fs::create_dir_all(cache.path().parent().expect("parent")).expect("mkdir");
        std::fs::write(cache.path(), "{not json").expect("write");
        let err = show(&cache, "file").expect_err("corrupt");
        let sync = err.downcast_ref::<SyncError>().expect("typed error");
        assert_eq!(sync.code(), tether_core::ErrorCode::BaselineCorrupt);
    }
}
