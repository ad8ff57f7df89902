//! Record history read from git, used to rebuild a missing baseline.

use anyhow::{Context as _, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::path::{Path, PathBuf};
use std::process::Command;
use tether_core::baseline::HistoryAccess;

/// Answers `content_at` with `git log -1 --before` and `git show`.
#[derive(Debug, Clone)]
pub struct GitHistory {
    root: PathBuf,
}

impl GitHistory {
    /// History for the work tree containing `project_root`, or `None`
    /// outside a git repository.
    pub fn discover(project_root: &Path) -> Option<Self> {
        let output = Command::new("git")
            .arg("-C")
            .arg(project_root)
            .args(["rev-parse", "--is-inside-work-tree"])
            .output()
            .ok()?;
        let inside = output.status.success() && String::from_utf8_lossy(&output.stdout).trim() == "true";
        inside.then(|| Self {
            root: project_root.to_path_buf(),
        })
    }

    fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.root).unwrap_or(path)
    }

    fn commit_before(&self, path: &Path, at: DateTime<Utc>) -> Result<Option<String>> {
        let before = format!("--before={}", at.to_rfc3339_opts(SecondsFormat::Secs, true));
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .args(["log", "-1", "--format=%H", &before, "--"])
            .arg(self.relative(path))
            .output()
            .context("Failed to run git log")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("git log failed: {stderr}");
        }
        let hash = String::from_utf8(output.stdout).context("Invalid UTF-8 from git log")?;
        let hash = hash.trim();
        Ok((!hash.is_empty()).then(|| hash.to_string()))
    }
}

impl HistoryAccess for GitHistory {
    fn content_at(&self, path: &Path, at: DateTime<Utc>) -> Result<Option<Vec<u8>>> {
        let Some(commit) = self.commit_before(path, at)? else {
            return Ok(None);
        };
        let spec = format!("{commit}:./{}", self.relative(path).display());
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .args(["show", &spec])
            .output()
            .context("Failed to run git show")?;
        if output.status.success() {
            Ok(Some(output.stdout))
        } else {
            // the last commit touching the path before `at` deleted it
            Ok(None)
        }
    }
}
