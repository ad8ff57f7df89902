use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::BackendKind;
use crate::dedup::DedupConfig;
use crate::error::SyncError;
use crate::resilience::ResilienceConfig;
use crate::sync::{ConflictPolicy, SyncOptions};

/// Project settings from `.tether/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub conflict: ConflictPolicy,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub backends: BackendsConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_true")]
    pub auto_resolve: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            workers: default_workers(),
            auto_resolve: default_true(),
            dry_run: false,
            interactive: false,
            lock_timeout_secs: default_lock_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendsConfig {
    #[serde(default)]
    pub file: FileBackendConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBackendConfig {
    /// Directory acting as the tracker; relative to the project root.
    #[serde(default = "default_file_root")]
    pub root: PathBuf,
}

impl Default for FileBackendConfig {
    fn default() -> Self {
        Self {
            root: default_file_root(),
        }
    }
}

impl ProjectConfig {
    /// Resolve `[sync].backend` against the registry.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnknownBackend`] for an unregistered name.
    pub fn backend_kind(&self) -> Result<BackendKind, SyncError> {
        BackendKind::from_name(&self.sync.backend)
    }

    /// Root of the configured backend.
    #[must_use]
    pub fn backend_root(&self, kind: BackendKind) -> &Path {
        match kind {
            BackendKind::File => &self.backends.file.root,
        }
    }

    /// Sync options as configured, before CLI overrides.
    #[must_use]
    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            dry_run: self.sync.dry_run,
            auto_resolve_duplicates: self.sync.auto_resolve,
            duplicate_confidence_threshold: self.dedup.auto_resolve_threshold,
            interactive: self.sync.interactive,
            workers: self.sync.workers,
            dedup: self.dedup.clone(),
            conflict: self.conflict,
            lock_timeout: Duration::from_secs(self.sync.lock_timeout_secs),
        }
    }

    /// Check every section; part of sync preflight.
    ///
    /// # Errors
    ///
    /// Returns the first configuration problem found.
    pub fn validate(&self) -> Result<(), SyncError> {
        self.backend_kind()?;
        let problems = self.resilience.problems();
        if !problems.is_empty() {
            return Err(SyncError::InvalidOption(problems.join("; ")));
        }
        self.sync_options().validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserConfig {
    #[serde(default)]
    pub output: Option<String>,
}

/// How command results are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    Pretty,
    Text,
    Json,
}

impl OutputMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pretty => "pretty",
            Self::Text => "text",
            Self::Json => "json",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pretty" | "human" => Some(Self::Pretty),
            "text" | "table" | "plain" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub project: ProjectConfig,
    pub user: UserConfig,
    pub output: OutputMode,
}

/// Load `.tether/config.toml` under `project_root`; a missing file means defaults.
///
/// # Errors
///
/// Returns [`SyncError::Config`] if the file exists but cannot be read or parsed.
pub fn load_project_config(project_root: &Path) -> Result<ProjectConfig, SyncError> {
    read_toml(&project_root.join(".tether/config.toml"))
        .map(Option::unwrap_or_default)
        .map_err(SyncError::Config)
}

/// Load `<config dir>/tether/config.toml`; missing means defaults.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_user_config() -> Result<UserConfig> {
    let Some(config_dir) = dirs::config_dir() else {
        return Ok(UserConfig::default());
    };
    Ok(read_toml(&config_dir.join("tether/config.toml"))?.unwrap_or_default())
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str::<T>(&content)
        .map(Some)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Project config, user config and the output mode, with `cli_json` and
/// `TETHER_FORMAT` taking precedence over the user's `output` setting.
///
/// # Errors
///
/// Returns an error if either config file is unreadable.
pub fn resolve_config(project_root: &Path, cli_json: bool) -> Result<EffectiveConfig> {
    let project = load_project_config(project_root)?;
    let user = load_user_config()?;
    let output = resolve_output(
        cli_json,
        user.output.as_deref(),
        env::var("TETHER_FORMAT").ok().as_deref(),
    );
    Ok(EffectiveConfig {
        project,
        user,
        output,
    })
}

fn resolve_output(cli_json: bool, user_output: Option<&str>, env_format: Option<&str>) -> OutputMode {
    if cli_json {
        return OutputMode::Json;
    }
    if let Some(mode) = env_format.and_then(OutputMode::parse) {
        return mode;
    }
    if let Some(mode) = user_output.and_then(OutputMode::parse) {
        return mode;
    }
    if std::io::stdout().is_terminal() {
        OutputMode::Pretty
    } else {
        OutputMode::Text
    }
}

fn default_backend() -> String {
    BackendKind::File.as_str().to_string()
}

const fn default_workers() -> usize {
    4
}

const fn default_true() -> bool {
    true
}

const fn default_lock_timeout_secs() -> u64 {
    5
}

fn default_file_root() -> PathBuf {
    PathBuf::from(".tether/remote")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::sync::{ScalarStrategy, TextStrategy};

    fn write_config(root: &Path, content: &str) {
        let dir = root.join(".tether");
        std::fs::create_dir_all(&dir).expect("create .tether");
        std::fs::write(dir.join("config.toml"), content).expect("write config");
    }

    #[test]
    fn missing_project_config_uses_defaults() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cfg = load_project_config(tmp.path()).expect("load should succeed");
        assert_eq!(cfg.sync.backend, "file");
        assert_eq!(cfg.sync.workers, 4);
        assert!(cfg.sync.auto_resolve);
        assert_eq!(cfg.backends.file.root, PathBuf::from(".tether/remote"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn sections_override_defaults() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_config(
            tmp.path(),
            r#"
[sync]
workers = 8
dry_run = true

[dedup]
fuzzy_title_threshold = 0.8

[conflict]
scalar = "remote-wins"
text = "local-wins"

[resilience]
max_attempts = 3

[backends.file]
root = "/srv/tracker"
"#,
        );
        let cfg = load_project_config(tmp.path()).expect("load");
        let options = cfg.sync_options();
        assert_eq!(options.workers, 8);
        assert!(options.dry_run);
        assert!((options.dedup.fuzzy_title_threshold - 0.8).abs() < f64::EPSILON);
        assert!((options.dedup.content_threshold - 0.85).abs() < f64::EPSILON);
        assert_eq!(options.conflict.scalar, ScalarStrategy::RemoteWins);
        assert_eq!(options.conflict.text, TextStrategy::LocalWins);
        assert_eq!(cfg.resilience.max_attempts, 3);
        assert_eq!(cfg.resilience.failure_threshold, 5);
        assert_eq!(
            cfg.backend_root(BackendKind::File),
            Path::new("/srv/tracker")
        );
    }

    #[test]
    fn parse_errors_are_configuration_errors() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_config(tmp.path(), "[sync\nworkers = 2");
        let err = load_project_config(tmp.path()).expect_err("must fail");
        assert_eq!(err.code(), ErrorCode::ConfigParseError);
    }

    #[test]
    fn unknown_backend_fails_validation() {
        let cfg = ProjectConfig {
            sync: SyncConfig {
                backend: "jira".into(),
                ..SyncConfig::default()
            },
            ..ProjectConfig::default()
        };
        let err = cfg.validate().expect_err("unknown backend");
        assert_eq!(err.code(), ErrorCode::UnknownBackend);
        assert!(err.to_string().contains("file"));
    }

    #[test]
    fn cli_json_overrides_env_and_config() {
        assert_eq!(
            resolve_output(true, Some("pretty"), Some("text")),
            OutputMode::Json
        );
        assert_eq!(
            resolve_output(false, Some("pretty"), Some("table")),
            OutputMode::Text
        );
        assert_eq!(
            resolve_output(false, Some("human"), Some("bogus")),
            OutputMode::Pretty
        );
    }
}
