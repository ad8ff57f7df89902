#![forbid(unsafe_code)]

mod cmd;
mod git_history;
mod output;
mod prompt;

use clap::{Parser, Subcommand};
use output::{CliError, OutputMode, render_error};
use std::env;
use std::path::Path;
use std::process::ExitCode;
use tether_core::SyncError;
use tether_core::config::{EffectiveConfig, resolve_config};
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Exit status when the run finished but left conflicts or errors behind.
const EXIT_UNRESOLVED: u8 = 2;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "tether: keep a local work-item store and an issue tracker in sync",
    long_about = None
)]
struct Cli {
    /// Enable debug logging (overridden by TETHER_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Sync(cmd::sync::SyncArgs),
    Dedup(cmd::dedup::DedupArgs),
    Baseline(cmd::baseline::BaselineArgs),
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env("TETHER_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if verbose || env::var("DEBUG").is_ok() {
            "tether=debug,info"
        } else {
            "tether=info,warn"
        })
    });

    let format = env::var("TETHER_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    // stdout carries command output
    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Run one command; `Ok(false)` means it finished with work left for a human.
fn dispatch(command: &Commands, config: &EffectiveConfig, project_root: &Path) -> anyhow::Result<bool> {
    match command {
        Commands::Sync(args) => {
            let report = cmd::sync::run_sync(args, config, project_root)?;
            Ok(!report.has_unresolved())
        }
        Commands::Dedup(args) => cmd::dedup::run_dedup(args, config, project_root).map(|()| true),
        Commands::Baseline(args) => {
            cmd::baseline::run_baseline(args, config, project_root).map(|()| true)
        }
    }
}

fn report_failure(mode: OutputMode, err: &anyhow::Error) {
    let cli_error = err
        .downcast_ref::<SyncError>()
        .map_or_else(|| CliError::new(format!("{err:#}")), CliError::from);
    if let Err(render_err) = render_error(mode, &cli_error) {
        eprintln!("error: {err:#} (while rendering: {render_err})");
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let fallback = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };

    let project_root = match env::current_dir() {
        Ok(dir) => dir,
        Err(err) => {
            report_failure(fallback, &anyhow::Error::from(err));
            return ExitCode::FAILURE;
        }
    };
    let config = match resolve_config(&project_root, cli.json) {
        Ok(config) => config,
        Err(err) => {
            report_failure(fallback, &err);
            return ExitCode::FAILURE;
        }
    };
    debug!(output = %config.output, root = %project_root.display(), "resolved configuration");

    match dispatch(&cli.command, &config, &project_root) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(EXIT_UNRESOLVED),
        Err(err) => {
            report_failure(config.output, &err);
            ExitCode::FAILURE
        }
    }
}
