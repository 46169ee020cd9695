use std::path::{Path, PathBuf};

use autopilot_cli::app;
use autopilot_cli::commands::cli;
use autopilot_core::api::{
    apply_env_overrides, load_default, load_from_path, AppConfig, CliError, EngineError,
    ErrorKind, LoggingConfig,
};
use clap::Parser;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const EXIT_CONFIG: i32 = 11;
const EXIT_IO: i32 = 20;
const EXIT_TASK: i32 = 30;
const EXIT_INTERNAL: i32 = 50;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

#[tokio::main]
async fn main() {
    let code = run().await.unwrap_or_else(|e| {
        let code = exit_code(&e);
        tracing::debug!(exit_code = code, error.message = %e, "command failed");
        eprintln!("autopilot: {e}");
        code
    });
    std::process::exit(code);
}

async fn run() -> Result<i32, CliError> {
    let args = cli::Args::parse();
    let cfg = load_config(args.config.as_deref())?;
    install_subscriber(&cfg.logging).map_err(CliError::Config)?;
    app::dispatch(args.command, args.format, cfg).await
}

/// `--config` replaces the search path; environment overrides apply either way.
fn load_config(explicit: Option<&str>) -> Result<AppConfig, CliError> {
    let Some(path) = explicit else {
        return load_default().map_err(|e| CliError::Config(e.to_string()));
    };
    let mut cfg =
        load_from_path(Path::new(path)).map_err(|e| CliError::Config(format!("{path}: {e}")))?;
    apply_env_overrides(&mut cfg, |k| std::env::var(k).ok());
    Ok(cfg)
}

fn exit_code(e: &CliError) -> i32 {
    match e {
        CliError::Config(_) => EXIT_CONFIG,
        CliError::Io(_) | CliError::Command(_) => EXIT_IO,
        CliError::TaskFailed { .. } => EXIT_TASK,
        CliError::Engine(err) => engine_exit_code(err),
        CliError::Anyhow(_) => EXIT_INTERNAL,
    }
}

fn engine_exit_code(err: &EngineError) -> i32 {
    use ErrorKind::*;
    match err.kind() {
        Config => EXIT_CONFIG,
        Io | StoreUnavailable => EXIT_IO,
        InvalidPlan | HealingExhausted | ContinuationExhausted | SafetyRejected
        | UnsupportedLanguage | Cancelled => EXIT_TASK,
        _ => EXIT_INTERNAL,
    }
}

/// RUST_LOG wins over `logging.level` when set.
fn level_filter(logging: &LoggingConfig) -> Result<EnvFilter, String> {
    let from_env = std::env::var("RUST_LOG")
        .ok()
        .filter(|v| !v.trim().is_empty());
    let directive = from_env.unwrap_or_else(|| logging.level.clone());
    EnvFilter::try_new(&directive).map_err(|e| format!("log filter `{directive}`: {e}"))
}

fn log_dir(logging: &LoggingConfig) -> PathBuf {
    logging
        .directory
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("autopilot"))
}

/// One log file per process; the guard lives until exit so buffered lines get flushed.
fn file_writer(logging: &LoggingConfig) -> Result<NonBlocking, String> {
    let dir = log_dir(logging);
    std::fs::create_dir_all(&dir).map_err(|e| format!("log dir {}: {e}", dir.display()))?;
    let appender =
        tracing_appender::rolling::never(&dir, format!("autopilot.{}.log", std::process::id()));
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = LOG_GUARD.set(guard);
    Ok(writer)
}

fn install_subscriber(logging: &LoggingConfig) -> Result<(), String> {
    if !logging.enabled {
        return Ok(());
    }
    if !logging.console && !logging.file {
        return Err("logging is enabled but neither console nor file output is".to_string());
    }

    let filter = level_filter(logging)?;
    let file = if logging.file {
        Some(file_writer(logging)?)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(logging.console.then(|| {
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_ansi(atty::is(atty::Stream::Stderr))
        }))
        .with(file.map(|w| {
            tracing_subscriber::fmt::layer()
                .with_writer(w)
                .with_ansi(false)
        }))
        .init();
    Ok(())
}
