use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use dominod::{
    config::CoordinatorConfig, deployment::DeploymentStore, secrets::InMemorySecretStore, socket,
    AppContext,
};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "dominod",
    about = "Domino coordinator — deployment orchestration daemon",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Agent socket server port
    #[arg(long, env = "DOMINO_PORT")]
    port: Option<u16>,

    /// Data directory for config, deployments, and secrets
    #[arg(long, env = "DOMINO_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "DOMINO_LOG")]
    log: Option<String>,

    /// Bind address for the socket server (default: 127.0.0.1; use 0.0.0.0 for LAN agents)
    #[arg(long, env = "DOMINO_BIND")]
    bind_address: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "DOMINO_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the coordinator (default when no subcommand given).
    ///
    /// Runs dominod in the foreground: accepts agent connections, drives
    /// lifecycle commands, and answers HTTP GET /health on the same port.
    ///
    /// Examples:
    ///   dominod serve
    ///   dominod
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // ── Config, then logging ─────────────────────────────────────────────────
    // Config is assembled first so the log level and format from config.toml
    // take effect; config assembly itself reports problems on stderr.
    let config = CoordinatorConfig::new(args.port, args.data_dir, args.log, args.bind_address);
    let _file_guard = setup_logging(&config.log, args.log_file.as_deref(), &config.log_format);

    match args.command {
        None | Some(Command::Serve) => {
            run_server(config).await?;
        }
    }

    Ok(())
}

async fn run_server(config: CoordinatorConfig) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %config.data_dir.display(),
        agents = config.agents.len(),
        operation_timeout_ms = config.operation_timeout_ms,
        "dominod starting"
    );

    let deployments = DeploymentStore::load(&config.data_dir)?;
    let secrets = Arc::new(InMemorySecretStore::load(&config.data_dir)?);
    let ctx = Arc::new(AppContext::new(config, deployments, secrets));

    socket::run(ctx).await
}

/// Initialize the tracing subscriber.
/// If `log_file` is set, logs go to both stdout and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
///
/// `log_format` may be `"pretty"` (default, human-readable compact format) or
/// `"json"` (structured JSON for log aggregators).
///
/// If the log directory cannot be created, falls back to stdout-only logging
/// with a warning — never panics.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
    log_format: &str,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let use_json = log_format == "json";

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("dominod.log"));

        // Ensure the directory exists before tracing-appender tries to open it.
        if let Err(e) = std::fs::create_dir_all(dir) {
            // Fall back to stdout-only — don't panic on a bad log path.
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            if use_json {
                tracing_subscriber::fmt().json().with_env_filter(log_level).init();
            } else {
                tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
            }
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        if use_json {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().json())
                .with(fmt::layer().json().with_writer(non_blocking))
                .init();
        } else {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().compact())
                .with(fmt::layer().with_writer(non_blocking))
                .init();
        }

        Some(guard)
    } else if use_json {
        tracing_subscriber::fmt().json().with_env_filter(log_level).init();
        None
    } else {
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        None
    }
}
