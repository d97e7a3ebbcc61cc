//! OliveTin - run predefined shell actions from a web API
//!
//! Main entry point: flags, logging, config discovery, then the service
//! until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use olivetin_core::config::{find_config_file, ConfigSource, DEFAULT_BASE_PORT};
use olivetin_core::installation::BUILD;
use olivetin_core::Application;

/// Log levels
#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[clap(
    name = "olivetin",
    about = "Run predefined shell actions from a web API",
    disable_version_flag = true
)]
struct Cli {
    /// Directory searched first for config.yaml
    #[clap(long, default_value = ".")]
    configdir: PathBuf,

    /// Print version information and exit
    #[clap(long)]
    version: bool,

    /// Set log level (default: the config's logLevel, else info)
    #[clap(long)]
    log_level: Option<LogLevel>,

    /// Log output format
    #[clap(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Logs always go to stderr. `RUST_LOG` wins over everything else.
fn initialize_tracing(level: &str, format: LogFormat) -> FilterHandle {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let (filter, handle) = reload::Layer::new(filter);
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_writer(std::io::stderr),
            )
            .init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init(),
    }

    handle
}

/// Maps the config's `logLevel` (`INFO`, `DEBUG`, ...) onto a filter directive.
fn config_log_directive(level: &str) -> Option<&'static str> {
    match level.to_ascii_lowercase().as_str() {
        "error" => Some("error"),
        "warn" | "warning" => Some("warn"),
        "info" => Some("info"),
        "debug" => Some("debug"),
        "trace" => Some("trace"),
        _ => None,
    }
}

fn base_port() -> u16 {
    match std::env::var("PORT") {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(port = %raw, "PORT is not a valid port number, using the default");
            DEFAULT_BASE_PORT
        }),
        Err(_) => DEFAULT_BASE_PORT,
    }
}

fn warn_about_environment() {
    for var in ["PUID", "PGID"] {
        if std::env::var_os(var).is_some() {
            warn!(var, "This variable is not used by OliveTin and is ignored");
        }
    }

    if std::env::var_os("OLIVETIN_FORCE_UPDATE_CHECK").is_some() {
        debug!("OLIVETIN_FORCE_UPDATE_CHECK is set, but update checks are not performed");
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = terminate.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM, only SIGINT will stop the service");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl-C");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("OliveTin {} (commit {}, built {})", BUILD.version, BUILD.commit, BUILD.date);
        return Ok(());
    }

    let initial_level = cli.log_level.as_ref().map_or("info", LogLevel::to_filter_directive);
    let filter_handle = initialize_tracing(initial_level, cli.log_format);

    info!(version = %BUILD.version, commit = %BUILD.commit, date = %BUILD.date, "OliveTin starting");
    warn_about_environment();

    let source = ConfigSource {
        path: find_config_file(&cli.configdir),
        base_port: base_port(),
    };

    match &source.path {
        Some(path) => info!(path = %path.display(), "Using config file"),
        None => warn!(configdir = %cli.configdir.display(), "No config.yaml found, running with defaults"),
    }

    let app = Application::load(source).context("Cannot start without a valid configuration")?;

    if cli.log_level.is_none() && std::env::var_os("RUST_LOG").is_none() {
        let cfg = app.executor().config().await;
        if let Some(directive) = config_log_directive(&cfg.log_level) {
            if let Err(e) = filter_handle.reload(EnvFilter::new(directive)) {
                warn!(error = %e, "Could not apply logLevel from config");
            }
        }
    }

    app.start().await;

    let signal_app = Arc::clone(&app);
    tokio::spawn(async move {
        wait_for_signal().await;
        signal_app.shutdown();
    });

    app.serve().await?;

    info!("OliveTin stopped");
    Ok(())
}
