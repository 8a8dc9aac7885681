//! `superproxy` Server Binary
//!
//! Loads configuration, restores the store snapshot, and serves the
//! management, reader and admin API.
//!
//! ## Usage
//!
//! ```bash
//! # Start with config.toml / config.local.toml / SUPERPROXY_* env vars
//! cargo run --bin superproxy-server
//!
//! # Explicit config file and bind address
//! cargo run --bin superproxy-server -- --config prod.toml --host 0.0.0.0 --port 9090
//! ```
//!
//! ## Logging
//!
//! `SUPERPROXY_LOG` takes an `EnvFilter` directive and overrides
//! `logging.level`. `SUPERPROXY_LOG_JSON=1` overrides `logging.format`.

use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use superproxy::config::LoggingConfig;
use superproxy::{rest, Config, Engine};

static TRACE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

#[derive(Debug, Parser)]
#[command(name = "superproxy-server", version, about = "Scheduled caching proxy for an analytics API")]
struct Args {
    /// Configuration file (default: config.toml + config.local.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bind host, overrides http.host
    #[arg(long)]
    host: Option<String>,

    /// Bind port, overrides http.port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(&path.to_string_lossy())
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load configuration")?,
    };

    init_tracing(&config.logging);

    if let Some(host) = args.host {
        config.http.host = host;
    }
    if let Some(port) = args.port {
        config.http.port = port;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.http.host,
        port = config.http.port,
        snapshot = %config.storage.snapshot_path().display(),
        "superproxy_starting"
    );

    let (engine, fired) = Engine::from_config(config).context("failed to initialize engine")?;
    rest::start_http_server(engine, fired).await
}

fn init_tracing(logging: &LoggingConfig) {
    // Environment variables take precedence over config file values
    let level = env::var("SUPERPROXY_LOG").unwrap_or_else(|_| logging.level.clone());
    let json = env::var("SUPERPROXY_LOG_JSON")
        .ok()
        .map_or_else(|| logging.format == "json", |v| v != "0");

    let (writer, guard) = match &logging.file {
        Some(path) => match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => tracing_appender::non_blocking(file),
            Err(e) => {
                eprintln!("ERROR: Unable to open log file '{}': {e}", path.display());
                tracing_appender::non_blocking(std::io::stdout())
            }
        },
        None => tracing_appender::non_blocking(std::io::stdout()),
    };
    let _ = TRACE_GUARD.set(guard);

    let base = || {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info")))
            .with_ansi(logging.file.is_none())
            .with_writer(writer.clone())
            .with_target(false)
    };

    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> = if json {
        Box::new(base().json().finish())
    } else {
        Box::new(base().compact().finish())
    };

    let _ = tracing::subscriber::set_global_default(subscriber);
}
