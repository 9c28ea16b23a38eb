//! Hermes - intercepting HTTP/HTTPS proxy.
//!
//! Runs the MITM proxy in the foreground and exposes a few one-shot commands:
//! - `run` (default): serve until Ctrl-C, optionally exporting the session as HAR
//! - `ca-path`: print the CA certificate location
//! - `export-ca`: write the CA certificate in DER form
//! - `replay-har`: import a HAR archive and replay every entry

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hermes_proxy::{ProxyConfig, ProxyController, ProxyError, ProxyEvent, ReplayOverrides};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Hermes - intercepting HTTP/HTTPS proxy
#[derive(Parser, Debug)]
#[command(name = "hermes", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// First port to try (moves up while busy)
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Address to bind
    #[arg(long, global = true)]
    host: Option<String>,

    /// Directory for the CA, rules and logs
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Rules file (defaults to <data dir>/rules.json)
    #[arg(long, global = true)]
    rules: Option<PathBuf>,

    /// Upstream connect timeout in milliseconds
    #[arg(long, global = true)]
    connect_timeout_ms: Option<u64>,

    /// Upstream response timeout in milliseconds
    #[arg(long, global = true)]
    read_timeout_ms: Option<u64>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Run the proxy until interrupted
    Run {
        /// Write the captured session to this HAR file on exit
        #[arg(long)]
        export_har: Option<PathBuf>,
    },
    /// Print the CA certificate path, creating the CA if needed
    CaPath,
    /// Export the CA certificate in DER form
    ExportCa {
        /// Destination file
        dest: PathBuf,
    },
    /// Import a HAR file and replay each entry
    ReplayHar {
        /// HAR file to import
        file: PathBuf,
        /// Write the resulting history to this HAR file
        #[arg(long)]
        export_har: Option<PathBuf>,
    },
}

/// Resolves the data directory from the flag or the platform default.
fn data_dir(args: &Args) -> Result<PathBuf> {
    match &args.data_dir {
        Some(dir) => Ok(dir.clone()),
        None => hermes_proxy::default_data_dir().context("Failed to get project dirs"),
    }
}

/// Builds the proxy configuration with CLI overrides applied.
fn build_config(args: &Args, data_dir: &Path) -> ProxyConfig {
    let mut config = ProxyConfig::with_data_dir(data_dir);
    if let Some(host) = &args.host {
        config = config.with_host(host.clone());
    }
    if let Some(port) = args.port {
        config = config.with_port(port);
    }
    if let Some(rules) = &args.rules {
        config = config.with_rules_path(rules.clone());
    }
    if let Some(ms) = args.connect_timeout_ms {
        config = config.with_connect_timeout(Duration::from_millis(ms));
    }
    if let Some(ms) = args.read_timeout_ms {
        config = config.with_read_timeout(Duration::from_millis(ms));
    }
    config
}

/// Initialize logging with file rotation.
fn init_logging(args: &Args, data_dir: &Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("hermes={},warn", log_level)));

    let log_dir = data_dir.join("logs");
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .max_log_files(5)
            .filename_prefix("hermes")
            .filename_suffix("log")
            .build(&log_dir)
            .ok();

        if let Some(appender) = file_appender {
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stdout))
                .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();

            tracing::info!("Logging to {:?}", log_dir);
            return Some(guard);
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

/// Exports history to `path`; an empty session is only a warning.
fn export_session(controller: &ProxyController, path: &Path) -> Result<()> {
    match controller.export_all_har(path) {
        Ok(count) => {
            println!("Exported {} entries to {}", count, path.display());
            Ok(())
        }
        Err(ProxyError::NotFound(_)) => {
            tracing::warn!("No entries captured, skipping HAR export");
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to export HAR to {}", path.display())),
    }
}

async fn run(controller: &ProxyController, export_har: Option<&Path>) -> Result<()> {
    let mut events = controller.subscribe();
    let port = controller.start().await.context("Failed to start proxy")?;

    println!("Hermes proxy listening on port {}", port);
    println!("CA certificate: {}", controller.ca_cert_path().display());
    println!("Press Ctrl-C to stop");

    let logger = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let ProxyEvent::Entry(entry) = event {
                match (entry.status, &entry.error) {
                    (Some(status), None) => {
                        tracing::info!("{} {} -> {}", entry.method, entry.url(), status)
                    }
                    (_, error) => tracing::info!(
                        "{} {} -> {}",
                        entry.method,
                        entry.url(),
                        error.as_deref().unwrap_or("no response")
                    ),
                }
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");

    controller.shutdown().await;
    logger.abort();

    if let Some(path) = export_har {
        export_session(controller, path)?;
    }
    Ok(())
}

async fn replay_har(
    controller: &ProxyController,
    file: &Path,
    export_har: Option<&Path>,
) -> Result<()> {
    let summary = controller
        .import_har(file)
        .with_context(|| format!("Failed to import {}", file.display()))?;
    println!(
        "Imported {} entries ({} skipped)",
        summary.entries.len(),
        summary.skipped
    );

    let mut failed = 0;
    for entry in &summary.entries {
        match controller.replay(&entry.id, &ReplayOverrides::default()).await {
            Ok(replayed) => match replayed.status {
                Some(status) if replayed.error.is_none() => {
                    println!("{} {} -> {}", replayed.method, replayed.url(), status)
                }
                _ => {
                    failed += 1;
                    println!(
                        "{} {} -> {}",
                        replayed.method,
                        replayed.url(),
                        replayed.error.as_deref().unwrap_or("no response")
                    );
                }
            },
            Err(e) => {
                failed += 1;
                tracing::warn!("Could not replay {}: {}", entry.id, e);
            }
        }
    }
    println!(
        "Replayed {} entries, {} failed",
        summary.entries.len(),
        failed
    );

    if let Some(path) = export_har {
        export_session(controller, path)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let data_dir = data_dir(&args)?;
    let _log_guard = init_logging(&args, &data_dir);

    tracing::info!("Hermes v{} starting", env!("CARGO_PKG_VERSION"));
    let controller = ProxyController::new(build_config(&args, &data_dir))
        .context("Failed to configure proxy")?;

    match args.command.unwrap_or(Command::Run { export_har: None }) {
        Command::Run { export_har } => run(&controller, export_har.as_deref()).await,
        Command::CaPath => {
            let path = controller.prepare_ca().await.context("Failed to prepare CA")?;
            println!("{}", path.display());
            Ok(())
        }
        Command::ExportCa { dest } => {
            controller
                .export_ca_der(&dest)
                .await
                .with_context(|| format!("Failed to export CA to {}", dest.display()))?;
            println!("{}", dest.display());
            Ok(())
        }
        Command::ReplayHar { file, export_har } => {
            replay_har(&controller, &file, export_har.as_deref()).await
        }
    }
}
