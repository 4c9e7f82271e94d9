use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use plugin_host::commands;
use plugin_host::config;
use plugin_host::host::HostManager;

#[derive(Parser, Debug)]
#[command(name = "plugin-host")]
#[command(about = "Run and supervise out-of-process data-source plugins", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Also write logs to this file
    #[arg(long, value_name = "FILE", global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Start every configured plugin and wait for a shutdown signal (default)
    Run,
    /// Validate configuration and plugin binaries
    Check {
        /// Also start each plugin and complete the handshake
        #[arg(long)]
        start: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_tracing(&args)?;

    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            config::load_from_path(path).await.map_err(|e| {
                error!("Failed to load configuration from {}: {}", path.display(), e);
                e
            })?
        }
        None => {
            info!("Loading configuration from default locations");
            config::load_from_env_or_file().await.map_err(|e| {
                error!("Failed to load configuration: {}", e);
                e
            })?
        }
    };

    let base_dir = match args.config.as_deref().and_then(Path::parent) {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => std::env::current_dir().context("cannot determine working directory")?,
    };

    match args.command.unwrap_or(Command::Run) {
        Command::Check { start } => {
            commands::run_config_check(config, &base_dir, start).await?;
            Ok(())
        }
        Command::Run => {
            info!("Starting plugin host");
            info!(
                "Plugins {}, {} configured",
                if config.plugins.enabled { "enabled" } else { "disabled" },
                config.plugins.plugins.len()
            );

            let shutdown = CancellationToken::new();
            let startup = config.startup_config();
            let manager = HostManager::new(config.plugins, base_dir).with_startup(startup);
            let host = tokio::spawn(manager.run(shutdown.clone()));

            shutdown_signal().await;
            info!("Shutting down plugin host");
            shutdown.cancel();

            host.await.context("plugin host task failed")??;
            info!("Shutdown completed");
            Ok(())
        }
    }
}

fn init_tracing(args: &Args) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    let log_level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::from_default_env().add_directive(
        format!("plugin_host={log_level}")
            .parse()
            .context("invalid log directive")?,
    );

    let (file_writer, guard) = match &args.log_file {
        Some(path) => {
            let dir = path.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let file_name = path.file_name().context("log file path has no file name")?;
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (args.json, file_writer) {
        (true, Some(file)) => builder.json().with_writer(std::io::stderr.and(file)).init(),
        (true, None) => builder.json().with_writer(std::io::stderr).init(),
        (false, Some(file)) => builder.with_writer(std::io::stderr.and(file)).init(),
        (false, None) => builder.with_writer(std::io::stderr).init(),
    }

    Ok(guard)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
