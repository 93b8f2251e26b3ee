use std::{
    fs::OpenOptions,
    io::{IsTerminal, stderr},
    net::SocketAddr,
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::Parser;
use eyre::WrapErr;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    config::{Config, LoggingTable, Verbosity},
    geo::GeoResolver,
    history::HistoryPruner,
    poller::Poller,
    reconcile::Reconciler,
    routes::{AppState, create_router},
    store::Store,
};

mod config;
mod geo;
mod history;
mod identity;
mod poller;
mod reconcile;
mod routes;
mod status;
mod store;

#[derive(clap::Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
struct CliOptions {
    /// Configuration file
    #[arg(
        short = 'c',
        long = "config",
        env = "KA9Q_WATCH_CONF",
        default_value = "/etc/ka9q-watch.toml"
    )]
    config_file: PathBuf,

    /// Address/port to serve the API on (overrides the config file)
    #[arg(short, long = "listen-on")]
    listen_addr: Option<SocketAddr>,

    /// Log verbosity (overrides the config file)
    #[arg(short, long, alias = "log-level", value_enum)]
    verbosity: Option<Verbosity>,

    /// File to print logs to in addition to the console (overrides the config file)
    #[arg(short = 'o', long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI options and configuration file
    let cli = CliOptions::parse();
    let mut config = match Config::parse_from_file(&cli.config_file).await {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {err:?}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(addr) = cli.listen_addr {
        config.network.listen_addr = addr;
    }
    if let Some(verbosity) = cli.verbosity {
        config.logging.verbosity = verbosity;
    }
    if let Some(path) = cli.log_file {
        config.logging.log_file = Some(path);
    }

    // Set up logging. The guard flushes the log file when dropped, so it lives until exit.
    let _log_guard = match init_logging(&config.logging) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("Error: failed to initialize logger: {err}");
            return ExitCode::FAILURE;
        }
    };
    info!(config = %cli.config_file.display(), "Starting ka9q-watch");

    // Open database
    let store = match Store::open(config.storage.db_path.clone()).await {
        Ok(store) => store,
        Err(err) => {
            error!(
                "Failed to open database {}: {err}",
                config.storage.db_path.display()
            );
            return ExitCode::FAILURE;
        }
    };
    info!(db = %store.path().display(), "Database open");

    // Start poller
    let resolver = GeoResolver::new(store.clone(), config.geo.providers, config.geo.timeout);
    let poller = Poller::new(
        &config.upstream,
        Reconciler::new(store.clone(), resolver),
        HistoryPruner::new(store.clone(), config.storage.history_limit),
    );
    tokio::spawn(poller.run());

    // Start server
    let router = create_router(AppState {
        store,
        history_limit: config.storage.history_limit,
    });
    let bind_addr = &config.network.listen_addr;
    match tokio::net::TcpListener::bind(bind_addr).await {
        Ok(listener) => {
            info!("Listening on http://{bind_addr}");
            if let Err(err) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await
            {
                error!("Server error: {err}");
                return ExitCode::FAILURE;
            }
        }
        Err(err) => {
            error!("Failed to listen on {bind_addr}: {err}");
            return ExitCode::FAILURE;
        }
    }

    info!("Shutting down");
    ExitCode::SUCCESS
}

/// Install the global subscriber: the console always, plus a log file if configured.
fn init_logging(logging: &LoggingTable) -> eyre::Result<Option<WorkerGuard>> {
    let level = LevelFilter::from(logging.verbosity);
    let console = tracing_subscriber::fmt::layer()
        .with_writer(stderr)
        .with_ansi(stderr().is_terminal())
        .with_filter(level);

    let (file, guard) = match &logging.log_file {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(open_log_file(path)?);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(level);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()?;
    Ok(guard)
}

/// Open a log file for appending, creating it if needed.
fn open_log_file(path: &Path) -> eyre::Result<std::fs::File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .wrap_err_with(|| format!("cannot open {}", path.display()))
}

/// Resolves when the process is asked to stop.
async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
}
