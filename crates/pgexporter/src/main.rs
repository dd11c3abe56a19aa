mod handlers;
mod state;

use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tracing::{error, info, warn};

use pgexporter_core::collector::{Exporter, Scraper};
use pgexporter_core::config::ConfigStore;
use pgexporter_core::connection::PgConnector;
use pgexporter_core::datasource::{DataSourceEnv, DataSourceResolver};
use pgexporter_core::descriptors::DescriptorTable;
use pgexporter_core::error::{DataSourceError, OptionsError};
use pgexporter_core::options::{ExporterOptions, RawOptions};
use pgexporter_core::pool::ServerPool;

use state::{AppInner, AppState};

// ============================================================
// CLI
// ============================================================

#[derive(Parser)]
#[command(name = "pgexporter", about = "Prometheus exporter for PostgreSQL server metrics", version)]
struct Args {
    /// Auth module configuration file.
    #[arg(long = "config.file", env = "PG_EXPORTER_CONFIG_FILE", default_value = "postgres_exporter.yml")]
    config_file: PathBuf,

    /// Address to listen on for web interface and telemetry.
    #[arg(long = "web.listen-address", env = "PG_EXPORTER_WEB_LISTEN_ADDRESS", default_value = ":9187")]
    listen_address: String,

    /// Path under which to expose metrics.
    #[arg(long = "web.telemetry-path", env = "PG_EXPORTER_WEB_TELEMETRY_PATH", default_value = "/metrics")]
    telemetry_path: String,

    /// Do not include default metrics.
    #[arg(long = "disable-default-metrics", env = "PG_EXPORTER_DISABLE_DEFAULT_METRICS")]
    disable_default_metrics: bool,

    /// Do not include pg_settings metrics.
    #[arg(long = "disable-settings-metrics", env = "PG_EXPORTER_DISABLE_SETTINGS_METRICS")]
    disable_settings_metrics: bool,

    /// Whether to discover the databases on a server dynamically (DEPRECATED).
    #[arg(long = "auto-discover-databases", env = "PG_EXPORTER_AUTO_DISCOVER_DATABASES")]
    auto_discover_databases: bool,

    /// Path to custom queries to run (DEPRECATED).
    #[arg(long = "extend.query-path", env = "PG_EXPORTER_EXTEND_QUERY_PATH")]
    query_path: Option<PathBuf>,

    /// Do not run, simply dump the maps.
    #[arg(long = "dumpmaps")]
    dumpmaps: bool,

    /// A list of label=value separated by comma (DEPRECATED).
    #[arg(long = "constantLabels", env = "PG_EXPORTER_CONSTANT_LABELS", default_value = "")]
    constant_labels: String,

    /// A list of databases to remove when autoDiscoverDatabases is enabled (DEPRECATED).
    #[arg(long = "exclude-databases", env = "PG_EXPORTER_EXCLUDE_DATABASES", default_value = "")]
    exclude_databases: String,

    /// A list of databases to only include when autoDiscoverDatabases is enabled (DEPRECATED).
    #[arg(long = "include-databases", env = "PG_EXPORTER_INCLUDE_DATABASES", default_value = "")]
    include_databases: String,

    /// Seconds subtracted from the scrape timeout announced by Prometheus.
    #[arg(long = "scrape-timeout-offset", env = "PG_EXPORTER_SCRAPE_TIMEOUT_OFFSET", default_value_t = 0.5)]
    scrape_timeout_offset: f64,
}

impl Args {
    fn raw_options(&self) -> RawOptions {
        RawOptions {
            disable_default_metrics: self.disable_default_metrics,
            disable_settings_metrics: self.disable_settings_metrics,
            auto_discover_databases: self.auto_discover_databases,
            user_queries_path: self.query_path.clone(),
            constant_labels: self.constant_labels.clone(),
            exclude_databases: self.exclude_databases.clone(),
            include_databases: self.include_databases.clone(),
        }
    }

    /// `:9187` means every interface.
    fn listen_address(&self) -> String {
        match self.listen_address.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{port}"),
            None => self.listen_address.clone(),
        }
    }
}

#[derive(Debug, Error)]
enum StartupError {
    #[error(transparent)]
    Options(#[from] OptionsError),

    #[error(transparent)]
    DataSource(#[from] DataSourceError),

    #[error("invalid --scrape-timeout-offset {0}")]
    TimeoutOffset(f64),

    #[error("failed to dump metric maps: {0}")]
    Dump(#[source] io::Error),

    #[error("failed to build tokio runtime: {0}")]
    Runtime(#[source] io::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[source] io::Error),
}

// ============================================================
// Main
// ============================================================

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pgexporter=info,pgexporter_core=info")),
        )
        .init();

    if let Err(e) = run(args) {
        error!(error = %e, "exporter failed");
        process::exit(1);
    }
}

/// Writes the metric maps for `options`. Touches neither the network nor a
/// database.
fn run_dump(options: &ExporterOptions, out: &mut impl Write) -> Result<(), StartupError> {
    DescriptorTable::build(options)
        .dump(out)
        .map_err(StartupError::Dump)
}

fn run(args: Args) -> Result<(), StartupError> {
    let options = ExporterOptions::from_raw(&args.raw_options())?;
    if args.dumpmaps {
        return run_dump(&options, &mut io::stdout().lock());
    }
    let table = DescriptorTable::build(&options);

    info!(version = env!("CARGO_PKG_VERSION"), "starting pgexporter");
    options.warn_deprecated();

    let timeout_offset = Duration::try_from_secs_f64(args.scrape_timeout_offset)
        .map_err(|_| StartupError::TimeoutOffset(args.scrape_timeout_offset))?;

    let config = Arc::new(ConfigStore::new());
    config.reload_or_warn(&args.config_file);

    let resolver = DataSourceResolver::new(DataSourceEnv::from_process(), config.clone());
    let targets = resolver.resolve_startup_targets()?;
    info!(
        targets = ?targets.iter().map(|t| t.dsn.redacted()).collect::<Vec<_>>(),
        "scraping startup targets"
    );

    let pool = Arc::new(ServerPool::new(Arc::new(PgConnector::new())));
    let scraper = Scraper::new(Arc::new(table), pool, Arc::new(options));

    let state: AppState = Arc::new(AppInner {
        exporter: Exporter::new(scraper, targets),
        resolver,
        config,
        config_path: args.config_file.clone(),
        telemetry_path: args.telemetry_path.clone(),
        timeout_offset,
    });

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(StartupError::Runtime)?
        .block_on(serve(state, args.listen_address()))
}

async fn serve(state: AppState, addr: String) -> Result<(), StartupError> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| StartupError::Bind {
            addr: addr.clone(),
            source,
        })?;
    info!(%addr, path = %state.telemetry_path, "listening");

    tokio::spawn(reload_on_sighup(state.clone()));

    let app = handlers::router(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(StartupError::Serve)?;

    info!("shutting down, closing connections");
    if let Err(e) = tokio::task::spawn_blocking(move || state.exporter.close()).await {
        warn!(error = %e, "pool close panicked");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(unix)]
async fn reload_on_sighup(state: AppState) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(sig) => sig,
        Err(e) => {
            warn!(error = %e, "failed to listen for SIGHUP, reload only via /-/reload");
            return;
        }
    };
    while hangup.recv().await.is_some() {
        info!("SIGHUP received, reloading config");
        let state = state.clone();
        let reload = tokio::task::spawn_blocking(move || state.config.reload_or_warn(&state.config_path));
        if let Err(e) = reload.await {
            error!(error = %e, "config reload panicked");
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_sighup(_state: AppState) {}
