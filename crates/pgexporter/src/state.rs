//! Shared application state and the global allocator.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pgexporter_core::collector::Exporter;
use pgexporter_core::config::ConfigStore;
use pgexporter_core::datasource::DataSourceResolver;

pub(crate) struct AppInner {
    /// Default collector over the startup targets.
    pub(crate) exporter: Exporter,
    pub(crate) resolver: DataSourceResolver,
    pub(crate) config: Arc<ConfigStore>,
    pub(crate) config_path: PathBuf,
    pub(crate) telemetry_path: String,
    /// Subtracted from the scrape timeout announced by Prometheus.
    pub(crate) timeout_offset: Duration,
}

pub(crate) type AppState = Arc<AppInner>;
