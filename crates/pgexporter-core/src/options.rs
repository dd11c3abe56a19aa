//! Validated exporter options.
//!
//! The binary collects raw flag values into [`RawOptions`] and converts them
//! once with [`ExporterOptions::from_raw`]. Everything downstream receives the
//! resulting value through its constructor.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::error::OptionsError;

/// Label carrying the `host:port` fingerprint of a target.
pub const SERVER_LABEL: &str = "server";
/// Label carrying the database name when auto-discovery is enabled.
pub const DATABASE_LABEL: &str = "dbname";

/// Minimum interval between two catalog queries listing databases.
pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Flag values as parsed from the command line / environment.
#[derive(Debug, Clone, Default)]
pub struct RawOptions {
    pub disable_default_metrics: bool,
    pub disable_settings_metrics: bool,
    pub auto_discover_databases: bool,
    pub user_queries_path: Option<PathBuf>,
    /// `name=value,name=value`.
    pub constant_labels: String,
    /// Comma-separated database names.
    pub exclude_databases: String,
    /// Comma-separated database names.
    pub include_databases: String,
}

/// Which auto-discovered databases get scraped.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DatabaseFilter {
    #[default]
    All,
    Exclude(BTreeSet<String>),
    Include(BTreeSet<String>),
}

impl DatabaseFilter {
    pub fn allows(&self, database: &str) -> bool {
        match self {
            DatabaseFilter::All => true,
            DatabaseFilter::Exclude(names) => !names.contains(database),
            DatabaseFilter::Include(names) => names.contains(database),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExporterOptions {
    pub disable_default_metrics: bool,
    pub disable_settings_metrics: bool,
    pub auto_discover_databases: bool,
    pub database_filter: DatabaseFilter,
    pub user_queries_path: Option<PathBuf>,
    /// Applied to every emitted sample, sorted by name.
    pub constant_labels: Vec<(String, String)>,
    pub discovery_interval: Duration,
}

impl Default for ExporterOptions {
    fn default() -> Self {
        Self {
            disable_default_metrics: false,
            disable_settings_metrics: false,
            auto_discover_databases: false,
            database_filter: DatabaseFilter::All,
            user_queries_path: None,
            constant_labels: Vec::new(),
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
        }
    }
}

impl ExporterOptions {
    pub fn from_raw(raw: &RawOptions) -> Result<Self, OptionsError> {
        let exclude = split_list(&raw.exclude_databases);
        let include = split_list(&raw.include_databases);

        let database_filter = match (include.is_empty(), exclude.is_empty()) {
            (true, true) => DatabaseFilter::All,
            (true, false) => DatabaseFilter::Exclude(exclude),
            (false, true) => DatabaseFilter::Include(include),
            (false, false) => {
                warn!("both include-databases and exclude-databases are set; only include-databases is applied");
                DatabaseFilter::Include(include)
            }
        };

        Ok(Self {
            disable_default_metrics: raw.disable_default_metrics,
            disable_settings_metrics: raw.disable_settings_metrics,
            auto_discover_databases: raw.auto_discover_databases,
            database_filter,
            user_queries_path: raw.user_queries_path.clone().filter(|p| !p.as_os_str().is_empty()),
            constant_labels: parse_constant_labels(&raw.constant_labels)?,
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
        })
    }

    /// Labels the exporter adds itself; user-supplied labels may not reuse them.
    pub fn reserved_labels(&self) -> Vec<&'static str> {
        if self.auto_discover_databases {
            vec![SERVER_LABEL, DATABASE_LABEL]
        } else {
            vec![SERVER_LABEL]
        }
    }

    /// Logs one warning per deprecated option in use.
    pub fn warn_deprecated(&self) {
        if let Some(path) = &self.user_queries_path {
            warn!(file = %path.display(), "the extended queries.yaml config is DEPRECATED");
        }
        if self.auto_discover_databases || self.database_filter != DatabaseFilter::All {
            warn!("scraping additional databases via auto discovery is DEPRECATED");
        }
        if !self.constant_labels.is_empty() {
            warn!("constant labels on all metrics is DEPRECATED");
        }
    }
}

fn split_list(list: &str) -> BTreeSet<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_constant_labels(list: &str) -> Result<Vec<(String, String)>, OptionsError> {
    let mut labels = Vec::new();
    for pair in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let Some((name, value)) = pair.split_once('=') else {
            return Err(OptionsError::ConstantLabelFormat(pair.to_string()));
        };
        let name = name.trim();
        if !is_valid_label_name(name) {
            return Err(OptionsError::ConstantLabelName(name.to_string()));
        }
        if name == SERVER_LABEL || name == DATABASE_LABEL {
            return Err(OptionsError::ReservedLabel(name.to_string()));
        }
        labels.push((name.to_string(), value.trim().to_string()));
    }
    labels.sort();
    labels.dedup_by(|a, b| a.0 == b.0);
    Ok(labels)
}

/// `[a-zA-Z_][a-zA-Z0-9_]*`, excluding the `__` prefix reserved by Prometheus.
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    let valid_first = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    valid_first && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && !name.starts_with("__")
}

/// `[a-zA-Z_:][a-zA-Z0-9_:]*`.
pub fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    let valid_first =
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':');
    valid_first && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}
