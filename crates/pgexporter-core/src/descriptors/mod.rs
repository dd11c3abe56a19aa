//! Metric descriptor table.
//!
//! A [`QueryMapping`] ties one source query (with per-version variants) to the
//! meaning of its result columns. The [`DescriptorTable`] is built once at
//! startup from the built-in mappings and the optional user query file,
//! validated, and shared read-only by every collector afterwards.
//!
//! ## Column usages
//!
//! | Usage          | Emitted as                                          |
//! |----------------|-----------------------------------------------------|
//! | `DISCARD`      | nothing                                             |
//! | `LABEL`        | label on every metric of the row                    |
//! | `COUNTER`      | counter `<namespace>_<column>`                      |
//! | `GAUGE`        | gauge `<namespace>_<column>`                        |
//! | `MAPPEDMETRIC` | gauge, text value looked up in `metric_mapping`     |
//! | `DURATION`     | gauge `<namespace>_<column>_milliseconds`           |
//! | `HISTOGRAM`    | histogram; `<column>` holds the bucket bounds and   |
//! |                | `<column>_bucket/_sum/_count` the observations      |

pub mod builtin;
pub mod settings;
pub mod user_queries;
pub mod version;

use std::collections::{BTreeMap, HashSet};
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::options::{ExporterOptions, SERVER_LABEL, is_valid_label_name, is_valid_metric_name};

pub use version::{ServerVersion, VersionRange};

pub const UP_METRIC: &str = "pg_up";
pub const STATIC_METRIC: &str = "pg_static";
pub const SCRAPES_TOTAL_METRIC: &str = "pg_exporter_scrapes_total";
pub const ERRORS_TOTAL_METRIC: &str = "pg_exporter_errors_total";
pub const LAST_SCRAPE_DURATION_METRIC: &str = "pg_exporter_last_scrape_duration_seconds";
pub const LAST_SCRAPE_ERROR_METRIC: &str = "pg_exporter_last_scrape_error";
pub const USER_QUERIES_LOAD_ERROR_METRIC: &str = "pg_exporter_user_queries_load_error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnUsage {
    Discard,
    Label,
    Counter,
    Gauge,
    #[serde(rename = "MAPPEDMETRIC")]
    MappedMetric,
    Duration,
    Histogram,
}

impl ColumnUsage {
    /// Kind of metric produced, `None` for columns that produce no metric.
    pub fn metric_kind(self) -> Option<MetricKind> {
        match self {
            ColumnUsage::Discard | ColumnUsage::Label => None,
            ColumnUsage::Counter => Some(MetricKind::Counter),
            ColumnUsage::Gauge | ColumnUsage::MappedMetric | ColumnUsage::Duration => {
                Some(MetricKind::Gauge)
            }
            ColumnUsage::Histogram => Some(MetricKind::Histogram),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ColumnUsage::Discard => "DISCARD",
            ColumnUsage::Label => "LABEL",
            ColumnUsage::Counter => "COUNTER",
            ColumnUsage::Gauge => "GAUGE",
            ColumnUsage::MappedMetric => "MAPPEDMETRIC",
            ColumnUsage::Duration => "DURATION",
            ColumnUsage::Histogram => "HISTOGRAM",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Untyped,
    Histogram,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMapping {
    pub name: String,
    pub usage: ColumnUsage,
    pub description: String,
    /// Text value → metric value, for `MAPPEDMETRIC` columns.
    pub mapping: BTreeMap<String, f64>,
}

impl ColumnMapping {
    pub fn new(name: &str, usage: ColumnUsage, description: &str) -> Self {
        Self {
            name: name.to_string(),
            usage,
            description: description.to_string(),
            mapping: BTreeMap::new(),
        }
    }
}

/// Query text used for servers within `range`.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedQuery {
    pub range: VersionRange,
    pub sql: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingOrigin {
    Builtin,
    User,
}

/// One source query and the meaning of its columns.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryMapping {
    pub namespace: String,
    /// First matching variant wins.
    pub queries: Vec<VersionedQuery>,
    pub columns: Vec<ColumnMapping>,
    /// Run only on configured targets, never on auto-discovered databases.
    pub master: bool,
    pub cache_ttl: Option<Duration>,
    pub origin: MappingOrigin,
}

impl QueryMapping {
    pub fn new(namespace: &str, origin: MappingOrigin) -> Self {
        Self {
            namespace: namespace.to_string(),
            queries: Vec::new(),
            columns: Vec::new(),
            master: false,
            cache_ttl: None,
            origin,
        }
    }

    pub fn query(mut self, range: VersionRange, sql: &str) -> Self {
        self.queries.push(VersionedQuery {
            range,
            sql: sql.trim().to_string(),
        });
        self
    }

    pub fn column(mut self, name: &str, usage: ColumnUsage, description: &str) -> Self {
        self.columns.push(ColumnMapping::new(name, usage, description));
        self
    }

    pub fn master(mut self, master: bool) -> Self {
        self.master = master;
        self
    }

    /// Query text for `version`, `None` when no variant applies.
    pub fn query_for(&self, version: ServerVersion) -> Option<&str> {
        self.queries
            .iter()
            .find(|q| q.range.matches(version))
            .map(|q| q.sql.as_str())
    }

    pub fn column_mapping(&self, name: &str) -> Option<&ColumnMapping> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn label_columns(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(|c| c.usage == ColumnUsage::Label)
            .map(|c| c.name.as_str())
    }

    /// Fully qualified metric name for `column`.
    pub fn metric_name(&self, column: &ColumnMapping) -> String {
        match column.usage {
            ColumnUsage::Duration => format!("{}_{}_milliseconds", self.namespace, column.name),
            _ => format!("{}_{}", self.namespace, column.name),
        }
    }

    /// Columns that belong to a histogram column rather than being their own
    /// metric.
    pub fn is_histogram_part(&self, column: &str) -> bool {
        self.columns
            .iter()
            .filter(|c| c.usage == ColumnUsage::Histogram)
            .any(|c| {
                column
                    .strip_prefix(c.name.as_str())
                    .is_some_and(|suffix| matches!(suffix, "_bucket" | "_sum" | "_count"))
            })
    }
}

/// How a descriptor's value is obtained.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueRule {
    /// Result column of the descriptor's source query.
    Column { column: String, usage: ColumnUsage },
    /// One gauge per `pg_settings` row; the descriptor is a family template.
    ServerSettings,
    /// Maintained by the exporter itself.
    Internal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricDescriptor {
    pub namespace: String,
    pub subsystem: String,
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    /// Complete label set of emitted samples.
    pub label_names: Vec<String>,
    /// Namespace of the source [`QueryMapping`].
    pub query: Option<String>,
    pub rule: ValueRule,
    pub cache_ttl: Option<Duration>,
}

impl MetricDescriptor {
    pub fn fq_name(&self) -> String {
        [&self.namespace, &self.subsystem, &self.name]
            .iter()
            .filter(|part| !part.is_empty())
            .map(|part| part.as_str())
            .collect::<Vec<_>>()
            .join("_")
    }

    fn internal(fq_name: &str, help: &str, kind: MetricKind, label_names: Vec<String>) -> Self {
        Self {
            namespace: fq_name.to_string(),
            subsystem: String::new(),
            name: String::new(),
            help: help.to_string(),
            kind,
            label_names,
            query: None,
            rule: ValueRule::Internal,
            cache_ttl: None,
        }
    }
}

/// Outcome of loading the user query file.
#[derive(Debug, Clone, PartialEq)]
pub struct UserQueriesStatus {
    pub path: PathBuf,
    /// xxh3 of the file content, empty when it could not be read.
    pub hashsum: String,
    pub error: Option<String>,
}

/// Validated, immutable set of query mappings and their descriptors.
#[derive(Debug, Clone)]
pub struct DescriptorTable {
    mappings: BTreeMap<String, QueryMapping>,
    descriptors: Vec<MetricDescriptor>,
    settings_enabled: bool,
    user_queries: Option<UserQueriesStatus>,
}

impl DescriptorTable {
    /// Built-in mappings (unless disabled) overlaid with the user query file.
    /// Never touches a database.
    pub fn build(options: &ExporterOptions) -> Self {
        let mut mappings = if options.disable_default_metrics {
            Vec::new()
        } else {
            builtin::mappings()
        };

        let user_queries = options.user_queries_path.as_ref().map(|path| {
            let (status, user) = user_queries::load(path);
            for mapping in user {
                mappings.retain(|m| m.namespace != mapping.namespace);
                mappings.push(mapping);
            }
            status
        });

        Self::from_mappings(mappings, options, user_queries)
    }

    /// Validates `mappings`; invalid ones are dropped with a warning.
    pub fn from_mappings(
        mappings: Vec<QueryMapping>,
        options: &ExporterOptions,
        user_queries: Option<UserQueriesStatus>,
    ) -> Self {
        let target_labels: Vec<String> = options
            .reserved_labels()
            .iter()
            .map(|l| l.to_string())
            .collect();
        let constant_labels: Vec<String> = options
            .constant_labels
            .iter()
            .map(|(name, _)| name.clone())
            .collect();
        let with_labels = |extra: &[&str]| -> Vec<String> {
            target_labels
                .iter()
                .cloned()
                .chain(extra.iter().map(|l| l.to_string()))
                .chain(constant_labels.iter().cloned())
                .collect()
        };

        let mut descriptors = vec![
            MetricDescriptor::internal(
                UP_METRIC,
                "Whether the last scrape of metrics from PostgreSQL was able to connect to the server (1 for yes, 0 for no).",
                MetricKind::Gauge,
                with_labels(&[]),
            ),
            MetricDescriptor::internal(
                STATIC_METRIC,
                "Version string as reported by postgres",
                MetricKind::Untyped,
                with_labels(&["short_version", "version"]),
            ),
            MetricDescriptor::internal(
                SCRAPES_TOTAL_METRIC,
                "Total number of times PostgreSQL was scraped for metrics.",
                MetricKind::Counter,
                constant_labels.clone(),
            ),
            MetricDescriptor::internal(
                ERRORS_TOTAL_METRIC,
                "Total number of errors recorded while scraping PostgreSQL.",
                MetricKind::Counter,
                constant_labels.clone(),
            ),
            MetricDescriptor::internal(
                LAST_SCRAPE_DURATION_METRIC,
                "Duration of the last scrape of metrics from PostgreSQL.",
                MetricKind::Gauge,
                constant_labels.clone(),
            ),
            MetricDescriptor::internal(
                LAST_SCRAPE_ERROR_METRIC,
                "Whether the last scrape of metrics from PostgreSQL resulted in an error (1 for error, 0 for success).",
                MetricKind::Gauge,
                constant_labels.clone(),
            ),
        ];
        if user_queries.is_some() {
            let mut labels = vec!["filename".to_string(), "hashsum".to_string()];
            labels.extend(constant_labels.iter().cloned());
            descriptors.push(MetricDescriptor::internal(
                USER_QUERIES_LOAD_ERROR_METRIC,
                "Whether the user queries file was loaded and parsed successfully (1 for error, 0 for success).",
                MetricKind::Gauge,
                labels,
            ));
        }

        let mut seen: HashSet<String> = descriptors.iter().map(|d| d.fq_name()).collect();
        let forbidden: Vec<&str> = target_labels
            .iter()
            .chain(constant_labels.iter())
            .map(String::as_str)
            .collect();

        let mut valid = BTreeMap::new();
        for mapping in mappings {
            if let Err(reason) = validate(&mapping, &forbidden, &seen) {
                warn!(namespace = %mapping.namespace, reason = %reason, "skipping query mapping");
                continue;
            }

            let labels: Vec<&str> = mapping.label_columns().collect();
            for column in &mapping.columns {
                let Some(kind) = column.usage.metric_kind() else {
                    continue;
                };
                let fq_name = mapping.metric_name(column);
                seen.insert(fq_name.clone());
                let help = if column.description.is_empty() {
                    fq_name.clone()
                } else {
                    column.description.clone()
                };
                let name = fq_name
                    .strip_prefix(&format!("{}_", mapping.namespace))
                    .unwrap_or(&fq_name)
                    .to_string();
                descriptors.push(MetricDescriptor {
                    namespace: mapping.namespace.clone(),
                    subsystem: String::new(),
                    name,
                    help,
                    kind,
                    label_names: with_labels(&labels),
                    query: Some(mapping.namespace.clone()),
                    rule: ValueRule::Column {
                        column: column.name.clone(),
                        usage: column.usage,
                    },
                    cache_ttl: mapping.cache_ttl,
                });
            }
            valid.insert(mapping.namespace.clone(), mapping);
        }

        let settings_enabled = !options.disable_settings_metrics;
        if settings_enabled {
            descriptors.push(MetricDescriptor {
                namespace: settings::SETTINGS_METRIC_PREFIX.to_string(),
                subsystem: String::new(),
                name: String::new(),
                help: "Server Parameter".to_string(),
                kind: MetricKind::Gauge,
                label_names: with_labels(&[]),
                query: None,
                rule: ValueRule::ServerSettings,
                cache_ttl: None,
            });
        }

        info!(
            mappings = valid.len(),
            descriptors = descriptors.len(),
            settings = settings_enabled,
            "descriptor table built"
        );

        Self {
            mappings: valid,
            descriptors,
            settings_enabled,
            user_queries,
        }
    }

    /// Every registered descriptor. Does not run any query.
    pub fn describe(&self) -> &[MetricDescriptor] {
        &self.descriptors
    }

    pub fn mappings(&self) -> impl Iterator<Item = &QueryMapping> {
        self.mappings.values()
    }

    pub fn mapping(&self, namespace: &str) -> Option<&QueryMapping> {
        self.mappings.get(namespace)
    }

    pub fn settings_enabled(&self) -> bool {
        self.settings_enabled
    }

    pub fn user_queries(&self) -> Option<&UserQueriesStatus> {
        self.user_queries.as_ref()
    }

    /// Human-readable listing of every mapping.
    pub fn dump(&self, out: &mut impl Write) -> io::Result<()> {
        for mapping in self.mappings.values() {
            let mut flags = Vec::new();
            if mapping.master {
                flags.push("master".to_string());
            }
            if let Some(ttl) = mapping.cache_ttl {
                flags.push(format!("cache={}s", ttl.as_secs()));
            }
            if mapping.origin == MappingOrigin::User {
                flags.push("user".to_string());
            }
            if flags.is_empty() {
                writeln!(out, "{}", mapping.namespace)?;
            } else {
                writeln!(out, "{} [{}]", mapping.namespace, flags.join(", "))?;
            }
            for query in &mapping.queries {
                writeln!(out, "  version {}", query.range)?;
            }
            for column in &mapping.columns {
                writeln!(
                    out,
                    "  {:<40} {:<12} {}",
                    column.name,
                    column.usage.as_str(),
                    column.description
                )?;
            }
            writeln!(out)?;
        }
        if self.settings_enabled {
            writeln!(out, "{} (from pg_settings)", settings::SETTINGS_METRIC_PREFIX)?;
        }
        Ok(())
    }
}

fn validate(mapping: &QueryMapping, forbidden_labels: &[&str], seen: &HashSet<String>) -> Result<(), String> {
    if !is_valid_metric_name(&mapping.namespace) {
        return Err("invalid namespace".to_string());
    }
    if mapping.queries.is_empty() {
        return Err("no query".to_string());
    }

    let mut columns = HashSet::new();
    let mut fq_names = HashSet::new();
    for column in &mapping.columns {
        if !columns.insert(column.name.as_str()) {
            return Err(format!("column {:?} mapped twice", column.name));
        }
        match column.usage {
            ColumnUsage::Discard => {}
            ColumnUsage::Label => {
                if !is_valid_label_name(&column.name) {
                    return Err(format!("invalid label name {:?}", column.name));
                }
                if column.name == SERVER_LABEL || forbidden_labels.contains(&column.name.as_str()) {
                    return Err(format!(
                        "label {:?} collides with a label added by the exporter",
                        column.name
                    ));
                }
            }
            _ => {
                let fq_name = mapping.metric_name(column);
                if !is_valid_metric_name(&fq_name) {
                    return Err(format!("invalid metric name {fq_name:?}"));
                }
                if seen.contains(&fq_name) || !fq_names.insert(fq_name.clone()) {
                    return Err(format!("duplicate metric name {fq_name:?}"));
                }
            }
        }
    }
    Ok(())
}
