//! Collectors.
//!
//! [`Scraper`] turns one target into samples: it leases the target from the
//! pool, runs every applicable query mapping, converts rows into samples and
//! records failures without stopping. [`Exporter`] is the process-wide
//! collector over the startup targets and adds the exporter's own metrics;
//! [`crate::probe::ProbeCollector`] reuses the same scraper for a single
//! caller-chosen target.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::connection::Row;
use crate::datasource::DataSourceSpec;
use crate::descriptors::settings::{SETTINGS_QUERY, setting_from_row};
use crate::descriptors::{
    ColumnUsage, DescriptorTable, ERRORS_TOTAL_METRIC, LAST_SCRAPE_DURATION_METRIC,
    LAST_SCRAPE_ERROR_METRIC, MetricDescriptor, QueryMapping, SCRAPES_TOTAL_METRIC, STATIC_METRIC,
    ServerVersion, UP_METRIC, USER_QUERIES_LOAD_ERROR_METRIC,
};
use crate::options::{DATABASE_LABEL, ExporterOptions, SERVER_LABEL};
use crate::pool::{ServerLease, ServerPool};
use crate::scrape::{Sample, SampleValue, ScrapeContext, ScrapeError, ScrapeResult};
use crate::values::{parse_duration_ms, parse_float, parse_float_array};

/// Describe/collect contract shared by the default exporter and probes.
pub trait MetricCollector: Send + Sync {
    /// Every descriptor that may appear in a collect result. Runs no query.
    fn describe(&self) -> Vec<MetricDescriptor>;

    /// Scrapes the bound targets. Never fails as a whole: per-target and
    /// per-query failures are recorded in the result.
    fn collect(&self, ctx: &ScrapeContext) -> ScrapeResult;
}

/// Outcome of scraping one configured target (and its discovered databases).
#[derive(Debug, Default)]
pub struct TargetScrape {
    pub result: ScrapeResult,
    /// Whether the configured target itself could be connected to.
    pub connected: bool,
}

/// Shared scraping engine. Cheap to clone.
#[derive(Clone)]
pub struct Scraper {
    table: Arc<DescriptorTable>,
    pool: Arc<ServerPool>,
    options: Arc<ExporterOptions>,
}

impl Scraper {
    pub fn new(table: Arc<DescriptorTable>, pool: Arc<ServerPool>, options: Arc<ExporterOptions>) -> Self {
        Self {
            table,
            pool,
            options,
        }
    }

    pub fn table(&self) -> &Arc<DescriptorTable> {
        &self.table
    }

    pub fn pool(&self) -> &Arc<ServerPool> {
        &self.pool
    }

    pub fn options(&self) -> &ExporterOptions {
        &self.options
    }

    /// Scrapes `spec`. With `configured` set and auto-discovery enabled, also
    /// every database of the same server that passes the database filter.
    /// A database that is itself a configured target, or that an earlier
    /// configured target discovers under the same connection string, is left
    /// to that target.
    pub fn scrape_target(
        &self,
        spec: &DataSourceSpec,
        ctx: &ScrapeContext,
        configured: Option<&[DataSourceSpec]>,
    ) -> TargetScrape {
        let mut result = ScrapeResult::default();

        let mut lease = match self.pool.acquire(spec) {
            Ok(lease) => lease,
            Err(e) => {
                record(&mut result, spec, None, e.to_string());
                result.push(self.up_sample(spec, false));
                return TargetScrape {
                    result,
                    connected: false,
                };
            }
        };

        let up = self.scrape_server(spec, &mut lease, ctx, &mut result);
        result.push(self.up_sample(spec, up));

        let configured = configured.unwrap_or_default();
        let discover = !configured.is_empty() && spec.primary && self.options.auto_discover_databases && up;
        let databases = if discover {
            match lease.databases(self.options.discovery_interval, ctx) {
                Ok(databases) => databases,
                Err(e) => {
                    record(&mut result, spec, None, format!("database discovery failed: {e}"));
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        drop(lease);

        let own_key = spec.key();
        let earlier = configured
            .iter()
            .position(|t| t.key() == own_key)
            .map_or(&[][..], |i| &configured[..i]);

        for database in databases {
            if spec.dsn.dbname() == Some(database.as_str())
                || !self.options.database_filter.allows(&database)
            {
                continue;
            }
            let discovered = spec.discovered(&database);
            let key = discovered.key();
            if configured.iter().any(|t| t.key() == key)
                || earlier.iter().any(|t| t.primary && t.discovered(&database).key() == key)
            {
                debug!(server = %spec.dsn.fingerprint(), %database, "database scraped by another target");
                continue;
            }
            match self.pool.acquire(&discovered) {
                Ok(mut lease) => {
                    let up = self.scrape_server(&discovered, &mut lease, ctx, &mut result);
                    result.push(self.up_sample(&discovered, up));
                }
                Err(e) => {
                    record(&mut result, &discovered, None, e.to_string());
                    result.push(self.up_sample(&discovered, false));
                }
            }
        }

        TargetScrape {
            result,
            connected: true,
        }
    }

    /// Runs every mapping applicable to `spec` on its leased server. Returns
    /// whether the connection survived the scrape.
    fn scrape_server(
        &self,
        spec: &DataSourceSpec,
        lease: &mut ServerLease,
        ctx: &ScrapeContext,
        result: &mut ScrapeResult,
    ) -> bool {
        let base = self.target_labels(spec);
        let version = lease.server_version().unwrap_or(ServerVersion::new(0, 0, 0));

        if spec.primary
            && let Some(text) = lease.version_text()
        {
            let mut labels = base.clone();
            labels.push(("short_version".to_string(), ServerVersion::short_version(text)));
            labels.push(("version".to_string(), text.to_string()));
            result.push(Sample::new(
                STATIC_METRIC,
                "Version string as reported by postgres",
                self.with_constants(labels),
                SampleValue::Untyped(1.0),
            ));
        }

        for mapping in self.table.mappings() {
            if mapping.master && !spec.primary {
                continue;
            }
            if let Err(fatal) = self.scrape_mapping(spec, lease, mapping, version, &base, ctx, result) {
                record(result, spec, Some(&mapping.namespace), fatal);
                return false;
            }
        }

        if spec.primary && self.table.settings_enabled() {
            match lease.query(SETTINGS_QUERY, ctx) {
                Ok(rows) => {
                    let labels = self.with_constants(base.clone());
                    for row in &rows {
                        match setting_from_row(row) {
                            Ok(setting) => result.push(Sample::new(
                                &setting.metric_name,
                                &setting.help,
                                labels.clone(),
                                SampleValue::Gauge(setting.value),
                            )),
                            Err(e) => record(result, spec, Some("pg_settings"), e),
                        }
                    }
                }
                Err(e) if e.is_fatal_for_connection() => {
                    record(result, spec, Some("pg_settings"), e.to_string());
                    return false;
                }
                Err(e) => record(result, spec, Some("pg_settings"), e.to_string()),
            }
        }

        lease.mark_scraped();
        true
    }

    /// Runs one mapping. Non-fatal failures are recorded in `result`; a
    /// connection-level failure is returned so the caller stops using the
    /// server.
    #[allow(clippy::too_many_arguments)]
    fn scrape_mapping(
        &self,
        spec: &DataSourceSpec,
        lease: &mut ServerLease,
        mapping: &QueryMapping,
        version: ServerVersion,
        base: &[(String, String)],
        ctx: &ScrapeContext,
        result: &mut ScrapeResult,
    ) -> Result<(), String> {
        if let Some(ttl) = mapping.cache_ttl
            && let Some(samples) = lease.cached(&mapping.namespace, ttl)
        {
            result.samples.extend(samples);
            return Ok(());
        }

        let Some(sql) = mapping.query_for(version) else {
            debug!(namespace = %mapping.namespace, version = %version, "no query variant for server version");
            return Ok(());
        };

        let rows = match lease.query(sql, ctx) {
            Ok(rows) => rows,
            Err(e) if e.is_fatal_for_connection() => return Err(e.to_string()),
            Err(e) => {
                record(result, spec, Some(&mapping.namespace), e.to_string());
                return Ok(());
            }
        };

        let mut local = ScrapeResult::default();
        for row in &rows {
            self.row_samples(mapping, row, base, spec, &mut local);
        }
        if mapping.cache_ttl.is_some() {
            lease.store_cache(&mapping.namespace, local.samples.clone());
        }
        result.merge(local);
        Ok(())
    }

    fn row_samples(
        &self,
        mapping: &QueryMapping,
        row: &Row,
        base: &[(String, String)],
        spec: &DataSourceSpec,
        result: &mut ScrapeResult,
    ) {
        let mut labels = base.to_vec();
        for column in mapping.label_columns() {
            labels.push((column.to_string(), row.get(column).unwrap_or_default().to_string()));
        }
        let labels = self.with_constants(labels);
        let ns = mapping.namespace.as_str();

        for (column, value) in row.iter() {
            let Some(cm) = mapping.column_mapping(column) else {
                if mapping.is_histogram_part(column) {
                    continue;
                }
                match parse_float(value) {
                    Ok(v) => result.push(Sample::new(
                        &format!("{ns}_{column}"),
                        &format!("Unknown metric from {ns}"),
                        labels.clone(),
                        SampleValue::Untyped(v),
                    )),
                    Err(e) => record(result, spec, Some(ns), format!("column {column:?}: {e}")),
                }
                continue;
            };

            let name = mapping.metric_name(cm);
            let help = if cm.description.is_empty() {
                name.as_str()
            } else {
                cm.description.as_str()
            };
            let converted = match cm.usage {
                ColumnUsage::Discard | ColumnUsage::Label => continue,
                ColumnUsage::Counter => parse_float(value).map(SampleValue::Counter),
                ColumnUsage::Gauge => parse_float(value).map(SampleValue::Gauge),
                ColumnUsage::Duration => parse_duration_ms(value).map(SampleValue::Gauge),
                ColumnUsage::MappedMetric => match value {
                    None => Ok(SampleValue::Gauge(f64::NAN)),
                    Some(text) => cm
                        .mapping
                        .get(text)
                        .map(|v| SampleValue::Gauge(*v))
                        .ok_or_else(|| format!("unexpected value {text:?}")),
                },
                ColumnUsage::Histogram => histogram(column, value, row),
            };
            match converted {
                Ok(value) => result.push(Sample::new(&name, help, labels.clone(), value)),
                Err(e) => record(result, spec, Some(ns), format!("column {column:?}: {e}")),
            }
        }
    }

    fn target_labels(&self, spec: &DataSourceSpec) -> Vec<(String, String)> {
        let mut labels = vec![(SERVER_LABEL.to_string(), spec.dsn.fingerprint())];
        if self.options.auto_discover_databases {
            labels.push((
                DATABASE_LABEL.to_string(),
                spec.dsn.dbname().unwrap_or_default().to_string(),
            ));
        }
        for (name, value) in &spec.labels {
            if let Some(slot) = labels.iter_mut().find(|(n, _)| n == name) {
                slot.1 = value.clone();
            }
        }
        labels
    }

    fn with_constants(&self, mut labels: Vec<(String, String)>) -> Vec<(String, String)> {
        labels.extend(self.options.constant_labels.iter().cloned());
        labels
    }

    fn up_sample(&self, spec: &DataSourceSpec, up: bool) -> Sample {
        Sample::new(
            UP_METRIC,
            "Whether the last scrape of metrics from PostgreSQL was able to connect to the server (1 for yes, 0 for no).",
            self.with_constants(self.target_labels(spec)),
            SampleValue::Gauge(if up { 1.0 } else { 0.0 }),
        )
    }

    /// Sample carrying the exporter's constant labels only.
    fn internal_sample(&self, name: &str, help: &str, value: SampleValue) -> Sample {
        Sample::new(name, help, self.options.constant_labels.clone(), value)
    }
}

fn histogram(column: &str, bounds: Option<&str>, row: &Row) -> Result<SampleValue, String> {
    let part = |suffix: &str| format!("{column}_{suffix}");
    let bounds = parse_float_array(column, bounds).map_err(|e| e.to_string())?;
    let bucket_column = part("bucket");
    let counts = parse_float_array(&bucket_column, row.get(&bucket_column)).map_err(|e| e.to_string())?;
    if bounds.len() != counts.len() {
        return Err(format!(
            "{} bucket bounds but {} bucket counts",
            bounds.len(),
            counts.len()
        ));
    }
    let sum = parse_float(row.get(&part("sum")))?;
    let count = parse_float(row.get(&part("count")))?;

    Ok(SampleValue::Histogram {
        buckets: bounds
            .into_iter()
            .zip(counts)
            .map(|(bound, count)| (bound, count as u64))
            .collect(),
        sum,
        count: count as u64,
    })
}

fn record(result: &mut ScrapeResult, spec: &DataSourceSpec, namespace: Option<&str>, message: String) {
    result.record_error(ScrapeError {
        server: spec.dsn.fingerprint(),
        database: spec.dsn.dbname().map(str::to_string),
        namespace: namespace.map(str::to_string),
        message,
    });
}

#[derive(Debug, Default)]
struct ExporterStats {
    scrapes_total: u64,
    errors_total: u64,
}

/// Default collector over the startup targets.
pub struct Exporter {
    scraper: Scraper,
    targets: Vec<DataSourceSpec>,
    stats: Mutex<ExporterStats>,
}

impl Exporter {
    pub fn new(scraper: Scraper, targets: Vec<DataSourceSpec>) -> Self {
        Self {
            scraper,
            targets,
            stats: Mutex::new(ExporterStats::default()),
        }
    }

    pub fn scraper(&self) -> &Scraper {
        &self.scraper
    }

    pub fn targets(&self) -> &[DataSourceSpec] {
        &self.targets
    }

    /// Closes the shared pool. In-flight and later scrapes report the
    /// targets as down.
    pub fn close(&self) {
        self.scraper.pool().close();
    }
}

impl MetricCollector for Exporter {
    fn describe(&self) -> Vec<MetricDescriptor> {
        self.scraper.table().describe().to_vec()
    }

    fn collect(&self, ctx: &ScrapeContext) -> ScrapeResult {
        let start = Instant::now();

        let scrapes: Vec<ScrapeResult> = if self.targets.len() == 1 {
            vec![self
                .scraper
                .scrape_target(&self.targets[0], ctx, Some(self.targets.as_slice()))
                .result]
        } else {
            std::thread::scope(|scope| {
                let handles: Vec<_> = self
                    .targets
                    .iter()
                    .map(|target| {
                        scope.spawn(move || {
                            self.scraper
                                .scrape_target(target, ctx, Some(self.targets.as_slice()))
                                .result
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().unwrap_or_default())
                    .collect()
            })
        };

        let mut result = ScrapeResult::default();
        for scrape in scrapes {
            result.merge(scrape);
        }

        for error in &result.errors {
            warn!(
                server = %error.server,
                database = error.database.as_deref().unwrap_or_default(),
                namespace = error.namespace.as_deref().unwrap_or_default(),
                error = %error.message,
                "scrape error"
            );
        }

        let (scrapes_total, errors_total) = {
            let mut stats = self.stats.lock();
            stats.scrapes_total += 1;
            stats.errors_total += result.errors.len() as u64;
            (stats.scrapes_total, stats.errors_total)
        };
        let scraper = &self.scraper;
        let internal = [
            scraper.internal_sample(
                SCRAPES_TOTAL_METRIC,
                "Total number of times PostgreSQL was scraped for metrics.",
                SampleValue::Counter(scrapes_total as f64),
            ),
            scraper.internal_sample(
                ERRORS_TOTAL_METRIC,
                "Total number of errors recorded while scraping PostgreSQL.",
                SampleValue::Counter(errors_total as f64),
            ),
            scraper.internal_sample(
                LAST_SCRAPE_DURATION_METRIC,
                "Duration of the last scrape of metrics from PostgreSQL.",
                SampleValue::Gauge(start.elapsed().as_secs_f64()),
            ),
            scraper.internal_sample(
                LAST_SCRAPE_ERROR_METRIC,
                "Whether the last scrape of metrics from PostgreSQL resulted in an error (1 for error, 0 for success).",
                SampleValue::Gauge(if result.errors.is_empty() { 0.0 } else { 1.0 }),
            ),
        ];
        result.samples.extend(internal);

        if let Some(status) = scraper.table().user_queries() {
            let mut labels = vec![
                ("filename".to_string(), status.path.display().to_string()),
                ("hashsum".to_string(), status.hashsum.clone()),
            ];
            labels.extend(scraper.options().constant_labels.iter().cloned());
            result.push(Sample::new(
                USER_QUERIES_LOAD_ERROR_METRIC,
                "Whether the user queries file was loaded and parsed successfully (1 for error, 0 for success).",
                labels,
                SampleValue::Gauge(if status.error.is_some() { 1.0 } else { 0.0 }),
            ));
        }

        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::connection::MockConnector;
    use crate::connection::mock::MockResult;
    use crate::descriptors::{MappingOrigin, MetricKind, UserQueriesStatus, ValueRule, VersionRange};
    use crate::dsn::Dsn;
    use crate::options::DatabaseFilter;
    use std::collections::{BTreeSet, HashSet};
    use std::time::Duration;

    pub(crate) fn sizes_mapping() -> QueryMapping {
        QueryMapping::new("app_sizes", MappingOrigin::User)
            .query(VersionRange::any(), "SELECT relname, size FROM app_sizes")
            .column("relname", ColumnUsage::Label, "Relation")
            .column("size", ColumnUsage::Gauge, "Size in bytes")
    }

    fn master_mapping() -> QueryMapping {
        QueryMapping::new("app_master", MappingOrigin::User)
            .query(VersionRange::any(), "SELECT total FROM app_master")
            .column("total", ColumnUsage::Counter, "Total")
            .master(true)
    }

    pub(crate) fn scraper_with(
        connector: &MockConnector,
        mappings: Vec<QueryMapping>,
        options: ExporterOptions,
    ) -> Scraper {
        let table = DescriptorTable::from_mappings(mappings, &options, None);
        Scraper::new(
            Arc::new(table),
            Arc::new(ServerPool::new(Arc::new(connector.clone()))),
            Arc::new(options),
        )
    }

    fn no_settings() -> ExporterOptions {
        ExporterOptions {
            disable_default_metrics: true,
            disable_settings_metrics: true,
            ..Default::default()
        }
    }

    fn target(dsn: &str) -> DataSourceSpec {
        DataSourceSpec::new(Dsn::parse(dsn).unwrap())
    }

    fn sizes_rows() -> MockResult {
        MockResult::rows(&["relname", "size"], &[&["users", "8192"], &["orders", "16384"]])
    }

    fn databases_of(result: &ScrapeResult, metric: &str) -> BTreeSet<String> {
        result
            .samples_named(metric)
            .filter_map(|s| s.label(DATABASE_LABEL).map(str::to_string))
            .collect()
    }

    #[test]
    fn collect_emits_labelled_samples_and_up() {
        let connector = MockConnector::new().with_result("FROM app_sizes", sizes_rows());
        let scraper = scraper_with(&connector, vec![sizes_mapping()], no_settings());
        let exporter = Exporter::new(scraper, vec![target("host=db user=u dbname=postgres")]);

        let result = exporter.collect(&ScrapeContext::default());
        assert!(result.errors.is_empty(), "{:?}", result.errors);

        let users = result
            .samples_named("app_sizes_size")
            .find(|s| s.label("relname") == Some("users"))
            .unwrap();
        assert_eq!(users.value, SampleValue::Gauge(8192.0));
        assert_eq!(users.label(SERVER_LABEL), Some("db:5432"));

        let up = result.samples_named(UP_METRIC).next().unwrap();
        assert_eq!(up.value, SampleValue::Gauge(1.0));

        let version = result.samples_named(STATIC_METRIC).next().unwrap();
        assert_eq!(version.label("short_version"), Some("16.2"));
    }

    #[test]
    fn failing_query_does_not_suppress_other_mappings() {
        let connector = MockConnector::new()
            .with_result("FROM app_sizes", sizes_rows())
            .with_error("FROM app_master", "relation \"app_master\" does not exist");
        let scraper = scraper_with(&connector, vec![master_mapping(), sizes_mapping()], no_settings());
        let exporter = Exporter::new(scraper, vec![target("host=db user=u dbname=postgres")]);

        let result = exporter.collect(&ScrapeContext::default());
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].namespace.as_deref(), Some("app_master"));
        assert_eq!(result.samples_named("app_sizes_size").count(), 2);
        assert_eq!(
            result.samples_named(LAST_SCRAPE_ERROR_METRIC).next().unwrap().value,
            SampleValue::Gauge(1.0)
        );
        assert_eq!(
            result.samples_named(ERRORS_TOTAL_METRIC).next().unwrap().value,
            SampleValue::Counter(1.0)
        );
    }

    #[test]
    fn unreachable_target_does_not_abort_others() {
        let connector = MockConnector::new()
            .with_result("FROM app_sizes", sizes_rows())
            .refuse("down:5432");
        let scraper = scraper_with(&connector, vec![sizes_mapping()], no_settings());
        let exporter = Exporter::new(
            scraper,
            vec![
                target("host=down user=u dbname=postgres"),
                target("host=db user=u dbname=postgres"),
            ],
        );

        let result = exporter.collect(&ScrapeContext::default());
        let up: Vec<_> = result
            .samples_named(UP_METRIC)
            .map(|s| (s.label(SERVER_LABEL).unwrap().to_string(), s.value.value()))
            .collect();
        assert!(up.contains(&("down:5432".to_string(), 0.0)));
        assert!(up.contains(&("db:5432".to_string(), 1.0)));
        assert_eq!(result.samples_named("app_sizes_size").count(), 2);
        assert!(result.errors.iter().any(|e| e.server == "down:5432" && e.namespace.is_none()));
    }

    fn discovery_options(filter: DatabaseFilter) -> ExporterOptions {
        ExporterOptions {
            auto_discover_databases: true,
            database_filter: filter,
            ..no_settings()
        }
    }

    #[test]
    fn discovery_with_exclude_list() {
        let connector = MockConnector::new()
            .with_rows("FROM pg_database", &["datname"], &[&["a"], &["b"], &["c"]])
            .with_result("FROM app_sizes", sizes_rows());
        let filter = DatabaseFilter::Exclude(BTreeSet::from(["b".to_string()]));
        let scraper = scraper_with(&connector, vec![sizes_mapping()], discovery_options(filter));
        let exporter = Exporter::new(scraper, vec![target("host=db user=u dbname=a")]);

        let result = exporter.collect(&ScrapeContext::default());
        assert_eq!(
            databases_of(&result, "app_sizes_size"),
            BTreeSet::from(["a".to_string(), "c".to_string()])
        );
        assert!(!connector.connects().contains(&"b".to_string()));
    }

    #[test]
    fn discovery_excluding_templates() {
        let connector = MockConnector::new()
            .with_rows(
                "FROM pg_database",
                &["datname"],
                &[&["postgres"], &["template0"], &["template1"], &["app"]],
            )
            .with_result("FROM app_sizes", sizes_rows());
        let filter = DatabaseFilter::Exclude(BTreeSet::from([
            "template0".to_string(),
            "template1".to_string(),
        ]));
        let scraper = scraper_with(&connector, vec![sizes_mapping()], discovery_options(filter));
        let exporter = Exporter::new(scraper, vec![target("host=db user=u dbname=postgres")]);

        let result = exporter.collect(&ScrapeContext::default());
        assert_eq!(
            databases_of(&result, "app_sizes_size"),
            BTreeSet::from(["postgres".to_string(), "app".to_string()])
        );
        assert_eq!(
            databases_of(&result, UP_METRIC),
            BTreeSet::from(["postgres".to_string(), "app".to_string()])
        );
    }

    #[test]
    fn discovery_with_include_list() {
        let connector = MockConnector::new()
            .with_rows("FROM pg_database", &["datname"], &[&["a"], &["b"], &["c"]])
            .with_result("FROM app_sizes", sizes_rows());
        let filter = DatabaseFilter::Include(BTreeSet::from(["c".to_string()]));
        let scraper = scraper_with(&connector, vec![sizes_mapping()], discovery_options(filter));
        let exporter = Exporter::new(scraper, vec![target("host=db user=u dbname=a")]);

        let result = exporter.collect(&ScrapeContext::default());
        assert_eq!(
            databases_of(&result, "app_sizes_size"),
            BTreeSet::from(["a".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn master_mappings_skip_discovered_databases() {
        let connector = MockConnector::new()
            .with_rows("FROM pg_database", &["datname"], &[&["postgres"], &["app"]])
            .with_rows("FROM app_master", &["total"], &[&["7"]])
            .with_result("FROM app_sizes", sizes_rows());
        let scraper = scraper_with(
            &connector,
            vec![master_mapping(), sizes_mapping()],
            discovery_options(DatabaseFilter::All),
        );
        let exporter = Exporter::new(scraper, vec![target("host=db user=u dbname=postgres")]);

        let result = exporter.collect(&ScrapeContext::default());
        assert_eq!(
            databases_of(&result, "app_master_total"),
            BTreeSet::from(["postgres".to_string()])
        );
        assert!(
            connector
                .executed()
                .iter()
                .all(|(db, sql)| db != "app" || !sql.contains("app_master"))
        );
    }

    #[test]
    fn direct_scrape_of_a_discovered_database_counts_as_primary() {
        let connector = MockConnector::new()
            .with_rows("FROM pg_database", &["datname"], &[&["postgres"], &["app"]])
            .with_rows("FROM app_master", &["total"], &[&["7"]])
            .with_result("FROM app_sizes", sizes_rows());
        let scraper = scraper_with(
            &connector,
            vec![master_mapping(), sizes_mapping()],
            discovery_options(DatabaseFilter::All),
        );
        let exporter = Exporter::new(scraper.clone(), vec![target("host=db user=u dbname=postgres")]);
        exporter.collect(&ScrapeContext::default());

        // The pool entry for `app` was created by discovery above.
        let app = target("host=db user=u dbname=app");
        assert!(scraper.pool().get(&app.key()).is_some());

        let scrape = scraper.scrape_target(&app, &ScrapeContext::default(), None);
        assert!(scrape.connected);
        assert_eq!(
            databases_of(&scrape.result, "app_master_total"),
            BTreeSet::from(["app".to_string()])
        );
        assert_eq!(scrape.result.samples_named(STATIC_METRIC).count(), 1);
        assert_eq!(scrape.result.samples_named("app_sizes_size").count(), 2);
    }

    #[test]
    fn configured_databases_are_not_rediscovered() {
        let connector = MockConnector::new()
            .with_rows("FROM pg_database", &["datname"], &[&["postgres"], &["app"], &["c"]])
            .with_result("FROM app_sizes", sizes_rows());
        let scraper = scraper_with(&connector, vec![sizes_mapping()], discovery_options(DatabaseFilter::All));
        let exporter = Exporter::new(
            scraper,
            vec![target("host=db user=u dbname=postgres"), target("host=db user=u dbname=app")],
        );

        let result = exporter.collect(&ScrapeContext::default());
        for database in ["postgres", "app", "c"] {
            let rows = result
                .samples
                .iter()
                .filter(|s| s.name == "app_sizes_size" && s.label(DATABASE_LABEL) == Some(database))
                .count();
            assert_eq!(rows, 2, "{database}");
        }
        let c_scrapes = connector
            .executed()
            .iter()
            .filter(|(db, sql)| db == "c" && sql.contains("FROM app_sizes"))
            .count();
        assert_eq!(c_scrapes, 1);
    }

    #[test]
    fn settings_are_collected_on_primary() {
        let connector = MockConnector::new().with_rows(
            "FROM pg_settings",
            &["name", "setting", "unit", "short_desc", "vartype"],
            &[
                &["shared_buffers", "16384", "8kB", "Sets buffers", "integer"],
                &["fsync", "on", "", "Forces synchronization", "bool"],
                &["broken", "1", "parsec", "Unknown unit", "integer"],
            ],
        );
        let options = ExporterOptions {
            disable_default_metrics: true,
            ..Default::default()
        };
        let scraper = scraper_with(&connector, Vec::new(), options);
        let exporter = Exporter::new(scraper, vec![target("host=db user=u dbname=postgres")]);

        let result = exporter.collect(&ScrapeContext::default());
        let buffers = result.samples_named("pg_settings_shared_buffers_bytes").next().unwrap();
        assert_eq!(buffers.value, SampleValue::Gauge(134_217_728.0));
        assert_eq!(
            result.samples_named("pg_settings_fsync").next().unwrap().value,
            SampleValue::Gauge(1.0)
        );
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].namespace.as_deref(), Some("pg_settings"));
    }

    #[test]
    fn column_conversions() {
        let mut mapping = QueryMapping::new("app_jobs", MappingOrigin::User)
            .query(VersionRange::any(), "SELECT * FROM app_jobs")
            .column("queue", ColumnUsage::Label, "Queue")
            .column("ignored", ColumnUsage::Discard, "")
            .column("lag", ColumnUsage::Duration, "Lag")
            .column("latency", ColumnUsage::Histogram, "Latency");
        mapping.columns.push(crate::descriptors::ColumnMapping {
            name: "state".to_string(),
            usage: ColumnUsage::MappedMetric,
            description: "State".to_string(),
            mapping: [("running".to_string(), 1.0), ("paused".to_string(), 0.0)].into(),
        });

        let connector = MockConnector::new().with_result(
            "FROM app_jobs",
            MockResult::nullable_rows(
                &[
                    "queue", "ignored", "lag", "state", "latency", "latency_bucket", "latency_sum",
                    "latency_count", "extra",
                ],
                &[&[
                    Some("mail"),
                    Some("x"),
                    Some("00:00:01.5"),
                    Some("paused"),
                    Some("{0.1,1}"),
                    Some("{2,5}"),
                    Some("2.5"),
                    Some("6"),
                    None,
                ]],
            ),
        );
        let scraper = scraper_with(&connector, vec![mapping], no_settings());
        let exporter = Exporter::new(scraper, vec![target("host=db user=u dbname=postgres")]);
        let result = exporter.collect(&ScrapeContext::default());
        assert!(result.errors.is_empty(), "{:?}", result.errors);

        let lag = result.samples_named("app_jobs_lag_milliseconds").next().unwrap();
        assert_eq!(lag.value, SampleValue::Gauge(1500.0));
        assert_eq!(lag.label("queue"), Some("mail"));
        assert_eq!(
            result.samples_named("app_jobs_state").next().unwrap().value,
            SampleValue::Gauge(0.0)
        );
        assert_eq!(
            result.samples_named("app_jobs_latency").next().unwrap().value,
            SampleValue::Histogram {
                buckets: vec![(0.1, 2), (1.0, 5)],
                sum: 2.5,
                count: 6
            }
        );
        let extra = result.samples_named("app_jobs_extra").next().unwrap();
        assert_eq!(extra.help, "Unknown metric from app_jobs");
        assert!(matches!(extra.value, SampleValue::Untyped(v) if v.is_nan()));
        assert_eq!(result.samples_named("app_jobs_ignored").count(), 0);
        assert_eq!(result.samples_named("app_jobs_latency_bucket").count(), 0);
    }

    #[test]
    fn bad_values_are_recorded_per_column() {
        let connector = MockConnector::new().with_result(
            "FROM app_sizes",
            MockResult::rows(&["relname", "size"], &[&["users", "lots"], &["orders", "1"]]),
        );
        let scraper = scraper_with(&connector, vec![sizes_mapping()], no_settings());
        let exporter = Exporter::new(scraper, vec![target("host=db user=u dbname=postgres")]);

        let result = exporter.collect(&ScrapeContext::default());
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.samples_named("app_sizes_size").count(), 1);
    }

    #[test]
    fn cached_mapping_runs_once_within_ttl() {
        let mut mapping = sizes_mapping();
        mapping.cache_ttl = Some(Duration::from_secs(300));
        let connector = MockConnector::new().with_result("FROM app_sizes", sizes_rows());
        let scraper = scraper_with(&connector, vec![mapping], no_settings());
        let exporter = Exporter::new(scraper, vec![target("host=db user=u dbname=postgres")]);

        let first = exporter.collect(&ScrapeContext::default());
        let second = exporter.collect(&ScrapeContext::default());
        assert_eq!(
            first.samples_named("app_sizes_size").collect::<Vec<_>>(),
            second.samples_named("app_sizes_size").collect::<Vec<_>>()
        );
        let runs = connector
            .executed()
            .iter()
            .filter(|(_, sql)| sql.contains("FROM app_sizes"))
            .count();
        assert_eq!(runs, 1);
    }

    #[test]
    fn consecutive_collects_are_identical_apart_from_counters() {
        let connector = MockConnector::new().with_result("FROM app_sizes", sizes_rows());
        let scraper = scraper_with(&connector, vec![sizes_mapping()], no_settings());
        let exporter = Exporter::new(scraper, vec![target("host=db user=u dbname=postgres")]);

        let stable = |result: ScrapeResult| -> Vec<Sample> {
            result
                .samples
                .into_iter()
                .filter(|s| {
                    s.value.kind() != MetricKind::Counter && s.name != LAST_SCRAPE_DURATION_METRIC
                })
                .collect()
        };
        let first = exporter.collect(&ScrapeContext::default());
        let second = exporter.collect(&ScrapeContext::default());
        let first_names: HashSet<_> = first.samples.iter().map(|s| (s.name.clone(), s.labels.clone())).collect();
        let second_names: HashSet<_> = second.samples.iter().map(|s| (s.name.clone(), s.labels.clone())).collect();
        assert_eq!(first_names, second_names);
        assert_eq!(stable(first), stable(second));
    }

    #[test]
    fn every_described_metric_is_collected_with_its_labels() {
        let connector = MockConnector::new()
            .with_result("FROM app_sizes", sizes_rows())
            .with_rows("FROM app_master", &["total"], &[&["7"]])
            .with_rows(
                "FROM pg_settings",
                &["name", "setting", "unit", "short_desc", "vartype"],
                &[&["fsync", "on", "", "Forces synchronization", "bool"]],
            );
        let options = ExporterOptions {
            disable_default_metrics: true,
            constant_labels: vec![("env".to_string(), "test".to_string())],
            ..Default::default()
        };
        let table = DescriptorTable::from_mappings(
            vec![sizes_mapping(), master_mapping()],
            &options,
            Some(UserQueriesStatus {
                path: "queries.yml".into(),
                hashsum: "0123456789abcdef".to_string(),
                error: None,
            }),
        );
        let scraper = Scraper::new(
            Arc::new(table),
            Arc::new(ServerPool::new(Arc::new(connector.clone()))),
            Arc::new(options),
        );
        let exporter = Exporter::new(scraper, vec![target("host=db user=u dbname=postgres")]);
        let result = exporter.collect(&ScrapeContext::default());
        assert!(result.errors.is_empty(), "{:?}", result.errors);

        for descriptor in exporter.describe() {
            let name = descriptor.fq_name();
            let found = result.samples.iter().any(|s| {
                let name_matches = match descriptor.rule {
                    ValueRule::ServerSettings => s.name.starts_with(&format!("{name}_")),
                    _ => s.name == name,
                };
                name_matches && s.label_names() == descriptor.label_names
            });
            assert!(found, "no sample for {name} with labels {:?}", descriptor.label_names);
        }
    }

    #[test]
    fn constant_labels_and_label_overrides() {
        let connector = MockConnector::new().with_result("FROM app_sizes", sizes_rows());
        let options = ExporterOptions {
            constant_labels: vec![("env".to_string(), "prod".to_string())],
            ..no_settings()
        };
        let scraper = scraper_with(&connector, vec![sizes_mapping()], options);
        let mut spec = target("host=db user=u dbname=postgres");
        spec.labels = vec![(SERVER_LABEL.to_string(), "primary-db".to_string())];
        let exporter = Exporter::new(scraper, vec![spec]);

        let result = exporter.collect(&ScrapeContext::default());
        let sample = result.samples_named("app_sizes_size").next().unwrap();
        assert_eq!(sample.label(SERVER_LABEL), Some("primary-db"));
        assert_eq!(sample.label("env"), Some("prod"));
        let scrapes = result.samples_named(SCRAPES_TOTAL_METRIC).next().unwrap();
        assert_eq!(scrapes.labels, vec![("env".to_string(), "prod".to_string())]);
    }

    #[test]
    fn expired_deadline_records_deadline_errors() {
        let connector = MockConnector::new().with_result("FROM app_sizes", sizes_rows());
        let scraper = scraper_with(&connector, vec![sizes_mapping()], no_settings());
        let exporter = Exporter::new(scraper, vec![target("host=db user=u dbname=postgres")]);

        let result = exporter.collect(&ScrapeContext::with_timeout(Duration::ZERO));
        assert_eq!(result.samples_named("app_sizes_size").count(), 0);
        assert!(result.errors.iter().any(|e| e.message.contains("deadline")));
    }

    #[test]
    fn closed_pool_reports_targets_down() {
        let connector = MockConnector::new().with_result("FROM app_sizes", sizes_rows());
        let scraper = scraper_with(&connector, vec![sizes_mapping()], no_settings());
        let exporter = Exporter::new(scraper, vec![target("host=db user=u dbname=postgres")]);
        exporter.collect(&ScrapeContext::default());

        exporter.close();
        let result = exporter.collect(&ScrapeContext::default());
        assert_eq!(
            result.samples_named(UP_METRIC).next().unwrap().value,
            SampleValue::Gauge(0.0)
        );
        assert!(result.errors.iter().any(|e| e.message.contains("closed")));
    }

    #[test]
    fn lost_connection_stops_target_and_reconnects_next_time() {
        let connector = MockConnector::new()
            .with_result("FROM app_sizes", MockResult::LoseConnection)
            .with_rows("FROM app_master", &["total"], &[&["1"]]);
        let scraper = scraper_with(&connector, vec![master_mapping(), sizes_mapping()], no_settings());
        let exporter = Exporter::new(scraper, vec![target("host=db user=u dbname=postgres")]);

        let result = exporter.collect(&ScrapeContext::default());
        assert_eq!(
            result.samples_named(UP_METRIC).next().unwrap().value,
            SampleValue::Gauge(0.0)
        );
        exporter.collect(&ScrapeContext::default());
        assert_eq!(connector.connect_count(), 2);
    }
}
