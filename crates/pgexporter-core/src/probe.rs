//! Multi-target probing (`/probe?target=...`).
//!
//! A probe resolves its target per request and scrapes it with the shared
//! [`Scraper`]: same pool, same descriptor table. Nothing about the probe is
//! registered anywhere, so the default exporter's output is unaffected.

use std::time::Instant;

use tracing::{debug, warn};

use crate::collector::{MetricCollector, Scraper};
use crate::datasource::{DataSourceResolver, DataSourceSpec};
use crate::descriptors::{MetricDescriptor, MetricKind, ValueRule};
use crate::error::DataSourceError;
use crate::scrape::{Sample, SampleValue, ScrapeContext, ScrapeError, ScrapeResult};

pub const PROBE_SUCCESS_METRIC: &str = "probe_success";
pub const PROBE_DURATION_METRIC: &str = "probe_duration_seconds";

/// Collector bound to one caller-supplied target.
pub struct ProbeCollector {
    scraper: Scraper,
    target: String,
    resolved: Result<DataSourceSpec, DataSourceError>,
}

impl ProbeCollector {
    /// Resolves `target` (with an optional auth module name). A resolution
    /// failure is not an error here: it is reported by [`collect`] as a failed
    /// probe.
    ///
    /// [`collect`]: MetricCollector::collect
    pub fn new(scraper: Scraper, resolver: &DataSourceResolver, target: &str, auth_module: Option<&str>) -> Self {
        let resolved = resolver.resolve_target(target, auth_module);
        match &resolved {
            Ok(spec) => debug!(target = %target, dsn = %spec.dsn, "probe target resolved"),
            Err(e) => warn!(target = %target, error = %e, "probe target could not be resolved"),
        }
        Self {
            scraper,
            target: target.to_string(),
            resolved,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn resolved(&self) -> Result<&DataSourceSpec, &DataSourceError> {
        self.resolved.as_ref()
    }
}

fn probe_descriptor(name: &str, help: &str) -> MetricDescriptor {
    MetricDescriptor {
        namespace: name.to_string(),
        subsystem: String::new(),
        name: String::new(),
        help: help.to_string(),
        kind: MetricKind::Gauge,
        label_names: Vec::new(),
        query: None,
        rule: ValueRule::Internal,
        cache_ttl: None,
    }
}

impl MetricCollector for ProbeCollector {
    fn describe(&self) -> Vec<MetricDescriptor> {
        let mut descriptors = self.scraper.table().describe().to_vec();
        descriptors.push(probe_descriptor(
            PROBE_SUCCESS_METRIC,
            "Whether the probe target could be resolved and connected to.",
        ));
        descriptors.push(probe_descriptor(PROBE_DURATION_METRIC, "Duration of the probe in seconds."));
        descriptors
    }

    fn collect(&self, ctx: &ScrapeContext) -> ScrapeResult {
        let start = Instant::now();

        let (mut result, success) = match &self.resolved {
            Ok(spec) => {
                let scrape = self.scraper.scrape_target(spec, ctx, None);
                (scrape.result, scrape.connected)
            }
            Err(e) => {
                let mut result = ScrapeResult::default();
                result.record_error(ScrapeError {
                    server: self.target.clone(),
                    database: None,
                    namespace: None,
                    message: e.to_string(),
                });
                (result, false)
            }
        };

        for error in &result.errors {
            warn!(
                target = %self.target,
                namespace = error.namespace.as_deref().unwrap_or_default(),
                error = %error.message,
                "probe error"
            );
        }

        result.push(Sample::new(
            PROBE_SUCCESS_METRIC,
            "Whether the probe target could be resolved and connected to.",
            Vec::new(),
            SampleValue::Gauge(if success { 1.0 } else { 0.0 }),
        ));
        result.push(Sample::new(
            PROBE_DURATION_METRIC,
            "Duration of the probe in seconds.",
            Vec::new(),
            SampleValue::Gauge(start.elapsed().as_secs_f64()),
        ));
        result
    }
}
