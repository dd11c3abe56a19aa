//! Scrape results and their conversion to exposition families.

use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

use prometheus::proto::{self, MetricType};
use tracing::debug;

use crate::descriptors::MetricKind;

#[derive(Debug, Clone, PartialEq)]
pub enum SampleValue {
    Counter(f64),
    Gauge(f64),
    Untyped(f64),
    Histogram {
        /// `(upper bound, cumulative count)`, ascending.
        buckets: Vec<(f64, u64)>,
        sum: f64,
        count: u64,
    },
}

impl SampleValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            SampleValue::Counter(_) => MetricKind::Counter,
            SampleValue::Gauge(_) => MetricKind::Gauge,
            SampleValue::Untyped(_) => MetricKind::Untyped,
            SampleValue::Histogram { .. } => MetricKind::Histogram,
        }
    }

    /// Scalar value; histograms report their sample count.
    pub fn value(&self) -> f64 {
        match self {
            SampleValue::Counter(v) | SampleValue::Gauge(v) | SampleValue::Untyped(v) => *v,
            SampleValue::Histogram { count, .. } => *count as f64,
        }
    }
}

/// One series value.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub help: String,
    pub labels: Vec<(String, String)>,
    pub value: SampleValue,
}

impl Sample {
    pub fn new(name: &str, help: &str, labels: Vec<(String, String)>, value: SampleValue) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            labels,
            value,
        }
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn label_names(&self) -> Vec<&str> {
        self.labels.iter().map(|(n, _)| n.as_str()).collect()
    }
}

/// A failure recorded during a scrape.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeError {
    /// `host:port` of the target.
    pub server: String,
    pub database: Option<String>,
    /// Query mapping namespace; `None` for target-level failures.
    pub namespace: Option<String>,
    pub message: String,
}

/// Samples and errors of one collect call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScrapeResult {
    pub samples: Vec<Sample>,
    pub errors: Vec<ScrapeError>,
}

impl ScrapeResult {
    pub fn push(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    pub fn record_error(&mut self, error: ScrapeError) {
        self.errors.push(error);
    }

    pub fn merge(&mut self, other: ScrapeResult) {
        self.samples.extend(other.samples);
        self.errors.extend(other.errors);
    }

    pub fn samples_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Sample> {
        self.samples.iter().filter(move |s| s.name == name)
    }

    /// Groups samples into families, sorted by name. Empty families are never
    /// produced and the first of two identical series wins.
    pub fn metric_families(&self) -> Vec<proto::MetricFamily> {
        let mut families: BTreeMap<&str, proto::MetricFamily> = BTreeMap::new();
        let mut series: HashSet<(&str, &[(String, String)])> = HashSet::new();

        for sample in &self.samples {
            if !series.insert((sample.name.as_str(), sample.labels.as_slice())) {
                debug!(metric = %sample.name, labels = ?sample.labels, "dropping duplicate series");
                continue;
            }
            let family = families.entry(sample.name.as_str()).or_insert_with(|| {
                let mut family = proto::MetricFamily::default();
                family.set_name(sample.name.clone());
                family.set_help(sample.help.clone());
                family.set_field_type(metric_type(sample.value.kind()));
                family
            });
            if family.get_field_type() != metric_type(sample.value.kind()) {
                debug!(metric = %sample.name, "dropping sample with conflicting type");
                continue;
            }
            family.mut_metric().push(to_metric(sample));
        }

        families.into_values().collect()
    }
}

/// The text encoder has no untyped exposition, so untyped values go out as
/// gauges.
fn metric_type(kind: MetricKind) -> MetricType {
    match kind {
        MetricKind::Counter => MetricType::COUNTER,
        MetricKind::Gauge | MetricKind::Untyped => MetricType::GAUGE,
        MetricKind::Histogram => MetricType::HISTOGRAM,
    }
}

fn to_metric(sample: &Sample) -> proto::Metric {
    let mut metric = proto::Metric::default();
    for (name, value) in &sample.labels {
        let mut pair = proto::LabelPair::default();
        pair.set_name(name.clone());
        pair.set_value(value.clone());
        metric.mut_label().push(pair);
    }

    match &sample.value {
        SampleValue::Counter(v) => {
            let mut counter = proto::Counter::default();
            counter.set_value(*v);
            metric.set_counter(counter);
        }
        SampleValue::Gauge(v) | SampleValue::Untyped(v) => {
            let mut gauge = proto::Gauge::default();
            gauge.set_value(*v);
            metric.set_gauge(gauge);
        }
        SampleValue::Histogram {
            buckets,
            sum,
            count,
        } => {
            let mut histogram = proto::Histogram::default();
            histogram.set_sample_sum(*sum);
            histogram.set_sample_count(*count);
            for (upper_bound, cumulative) in buckets {
                let mut bucket = proto::Bucket::default();
                bucket.set_upper_bound(*upper_bound);
                bucket.set_cumulative_count(*cumulative);
                histogram.mut_bucket().push(bucket);
            }
            metric.set_histogram(histogram);
        }
    }
    metric
}

/// Per-scrape execution parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScrapeContext {
    pub deadline: Option<Instant>,
}

impl ScrapeContext {
    /// A timeout too large to represent as an instant means no deadline.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now().checked_add(timeout),
        }
    }

    /// Time left before the deadline; `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_some_and(|r| r.is_zero())
    }
}
