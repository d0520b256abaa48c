//! Prometheus-compatible Metrics Collection
//!
//! Counters and duration histograms for the pull-through engine:
//! - digest cache hits/misses (global and repository-scoped)
//! - resolved-store cache hits/misses
//! - per-remote-registry operation durations and error counts
//!
//! A disabled [`Metrics`] accepts every call and records nothing.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

pub const DIGEST_CACHE_REQUESTS: &str = "relay_digest_cache_requests_total";
pub const DIGEST_CACHE_SCOPED_REQUESTS: &str = "relay_digest_cache_scoped_requests_total";
pub const RESOLVED_STORE_CACHE_REQUESTS: &str = "relay_resolved_store_cache_requests_total";
pub const REMOTE_REQUEST_DURATION: &str = "relay_pullthrough_request_duration_seconds";
pub const REMOTE_ERRORS: &str = "relay_pullthrough_errors_total";

/// Types of metrics
#[derive(Debug, Clone)]
pub enum MetricValue {
    /// Counter (monotonically increasing)
    Counter(f64),
    /// Histogram (distribution of values)
    Histogram(HistogramValue),
}

/// Histogram value with buckets
#[derive(Debug, Clone)]
pub struct HistogramValue {
    /// Sum of all observations
    pub sum: f64,
    /// Count of observations
    pub count: u64,
    /// Bucket counts (le -> count)
    pub buckets: Vec<(f64, u64)>,
}

impl HistogramValue {
    /// Create a new histogram with default (seconds) buckets
    pub fn new() -> Self {
        Self::with_buckets(&[0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0])
    }

    /// Create a histogram with custom buckets
    pub fn with_buckets(buckets: &[f64]) -> Self {
        Self {
            sum: 0.0,
            count: 0,
            buckets: buckets.iter().map(|&b| (b, 0)).collect(),
        }
    }

    /// Observe a value
    pub fn observe(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;

        for (le, count) in &mut self.buckets {
            if value <= *le {
                *count += 1;
            }
        }
    }
}

impl Default for HistogramValue {
    fn default() -> Self {
        Self::new()
    }
}

/// A single metric series with labels
#[derive(Debug, Clone)]
pub struct Metric {
    pub name: String,
    pub help: String,
    pub value: MetricValue,
    pub labels: BTreeMap<String, String>,
}

/// Snapshot of all collected series
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Series keyed by name plus labels
    pub metrics: HashMap<String, Metric>,
}

impl MetricsSnapshot {
    /// Value of a counter series, looked up by name and exact label set.
    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.metrics
            .get(&series_key(name, &label_map(labels)))
            .and_then(|m| match &m.value {
                MetricValue::Counter(v) => Some(*v),
                _ => None,
            })
    }

    pub fn histogram(&self, name: &str, labels: &[(&str, &str)]) -> Option<&HistogramValue> {
        self.metrics
            .get(&series_key(name, &label_map(labels)))
            .and_then(|m| match &m.value {
                MetricValue::Histogram(h) => Some(h),
                _ => None,
            })
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Format as Prometheus text format
    pub fn to_prometheus_text(&self) -> String {
        let mut by_name: BTreeMap<&str, Vec<&Metric>> = BTreeMap::new();
        for metric in self.metrics.values() {
            by_name.entry(metric.name.as_str()).or_default().push(metric);
        }

        let mut output = String::new();
        for (name, mut series) in by_name {
            series.sort_by(|a, b| a.labels.cmp(&b.labels));

            let type_str = match &series[0].value {
                MetricValue::Counter(_) => "counter",
                MetricValue::Histogram(_) => "histogram",
            };
            output.push_str(&format!("# HELP {} {}\n", name, series[0].help));
            output.push_str(&format!("# TYPE {} {}\n", name, type_str));

            for metric in series {
                let pairs: Vec<_> = metric
                    .labels
                    .iter()
                    .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
                    .collect();
                let labels_str = if pairs.is_empty() {
                    String::new()
                } else {
                    format!("{{{}}}", pairs.join(","))
                };

                match &metric.value {
                    MetricValue::Counter(v) => {
                        output.push_str(&format!("{}{} {}\n", name, labels_str, v));
                    }
                    MetricValue::Histogram(h) => {
                        for (le, count) in &h.buckets {
                            let mut bucket_labels = pairs.clone();
                            bucket_labels.push(format!("le=\"{}\"", le));
                            output.push_str(&format!(
                                "{}_bucket{{{}}} {}\n",
                                name,
                                bucket_labels.join(","),
                                count
                            ));
                        }
                        let mut inf_labels = pairs.clone();
                        inf_labels.push("le=\"+Inf\"".to_string());
                        output.push_str(&format!(
                            "{}_bucket{{{}}} {}\n",
                            name,
                            inf_labels.join(","),
                            h.count
                        ));
                        output.push_str(&format!("{}_sum{} {}\n", name, labels_str, h.sum));
                        output.push_str(&format!("{}_count{} {}\n", name, labels_str, h.count));
                    }
                }
            }
        }

        output
    }
}

fn label_map(labels: &[(&str, &str)]) -> BTreeMap<String, String> {
    labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn series_key(name: &str, labels: &BTreeMap<String, String>) -> String {
    format!("{}:{:?}", name, labels)
}

/// Metrics collector shared by every request of a server instance.
#[derive(Debug)]
pub struct Metrics {
    enabled: bool,
    metrics: Mutex<HashMap<String, Metric>>,
}

impl Metrics {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            metrics: Mutex::new(HashMap::new()),
        }
    }

    /// A collector that records nothing.
    pub fn disabled() -> Self {
        Self::new(false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Metric>> {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Increment a counter
    pub fn increment_counter(&self, name: &str, help: &str, labels: &[(&str, &str)]) {
        if !self.enabled {
            return;
        }

        let labels = label_map(labels);
        let key = series_key(name, &labels);
        let mut metrics = self.lock();
        let metric = metrics.entry(key).or_insert_with(|| Metric {
            name: name.to_string(),
            help: help.to_string(),
            value: MetricValue::Counter(0.0),
            labels,
        });

        if let MetricValue::Counter(v) = &mut metric.value {
            *v += 1.0;
        }
    }

    /// Record a duration, in seconds, into a histogram series
    pub fn record_duration(&self, name: &str, help: &str, duration: Duration, labels: &[(&str, &str)]) {
        if !self.enabled {
            return;
        }

        let labels = label_map(labels);
        let key = series_key(name, &labels);
        let mut metrics = self.lock();
        let metric = metrics.entry(key).or_insert_with(|| Metric {
            name: name.to_string(),
            help: help.to_string(),
            value: MetricValue::Histogram(HistogramValue::new()),
            labels,
        });

        if let MetricValue::Histogram(h) = &mut metric.value {
            h.observe(duration.as_secs_f64());
        }
    }

    pub fn digest_cache(&self, hit: bool) {
        self.increment_counter(
            DIGEST_CACHE_REQUESTS,
            "Digest cache lookups",
            &[("type", hit_label(hit))],
        );
    }

    pub fn digest_cache_scoped(&self, hit: bool) {
        self.increment_counter(
            DIGEST_CACHE_SCOPED_REQUESTS,
            "Repository-scoped digest cache lookups",
            &[("type", hit_label(hit))],
        );
    }

    pub fn resolved_store_cache(&self, hit: bool) {
        self.increment_counter(
            RESOLVED_STORE_CACHE_REQUESTS,
            "Lookups of the last remote store that served a digest",
            &[("type", hit_label(hit))],
        );
    }

    /// Record one call against a remote registry. `error_code` is set when
    /// the call failed.
    pub fn remote_operation(
        &self,
        registry: &str,
        operation: &str,
        duration: Duration,
        error_code: Option<&str>,
    ) {
        if !self.enabled {
            return;
        }
        let registry = registry.to_lowercase();
        self.record_duration(
            REMOTE_REQUEST_DURATION,
            "Duration of calls to remote registries",
            duration,
            &[("registry", &registry), ("operation", operation)],
        );
        if let Some(code) = error_code {
            self.increment_counter(
                REMOTE_ERRORS,
                "Failed calls to remote registries",
                &[("registry", &registry), ("operation", operation), ("code", code)],
            );
        }
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            metrics: self.lock().clone(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::disabled()
    }
}

fn hit_label(hit: bool) -> &'static str {
    if hit {
        "Hit"
    } else {
        "Miss"
    }
}

/// Escape a label value for the text exposition format.
fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}
