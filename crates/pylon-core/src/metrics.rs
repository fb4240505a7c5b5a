//! Metrics sink abstraction and an in-memory recorder.
//!
//! The metrics middleware and the stats poller report through
//! [`MetricsSink`]. [`MetricsRecorder`] keeps everything in memory and can
//! render it in the Prometheus text format; [`NoopSink`] drops everything.

pub mod prometheus;

use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::OperationError;
use crate::kind::BackendKind;

pub use prometheus::render_prometheus;

/// Histogram bucket upper bounds, in milliseconds.
pub const DURATION_BUCKETS_MS: [f64; 12] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

/// Whether an operation counts as a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Outcome {
    Ok,
    Error,
}

impl Outcome {
    /// Classify an operation result. Not-found is a success.
    pub fn of<T>(result: &Result<T, OperationError>) -> Self {
        match result {
            Err(err) if err.is_failure() => Outcome::Error,
            _ => Outcome::Ok,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::Error => "error",
        }
    }
}

/// Labels attached to request counters and duration histograms.
#[derive(Clone, Copy, Debug)]
pub struct RequestLabels<'a> {
    pub kind: BackendKind,
    pub name: &'a str,
    pub address: &'a str,
    pub command: &'a str,
}

/// Labels attached to pool gauges.
#[derive(Clone, Copy, Debug)]
pub struct GaugeLabels<'a> {
    pub kind: BackendKind,
    pub name: &'a str,
    pub address: &'a str,
    pub metric: &'a str,
}

/// Destination for request metrics and pool gauges.
pub trait MetricsSink: Send + Sync + std::fmt::Debug {
    fn inc_requests(&self, labels: &RequestLabels<'_>, outcome: Outcome);
    fn observe_duration(&self, labels: &RequestLabels<'_>, elapsed: Duration);
    fn set_gauge(&self, labels: &GaugeLabels<'_>, value: f64);
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn inc_requests(&self, _labels: &RequestLabels<'_>, _outcome: Outcome) {}
    fn observe_duration(&self, _labels: &RequestLabels<'_>, _elapsed: Duration) {}
    fn set_gauge(&self, _labels: &GaugeLabels<'_>, _value: f64) {}
}

/// Owned request label set, used as a map key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct RequestKey {
    pub kind: BackendKind,
    pub name: String,
    pub address: String,
    pub command: String,
}

impl From<&RequestLabels<'_>> for RequestKey {
    fn from(labels: &RequestLabels<'_>) -> Self {
        Self {
            kind: labels.kind,
            name: labels.name.to_string(),
            address: labels.address.to_string(),
            command: labels.command.to_string(),
        }
    }
}

/// Owned gauge label set, used as a map key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct GaugeKey {
    pub kind: BackendKind,
    pub name: String,
    pub address: String,
    pub metric: String,
}

/// Fixed-bucket latency histogram.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Histogram {
    /// Cumulative counts per entry of [`DURATION_BUCKETS_MS`].
    pub buckets: [u64; DURATION_BUCKETS_MS.len()],
    pub count: u64,
    pub sum_ms: f64,
}

impl Histogram {
    fn observe(&mut self, ms: f64) {
        for (slot, bound) in self.buckets.iter_mut().zip(DURATION_BUCKETS_MS) {
            if ms <= bound {
                *slot += 1;
            }
        }
        self.count += 1;
        self.sum_ms += ms;
    }
}

/// Point-in-time copy of everything a [`MetricsRecorder`] holds.
#[derive(Clone, Debug, Default)]
pub struct MetricsSnapshot {
    pub requests: BTreeMap<(RequestKey, Outcome), u64>,
    pub durations: BTreeMap<RequestKey, Histogram>,
    pub gauges: BTreeMap<GaugeKey, f64>,
}

#[derive(Debug, Default)]
struct RecorderState {
    requests: BTreeMap<(RequestKey, Outcome), u64>,
    durations: BTreeMap<RequestKey, Histogram>,
    gauges: BTreeMap<GaugeKey, f64>,
}

/// In-memory sink with counters, histograms and gauges.
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    state: Mutex<RecorderState>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock();
        MetricsSnapshot {
            requests: state.requests.clone(),
            durations: state.durations.clone(),
            gauges: state.gauges.clone(),
        }
    }

    pub fn render_prometheus(&self) -> String {
        render_prometheus(&self.snapshot())
    }

    /// Requests counted for instance `name`, across commands and outcomes.
    pub fn requests_for(&self, name: &str) -> u64 {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|((key, _), _)| key.name == name)
            .map(|(_, count)| *count)
            .sum()
    }

    /// Requests counted for `name`/`command` with the given outcome.
    pub fn request_count(&self, name: &str, command: &str, outcome: Outcome) -> u64 {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|((key, o), _)| key.name == name && key.command == command && *o == outcome)
            .map(|(_, count)| *count)
            .sum()
    }

    /// Durations observed for `name`/`command`.
    pub fn duration_count(&self, name: &str, command: &str) -> u64 {
        self.state
            .lock()
            .durations
            .iter()
            .filter(|(key, _)| key.name == name && key.command == command)
            .map(|(_, h)| h.count)
            .sum()
    }

    /// Latest value of a pool gauge for instance `name`.
    pub fn gauge(&self, name: &str, metric: &str) -> Option<f64> {
        self.state
            .lock()
            .gauges
            .iter()
            .find(|(key, _)| key.name == name && key.metric == metric)
            .map(|(_, v)| *v)
    }

    /// Whether instance `name` produced any sample at all.
    pub fn has_samples_for(&self, name: &str) -> bool {
        let state = self.state.lock();
        state.requests.keys().any(|(key, _)| key.name == name)
            || state.durations.keys().any(|key| key.name == name)
            || state.gauges.keys().any(|key| key.name == name)
    }

    pub fn clear(&self) {
        *self.state.lock() = RecorderState::default();
    }
}

impl MetricsSink for MetricsRecorder {
    fn inc_requests(&self, labels: &RequestLabels<'_>, outcome: Outcome) {
        *self
            .state
            .lock()
            .requests
            .entry((RequestKey::from(labels), outcome))
            .or_insert(0) += 1;
    }

    fn observe_duration(&self, labels: &RequestLabels<'_>, elapsed: Duration) {
        self.state
            .lock()
            .durations
            .entry(RequestKey::from(labels))
            .or_default()
            .observe(elapsed.as_secs_f64() * 1000.0);
    }

    fn set_gauge(&self, labels: &GaugeLabels<'_>, value: f64) {
        let key = GaugeKey {
            kind: labels.kind,
            name: labels.name.to_string(),
            address: labels.address.to_string(),
            metric: labels.metric.to_string(),
        };
        self.state.lock().gauges.insert(key, value);
    }
}
