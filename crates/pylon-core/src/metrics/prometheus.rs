//! Prometheus text exposition format.
//!
//! Renders a [`MetricsSnapshot`] for scraping by a Prometheus server or a
//! compatible agent.

use std::fmt::Write;

use super::{DURATION_BUCKETS_MS, MetricsSnapshot, RequestKey};

/// Render a metrics snapshot into Prometheus text format.
///
/// Produces one COUNTER, one HISTOGRAM and one GAUGE family labelled with
/// `component`, `name` and `addr`.
pub fn render_prometheus(snapshot: &MetricsSnapshot) -> String {
    let mut out = String::new();

    out.push_str("# HELP db_client_requests_total Backend operations by command and outcome.\n");
    out.push_str("# TYPE db_client_requests_total counter\n");
    for ((key, outcome), count) in &snapshot.requests {
        let _ = writeln!(
            out,
            "db_client_requests_total{{{},cmd=\"{}\",code=\"{}\"}} {}",
            base_labels(key),
            escape(&key.command),
            outcome.as_str(),
            count
        );
    }

    out.push_str("# HELP db_client_requests_duration_ms Backend operation latency in milliseconds.\n");
    out.push_str("# TYPE db_client_requests_duration_ms histogram\n");
    for (key, hist) in &snapshot.durations {
        let labels = format!("{},cmd=\"{}\"", base_labels(key), escape(&key.command));
        for (bound, count) in DURATION_BUCKETS_MS.iter().zip(hist.buckets) {
            let _ = writeln!(
                out,
                "db_client_requests_duration_ms_bucket{{{labels},le=\"{bound}\"}} {count}"
            );
        }
        let _ = writeln!(
            out,
            "db_client_requests_duration_ms_bucket{{{labels},le=\"+Inf\"}} {}",
            hist.count
        );
        let _ = writeln!(
            out,
            "db_client_requests_duration_ms_sum{{{labels}}} {:.3}",
            hist.sum_ms
        );
        let _ = writeln!(
            out,
            "db_client_requests_duration_ms_count{{{labels}}} {}",
            hist.count
        );
    }

    out.push_str("# HELP db_client_pool_stats Connection pool counters.\n");
    out.push_str("# TYPE db_client_pool_stats gauge\n");
    for (key, value) in &snapshot.gauges {
        let _ = writeln!(
            out,
            "db_client_pool_stats{{component=\"{}\",name=\"{}\",addr=\"{}\",metric=\"{}\"}} {}",
            key.kind,
            escape(&key.name),
            escape(&key.address),
            escape(&key.metric),
            value
        );
    }

    out
}

fn base_labels(key: &RequestKey) -> String {
    format!(
        "component=\"{}\",name=\"{}\",addr=\"{}\"",
        key.kind,
        escape(&key.name),
        escape(&key.address)
    )
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::super::{GaugeLabels, MetricsRecorder, MetricsSink, Outcome, RequestLabels};
    use super::*;
    use crate::kind::BackendKind;
    use std::time::Duration;

    fn recorder() -> MetricsRecorder {
        let rec = MetricsRecorder::new();
        let labels = RequestLabels {
            kind: BackendKind::Redis,
            name: "default",
            address: "127.0.0.1:6379",
            command: "GET",
        };
        rec.inc_requests(&labels, Outcome::Ok);
        rec.observe_duration(&labels, Duration::from_millis(12));
        rec.set_gauge(
            &GaugeLabels {
                kind: BackendKind::Redis,
                name: "default",
                address: "127.0.0.1:6379",
                metric: "idle",
            },
            4.0,
        );
        rec
    }

    #[test]
    fn render_empty() {
        let output = render_prometheus(&MetricsSnapshot::default());
        assert!(output.contains("# TYPE db_client_requests_total counter"));
        assert!(output.contains("# TYPE db_client_requests_duration_ms histogram"));
        assert!(output.contains("# TYPE db_client_pool_stats gauge"));
    }

    #[test]
    fn render_all_families() {
        let output = recorder().render_prometheus();
        assert!(output.contains(
            "db_client_requests_total{component=\"redis\",name=\"default\",addr=\"127.0.0.1:6379\",cmd=\"GET\",code=\"ok\"} 1"
        ));
        assert!(output.contains("le=\"25\"} 1"));
        assert!(output.contains("le=\"10\"} 0"));
        assert!(output.contains("le=\"+Inf\"} 1"));
        assert!(output.contains("db_client_requests_duration_ms_count{"));
        assert!(output.contains(
            "db_client_pool_stats{component=\"redis\",name=\"default\",addr=\"127.0.0.1:6379\",metric=\"idle\"} 4"
        ));
    }

    #[test]
    fn render_format_is_prometheus_compatible() {
        let output = recorder().render_prometheus();
        for line in output.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            assert!(
                line.contains('{') && line.contains('}'),
                "line should have labels: {line}"
            );
        }
    }

    #[test]
    fn label_values_are_escaped() {
        assert_eq!(escape("a\"b\\c"), "a\\\"b\\\\c");
    }
}
