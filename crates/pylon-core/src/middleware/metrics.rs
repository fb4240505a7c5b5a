//! Request counters and latency histograms.

use std::sync::Arc;
use std::time::Instant;

use super::{Handler, InstanceLabels, Middleware, handler_fn};
use crate::metrics::{MetricsSink, Outcome, RequestLabels};
use crate::operation::Operation;

#[derive(Debug, Clone)]
pub struct Metrics {
    labels: Arc<InstanceLabels>,
    sink: Arc<dyn MetricsSink>,
}

impl Metrics {
    pub fn new(labels: Arc<InstanceLabels>, sink: Arc<dyn MetricsSink>) -> Self {
        Self { labels, sink }
    }
}

impl Middleware for Metrics {
    fn name(&self) -> &str {
        "metrics"
    }

    fn wrap(&self, next: Handler) -> Handler {
        let labels = self.labels.clone();
        let sink = self.sink.clone();
        handler_fn(move |cancel, op: Operation| {
            let next = next.clone();
            let labels = labels.clone();
            let sink = sink.clone();
            async move {
                let command = op.name.clone();
                let start = Instant::now();
                let result = next(cancel, op).await;
                let elapsed = start.elapsed();

                let request = RequestLabels {
                    kind: labels.kind,
                    name: &labels.name,
                    address: &labels.address,
                    command: &command,
                };
                sink.inc_requests(&request, Outcome::of(&result));
                sink.observe_duration(&request, elapsed);
                result
            }
        })
    }
}
