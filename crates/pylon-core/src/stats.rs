//! Periodic pool-stats export.
//!
//! One poller per component. Every interval it walks the registry, reads each
//! instance's pool counters and reports them as gauges. It runs until its
//! cancellation token fires and never exits on its own.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::{GaugeLabels, MetricsSink};
use crate::registry::Registry;

pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct StatsPoller {
    registry: Arc<Registry>,
    sink: Arc<dyn MetricsSink>,
    interval: Duration,
}

impl StatsPoller {
    pub fn new(registry: Arc<Registry>, sink: Arc<dyn MetricsSink>, interval: Duration) -> Self {
        Self {
            registry,
            sink,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sample every registered instance once. Returns how many were exported.
    pub fn sample_once(&self) -> usize {
        self.sample_pass(None)
    }

    fn sample_pass(&self, cancel: Option<&CancellationToken>) -> usize {
        let mut exported = 0;
        for instance in self.registry.snapshot() {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                break;
            }
            if instance.options().disable_metric {
                continue;
            }
            match instance.pool_stats() {
                Ok(stats) => {
                    for (metric, value) in stats.samples() {
                        self.sink.set_gauge(
                            &GaugeLabels {
                                kind: instance.kind(),
                                name: instance.name(),
                                address: instance.address(),
                                metric,
                            },
                            value,
                        );
                    }
                    exported += 1;
                }
                Err(e) => {
                    warn!(
                        kind = %instance.kind(),
                        name = instance.name(),
                        error = %e,
                        "failed to read pool stats"
                    );
                }
            }
        }
        exported
    }

    /// Run until `cancel` fires. The first sample is taken one interval after start.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            kind = %self.registry.kind(),
            interval_ms = self.interval.as_millis() as u64,
            "stats poller started"
        );

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(kind = %self.registry.kind(), "stats poller shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let exported = self.sample_pass(Some(&cancel));
                    debug!(kind = %self.registry.kind(), exported, "pool stats sampled");
                }
            }
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}
