//! Driver capability traits.
//!
//! A [`Driver`] knows how to open a pooled [`Connection`] to one [`Target`].
//! Everything backend-specific lives behind these two traits; the rest of the
//! crate only composes, instruments and tracks them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{DriverError, OperationError, StatSampleError};
use crate::operation::{Operation, Reply};
use crate::target::Target;

/// Opens connections for one or more backend kinds.
#[async_trait]
pub trait Driver: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    async fn open(&self, target: &Target) -> Result<Arc<dyn Connection>, DriverError>;
}

/// A live, pooled handle to one logical backend instance.
#[async_trait]
pub trait Connection: Send + Sync + std::fmt::Debug {
    /// Run one operation. Must honour `cancel`.
    async fn execute(&self, cancel: CancellationToken, op: Operation) -> Result<Reply, OperationError>;

    /// Liveness round-trip.
    async fn ping(&self) -> Result<(), DriverError>;

    fn pool_stats(&self) -> Result<PoolStats, StatSampleError>;

    /// Release every pooled resource. Later calls fail with [`DriverError::Closed`].
    async fn close(&self) -> Result<(), DriverError>;
}

/// Point-in-time pool counters.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PoolStats {
    pub open: u64,
    pub idle: u64,
    pub in_use: u64,
    pub wait_count: u64,
    pub wait_duration: Duration,
    pub max_idle_closed: u64,
    pub max_lifetime_closed: u64,
    pub hits: u64,
    pub misses: u64,
    pub timeouts: u64,
}

impl PoolStats {
    /// Metric name and value pairs, in export order.
    pub fn samples(&self) -> [(&'static str, f64); 10] {
        [
            ("open", self.open as f64),
            ("idle", self.idle as f64),
            ("in_use", self.in_use as f64),
            ("wait_count", self.wait_count as f64),
            ("wait_duration_ms", self.wait_duration.as_secs_f64() * 1000.0),
            ("max_idle_closed", self.max_idle_closed as f64),
            ("max_lifetime_closed", self.max_lifetime_closed as f64),
            ("hits", self.hits as f64),
            ("misses", self.misses as f64),
            ("timeouts", self.timeouts as f64),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_cover_every_counter() {
        let stats = PoolStats {
            open: 3,
            idle: 2,
            in_use: 1,
            wait_duration: Duration::from_millis(1500),
            ..PoolStats::default()
        };
        let samples = stats.samples();
        assert_eq!(samples.len(), 10);
        assert_eq!(samples[0], ("open", 3.0));
        assert_eq!(samples[4], ("wait_duration_ms", 1500.0));
    }
}
