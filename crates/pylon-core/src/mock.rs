//! In-memory driver for tests and examples.
//!
//! Behaviour is scripted per instance name (`fail_open`, `fail_ping`, ...) and
//! per operation name (`reply`). Every opened connection is kept so tests can
//! inspect what ran against it and whether it was closed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::driver::{Connection, Driver, PoolStats};
use crate::error::{DriverError, OperationError, StatSampleError};
use crate::middleware::HandlerResult;
use crate::operation::{Operation, Reply};
use crate::target::Target;

#[derive(Debug, Clone, Default)]
struct Behavior {
    fail_open: bool,
    fail_ping: bool,
    ping_delay: Option<Duration>,
    fail_close: bool,
    fail_stats: bool,
}

type Replies = Arc<Mutex<HashMap<String, HandlerResult>>>;

#[derive(Debug, Default)]
pub struct MockDriver {
    behaviors: Mutex<HashMap<String, Behavior>>,
    replies: Replies,
    opened: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, name: &str, f: impl FnOnce(&mut Behavior)) {
        f(self.behaviors.lock().entry(name.to_string()).or_default());
    }

    pub fn fail_open(&self, name: &str) {
        self.update(name, |b| b.fail_open = true);
    }

    pub fn fail_ping(&self, name: &str) {
        self.update(name, |b| b.fail_ping = true);
    }

    pub fn slow_ping(&self, name: &str, delay: Duration) {
        self.update(name, |b| b.ping_delay = Some(delay));
    }

    pub fn fail_close(&self, name: &str) {
        self.update(name, |b| b.fail_close = true);
    }

    pub fn fail_stats(&self, name: &str) {
        self.update(name, |b| b.fail_stats = true);
    }

    /// Script the result of every operation called `op`.
    pub fn reply(&self, op: &str, result: HandlerResult) {
        self.replies.lock().insert(op.to_string(), result);
    }

    pub fn open_count(&self) -> usize {
        self.opened.lock().len()
    }

    /// Most recently opened connection for instance `name`.
    pub fn connection(&self, name: &str) -> Option<Arc<MockConnection>> {
        self.opened
            .lock()
            .iter()
            .rev()
            .find(|c| c.name == name)
            .cloned()
    }

    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.opened.lock().clone()
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn name(&self) -> &str {
        "mock"
    }

    async fn open(&self, target: &Target) -> Result<Arc<dyn Connection>, DriverError> {
        let behavior = self
            .behaviors
            .lock()
            .get(&target.name)
            .cloned()
            .unwrap_or_default();
        if behavior.fail_open {
            return Err(DriverError::Other(format!("connection refused: {}", target.address_label())));
        }
        let conn = Arc::new(MockConnection {
            name: target.name.clone(),
            target: target.clone(),
            behavior,
            replies: self.replies.clone(),
            executed: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            pings: AtomicUsize::new(0),
        });
        self.opened.lock().push(conn.clone());
        Ok(conn)
    }
}

#[derive(Debug)]
pub struct MockConnection {
    name: String,
    target: Target,
    behavior: Behavior,
    replies: Replies,
    executed: Mutex<Vec<Operation>>,
    closed: AtomicBool,
    pings: AtomicUsize,
}

impl MockConnection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    /// Operations that reached the driver, in order.
    pub fn executed(&self) -> Vec<Operation> {
        self.executed.lock().clone()
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn execute(&self, cancel: CancellationToken, op: Operation) -> Result<Reply, OperationError> {
        if self.is_closed() {
            return Err(DriverError::Closed.into());
        }
        self.executed.lock().push(op.clone());

        if let Some(result) = self.replies.lock().get(&op.name).cloned() {
            return result;
        }
        match op.name.as_str() {
            "PING" => Ok(Reply::String("PONG".into())),
            // SLEEP <ms>: hold the call until the delay passes or the caller cancels.
            "SLEEP" => {
                let ms = op.args.first().and_then(Reply::as_u64).unwrap_or(0);
                tokio::select! {
                    _ = cancel.cancelled() => Err(OperationError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(Reply::Null),
                }
            }
            _ => Ok(Reply::String("OK".into())),
        }
    }

    async fn ping(&self) -> Result<(), DriverError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.behavior.ping_delay {
            tokio::time::sleep(delay).await;
        }
        if self.is_closed() {
            return Err(DriverError::Closed);
        }
        if self.behavior.fail_ping {
            return Err(DriverError::Auth("WRONGPASS invalid username-password pair".into()));
        }
        Ok(())
    }

    fn pool_stats(&self) -> Result<PoolStats, StatSampleError> {
        if self.behavior.fail_stats {
            return Err(StatSampleError::Unavailable("stats endpoint disabled".into()));
        }
        if self.is_closed() {
            return Err(StatSampleError::Closed);
        }
        let ops = self.executed.lock().len() as u64;
        Ok(PoolStats {
            open: u64::from(self.target.pool.min_idle.max(1)),
            idle: u64::from(self.target.pool.min_idle.max(1)),
            hits: ops,
            ..PoolStats::default()
        })
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.closed.store(true, Ordering::SeqCst);
        if self.behavior.fail_close {
            return Err(DriverError::Other("close failed".into()));
        }
        Ok(())
    }
}
